//! IPsec Integration Tests
//!
//! Cross-module flows: the UE side `IkeSession` against the responder
//! helpers of `common`, EAP-AKA key agreement between the network and the
//! `AuthenticationContext`, and ESP interop between both ends of a child SA.

#![cfg(feature = "ipsec")]

mod common;

use std::net::SocketAddr;

use common::{aka_challenge, TestGateway, IMSI, KI, OPC};
use n3ue_platform::{AuthVectorProvider, VectorResponse};
use n3ue_proto::ipsec::{
    child_sa::{ChildKind, ChildSession},
    config::{default_child_proposals, default_ike_proposals},
    ikev2::{
        constants::ExchangeType,
        exchange::{ExchangePayloads, IkeAuthExchange, IkeSaInitExchange, InitOutcome},
        payload::{IdPayload, IkePayload},
        proposal::{NegotiatedAlgorithms, Proposal},
        state::AccessVariant,
    },
    session::{IkeSession, KeyGeneration},
    Error,
};
use n3ue_proto::mobile::{kdf, Milenage, MilenageProvider, AuthenticationContext};

fn endpoints() -> (SocketAddr, SocketAddr) {
    (
        "127.0.0.1:40000".parse().unwrap(),
        "127.0.0.1:500".parse().unwrap(),
    )
}

/// Run IKE_SA_INIT between a UE session and the test gateway
fn negotiate(offered: &[Proposal]) -> (IkeSession, TestGateway) {
    let (local, peer) = endpoints();
    let mut session = IkeSession::new();
    let request =
        IkeSaInitExchange::create_request(&mut session, offered, None, local, peer).unwrap();
    let (gateway, response) = TestGateway::respond_init(&request);
    let outcome = IkeSaInitExchange::process_response(
        &mut session,
        offered,
        &request,
        &response,
        local,
        peer,
    )
    .unwrap();
    assert_eq!(outcome, InitOutcome::Established { nat_detected: false });
    (session, gateway)
}

fn exchange_auth_round(offered: &[Proposal]) {
    let (mut session, gateway) = negotiate(offered);
    assert!(session.is_established());
    assert_eq!(session.keys().unwrap().sk_ei, gateway.keys.sk_ei);
    assert_eq!(session.keys().unwrap().sk_pr, gateway.keys.sk_pr);

    let idi = IdPayload::from_email("0208930000000003@nai.test");
    let header = session.request_header(ExchangeType::IkeAuth);
    assert_eq!(header.message_id, 1);
    let payloads = IkeAuthExchange::first_request(
        AccessVariant::Swu,
        &idi,
        None,
        &default_child_proposals(),
        0x1000,
    );
    let request = session.protect(&header, &payloads).unwrap();

    let opened = gateway.open(&request);
    assert_eq!(opened.header.message_id, 1);
    let seen = ExchangePayloads::collect(&opened.payloads);
    assert_eq!(seen.proposals.len(), default_child_proposals().len());
    assert!(seen.cp.is_some());

    let idr = IdPayload::from_email("epdg@test");
    let response = gateway.response(ExchangeType::IkeAuth, 1, &[IkePayload::IDr(idr.clone())]);
    let (msg, generation) = session.unprotect(&response).unwrap();
    assert!(matches!(generation, KeyGeneration::Current));
    assert_eq!(ExchangePayloads::collect(&msg.payloads).idr, Some(idr));
}

#[test]
fn test_sk_exchange_with_cbc_and_hmac() {
    exchange_auth_round(&default_ike_proposals()[..1]);
}

#[test]
fn test_sk_exchange_with_gcm() {
    exchange_auth_round(&default_ike_proposals()[1..]);
}

#[test]
fn test_tampered_sk_payload_is_rejected() {
    let (mut session, gateway) = negotiate(&default_ike_proposals());
    let header = session.request_header(ExchangeType::Informational);
    let mut request = session.protect(&header, &[]).unwrap();
    let last = request.len() - 1;
    request[last] ^= 0x01;
    assert!(gateway.sk.unprotect(&gateway.keys, &request).is_err());
}

#[test]
fn test_shared_key_auth_both_directions() {
    let (session, gateway) = negotiate(&default_ike_proposals());
    let msk = [0x3c; 64];
    let idi = IdPayload::from_email("0208930000000003@nai.test");
    let idr = IdPayload::from_email("epdg@test");

    let ue_auth = IkeAuthExchange::compute_auth(&session, &msk, &idi).unwrap();
    gateway.verify_ue_auth(&msk, &idi, &ue_auth);

    let gateway_auth = gateway.auth(&msk, &idr);
    IkeAuthExchange::verify_auth(&session, &msk, &idr, &gateway_auth).unwrap();

    let wrong = gateway.auth(&[0x3d; 64], &idr);
    let result = IkeAuthExchange::verify_auth(&session, &msk, &idr, &wrong);
    assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
}

#[tokio::test]
async fn test_eap_aka_keys_agree_with_network() {
    let identity = "0208930000000003@nai.test";
    let challenge = aka_challenge(identity, 7, [0, 0, 0, 0, 0, 0x21]);
    let aka = challenge.packet.aka().unwrap();
    let rand: [u8; 16] = aka.rand().unwrap().try_into().unwrap();
    let autn: [u8; 16] = aka.autn().unwrap().try_into().unwrap();

    let provider = MilenageProvider::new(Milenage::with_opc(&KI, &OPC)).with_imsi(IMSI);
    let vector = provider.resolve(&rand, &autn).await.unwrap();
    let VectorResponse::Success { res, .. } = &vector else {
        panic!("expected a fresh SQN");
    };
    assert_eq!(res[..], challenge.vector.res[..]);

    let mut ctx = AuthenticationContext::new(identity);
    ctx.record(&rand, &autn, vector).unwrap();
    let keys = ctx.aka().unwrap();
    assert_eq!(keys.k_aut, challenge.keys.k_aut);
    assert_eq!(keys.msk, challenge.keys.msk);
    challenge.packet.verify_mac(&keys.k_aut, &[]).unwrap();
    assert_eq!(ctx.auth_key().unwrap(), challenge.keys.msk.to_vec());
}

#[tokio::test]
async fn test_replayed_challenge_triggers_resync() {
    let challenge = aka_challenge("0208930000000003@nai.test", 1, [0, 0, 0, 0, 0, 0x21]);
    let aka = challenge.packet.aka().unwrap();
    let rand: [u8; 16] = aka.rand().unwrap().try_into().unwrap();
    let autn: [u8; 16] = aka.autn().unwrap().try_into().unwrap();

    let provider = MilenageProvider::new(Milenage::with_opc(&KI, &OPC)).with_highest_sqn(0x21);
    let vector = provider.resolve(&rand, &autn).await.unwrap();
    let mut ctx = AuthenticationContext::new("0208930000000003@nai.test");
    assert_eq!(ctx.record(&rand, &autn, vector), Err(Error::SynchFailure));
    assert_eq!(ctx.auts.as_ref().map(Vec::len), Some(14));
}

#[test]
fn test_five_g_aka_res_star() {
    let milenage = Milenage::with_opc(&KI, &OPC);
    let rand = [0x42; 16];
    let sqn = [0, 0, 0, 0, 0, 0x05];
    let autn = milenage.generate_autn(&rand, &sqn, &[0x80, 0x00]);
    let out = milenage.f2345(&rand);
    let sn_name = kdf::serving_network_name("208", "93");
    assert_eq!(sn_name, "5G:mnc093.mcc208.3gppnetwork.org");

    let mut ctx = AuthenticationContext::new(IMSI);
    ctx.record(
        &rand,
        &autn,
        VectorResponse::Success {
            res: out.res.to_vec(),
            ck: out.ck.to_vec(),
            ik: out.ik.to_vec(),
        },
    )
    .unwrap();
    let res_star = ctx.five_g_aka(&sn_name, IMSI, &[0, 0]).unwrap();
    let expected = kdf::res_star(&out.ck, &out.ik, sn_name.as_bytes(), &rand, &out.res).unwrap();
    assert_eq!(res_star, expected);
}

fn child_pair(proposal: &Proposal) -> (ChildSession, ChildSession) {
    let algorithms = NegotiatedAlgorithms::from_proposal(proposal).unwrap();
    let prf = default_ike_proposals()
        .first()
        .map(|p| NegotiatedAlgorithms::from_proposal(p).unwrap().prf().unwrap())
        .unwrap();
    let sk_d = [0x77; 20];
    let (nonce_i, nonce_r) = ([0x11; 32], [0x22; 32]);
    let ue = ChildSession::derive(
        prf,
        &sk_d,
        None,
        &nonce_i,
        &nonce_r,
        algorithms,
        0x1000,
        0x2000,
        true,
        ChildKind::Signaling,
    )
    .unwrap();
    let gateway = ChildSession::derive(
        prf,
        &sk_d,
        None,
        &nonce_i,
        &nonce_r,
        algorithms,
        0x2000,
        0x1000,
        false,
        ChildKind::Signaling,
    )
    .unwrap();
    (ue, gateway)
}

fn esp_interop(proposal: &Proposal) {
    let (ue, gateway) = child_pair(proposal);
    let packet = [0x45u8; 40];

    let mut uplink = ue.outbound_sa().unwrap();
    let datagram = uplink.encapsulate(&packet, 4).unwrap();
    assert_eq!(&datagram[..4], &0x2000u32.to_be_bytes());
    let (plain, next_header) = gateway.inbound_sa().unwrap().decapsulate(&datagram).unwrap();
    assert_eq!(plain, packet);
    assert_eq!(next_header, 4);

    let mut downlink = gateway.outbound_sa().unwrap();
    let datagram = downlink.encapsulate(&packet[..20], 47).unwrap();
    assert_eq!(&datagram[..4], &0x1000u32.to_be_bytes());
    let (plain, next_header) = ue.inbound_sa().unwrap().decapsulate(&datagram).unwrap();
    assert_eq!(plain, &packet[..20]);
    assert_eq!(next_header, 47);
}

#[test]
fn test_esp_interop_cbc_sha1() {
    esp_interop(&default_child_proposals()[0]);
}

#[test]
fn test_esp_interop_gcm() {
    esp_interop(&default_child_proposals()[1]);
}

#[test]
fn test_esp_wrong_direction_fails() {
    let (ue, _) = child_pair(&default_child_proposals()[0]);
    let mut uplink = ue.outbound_sa().unwrap();
    let datagram = uplink.encapsulate(&[0x45; 40], 4).unwrap();
    assert!(ue.inbound_sa().unwrap().decapsulate(&datagram).is_err());
}

#[test]
fn test_esp_roundtrip_across_lengths() {
    for proposal in default_child_proposals() {
        let (ue, gateway) = child_pair(&proposal);
        let mut uplink = ue.outbound_sa().unwrap();
        let inbound = gateway.inbound_sa().unwrap();
        for len in (1..=1500usize).step_by(7).chain(1497..=1500) {
            let packet: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let datagram = uplink.encapsulate(&packet, 4).unwrap();
            let (plain, _) = inbound.decapsulate(&datagram).unwrap();
            assert_eq!(plain, packet, "length {}", len);
        }
    }
}
