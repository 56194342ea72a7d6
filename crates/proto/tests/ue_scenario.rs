//! UE scenario tests
//!
//! Drives a real `UeClient` over loopback UDP against a scripted ePDG that
//! answers IKE_SA_INIT, runs one EAP-AKA challenge and completes IKE_AUTH.

#![cfg(feature = "ipsec")]

mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use common::{aka_challenge, initiator_id, ue_config, TestGateway};
use n3ue_proto::ipsec::{
    config::UeConfig,
    crypto::{DhGroup, DhKeyPair, EncrAlgorithm, IntegAlgorithm},
    ikev2::{
        constants::{cfg, notify, ExchangeType, NON_ESP_MARKER},
        eap::{attr, code, EapBody, EapPacket},
        exchange::ExchangePayloads,
        payload::{
            CfgAttribute, CfgValue, CpPayload, IdPayload, IkePayload, KePayload, NonceBias,
            NoncePayload, TrafficSelector,
        },
        proposal::{Proposal, ProtocolId, Transform},
        state::{AccessVariant, UeState},
    },
    Error, OperatorCommand, UeClient,
};
use n3ue_proto::mobile::MilenageProvider;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const TUNNEL: Ipv4Addr = Ipv4Addr::new(10, 45, 0, 7);
const DNS: Ipv4Addr = Ipv4Addr::new(10, 45, 0, 1);
const GATEWAY_ESP_SPI: u32 = 0x0bad_cafe;

/// Loopback socket speaking IKE with or without the non-ESP marker
struct Wire {
    socket: UdpSocket,
    ue: Option<SocketAddr>,
    marker: bool,
}

impl Wire {
    async fn bind() -> (Wire, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (
            Wire {
                socket,
                ue: None,
                marker: false,
            },
            port,
        )
    }

    async fn recv(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 65535];
        let (len, from) = self.socket.recv_from(&mut buf).await.unwrap();
        self.ue = Some(from);
        match buf[..len].strip_prefix(&NON_ESP_MARKER[..]) {
            Some(ike) => {
                self.marker = true;
                ike.to_vec()
            }
            None => {
                self.marker = false;
                buf[..len].to_vec()
            }
        }
    }

    async fn send(&self, message: &[u8]) {
        let mut datagram = Vec::new();
        if self.marker {
            datagram.extend_from_slice(&NON_ESP_MARKER);
        }
        datagram.extend_from_slice(message);
        self.socket
            .send_to(&datagram, self.ue.unwrap())
            .await
            .unwrap();
    }
}

/// Run IKE_SA_INIT and the SWu IKE_AUTH rounds; returns the gateway SA
async fn establish_swu(wire: &mut Wire, nai: &str) -> TestGateway {
    let request = wire.recv().await;
    let (gateway, response) = TestGateway::respond_init(&request);
    wire.send(&response).await;

    // IKE_AUTH 1: IDi, IDr(APN), CP, SA, TS -> IDr, EAP-AKA challenge
    let first = gateway.open(&wire.recv().await);
    assert_eq!(first.header.message_id, 1);
    let idi = initiator_id(&first).unwrap();
    assert_eq!(idi.as_string().as_deref(), Some(nai));
    let offered = ExchangePayloads::collect(&first.payloads);
    assert!(offered.cp.is_some());
    let idr = IdPayload::from_email("epdg@test");
    let challenge = aka_challenge(nai, 1, [0, 0, 0, 0, 0, 0x21]);
    wire.send(&gateway.response(
        ExchangeType::IkeAuth,
        1,
        &[
            IkePayload::IDr(idr.clone()),
            IkePayload::EAP(challenge.packet.clone()),
        ],
    ))
    .await;

    // IKE_AUTH 2: EAP response with AT_RES -> EAP success
    let second = gateway.open(&wire.recv().await);
    assert_eq!(second.header.message_id, 2);
    let eap = ExchangePayloads::collect(&second.payloads).eap.unwrap();
    assert_eq!(eap.code, code::RESPONSE);
    eap.verify_mac(&challenge.keys.k_aut, &[]).unwrap();
    let res = eap.aka().and_then(|m| m.attribute(attr::RES)).unwrap();
    assert_eq!(res.as_res(), Some(&challenge.vector.res[..]));
    wire.send(&gateway.response(
        ExchangeType::IkeAuth,
        2,
        &[IkePayload::EAP(EapPacket {
            code: code::SUCCESS,
            identifier: 1,
            body: EapBody::Empty,
        })],
    ))
    .await;

    // IKE_AUTH 3: AUTH(MSK) -> AUTH, CP(reply), SA, TS
    let third = gateway.open(&wire.recv().await);
    assert_eq!(third.header.message_id, 3);
    let received = ExchangePayloads::collect(&third.payloads).auth.unwrap();
    gateway.verify_ue_auth(&challenge.keys.msk, &idi, &received);

    let child = offered.proposals[0]
        .clone()
        .with_spi(GATEWAY_ESP_SPI.to_be_bytes().to_vec());
    let cp = CpPayload {
        cfg_type: cfg::REPLY,
        attributes: vec![
            CfgAttribute {
                attr_type: cfg::INTERNAL_IP4_ADDRESS,
                value: CfgValue::Ipv4(vec![TUNNEL]),
            },
            CfgAttribute {
                attr_type: cfg::INTERNAL_IP4_DNS,
                value: CfgValue::Ipv4(vec![DNS]),
            },
        ],
    };
    wire.send(&gateway.response(
        ExchangeType::IkeAuth,
        3,
        &[
            IkePayload::AUTH(gateway.auth(&challenge.keys.msk, &idr)),
            IkePayload::CP(cp),
            IkePayload::SA(vec![child]),
            IkePayload::TSi(vec![TrafficSelector::any_ipv4()]),
            IkePayload::TSr(vec![TrafficSelector::any_ipv4()]),
        ],
    ))
    .await;
    gateway
}

fn swu_client(config: UeConfig) -> UeClient {
    let provider = Arc::new(MilenageProvider::new(config.milenage()));
    UeClient::new(config, provider)
}

#[tokio::test]
async fn test_swu_connect_with_eap_aka() {
    let (mut wire, port) = Wire::bind().await;
    let config = ue_config(port)
        .with_variant(AccessVariant::Swu)
        .with_dnn("ims")
        .build()
        .unwrap();
    let nai = config.nai();
    let gateway = tokio::spawn(async move {
        establish_swu(&mut wire, &nai).await;
        wire
    });

    let mut ue = swu_client(config);
    ue.connect().await.unwrap();
    let wire = gateway.await.unwrap();

    assert_eq!(ue.state(), UeState::Connected);
    assert_eq!(ue.tunnel_address(), Some(TUNNEL));
    assert_eq!(ue.dns_servers(), &[DNS]);
    // UDP data path: signaling moved to the NAT-T port with the marker
    assert!(wire.marker);
}

#[tokio::test]
async fn test_swu_quit_deletes_ike_sa() {
    let (mut wire, port) = Wire::bind().await;
    let config = ue_config(port)
        .with_variant(AccessVariant::Swu)
        .build()
        .unwrap();
    let nai = config.nai();
    let gateway = tokio::spawn(async move {
        let gateway = establish_swu(&mut wire, &nai).await;

        let delete = gateway.open(&wire.recv().await);
        assert_eq!(delete.header.exchange_type, ExchangeType::Informational);
        assert_eq!(delete.header.message_id, 4);
        let deletes = ExchangePayloads::collect(&delete.payloads).deletes;
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].protocol_id, 1);
        wire.send(&gateway.response(ExchangeType::Informational, 4, &[]))
            .await;
    });

    let (commands, rx) = mpsc::channel(4);
    commands.send(OperatorCommand::Quit).await.unwrap();
    let mut ue = swu_client(config);
    ue.run(Some(rx)).await.unwrap();
    gateway.await.unwrap();
    assert_eq!(ue.state(), UeState::Closed);
}

#[tokio::test]
async fn test_swu_peer_delete_ends_iteration() {
    let (mut wire, port) = Wire::bind().await;
    let config = ue_config(port)
        .with_variant(AccessVariant::Swu)
        .with_iterations(1)
        .build()
        .unwrap();
    let nai = config.nai();
    let gateway = tokio::spawn(async move {
        let gateway = establish_swu(&mut wire, &nai).await;

        let delete = gateway.request(
            ExchangeType::Informational,
            0,
            &[IkePayload::D(
                n3ue_proto::ipsec::ikev2::payload::DeletePayload {
                    protocol_id: 1,
                    spi_size: 0,
                    spis: Vec::new(),
                },
            )],
        );
        wire.send(&delete).await;
        let reply = wire.recv().await;
        let reply = gateway.open(&reply);
        assert!(reply.header.flags.is_response());
        assert_eq!(reply.header.message_id, 0);
    });

    let mut ue = swu_client(config);
    tokio::time::timeout(Duration::from_secs(30), ue.run(None))
        .await
        .unwrap()
        .unwrap();
    gateway.await.unwrap();
}

#[tokio::test]
async fn test_swu_wrong_sqn_is_resynchronised() {
    let (mut wire, port) = Wire::bind().await;
    let config = ue_config(port)
        .with_variant(AccessVariant::Swu)
        .build()
        .unwrap();
    let nai = config.nai();
    let gateway = tokio::spawn(async move {
        let request = wire.recv().await;
        let (gateway, response) = TestGateway::respond_init(&request);
        wire.send(&response).await;

        let _first = gateway.open(&wire.recv().await);
        // SQN 0 is never fresh for the UE
        let challenge = aka_challenge(&nai, 1, [0; 6]);
        wire.send(&gateway.response(
            ExchangeType::IkeAuth,
            1,
            &[
                IkePayload::IDr(IdPayload::from_email("epdg@test")),
                IkePayload::EAP(challenge.packet),
            ],
        ))
        .await;

        let second = gateway.open(&wire.recv().await);
        let eap = ExchangePayloads::collect(&second.payloads).eap.unwrap();
        let auts = eap.aka().and_then(|m| m.attribute(attr::AUTS)).cloned();
        wire.send(&gateway.response(
            ExchangeType::IkeAuth,
            2,
            &[IkePayload::EAP(EapPacket {
                code: code::FAILURE,
                identifier: 2,
                body: EapBody::Empty,
            })],
        ))
        .await;
        auts
    });

    let mut ue = swu_client(config);
    let result = ue.connect().await;
    assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
    let auts = gateway.await.unwrap().unwrap();
    assert_eq!(auts.as_auts().map(<[u8]>::len), Some(14));
}

#[tokio::test]
async fn test_swu_second_synch_failure_aborts() {
    let (mut wire, port) = Wire::bind().await;
    let config = ue_config(port)
        .with_variant(AccessVariant::Swu)
        .build()
        .unwrap();
    let nai = config.nai();
    let gateway = tokio::spawn(async move {
        let request = wire.recv().await;
        let (gateway, response) = TestGateway::respond_init(&request);
        wire.send(&response).await;

        let _first = gateway.open(&wire.recv().await);
        wire.send(&gateway.response(
            ExchangeType::IkeAuth,
            1,
            &[
                IkePayload::IDr(IdPayload::from_email("epdg@test")),
                IkePayload::EAP(aka_challenge(&nai, 1, [0; 6]).packet),
            ],
        ))
        .await;

        // AUTS for the first challenge, answered by another stale one
        let second = gateway.open(&wire.recv().await);
        let eap = ExchangePayloads::collect(&second.payloads).eap.unwrap();
        assert!(eap.aka().and_then(|m| m.attribute(attr::AUTS)).is_some());
        wire.send(&gateway.response(
            ExchangeType::IkeAuth,
            2,
            &[IkePayload::EAP(aka_challenge(&nai, 2, [0; 6]).packet)],
        ))
        .await;

        // no third IKE_AUTH request follows
        tokio::time::timeout(Duration::from_millis(500), wire.recv())
            .await
            .is_err()
    });

    let mut ue = swu_client(config);
    assert_eq!(ue.connect().await, Err(Error::SynchFailure));
    assert!(gateway.await.unwrap());
}

#[tokio::test]
async fn test_swu_child_rekey_with_pfs() {
    let (mut wire, port) = Wire::bind().await;
    let pfs = Proposal::new(1, ProtocolId::Esp)
        .add_transform(Transform::encr(EncrAlgorithm::AesCbc { key_len: 16 }))
        .add_transform(Transform::integ(IntegAlgorithm::HmacSha1_96))
        .add_transform(Transform::dh(DhGroup::Modp2048))
        .add_transform(Transform::esn(false));
    let config = ue_config(port)
        .with_variant(AccessVariant::Swu)
        .with_child_proposals(vec![pfs])
        .build()
        .unwrap();
    let nai = config.nai();
    let (commands, rx) = mpsc::channel(4);
    commands.send(OperatorCommand::RekeyChild).await.unwrap();

    let gateway = tokio::spawn(async move {
        let gateway = establish_swu(&mut wire, &nai).await;

        let rekey = gateway.open(&wire.recv().await);
        assert_eq!(rekey.header.exchange_type, ExchangeType::CreateChildSa);
        assert_eq!(rekey.header.message_id, 4);
        let request = ExchangePayloads::collect(&rekey.payloads);
        assert!(request.notify(notify::REKEY_SA).is_some());
        let ke = request.ke.clone().unwrap();
        assert_eq!(ke.dh_group, DhGroup::Modp2048.transform_id());
        let responder = DhKeyPair::generate(DhGroup::Modp2048);
        assert!(responder.compute_shared(&ke.key_data).is_ok());

        let chosen = request.proposals[0]
            .clone()
            .with_spi(0x0bad_beefu32.to_be_bytes().to_vec());
        wire.send(&gateway.response(
            ExchangeType::CreateChildSa,
            4,
            &[
                IkePayload::SA(vec![chosen]),
                IkePayload::Nonce(NoncePayload::generate(NonceBias::Random)),
                IkePayload::KE(KePayload::new(
                    ke.dh_group,
                    responder.public_bytes().to_vec(),
                )),
                IkePayload::TSi(vec![TrafficSelector::any_ipv4()]),
                IkePayload::TSr(vec![TrafficSelector::any_ipv4()]),
            ],
        ))
        .await;

        // new keys in place, the replaced child SA is deleted
        let delete = gateway.open(&wire.recv().await);
        assert_eq!(delete.header.message_id, 5);
        let deletes = ExchangePayloads::collect(&delete.payloads).deletes;
        assert_eq!(deletes[0].protocol_id, ProtocolId::Esp.to_u8());
        wire.send(&gateway.response(ExchangeType::Informational, 5, &[]))
            .await;

        commands.send(OperatorCommand::Quit).await.unwrap();
        let quit = gateway.open(&wire.recv().await);
        assert_eq!(quit.header.message_id, 6);
        wire.send(&gateway.response(ExchangeType::Informational, 6, &[]))
            .await;
    });

    let mut ue = swu_client(config);
    ue.run(Some(rx)).await.unwrap();
    gateway.await.unwrap();
    assert_eq!(ue.state(), UeState::Closed);
}
