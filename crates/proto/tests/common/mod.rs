//! Responder side helpers shared by the integration tests
//!
//! `TestGateway` plays the ePDG/N3IWF half of IKEv2 with the crate's own
//! building blocks: it answers IKE_SA_INIT, derives the same SK_* keys
//! from the responder's point of view and opens/seals SK payloads.

#![allow(dead_code)]

use std::net::Ipv4Addr;

use n3ue_proto::ipsec::{
    crypto::{DhGroup, DhKeyPair, KeyMaterial, PrfAlgorithm, SkCodec},
    ikev2::{
        auth,
        constants::{ExchangeType, IkeFlags, PayloadType},
        eap::{attr, code, method, subtype, AkaMessage, EapAttribute, EapBody, EapPacket},
        exchange::ExchangePayloads,
        message::{IkeHeader, IkeMessage},
        payload::{AuthPayload, IdPayload, IkePayload, KePayload, NonceBias, NoncePayload},
        proposal::NegotiatedAlgorithms,
    },
    config::UeConfigBuilder,
    UeConfig,
};
use n3ue_proto::mobile::{kdf::AkaKeys, milenage::MilenageOutput, Milenage};

pub const KI: [u8; 16] = [0x46; 16];
pub const OPC: [u8; 16] = [0xcd; 16];
pub const IMSI: &str = "208930000000003";

/// UE configuration pointing at a loopback gateway
pub fn ue_config(port: u16) -> UeConfigBuilder {
    UeConfig::builder()
        .with_imsi(IMSI)
        .with_ki(KI)
        .with_opc(OPC)
        .with_server(Ipv4Addr::LOCALHOST)
        .with_local(Ipv4Addr::LOCALHOST)
        .with_ports(port, port)
}

/// IKE SA as seen by the responder
pub struct TestGateway {
    pub spi_i: [u8; 8],
    pub spi_r: [u8; 8],
    pub algorithms: NegotiatedAlgorithms,
    pub keys: KeyMaterial,
    pub sk: SkCodec,
    pub nonce_i: Vec<u8>,
    pub nonce_r: Vec<u8>,
    pub init_request: Vec<u8>,
    pub init_response: Vec<u8>,
}

impl TestGateway {
    /// Accept the first proposal of an IKE_SA_INIT request
    pub fn respond_init(request: &[u8]) -> (TestGateway, Vec<u8>) {
        let msg = IkeMessage::from_bytes(request).unwrap();
        let payloads = ExchangePayloads::collect(&msg.payloads);
        let chosen = payloads.proposals[0].clone();
        let algorithms = NegotiatedAlgorithms::from_proposal(&chosen).unwrap();
        let ke = payloads.ke.clone().unwrap();
        let dh = DhKeyPair::generate(DhGroup::from_transform_id(ke.dh_group).unwrap());
        let shared = dh.compute_shared(&ke.key_data).unwrap();
        let nonce_i = payloads.nonce.clone().unwrap();
        let nonce_r = NoncePayload::generate(NonceBias::Random);

        let spi_i = msg.header.initiator_spi;
        let spi_r = [0x5a; 8];
        let header = IkeHeader::new(
            spi_i,
            spi_r,
            PayloadType::None,
            ExchangeType::IkeSaInit,
            IkeFlags::response(false),
            0,
            0,
        );
        let response = IkeMessage::new(
            header,
            vec![
                IkePayload::SA(vec![chosen]),
                IkePayload::KE(KePayload::new(ke.dh_group, dh.public_bytes().to_vec())),
                IkePayload::Nonce(nonce_r.clone()),
            ],
        )
        .to_bytes()
        .unwrap();

        let keys = KeyMaterial::derive(
            algorithms.prf().unwrap(),
            &nonce_i,
            &nonce_r.nonce,
            &shared,
            &spi_i,
            &spi_r,
            algorithms.encr_key_len(),
            algorithms.integ_key_len(),
        )
        .unwrap();
        let sk = SkCodec::new(algorithms.encr, algorithms.integ).unwrap();

        let gateway = TestGateway {
            spi_i,
            spi_r,
            algorithms,
            keys,
            sk,
            nonce_i,
            nonce_r: nonce_r.nonce,
            init_request: request.to_vec(),
            init_response: response.clone(),
        };
        (gateway, response)
    }

    pub fn prf(&self) -> PrfAlgorithm {
        self.algorithms.prf().unwrap()
    }

    fn header(&self, exchange: ExchangeType, flags: IkeFlags, message_id: u32) -> IkeHeader {
        IkeHeader::new(
            self.spi_i,
            self.spi_r,
            PayloadType::None,
            exchange,
            flags,
            message_id,
            0,
        )
    }

    /// Protected response to a UE request
    pub fn response(&self, exchange: ExchangeType, message_id: u32, payloads: &[IkePayload]) -> Vec<u8> {
        let header = self.header(exchange, IkeFlags::response(false), message_id);
        self.sk.protect(&self.keys, &header, payloads).unwrap()
    }

    /// Protected request of the gateway
    pub fn request(&self, exchange: ExchangeType, message_id: u32, payloads: &[IkePayload]) -> Vec<u8> {
        let header = self.header(exchange, IkeFlags::request(false), message_id);
        self.sk.protect(&self.keys, &header, payloads).unwrap()
    }

    /// Decrypt a protected message from the UE
    pub fn open(&self, data: &[u8]) -> IkeMessage {
        self.sk.unprotect(&self.keys, data).unwrap()
    }

    /// Gateway AUTH over its INIT response
    pub fn auth(&self, shared_key: &[u8], idr: &IdPayload) -> AuthPayload {
        let octets = auth::signed_octets(
            self.prf(),
            &self.init_response,
            &self.nonce_i,
            &self.keys.sk_pr,
            idr,
        )
        .unwrap();
        auth::compute_shared_key_auth(self.prf(), shared_key, &octets).unwrap()
    }

    /// Check the UE's AUTH over its INIT request
    pub fn verify_ue_auth(&self, shared_key: &[u8], idi: &IdPayload, received: &AuthPayload) {
        let octets = auth::signed_octets(
            self.prf(),
            &self.init_request,
            &self.nonce_r,
            &self.keys.sk_pi,
            idi,
        )
        .unwrap();
        auth::verify_shared_key_auth(self.prf(), shared_key, &octets, received).unwrap();
    }
}

/// IDi payload of a decrypted UE message
pub fn initiator_id(msg: &IkeMessage) -> Option<IdPayload> {
    msg.payloads.iter().find_map(|p| match p {
        IkePayload::IDi(id) => Some(id.clone()),
        _ => None,
    })
}

/// Network side of one EAP-AKA challenge
pub struct AkaChallenge {
    pub packet: EapPacket,
    pub vector: MilenageOutput,
    pub keys: AkaKeys,
}

/// Build a signed EAP-AKA challenge for `identity` with the given SQN
pub fn aka_challenge(identity: &str, identifier: u8, sqn: [u8; 6]) -> AkaChallenge {
    let milenage = Milenage::with_opc(&KI, &OPC);
    let rand = [0x23; 16];
    let autn = milenage.generate_autn(&rand, &sqn, &[0x80, 0x00]);
    let vector = milenage.f2345(&rand);
    let keys = AkaKeys::derive(identity.as_bytes(), &vector.ik, &vector.ck);

    let mut packet = EapPacket {
        code: code::REQUEST,
        identifier,
        body: EapBody::Aka(AkaMessage {
            method: method::AKA,
            subtype: subtype::CHALLENGE,
            attributes: vec![
                EapAttribute::with_reserved(attr::RAND, &rand),
                EapAttribute::with_reserved(attr::AUTN, &autn),
                EapAttribute::empty_mac(),
            ],
        }),
    };
    packet.sign(&keys.k_aut, &[]).unwrap();
    AkaChallenge {
        packet,
        vector,
        keys,
    }
}
