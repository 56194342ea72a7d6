//! Milenage authentication functions (TS 35.206) and a local vector provider
//!
//! ```text
//! TEMP = E_K(RAND ^ OPc)
//! OUT1 = E_K(TEMP ^ rot(IN1 ^ OPc, r1) ^ c1) ^ OPc        IN1 = SQN||AMF||SQN||AMF
//! OUTn = E_K(rot(TEMP ^ OPc, rn) ^ cn) ^ OPc              n = 2..5
//!
//! f1 = OUT1[0..8]   f1* = OUT1[8..16]
//! f5 = OUT2[0..6]   f2  = OUT2[8..16]
//! f3 = OUT3         f4  = OUT4         f5* = OUT5[0..6]
//! ```

use aes::Aes128;
use async_trait::async_trait;
use cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use n3ue_platform::{AuthVectorProvider, Collaborator, PlatformError, PlatformResult, VectorResponse};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const BLOCK: usize = 16;

/// SQN length in bytes
pub const SQN_LEN: usize = 6;

/// AMF used in AUTS computation (TS 33.102 Section 6.3.3)
pub const RESYNC_AMF: [u8; 2] = [0x00, 0x00];

const R1: u32 = 64;
const R2: u32 = 0;
const R3: u32 = 32;
const R4: u32 = 64;
const R5: u32 = 96;

const fn constant(last: u8) -> [u8; BLOCK] {
    let mut c = [0u8; BLOCK];
    c[BLOCK - 1] = last;
    c
}

const C1: [u8; BLOCK] = constant(0);
const C2: [u8; BLOCK] = constant(1);
const C3: [u8; BLOCK] = constant(2);
const C4: [u8; BLOCK] = constant(4);
const C5: [u8; BLOCK] = constant(8);

fn xor(a: &[u8; BLOCK], b: &[u8; BLOCK]) -> [u8; BLOCK] {
    let mut out = [0u8; BLOCK];
    for i in 0..BLOCK {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn rotate(block: &[u8; BLOCK], bits: u32) -> [u8; BLOCK] {
    u128::from_be_bytes(*block).rotate_left(bits).to_be_bytes()
}

/// Milenage instance bound to one subscriber key
#[derive(Clone)]
pub struct Milenage {
    cipher: Aes128,
    opc: [u8; BLOCK],
}

/// Output of f2..f5 for one RAND
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilenageOutput {
    /// RES (f2)
    pub res: [u8; 8],
    /// CK (f3)
    pub ck: [u8; 16],
    /// IK (f4)
    pub ik: [u8; 16],
    /// AK (f5)
    pub ak: [u8; 6],
}

impl Milenage {
    /// Instance from K and OPc
    pub fn with_opc(k: &[u8; 16], opc: &[u8; 16]) -> Self {
        Milenage {
            cipher: Aes128::new(GenericArray::from_slice(k)),
            opc: *opc,
        }
    }

    /// Instance from K and OP, deriving OPc
    pub fn with_op(k: &[u8; 16], op: &[u8; 16]) -> Self {
        let opc = compute_opc(k, op);
        Self::with_opc(k, &opc)
    }

    /// OPc in use
    pub fn opc(&self) -> &[u8; 16] {
        &self.opc
    }

    fn encrypt(&self, block: &[u8; BLOCK]) -> [u8; BLOCK] {
        let mut out = GenericArray::clone_from_slice(block);
        self.cipher.encrypt_block(&mut out);
        let mut result = [0u8; BLOCK];
        result.copy_from_slice(&out);
        result
    }

    fn temp(&self, rand: &[u8; 16]) -> [u8; BLOCK] {
        self.encrypt(&xor(rand, &self.opc))
    }

    fn out1(&self, rand: &[u8; 16], sqn: &[u8; SQN_LEN], amf: &[u8; 2]) -> [u8; BLOCK] {
        let mut in1 = [0u8; BLOCK];
        in1[0..6].copy_from_slice(sqn);
        in1[6..8].copy_from_slice(amf);
        in1[8..14].copy_from_slice(sqn);
        in1[14..16].copy_from_slice(amf);

        let rotated = rotate(&xor(&in1, &self.opc), R1);
        let block = xor(&xor(&self.temp(rand), &rotated), &C1);
        xor(&self.encrypt(&block), &self.opc)
    }

    fn out_n(&self, temp: &[u8; BLOCK], r: u32, c: &[u8; BLOCK]) -> [u8; BLOCK] {
        let block = xor(&rotate(&xor(temp, &self.opc), r), c);
        xor(&self.encrypt(&block), &self.opc)
    }

    /// f1: network authentication code MAC-A
    pub fn f1(&self, rand: &[u8; 16], sqn: &[u8; SQN_LEN], amf: &[u8; 2]) -> [u8; 8] {
        let out = self.out1(rand, sqn, amf);
        let mut mac = [0u8; 8];
        mac.copy_from_slice(&out[0..8]);
        mac
    }

    /// f1*: resynchronisation code MAC-S
    pub fn f1_star(&self, rand: &[u8; 16], sqn: &[u8; SQN_LEN], amf: &[u8; 2]) -> [u8; 8] {
        let out = self.out1(rand, sqn, amf);
        let mut mac = [0u8; 8];
        mac.copy_from_slice(&out[8..16]);
        mac
    }

    /// f2, f3, f4 and f5 in one pass
    pub fn f2345(&self, rand: &[u8; 16]) -> MilenageOutput {
        let temp = self.temp(rand);
        let out2 = self.out_n(&temp, R2, &C2);
        let out3 = self.out_n(&temp, R3, &C3);
        let out4 = self.out_n(&temp, R4, &C4);

        let mut res = [0u8; 8];
        res.copy_from_slice(&out2[8..16]);
        let mut ak = [0u8; 6];
        ak.copy_from_slice(&out2[0..6]);

        MilenageOutput {
            res,
            ck: out3,
            ik: out4,
            ak,
        }
    }

    /// f5*: anonymity key for resynchronisation
    pub fn f5_star(&self, rand: &[u8; 16]) -> [u8; 6] {
        let out5 = self.out_n(&self.temp(rand), R5, &C5);
        let mut ak = [0u8; 6];
        ak.copy_from_slice(&out5[0..6]);
        ak
    }

    /// Network side: AUTN = (SQN ^ AK) || AMF || MAC-A
    pub fn generate_autn(&self, rand: &[u8; 16], sqn: &[u8; SQN_LEN], amf: &[u8; 2]) -> [u8; 16] {
        let ak = self.f2345(rand).ak;
        let mac = self.f1(rand, sqn, amf);
        let mut autn = [0u8; 16];
        for i in 0..SQN_LEN {
            autn[i] = sqn[i] ^ ak[i];
        }
        autn[6..8].copy_from_slice(amf);
        autn[8..16].copy_from_slice(&mac);
        autn
    }

    /// AUTS = (SQN_MS ^ AK*) || MAC-S
    pub fn generate_auts(&self, rand: &[u8; 16], sqn_ms: &[u8; SQN_LEN]) -> [u8; 14] {
        let ak_star = self.f5_star(rand);
        let mac_s = self.f1_star(rand, sqn_ms, &RESYNC_AMF);
        let mut auts = [0u8; 14];
        for i in 0..SQN_LEN {
            auts[i] = sqn_ms[i] ^ ak_star[i];
        }
        auts[6..14].copy_from_slice(&mac_s);
        auts
    }
}

/// OPc = OP ^ E_K(OP)
pub fn compute_opc(k: &[u8; 16], op: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(k));
    let mut block = GenericArray::clone_from_slice(op);
    cipher.encrypt_block(&mut block);
    let mut opc = [0u8; 16];
    for i in 0..16 {
        opc[i] = op[i] ^ block[i];
    }
    opc
}

fn sqn_value(sqn: &[u8; SQN_LEN]) -> u64 {
    let mut buf = [0u8; 8];
    buf[2..].copy_from_slice(sqn);
    u64::from_be_bytes(buf)
}

fn sqn_bytes(value: u64) -> [u8; SQN_LEN] {
    let mut sqn = [0u8; SQN_LEN];
    sqn.copy_from_slice(&value.to_be_bytes()[2..]);
    sqn
}

/// Outcome of checking AUTN against the subscriber credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutnCheck {
    /// MAC valid and SQN fresh
    Accepted {
        /// SQN recovered from AUTN
        sqn: [u8; SQN_LEN],
    },
    /// MAC valid but SQN not above the highest accepted one
    Stale,
    /// MAC-A mismatch
    MacFailure,
}

impl Milenage {
    /// Verify AUTN and SQN freshness against `highest_sqn`
    pub fn check_autn(&self, rand: &[u8; 16], autn: &[u8; 16], highest_sqn: u64) -> AutnCheck {
        let ak = self.f2345(rand).ak;
        let mut sqn = [0u8; SQN_LEN];
        for i in 0..SQN_LEN {
            sqn[i] = autn[i] ^ ak[i];
        }
        let amf = [autn[6], autn[7]];
        let xmac = self.f1(rand, &sqn, &amf);
        if !bool::from(xmac[..].ct_eq(&autn[8..16])) {
            return AutnCheck::MacFailure;
        }
        if sqn_value(&sqn) <= highest_sqn {
            return AutnCheck::Stale;
        }
        AutnCheck::Accepted { sqn }
    }
}

/// [`AuthVectorProvider`] computing vectors from locally held K and OP/OPc
pub struct MilenageProvider {
    milenage: Milenage,
    imsi: Option<String>,
    highest_sqn: Mutex<u64>,
}

impl MilenageProvider {
    /// Provider for one subscriber
    pub fn new(milenage: Milenage) -> Self {
        MilenageProvider {
            milenage,
            imsi: None,
            highest_sqn: Mutex::new(0),
        }
    }

    /// Report this IMSI from [`AuthVectorProvider::imsi`]
    pub fn with_imsi(mut self, imsi: impl Into<String>) -> Self {
        self.imsi = Some(imsi.into());
        self
    }

    /// Start the freshness window above `sqn`
    pub fn with_highest_sqn(mut self, sqn: u64) -> Self {
        self.highest_sqn = Mutex::new(sqn & 0xffff_ffff_ffff);
        self
    }

    /// Highest SQN accepted so far
    pub async fn highest_sqn(&self) -> u64 {
        *self.highest_sqn.lock().await
    }
}

impl Collaborator for MilenageProvider {
    fn id(&self) -> &'static str {
        "milenage"
    }

    fn description(&self) -> &'static str {
        "Local Milenage vector computation"
    }
}

#[async_trait]
impl AuthVectorProvider for MilenageProvider {
    async fn resolve(&self, rand: &[u8; 16], autn: &[u8; 16]) -> PlatformResult<VectorResponse> {
        let mut highest = self.highest_sqn.lock().await;
        match self.milenage.check_autn(rand, autn, *highest) {
            AutnCheck::MacFailure => {
                warn!("AUTN MAC verification failed");
                Err(PlatformError::Security("AUTN MAC failure".to_string()))
            }
            AutnCheck::Stale => {
                debug!(highest_sqn = *highest, "SQN not fresh, answering with AUTS");
                let auts = self.milenage.generate_auts(rand, &sqn_bytes(*highest));
                Ok(VectorResponse::SyncFailure {
                    auts: auts.to_vec(),
                })
            }
            AutnCheck::Accepted { sqn } => {
                *highest = sqn_value(&sqn);
                let out = self.milenage.f2345(rand);
                Ok(VectorResponse::Success {
                    res: out.res.to_vec(),
                    ck: out.ck.to_vec(),
                    ik: out.ik.to_vec(),
                })
            }
        }
    }

    async fn imsi(&self) -> PlatformResult<String> {
        self.imsi
            .clone()
            .ok_or_else(|| PlatformError::NotImplemented("IMSI not configured".to_string()))
    }
}
