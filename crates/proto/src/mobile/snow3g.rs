//! SNOW 3G keystream generator with the UEA2 (f8) and UIA2 (f9) modes
//!
//! 128-5G-EA1 and 128-5G-IA1 are f8 and f9 with the NAS COUNT, the
//! connection identifier as BEARER and `FRESH = BEARER << 27`.

/// Rijndael S-box
const SR: [u8; 256] = [
    0x63, 0x7c, 0x77, 0x7b, 0xf2, 0x6b, 0x6f, 0xc5, 0x30, 0x01, 0x67, 0x2b, 0xfe, 0xd7, 0xab, 0x76,
    0xca, 0x82, 0xc9, 0x7d, 0xfa, 0x59, 0x47, 0xf0, 0xad, 0xd4, 0xa2, 0xaf, 0x9c, 0xa4, 0x72, 0xc0,
    0xb7, 0xfd, 0x93, 0x26, 0x36, 0x3f, 0xf7, 0xcc, 0x34, 0xa5, 0xe5, 0xf1, 0x71, 0xd8, 0x31, 0x15,
    0x04, 0xc7, 0x23, 0xc3, 0x18, 0x96, 0x05, 0x9a, 0x07, 0x12, 0x80, 0xe2, 0xeb, 0x27, 0xb2, 0x75,
    0x09, 0x83, 0x2c, 0x1a, 0x1b, 0x6e, 0x5a, 0xa0, 0x52, 0x3b, 0xd6, 0xb3, 0x29, 0xe3, 0x2f, 0x84,
    0x53, 0xd1, 0x00, 0xed, 0x20, 0xfc, 0xb1, 0x5b, 0x6a, 0xcb, 0xbe, 0x39, 0x4a, 0x4c, 0x58, 0xcf,
    0xd0, 0xef, 0xaa, 0xfb, 0x43, 0x4d, 0x33, 0x85, 0x45, 0xf9, 0x02, 0x7f, 0x50, 0x3c, 0x9f, 0xa8,
    0x51, 0xa3, 0x40, 0x8f, 0x92, 0x9d, 0x38, 0xf5, 0xbc, 0xb6, 0xda, 0x21, 0x10, 0xff, 0xf3, 0xd2,
    0xcd, 0x0c, 0x13, 0xec, 0x5f, 0x97, 0x44, 0x17, 0xc4, 0xa7, 0x7e, 0x3d, 0x64, 0x5d, 0x19, 0x73,
    0x60, 0x81, 0x4f, 0xdc, 0x22, 0x2a, 0x90, 0x88, 0x46, 0xee, 0xb8, 0x14, 0xde, 0x5e, 0x0b, 0xdb,
    0xe0, 0x32, 0x3a, 0x0a, 0x49, 0x06, 0x24, 0x5c, 0xc2, 0xd3, 0xac, 0x62, 0x91, 0x95, 0xe4, 0x79,
    0xe7, 0xc8, 0x37, 0x6d, 0x8d, 0xd5, 0x4e, 0xa9, 0x6c, 0x56, 0xf4, 0xea, 0x65, 0x7a, 0xae, 0x08,
    0xba, 0x78, 0x25, 0x2e, 0x1c, 0xa6, 0xb4, 0xc6, 0xe8, 0xdd, 0x74, 0x1f, 0x4b, 0xbd, 0x8b, 0x8a,
    0x70, 0x3e, 0xb5, 0x66, 0x48, 0x03, 0xf6, 0x0e, 0x61, 0x35, 0x57, 0xb9, 0x86, 0xc1, 0x1d, 0x9e,
    0xe1, 0xf8, 0x98, 0x11, 0x69, 0xd9, 0x8e, 0x94, 0x9b, 0x1e, 0x87, 0xe9, 0xce, 0x55, 0x28, 0xdf,
    0x8c, 0xa1, 0x89, 0x0d, 0xbf, 0xe6, 0x42, 0x68, 0x41, 0x99, 0x2d, 0x0f, 0xb0, 0x54, 0xbb, 0x16,
];

/// S-box SQ, derived from the Dickson polynomial
const SQ: [u8; 256] = [
    0x25, 0x24, 0x73, 0x67, 0xd7, 0xae, 0x5c, 0x30, 0xa4, 0xee, 0x6e, 0xcb, 0x7d, 0xb5, 0x82, 0xdb,
    0xe4, 0x8e, 0x48, 0x49, 0x4f, 0x5d, 0x6a, 0x78, 0x70, 0x88, 0xe8, 0x5f, 0x5e, 0x84, 0x65, 0xe2,
    0xd8, 0xe9, 0xcc, 0xed, 0x40, 0x2f, 0x11, 0x28, 0x57, 0xd2, 0xac, 0xe3, 0x4a, 0x15, 0x1b, 0xb9,
    0xb2, 0x80, 0x85, 0xa6, 0x2e, 0x02, 0x47, 0x29, 0x07, 0x4b, 0x0e, 0xc1, 0x51, 0xaa, 0x89, 0xd4,
    0xca, 0x01, 0x46, 0xb3, 0xef, 0xdd, 0x44, 0x7b, 0xc2, 0x7f, 0xbe, 0xc3, 0x9f, 0x20, 0x4c, 0x64,
    0x83, 0xa2, 0x68, 0x42, 0x13, 0xb4, 0x41, 0xcd, 0xba, 0xc6, 0xbb, 0x6d, 0x4d, 0x71, 0x21, 0xf4,
    0x8d, 0xb0, 0xe5, 0x93, 0xfe, 0x8f, 0xe6, 0xcf, 0x43, 0x45, 0x31, 0x22, 0x37, 0x36, 0x96, 0xfa,
    0xbc, 0x0f, 0x08, 0x52, 0x1d, 0x55, 0x1a, 0xc5, 0x4e, 0x23, 0x69, 0x7a, 0x92, 0xff, 0x5b, 0x5a,
    0xeb, 0x9a, 0x1c, 0xa9, 0xd1, 0x7e, 0x0d, 0xfc, 0x50, 0x8a, 0xb6, 0x62, 0xf5, 0x0a, 0xf8, 0xdc,
    0x03, 0x3c, 0x0c, 0x39, 0xf1, 0xb8, 0xf3, 0x3d, 0xf2, 0xd5, 0x97, 0x66, 0x81, 0x32, 0xa0, 0x00,
    0x06, 0xce, 0xf6, 0xea, 0xb7, 0x17, 0xf7, 0x8c, 0x79, 0xd6, 0xa7, 0xbf, 0x8b, 0x3f, 0x1f, 0x53,
    0x63, 0x75, 0x35, 0x2c, 0x60, 0xfd, 0x27, 0xd3, 0x94, 0xa5, 0x7c, 0xa1, 0x05, 0x58, 0x2d, 0xbd,
    0xd9, 0xc7, 0xaf, 0x6b, 0x54, 0x0b, 0xe0, 0x38, 0x04, 0xc8, 0x9d, 0xe7, 0x14, 0xb1, 0x87, 0x9c,
    0xdf, 0x6f, 0xf9, 0xda, 0x2a, 0xc4, 0x59, 0x16, 0x74, 0x91, 0xab, 0x26, 0x61, 0x76, 0x34, 0x2b,
    0xad, 0x99, 0xfb, 0x72, 0xec, 0x33, 0x12, 0xde, 0x98, 0x3b, 0xc0, 0x9b, 0x3e, 0x18, 0x10, 0x3a,
    0x56, 0xe1, 0x77, 0xc9, 0x1e, 0x9e, 0x95, 0xa3, 0x90, 0x19, 0xa8, 0x6c, 0x09, 0xd0, 0xf0, 0x86,
];

fn mul_x(v: u8, c: u8) -> u8 {
    if v & 0x80 != 0 {
        (v << 1) ^ c
    } else {
        v << 1
    }
}

fn mul_x_pow(mut v: u8, i: u8, c: u8) -> u8 {
    for _ in 0..i {
        v = mul_x(v, c);
    }
    v
}

fn mul_alpha(c: u8) -> u32 {
    u32::from_be_bytes([
        mul_x_pow(c, 23, 0xa9),
        mul_x_pow(c, 245, 0xa9),
        mul_x_pow(c, 48, 0xa9),
        mul_x_pow(c, 239, 0xa9),
    ])
}

fn div_alpha(c: u8) -> u32 {
    u32::from_be_bytes([
        mul_x_pow(c, 16, 0xa9),
        mul_x_pow(c, 39, 0xa9),
        mul_x_pow(c, 6, 0xa9),
        mul_x_pow(c, 64, 0xa9),
    ])
}

/// 32-bit S-box built from a byte S-box and a MixColumns-like step over `c`
fn sbox(w: u32, table: &[u8; 256], c: u8) -> u32 {
    let [w0, w1, w2, w3] = w.to_be_bytes().map(|b| table[b as usize]);
    u32::from_be_bytes([
        mul_x(w0, c) ^ w1 ^ w2 ^ mul_x(w3, c) ^ w3,
        mul_x(w0, c) ^ w0 ^ mul_x(w1, c) ^ w2 ^ w3,
        w0 ^ mul_x(w1, c) ^ w1 ^ mul_x(w2, c) ^ w3,
        w0 ^ w1 ^ mul_x(w2, c) ^ w2 ^ mul_x(w3, c),
    ])
}

/// LFSR and FSM state
struct Snow3g {
    s: [u32; 16],
    r1: u32,
    r2: u32,
    r3: u32,
}

impl Snow3g {
    /// Load key and IV words and run the 32 initialisation clocks
    fn new(key: &[u8; 16], iv: [u32; 4]) -> Self {
        let mut k = [0u32; 4];
        for (i, chunk) in key.chunks_exact(4).enumerate() {
            k[3 - i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let mut s = [0u32; 16];
        s[15] = k[3] ^ iv[0];
        s[14] = k[2];
        s[13] = k[1];
        s[12] = k[0] ^ iv[1];
        s[11] = !k[3];
        s[10] = !k[2] ^ iv[2];
        s[9] = !k[1] ^ iv[3];
        s[8] = !k[0];
        s[7] = k[3];
        s[6] = k[2];
        s[5] = k[1];
        s[4] = k[0];
        s[3] = !k[3];
        s[2] = !k[2];
        s[1] = !k[1];
        s[0] = !k[0];

        let mut state = Snow3g { s, r1: 0, r2: 0, r3: 0 };
        for _ in 0..32 {
            let f = state.clock_fsm();
            state.clock_lfsr(f);
        }
        // the first keystream word is discarded
        state.clock_fsm();
        state.clock_lfsr(0);
        state
    }

    fn clock_lfsr(&mut self, f: u32) {
        let s0 = self.s[0];
        let s11 = self.s[11];
        let v = (s0 << 8)
            ^ mul_alpha((s0 >> 24) as u8)
            ^ self.s[2]
            ^ (s11 >> 8)
            ^ div_alpha(s11 as u8)
            ^ f;
        self.s.copy_within(1.., 0);
        self.s[15] = v;
    }

    fn clock_fsm(&mut self) -> u32 {
        let f = self.s[15].wrapping_add(self.r1) ^ self.r2;
        let r = self.r2.wrapping_add(self.r3 ^ self.s[5]);
        self.r3 = sbox(self.r2, &SQ, 0x69);
        self.r2 = sbox(self.r1, &SR, 0x1b);
        self.r1 = r;
        f
    }

    fn next_word(&mut self) -> u32 {
        let z = self.clock_fsm() ^ self.s[0];
        self.clock_lfsr(0);
        z
    }
}

/// UEA2: XOR the first `length` bits of `data` with the keystream
///
/// Output bits past `length` are zero.
pub fn f8(key: &[u8; 16], count: u32, bearer: u8, direction: u8, data: &[u8], length: usize) -> Vec<u8> {
    let bytes = length.div_ceil(8).min(data.len());
    let word2 = (u32::from(bearer & 0x1f) << 27) | (u32::from(direction & 0x01) << 26);
    let mut state = Snow3g::new(key, [word2, count, word2, count]);

    let mut out = data[..bytes].to_vec();
    for chunk in out.chunks_mut(4) {
        let ks = state.next_word().to_be_bytes();
        for (byte, k) in chunk.iter_mut().zip(ks) {
            *byte ^= k;
        }
    }
    if length % 8 != 0 && bytes == length.div_ceil(8) {
        if let Some(last) = out.last_mut() {
            *last &= 0xffu8 << (8 - length % 8);
        }
    }
    out
}

fn mul64x(v: u64, c: u64) -> u64 {
    if v & 0x8000_0000_0000_0000 != 0 {
        (v << 1) ^ c
    } else {
        v << 1
    }
}

/// Multiplication in GF(2^64) with the reduction constant `c`
fn mul64(mut v: u64, p: u64, c: u64) -> u64 {
    let mut result = 0u64;
    for i in 0..64 {
        if (p >> i) & 1 != 0 {
            result ^= v;
        }
        v = mul64x(v, c);
    }
    result
}

/// UIA2: 32-bit MAC over the first `length` bits of `data`
pub fn f9(key: &[u8; 16], count: u32, fresh: u32, direction: u8, data: &[u8], length: u64) -> [u8; 4] {
    let dir = u32::from(direction & 0x01);
    let iv = [fresh ^ (dir << 15), count ^ (dir << 31), fresh, count];
    let mut state = Snow3g::new(key, iv);
    let z: Vec<u32> = (0..5).map(|_| state.next_word()).collect();
    let p = (u64::from(z[0]) << 32) | u64::from(z[1]);
    let q = (u64::from(z[2]) << 32) | u64::from(z[3]);

    let mut eval = 0u64;
    let mut remaining = length;
    let mut blocks = data.chunks(8);
    while remaining > 0 {
        let mut block = [0u8; 8];
        if let Some(chunk) = blocks.next() {
            block[..chunk.len()].copy_from_slice(chunk);
        }
        let mut m = u64::from_be_bytes(block);
        if remaining < 64 {
            m &= !(u64::MAX >> remaining);
        }
        eval = mul64(eval ^ m, p, 0x1b);
        remaining = remaining.saturating_sub(64);
    }
    eval ^= length;
    eval = mul64(eval, q, 0x1b);

    (((eval >> 32) as u32) ^ z[4]).to_be_bytes()
}
