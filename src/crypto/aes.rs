//! AES block cipher (FIPS 197) for 128, 192 and 256 bit keys.
//!
//! Only the single-block primitive lives here; chaining is the caller's job
//! (see [`super::xts`]).

use super::{CipherError, Result};
use once_cell::sync::Lazy;
use std::fmt;
use zeroize::Zeroize;

pub const BLOCK_SIZE: usize = 16;
const MAX_ROUNDS: usize = 14;

#[rustfmt::skip]
static SBOX: [u8; 256] = [
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

static INV_SBOX: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut inv = [0u8; 256];
    for (i, &s) in SBOX.iter().enumerate() {
        inv[s as usize] = i as u8;
    }
    inv
});

const RCON: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36];

/// Expanded AES key schedule. Round keys are wiped on drop.
pub struct Aes {
    round_keys: [[u8; BLOCK_SIZE]; MAX_ROUNDS + 1],
    rounds: usize,
}

impl Aes {
    /// Expands `key` into a round-key schedule.
    ///
    /// Accepts 16, 24 or 32 byte keys (Nk = 4, 6 or 8 words), giving 10, 12
    /// or 14 rounds respectively.
    pub fn new(key: &[u8]) -> Result<Self> {
        let nk = match key.len() {
            16 | 24 | 32 => key.len() / 4,
            len => return Err(CipherError::InvalidKeyLength(len)),
        };
        let rounds = nk + 6;
        let total_words = 4 * (rounds + 1);

        let mut words = [[0u8; 4]; 4 * (MAX_ROUNDS + 1)];
        for (word, chunk) in words.iter_mut().zip(key.chunks_exact(4)) {
            word.copy_from_slice(chunk);
        }
        for i in nk..total_words {
            let mut temp = words[i - 1];
            if i % nk == 0 {
                temp.rotate_left(1);
                sub_word(&mut temp);
                temp[0] ^= RCON[i / nk - 1];
            } else if nk > 6 && i % nk == 4 {
                sub_word(&mut temp);
            }
            for j in 0..4 {
                words[i][j] = words[i - nk][j] ^ temp[j];
            }
            temp.zeroize();
        }

        let mut round_keys = [[0u8; BLOCK_SIZE]; MAX_ROUNDS + 1];
        for (round, round_key) in round_keys.iter_mut().take(rounds + 1).enumerate() {
            for c in 0..4 {
                round_key[4 * c..4 * c + 4].copy_from_slice(&words[4 * round + c]);
            }
        }
        words.zeroize();

        Ok(Self { round_keys, rounds })
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        add_round_key(block, &self.round_keys[0]);
        for round in 1..self.rounds {
            sub_bytes(block);
            shift_rows(block);
            mix_columns(block);
            add_round_key(block, &self.round_keys[round]);
        }
        sub_bytes(block);
        shift_rows(block);
        add_round_key(block, &self.round_keys[self.rounds]);
    }

    pub fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        add_round_key(block, &self.round_keys[self.rounds]);
        for round in (1..self.rounds).rev() {
            inv_shift_rows(block);
            inv_sub_bytes(block);
            add_round_key(block, &self.round_keys[round]);
            inv_mix_columns(block);
        }
        inv_shift_rows(block);
        inv_sub_bytes(block);
        add_round_key(block, &self.round_keys[0]);
    }
}

impl Drop for Aes {
    fn drop(&mut self) {
        self.round_keys.zeroize();
    }
}

impl fmt::Debug for Aes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes")
            .field("rounds", &self.rounds)
            .field("round_keys", &"[REDACTED]")
            .finish()
    }
}

fn sub_word(word: &mut [u8; 4]) {
    for b in word.iter_mut() {
        *b = SBOX[*b as usize];
    }
}

// State byte `i` sits at row `i % 4`, column `i / 4`.

fn add_round_key(state: &mut [u8; BLOCK_SIZE], round_key: &[u8; BLOCK_SIZE]) {
    for (s, k) in state.iter_mut().zip(round_key) {
        *s ^= k;
    }
}

fn sub_bytes(state: &mut [u8; BLOCK_SIZE]) {
    for b in state.iter_mut() {
        *b = SBOX[*b as usize];
    }
}

fn inv_sub_bytes(state: &mut [u8; BLOCK_SIZE]) {
    let inv = &*INV_SBOX;
    for b in state.iter_mut() {
        *b = inv[*b as usize];
    }
}

fn shift_rows(state: &mut [u8; BLOCK_SIZE]) {
    let old = *state;
    for r in 1..4 {
        for c in 0..4 {
            state[r + 4 * c] = old[r + 4 * ((c + r) % 4)];
        }
    }
}

fn inv_shift_rows(state: &mut [u8; BLOCK_SIZE]) {
    let old = *state;
    for r in 1..4 {
        for c in 0..4 {
            state[r + 4 * ((c + r) % 4)] = old[r + 4 * c];
        }
    }
}

/// Multiplication by `x` in GF(2^8) modulo `x^8 + x^4 + x^3 + x + 1`.
fn xtime(b: u8) -> u8 {
    (b << 1) ^ if b & 0x80 != 0 { 0x1b } else { 0 }
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        a = xtime(a);
        b >>= 1;
    }
    product
}

fn mix_columns(state: &mut [u8; BLOCK_SIZE]) {
    for column in state.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [column[0], column[1], column[2], column[3]];
        column[0] = xtime(a0) ^ xtime(a1) ^ a1 ^ a2 ^ a3;
        column[1] = a0 ^ xtime(a1) ^ xtime(a2) ^ a2 ^ a3;
        column[2] = a0 ^ a1 ^ xtime(a2) ^ xtime(a3) ^ a3;
        column[3] = xtime(a0) ^ a0 ^ a1 ^ a2 ^ xtime(a3);
    }
}

fn inv_mix_columns(state: &mut [u8; BLOCK_SIZE]) {
    for column in state.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [column[0], column[1], column[2], column[3]];
        column[0] = gf_mul(a0, 0x0e) ^ gf_mul(a1, 0x0b) ^ gf_mul(a2, 0x0d) ^ gf_mul(a3, 0x09);
        column[1] = gf_mul(a0, 0x09) ^ gf_mul(a1, 0x0e) ^ gf_mul(a2, 0x0b) ^ gf_mul(a3, 0x0d);
        column[2] = gf_mul(a0, 0x0d) ^ gf_mul(a1, 0x09) ^ gf_mul(a2, 0x0e) ^ gf_mul(a3, 0x0b);
        column[3] = gf_mul(a0, 0x0b) ^ gf_mul(a1, 0x0d) ^ gf_mul(a2, 0x09) ^ gf_mul(a3, 0x0e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    const PLAINTEXT: &str = "00112233445566778899aabbccddeeff";

    fn block(hex_str: &str) -> Result<[u8; BLOCK_SIZE]> {
        let mut out = [0u8; BLOCK_SIZE];
        hex::decode_to_slice(hex_str, &mut out)?;
        Ok(out)
    }

    fn check_vector(key: &str, expected: &str, rounds: usize) -> Result<()> {
        let aes = Aes::new(&hex::decode(key)?)?;
        assert_eq!(aes.rounds(), rounds);
        let mut data = block(PLAINTEXT)?;
        aes.encrypt_block(&mut data);
        assert_eq!(hex::encode(data), expected);
        aes.decrypt_block(&mut data);
        assert_eq!(hex::encode(data), PLAINTEXT);
        Ok(())
    }

    #[test]
    fn fips197_aes128() -> Result<()> {
        check_vector(
            "000102030405060708090a0b0c0d0e0f",
            "69c4e0d86a7b0430d8cdb78070b4c55a",
            10,
        )
    }

    #[test]
    fn fips197_aes192() -> Result<()> {
        check_vector(
            "000102030405060708090a0b0c0d0e0f1011121314151617",
            "dda97ca4864cdfe06eaf70a0ec0d7191",
            12,
        )
    }

    #[test]
    fn fips197_aes256() -> Result<()> {
        check_vector(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
            "8ea2b7ca516745bfeafc49904b496089",
            14,
        )
    }

    #[test]
    fn fips197_appendix_b() -> Result<()> {
        let aes = Aes::new(&hex::decode("2b7e151628aed2a6abf7158809cf4f3c")?)?;
        let mut data = block("3243f6a8885a308d313198a2e0370734")?;
        aes.encrypt_block(&mut data);
        assert_eq!(hex::encode(data), "3925841d02dc09fbdc118597196a0b32");
        Ok(())
    }

    #[test]
    fn round_trips_for_every_key_size() -> Result<()> {
        for key_len in [16, 24, 32] {
            let key: Vec<u8> = (0..key_len as u8).map(|b| b.wrapping_mul(37)).collect();
            let aes = Aes::new(&key)?;
            for seed in 0..64u8 {
                let original: [u8; BLOCK_SIZE] =
                    core::array::from_fn(|i| seed.wrapping_mul(13).wrapping_add(i as u8 * 7));
                let mut data = original;
                aes.encrypt_block(&mut data);
                assert_ne!(data, original);
                aes.decrypt_block(&mut data);
                assert_eq!(data, original);
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_bad_key_lengths() {
        for len in [0, 8, 15, 17, 20, 31, 33, 64] {
            assert_eq!(
                Aes::new(&vec![0u8; len]).unwrap_err(),
                CipherError::InvalidKeyLength(len)
            );
        }
    }

    #[test]
    fn inverse_sbox_inverts() {
        for i in 0..=255u8 {
            assert_eq!(INV_SBOX[SBOX[i as usize] as usize], i);
        }
    }

    #[test]
    fn debug_hides_round_keys() -> Result<()> {
        let aes = Aes::new(&[0x5a; 16])?;
        let rendered = format!("{:?}", aes);
        assert!(rendered.contains("REDACTED"));
        Ok(())
    }
}
