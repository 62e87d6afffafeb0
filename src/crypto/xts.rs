//! XTS-AES (IEEE 1619) with ciphertext stealing.
//!
//! The key is split in two halves: the first keys the data cipher, the second
//! encrypts the initial tweak. Every data unit processed here is at least one
//! block long; a trailing partial block borrows bytes from the block before it.

use super::aes::{Aes, BLOCK_SIZE};
use super::{CipherError, Result};
use std::fmt;
use zeroize::Zeroize;

pub type Tweak = [u8; BLOCK_SIZE];

/// Little-endian tweak for a data-unit sequence number.
pub fn tweak_from_sequence(sequence: u64) -> Tweak {
    let mut tweak = [0u8; BLOCK_SIZE];
    tweak[..8].copy_from_slice(&sequence.to_le_bytes());
    tweak
}

/// Multiplies a tweak by `α` in GF(2^128), reducing by
/// `x^128 + x^7 + x^2 + x + 1`.
pub fn double_tweak(tweak: &mut Tweak) {
    let carry = tweak[BLOCK_SIZE - 1] >> 7;
    for i in (1..BLOCK_SIZE).rev() {
        tweak[i] = (tweak[i] << 1) | (tweak[i - 1] >> 7);
    }
    tweak[0] = (tweak[0] << 1) ^ (carry * 0x87);
}

pub struct Xts {
    data: Aes,
    tweak: Aes,
}

impl Xts {
    /// Builds the two ciphers from a 256 bit (2×AES-128) or 512 bit
    /// (2×AES-256) key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 && key.len() != 64 {
            return Err(CipherError::InvalidXtsKeyLength(key.len()));
        }
        let (data, tweak) = key.split_at(key.len() / 2);
        Ok(Self {
            data: Aes::new(data)?,
            tweak: Aes::new(tweak)?,
        })
    }

    pub fn encrypt(&self, tweak: &Tweak, buf: &mut [u8]) -> Result<()> {
        let len = check_len(buf)?;
        let mut t = self.initial_tweak(tweak);
        let full = len - len % BLOCK_SIZE;

        for chunk in buf[..full].chunks_exact_mut(BLOCK_SIZE) {
            self.encrypt_unit(chunk, &t);
            double_tweak(&mut t);
        }

        let r = len - full;
        if r > 0 {
            let (head, tail) = buf.split_at_mut(full);
            let last = &mut head[full - BLOCK_SIZE..];
            let mut block = [0u8; BLOCK_SIZE];
            block[..r].copy_from_slice(tail);
            block[r..].copy_from_slice(&last[r..]);
            tail.copy_from_slice(&last[..r]);
            self.encrypt_unit(&mut block, &t);
            last.copy_from_slice(&block);
            block.zeroize();
        }
        t.zeroize();
        Ok(())
    }

    pub fn decrypt(&self, tweak: &Tweak, buf: &mut [u8]) -> Result<()> {
        let len = check_len(buf)?;
        let mut t = self.initial_tweak(tweak);
        let r = len % BLOCK_SIZE;
        let full = if r == 0 { len } else { len - BLOCK_SIZE - r };

        for chunk in buf[..full].chunks_exact_mut(BLOCK_SIZE) {
            self.decrypt_unit(chunk, &t);
            double_tweak(&mut t);
        }

        if r > 0 {
            // The stolen block was written under the following tweak.
            let mut next = t;
            double_tweak(&mut next);

            let (head, tail) = buf.split_at_mut(full + BLOCK_SIZE);
            let last = &mut head[full..];
            self.decrypt_unit(last, &next);

            let mut block = [0u8; BLOCK_SIZE];
            block[..r].copy_from_slice(tail);
            block[r..].copy_from_slice(&last[r..]);
            tail.copy_from_slice(&last[..r]);
            self.decrypt_unit(&mut block, &t);
            last.copy_from_slice(&block);

            block.zeroize();
            next.zeroize();
        }
        t.zeroize();
        Ok(())
    }

    fn initial_tweak(&self, seed: &Tweak) -> Tweak {
        let mut t = *seed;
        self.tweak.encrypt_block(&mut t);
        t
    }

    fn encrypt_unit(&self, chunk: &mut [u8], t: &Tweak) {
        let mut block = xor_block(chunk, t);
        self.data.encrypt_block(&mut block);
        store_xor(chunk, &block, t);
        block.zeroize();
    }

    fn decrypt_unit(&self, chunk: &mut [u8], t: &Tweak) {
        let mut block = xor_block(chunk, t);
        self.data.decrypt_block(&mut block);
        store_xor(chunk, &block, t);
        block.zeroize();
    }
}

impl fmt::Debug for Xts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xts")
            .field("rounds", &self.data.rounds())
            .finish_non_exhaustive()
    }
}

fn check_len(buf: &[u8]) -> Result<usize> {
    match buf.len() {
        len if len < BLOCK_SIZE => Err(CipherError::DataTooShort(len)),
        len => Ok(len),
    }
}

fn xor_block(chunk: &[u8], t: &Tweak) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    for ((b, c), k) in block.iter_mut().zip(chunk).zip(t) {
        *b = c ^ k;
    }
    block
}

fn store_xor(chunk: &mut [u8], block: &[u8; BLOCK_SIZE], t: &Tweak) {
    for ((c, b), k) in chunk.iter_mut().zip(block).zip(t) {
        *c = b ^ k;
    }
}
