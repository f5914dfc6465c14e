// AES-128 counter mode with resumable keystream position.

use aes_gcm::aes::cipher::{BlockEncrypt, KeyInit};
use aes_gcm::aes::{Aes128, Block};

use crate::cenc::DecryptError;

/// AES-128 key size in bytes.
pub const KEY_SIZE: usize = 16;
/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Running AES-CTR state.
///
/// The keystream position survives across calls: a block that was only
/// partially consumed is finished by the next call before the counter
/// advances again. This lets one state decrypt the encrypted runs of a
/// subsampled buffer as a single contiguous stream.
pub struct AesCtrState {
    cipher: Aes128,
    counter: [u8; BLOCK_SIZE],
    keystream: [u8; BLOCK_SIZE],
    offset: usize,
}

impl AesCtrState {
    /// `iv` is either a full 16-byte counter block or an 8-byte IV that
    /// occupies the high half with a zero block counter.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, DecryptError> {
        let cipher =
            Aes128::new_from_slice(key).map_err(|_| DecryptError::InvalidKeyLength(key.len()))?;

        let mut counter = [0u8; BLOCK_SIZE];
        match iv.len() {
            8 => counter[..8].copy_from_slice(iv),
            16 => counter.copy_from_slice(iv),
            n => return Err(DecryptError::InvalidIvLength(n)),
        }

        Ok(Self {
            cipher,
            counter,
            keystream: [0u8; BLOCK_SIZE],
            offset: 0,
        })
    }

    /// XOR `data` with the next bytes of keystream. Encrypts and decrypts.
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.offset == 0 {
                let mut block = Block::clone_from_slice(&self.counter);
                self.cipher.encrypt_block(&mut block);
                self.keystream.copy_from_slice(&block);
                increment_counter(&mut self.counter);
            }
            *byte ^= self.keystream[self.offset];
            self.offset = (self.offset + 1) % BLOCK_SIZE;
        }
    }
}

/// 128-bit big-endian increment.
fn increment_counter(counter: &mut [u8; BLOCK_SIZE]) {
    for b in counter.iter_mut().rev() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}
