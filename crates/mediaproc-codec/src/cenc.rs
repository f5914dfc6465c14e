// Common-encryption (CENC, `cenc` scheme) sample decryption with ClearKey.

use std::sync::{Condvar, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ctr::{AesCtrState, KEY_SIZE};

/// ClearKey protection system id.
pub const CLEAR_KEY_SYSTEM_ID: &str = "58147ec8-0423-4659-92e6-f52c5ce8c3cc";

/// Size of one serialized subsample entry (u16 clear + u32 encrypted).
pub const SUBSAMPLE_ENTRY_SIZE: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("invalid key length {0} (expected {KEY_SIZE})")]
    InvalidKeyLength(usize),
    #[error("invalid iv length {0} (expected 8 or 16)")]
    InvalidIvLength(usize),
    #[error("no key available")]
    NoKey,
    #[error("decryption cancelled")]
    Cancelled,
    #[error("subsample table is truncated: {0} bytes")]
    TruncatedSubsamples(usize),
    #[error("subsamples cover {covered} bytes but the sample has {len}")]
    SubsampleOutOfBounds { covered: usize, len: usize },
    #[error("unsupported protection system {0}")]
    UnsupportedSystem(String),
    #[error("unsupported protection event origin {0}")]
    UnsupportedOrigin(String),
}

/// One clear/encrypted run of a subsampled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsample {
    pub clear_bytes: u16,
    pub encrypted_bytes: u32,
}

/// Per-sample protection metadata attached by the demuxer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectionInfo {
    pub encrypted: bool,
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    pub subsamples: Vec<Subsample>,
}

/// Emitted when the demuxer reports protection data we can handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub system_id: String,
    pub init_data: Vec<u8>,
}

/// Parse `count` big-endian (u16 clear, u32 encrypted) entries.
pub fn parse_subsamples(data: &[u8], count: usize) -> Result<Vec<Subsample>, DecryptError> {
    let needed = count * SUBSAMPLE_ENTRY_SIZE;
    if data.len() < needed {
        return Err(DecryptError::TruncatedSubsamples(data.len()));
    }
    Ok(data[..needed]
        .chunks_exact(SUBSAMPLE_ENTRY_SIZE)
        .map(|entry| Subsample {
            clear_bytes: u16::from_be_bytes([entry[0], entry[1]]),
            encrypted_bytes: u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]),
        })
        .collect())
}

#[derive(Default)]
struct KeyState {
    key: Option<[u8; KEY_SIZE]>,
    /// Set once the first key arrives; never cleared.
    received: bool,
    cancelled: bool,
}

/// ClearKey decryptor shared between the key-delivery path and the
/// streaming thread that decrypts samples.
///
/// Decryption blocks until a key has been delivered at least once.
#[derive(Default)]
pub struct CencDecryptor {
    state: Mutex<KeyState>,
    key_arrived: Condvar,
}

impl CencDecryptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a protection event from the demuxer.
    pub fn on_protection_event(
        &self,
        system_id: &str,
        init_data: &[u8],
        origin: &str,
    ) -> Result<KeyRequest, DecryptError> {
        if !system_id.eq_ignore_ascii_case(CLEAR_KEY_SYSTEM_ID) {
            return Err(DecryptError::UnsupportedSystem(system_id.to_string()));
        }
        if !origin.starts_with("isobmff/") {
            return Err(DecryptError::UnsupportedOrigin(origin.to_string()));
        }
        debug!(origin, len = init_data.len(), "cenc: protection event accepted");
        Ok(KeyRequest {
            system_id: CLEAR_KEY_SYSTEM_ID.to_string(),
            init_data: init_data.to_vec(),
        })
    }

    /// Install the content key and wake any waiting decrypt calls.
    pub fn add_key(&self, key: &[u8]) -> Result<(), DecryptError> {
        let key: [u8; KEY_SIZE] = key
            .try_into()
            .map_err(|_| DecryptError::InvalidKeyLength(key.len()))?;
        let mut state = self.lock();
        state.key = Some(key);
        state.received = true;
        drop(state);
        self.key_arrived.notify_all();
        info!("cenc: key received");
        Ok(())
    }

    /// Forget the current key. Later decrypts fail instead of waiting.
    pub fn remove_key(&self) {
        self.lock().key = None;
    }

    /// Unblock every pending and future decrypt with `Cancelled`.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.key_arrived.notify_all();
    }

    /// Decrypt a sample in place.
    pub fn decrypt(&self, buffer: &mut [u8], info: &ProtectionInfo) -> Result<(), DecryptError> {
        if !info.encrypted {
            return Ok(());
        }
        let key = self.wait_for_key()?;
        let mut ctr = AesCtrState::new(&key, &info.iv)?;

        if info.subsamples.is_empty() {
            ctr.apply_keystream(buffer);
            return Ok(());
        }

        let len = buffer.len();
        let mut pos = 0usize;
        for sub in &info.subsamples {
            let clear = sub.clear_bytes as usize;
            let encrypted = sub.encrypted_bytes as usize;
            let end = pos + clear + encrypted;
            if end > len {
                warn!(covered = end, len, "cenc: subsample table overruns buffer");
                return Err(DecryptError::SubsampleOutOfBounds { covered: end, len });
            }
            pos += clear;
            ctr.apply_keystream(&mut buffer[pos..end]);
            pos = end;
        }
        // Anything past the table is one trailing encrypted run.
        if pos < len {
            ctr.apply_keystream(&mut buffer[pos..]);
        }
        Ok(())
    }

    fn wait_for_key(&self) -> Result<[u8; KEY_SIZE], DecryptError> {
        let mut state = self.lock();
        while !state.received && !state.cancelled {
            debug!("cenc: waiting for key");
            state = match self.key_arrived.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        if state.cancelled {
            return Err(DecryptError::Cancelled);
        }
        state.key.ok_or(DecryptError::NoKey)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];
    const IV: [u8; 8] = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80];

    fn encrypt_contiguous(plain: &[u8]) -> Vec<u8> {
        let mut out = plain.to_vec();
        AesCtrState::new(&KEY, &IV).unwrap().apply_keystream(&mut out);
        out
    }

    #[test]
    fn subsamples_share_one_running_counter() {
        // Three encrypted runs of 5, 20 and 11 bytes separated by clear headers.
        let enc_runs: Vec<u8> = (0u8..36).collect();
        let cipher_runs = encrypt_contiguous(&enc_runs);

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&[0xaa; 3]);
        buffer.extend_from_slice(&cipher_runs[..5]);
        buffer.extend_from_slice(&[0xbb; 2]);
        buffer.extend_from_slice(&cipher_runs[5..25]);
        buffer.extend_from_slice(&[0xcc; 4]);
        buffer.extend_from_slice(&cipher_runs[25..]);

        let info = ProtectionInfo {
            encrypted: true,
            key_id: vec![1; 16],
            iv: IV.to_vec(),
            subsamples: vec![
                Subsample { clear_bytes: 3, encrypted_bytes: 5 },
                Subsample { clear_bytes: 2, encrypted_bytes: 20 },
                Subsample { clear_bytes: 4, encrypted_bytes: 11 },
            ],
        };
        let decryptor = CencDecryptor::new();
        decryptor.add_key(&KEY).unwrap();
        decryptor.decrypt(&mut buffer, &info).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0xaa; 3]);
        expected.extend_from_slice(&enc_runs[..5]);
        expected.extend_from_slice(&[0xbb; 2]);
        expected.extend_from_slice(&enc_runs[5..25]);
        expected.extend_from_slice(&[0xcc; 4]);
        expected.extend_from_slice(&enc_runs[25..]);
        assert_eq!(buffer, expected);
    }

    #[test]
    fn bytes_past_the_table_are_decrypted() {
        let plain: Vec<u8> = (0u8..10).collect();
        let cipher = encrypt_contiguous(&plain);
        let mut buffer = vec![0x11, 0x22];
        buffer.extend_from_slice(&cipher);

        let info = ProtectionInfo {
            encrypted: true,
            iv: IV.to_vec(),
            subsamples: vec![Subsample { clear_bytes: 2, encrypted_bytes: 4 }],
            ..Default::default()
        };
        let decryptor = CencDecryptor::new();
        decryptor.add_key(&KEY).unwrap();
        decryptor.decrypt(&mut buffer, &info).unwrap();
        assert_eq!(&buffer[..2], &[0x11, 0x22]);
        assert_eq!(&buffer[2..], &plain[..]);
    }

    #[test]
    fn clear_samples_pass_through_without_a_key() {
        let decryptor = CencDecryptor::new();
        let mut buffer = vec![1, 2, 3];
        decryptor
            .decrypt(&mut buffer, &ProtectionInfo::default())
            .unwrap();
        assert_eq!(buffer, vec![1, 2, 3]);
    }

    #[test]
    fn overrunning_table_is_rejected() {
        let decryptor = CencDecryptor::new();
        decryptor.add_key(&KEY).unwrap();
        let info = ProtectionInfo {
            encrypted: true,
            iv: IV.to_vec(),
            subsamples: vec![Subsample { clear_bytes: 4, encrypted_bytes: 8 }],
            ..Default::default()
        };
        let mut buffer = vec![0u8; 6];
        assert_eq!(
            decryptor.decrypt(&mut buffer, &info),
            Err(DecryptError::SubsampleOutOfBounds { covered: 12, len: 6 })
        );
    }

    #[test]
    fn decrypt_waits_for_the_first_key() {
        let decryptor = Arc::new(CencDecryptor::new());
        let plain = vec![7u8; 32];
        let cipher = encrypt_contiguous(&plain);

        let worker = {
            let decryptor = Arc::clone(&decryptor);
            thread::spawn(move || {
                let mut buffer = cipher;
                let info = ProtectionInfo {
                    encrypted: true,
                    iv: IV.to_vec(),
                    ..Default::default()
                };
                decryptor.decrypt(&mut buffer, &info).map(|_| buffer)
            })
        };
        thread::sleep(Duration::from_millis(50));
        decryptor.add_key(&KEY).unwrap();
        assert_eq!(worker.join().unwrap().unwrap(), plain);
    }

    #[test]
    fn removed_key_fails_instead_of_waiting() {
        let decryptor = CencDecryptor::new();
        decryptor.add_key(&KEY).unwrap();
        decryptor.remove_key();
        let info = ProtectionInfo {
            encrypted: true,
            iv: IV.to_vec(),
            ..Default::default()
        };
        assert_eq!(
            decryptor.decrypt(&mut [0u8; 4], &info),
            Err(DecryptError::NoKey)
        );
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let decryptor = Arc::new(CencDecryptor::new());
        let worker = {
            let decryptor = Arc::clone(&decryptor);
            thread::spawn(move || {
                let info = ProtectionInfo {
                    encrypted: true,
                    iv: IV.to_vec(),
                    ..Default::default()
                };
                decryptor.decrypt(&mut [0u8; 4], &info)
            })
        };
        thread::sleep(Duration::from_millis(20));
        decryptor.cancel();
        assert_eq!(worker.join().unwrap(), Err(DecryptError::Cancelled));
    }

    #[test]
    fn parses_big_endian_subsample_table() {
        let raw = [0x00, 0x10, 0x00, 0x00, 0x01, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x01];
        let subs = parse_subsamples(&raw, 2).unwrap();
        assert_eq!(
            subs,
            vec![
                Subsample { clear_bytes: 16, encrypted_bytes: 256 },
                Subsample { clear_bytes: 0xffff, encrypted_bytes: 1 },
            ]
        );
        assert_eq!(
            parse_subsamples(&raw, 3),
            Err(DecryptError::TruncatedSubsamples(12))
        );
    }

    #[test]
    fn only_clear_key_isobmff_events_are_accepted() {
        let decryptor = CencDecryptor::new();
        let req = decryptor
            .on_protection_event(CLEAR_KEY_SYSTEM_ID, b"pssh", "isobmff/moov")
            .unwrap();
        assert_eq!(req.init_data, b"pssh".to_vec());
        assert!(matches!(
            decryptor.on_protection_event("edef8ba9-79d6-4ace-a3c8-27dcd51d21ed", b"", "isobmff/moov"),
            Err(DecryptError::UnsupportedSystem(_))
        ));
        assert!(matches!(
            decryptor.on_protection_event(CLEAR_KEY_SYSTEM_ID, b"", "webm"),
            Err(DecryptError::UnsupportedOrigin(_))
        ));
    }
}
