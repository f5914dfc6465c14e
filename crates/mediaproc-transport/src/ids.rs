use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Identifies a media player inside one renderer channel. Chosen by the renderer.
pub type PlayerId = i32;

/// Identifies a renderer process (the client of a per-renderer channel).
pub type ClientId = i32;

/// Browser-assigned media process host id. Monotonic, never reused.
pub type HostId = i32;

/// GL texture name produced by the pipeline's video sink.
pub type TextureId = u32;

/// Correlates an `EstablishChannel` request with its `ChannelEstablished` reply.
pub type RequestId = u64;

/// Mailbox name size in bytes.
pub const MAILBOX_SIZE: usize = 16;

/// Cross-context token under which a texture is published to the compositor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mailbox {
    pub name: [u8; MAILBOX_SIZE],
}

impl Mailbox {
    /// Generate a fresh random mailbox name.
    pub fn generate() -> Self {
        let mut name = [0u8; MAILBOX_SIZE];
        rand::thread_rng().fill_bytes(&mut name);
        Self { name }
    }

    pub fn is_zero(&self) -> bool {
        self.name.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mailbox(")?;
        for b in &self.name {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_mailboxes_differ() {
        let a = Mailbox::generate();
        let b = Mailbox::generate();
        assert_ne!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn debug_is_hex() {
        let mb = Mailbox { name: [0xab; MAILBOX_SIZE] };
        assert_eq!(format!("{mb:?}"), format!("Mailbox({})", "ab".repeat(16)));
    }
}
