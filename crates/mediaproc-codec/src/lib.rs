pub mod cenc;
pub mod ctr;

pub use cenc::{CencDecryptor, DecryptError, KeyRequest, ProtectionInfo, Subsample};
pub use ctr::AesCtrState;
