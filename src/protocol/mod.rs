//! Chip-independent wire protocol helpers.

pub mod stream;
pub mod xmodem;

pub use stream::AddressPrefix;
pub use xmodem::{ChecksumKind, XmodemConfig, XmodemSender};
