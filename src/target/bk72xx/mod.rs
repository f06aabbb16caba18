//! Beken BK72xx support.

pub mod protocol;

mod flasher;

pub use flasher::Bk72xxFlasher;
