//! Block-structured, tag-addressed firmware container format.
//!
//! Fixed 512-byte blocks carry firmware payloads plus typed key/length/value
//! tags. Two firmware variants (dual OTA) can share one block sequence:
//! OTA-1 bytes are stored directly and OTA-2 bytes are derived through
//! per-block binary patches.

pub mod binpatch;
pub mod block;
pub mod context;
pub mod file;
pub mod flags;
pub mod tag;

pub use block::{Block, BLOCK_SIZE, DATA_SIZE};
pub use context::{OtaIndex, UploadContext};
pub use file::Uf2File;
pub use flags::BlockFlags;
pub use tag::{Tag, TagMap};
