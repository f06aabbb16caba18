//! # uf2flash
//!
//! Serial flashing engines and dual-OTA UF2 container tooling for IoT
//! microcontrollers.
//!
//! This crate provides the core of a firmware flashing tool:
//!
//! - per-chip link/transfer protocol engines (bootloader handshake, baud
//!   negotiation, chunked verified reads and writes over a serial link)
//! - a block-structured, tag-addressed container format able to carry two
//!   firmware variants (dual OTA) through one block sequence
//! - a compact binary patch engine deriving OTA-2 bytes from OTA-1 bytes
//! - an upload context replaying container blocks into contiguous write
//!   jobs
//!
//! ## Supported chips
//!
//! - Realtek AmebaZ (RTL8710B family)
//! - Beken BK72xx (BK7231T/BK7231N)
//!
//! Front-ends, board descriptor files and image packaging live in the
//! embedding application; this crate consumes a [`BoardLayout`] and a
//! [`FlashProgress`] from it and exposes the [`Flasher`] driver surface.
//!
//! ## Example
//!
//! ```rust,no_run
//! use uf2flash::{ChipFamily, Flasher, NoProgress, PartitionMap, Uf2File, UploadContext};
//!
//! fn main() -> uf2flash::Result<()> {
//!     let file = Uf2File::from_file("firmware.uf2")?;
//!     let family = ChipFamily::from_family_id(file.family_id.unwrap_or(0))?;
//!     let mut ctx = UploadContext::new(file)?;
//!
//!     let layout = PartitionMap::new()
//!         .with("app", 0x11000, 0x121000)
//!         .with("ota2", 0x132000, 0xAE000);
//!
//!     let mut flasher = family.create_flasher("/dev/ttyUSB0", None)?;
//!     flasher.connect(&mut NoProgress)?;
//!     flasher.write_container(&mut ctx, &layout, true, &mut NoProgress)?;
//!     flasher.disconnect()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod layout;
pub mod port;
pub mod progress;
pub mod protocol;
pub mod target;
pub mod transport;
pub mod uf2;

// Re-exports for convenience
pub use error::{Error, Result};
pub use layout::{BoardLayout, MemoryRange, PartitionMap};
pub use port::{NativePort, Port};
pub use progress::{FlashProgress, NoProgress};
pub use target::{ChipFamily, Flasher, LinkState};
pub use transport::Transport;
pub use uf2::{Block, OtaIndex, Tag, TagMap, Uf2File, UploadContext};
