//! Chip family registry and the device driver surface.

pub mod ambz;
pub mod bk72xx;

use crate::error::{Error, Result};
use crate::layout::BoardLayout;
use crate::port::{NativePort, Port};
use crate::progress::FlashProgress;
use crate::uf2::UploadContext;
use std::fmt;
use std::io::{Read, Write};

/// Link state of a flashing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No confirmed communication yet.
    #[default]
    Unlinked,
    /// Probe/handshake in progress.
    Probing,
    /// Boot ROM confirmed responsive.
    Linked,
}

/// Supported chip families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    /// Realtek AmebaZ (RTL8710B and friends).
    Ambz,
    /// Beken BK72xx (BK7231T/BK7231N).
    Bk72xx,
}

/// Container family ids mapped to protocol implementations.
///
/// Values are the public UF2 family registry entries for these chips.
const FAMILY_TABLE: &[(u32, ChipFamily)] = &[
    (0x9FFFD543, ChipFamily::Ambz),   // RTL8710B
    (0x675A40B0, ChipFamily::Bk72xx), // BK7231T
    (0x7B3EF230, ChipFamily::Bk72xx), // BK7231N
];

impl ChipFamily {
    /// Look up a family by its lowercase code name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "ambz" | "realtek-ambz" | "rtl8710b" => Some(Self::Ambz),
            "bk72xx" | "beken-72xx" | "bk7231t" | "bk7231n" => Some(Self::Bk72xx),
            _ => None,
        }
    }

    /// Resolve a container family id to a protocol implementation.
    pub fn from_family_id(id: u32) -> Result<Self> {
        FAMILY_TABLE
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, family)| *family)
            .ok_or_else(|| Error::UnsupportedFamily(format!("0x{id:08X}")))
    }

    /// Container family ids this implementation accepts.
    #[must_use]
    pub fn family_ids(&self) -> Vec<u32> {
        FAMILY_TABLE
            .iter()
            .filter(|(_, family)| family == self)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Default working baud rate for bulk transfers.
    ///
    /// Most cheap USB-UART adapters cannot go faster than this reliably.
    #[must_use]
    pub fn default_baud(&self) -> u32 {
        match self {
            Self::Ambz => 460_800,
            Self::Bk72xx => 921_600,
        }
    }

    /// Open a serial port and build the flasher for this family.
    pub fn create_flasher(&self, port_name: &str, baud_rate: Option<u32>) -> Result<Box<dyn Flasher>> {
        let baud = baud_rate.unwrap_or_else(|| self.default_baud());
        match self {
            Self::Ambz => {
                let port = NativePort::open(port_name, ambz::protocol::ROM_BAUD)?;
                Ok(Box::new(ambz::AmbzFlasher::new(port, baud)))
            },
            Self::Bk72xx => {
                let port = NativePort::open(port_name, bk72xx::protocol::LINK_BAUD)?;
                Ok(Box::new(bk72xx::Bk72xxFlasher::new(port, baud)))
            },
        }
    }

    /// Build a flasher around an already-open port.
    ///
    /// Useful for tests and custom port implementations.
    pub fn create_flasher_with_port<P: Port + 'static>(
        &self,
        port: P,
        baud_rate: u32,
    ) -> Box<dyn Flasher> {
        match self {
            Self::Ambz => Box::new(ambz::AmbzFlasher::new(port, baud_rate)),
            Self::Bk72xx => Box::new(bk72xx::Bk72xxFlasher::new(port, baud_rate)),
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ambz => write!(f, "AmebaZ"),
            Self::Bk72xx => write!(f, "BK72xx"),
        }
    }
}

/// Device driver surface exposed to front-ends.
///
/// One implementation per chip family, selected through [`ChipFamily`].
pub trait Flasher {
    /// The family this flasher drives.
    fn family(&self) -> ChipFamily;

    /// Link with the boot ROM, escalating across bounded attempts.
    ///
    /// The first attempt probes passively; later attempts precede the probe
    /// with a reset (hardware lines or a reset magic, family-specific).
    fn connect(&mut self, progress: &mut dyn FlashProgress) -> Result<()>;

    /// Detach from the boot ROM and drop the link state.
    fn disconnect(&mut self) -> Result<()>;

    /// Identification key/value pairs read from the chip.
    fn read_chip_info(&mut self) -> Result<Vec<(String, String)>>;

    /// Device flash capacity in bytes.
    fn flash_size(&mut self) -> Result<u32>;

    /// Read `length` bytes from `offset` into `sink`.
    ///
    /// With `verify`, a device-side digest over the same range is compared
    /// against the locally accumulated one.
    fn read_raw(
        &mut self,
        offset: u32,
        length: u32,
        verify: bool,
        sink: &mut dyn Write,
        progress: &mut dyn FlashProgress,
    ) -> Result<()>;

    /// Write `length` bytes from `source` at `offset`.
    fn write_raw(
        &mut self,
        offset: u32,
        length: u32,
        source: &mut dyn Read,
        verify: bool,
        progress: &mut dyn FlashProgress,
    ) -> Result<()>;

    /// Flash a container, selecting the OTA view the device expects.
    fn write_container(
        &mut self,
        ctx: &mut UploadContext,
        layout: &dyn BoardLayout,
        verify: bool,
        progress: &mut dyn FlashProgress,
    ) -> Result<()>;

    /// Family-specific "how to enter download mode" instructions.
    fn boot_guide(&self) -> &'static [&'static str] {
        &[]
    }
}
