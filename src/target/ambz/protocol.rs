//! AmebaZ boot ROM protocol constants.
//!
//! The ROM download mode speaks single-byte commands at 1.5 Mbaud. While
//! idle it beacons NAK bytes ("loud handshake" mode); bulk transfers run
//! over XMODEM-1K with an address word in front of every packet.

/// ACK byte.
pub const ACK: u8 = 0x06;
/// NAK byte; four in a row mark loud-handshake mode.
pub const NAK: u8 = 0x15;

/// Baud rate of the ROM download mode.
pub const ROM_BAUD: u32 = 1_500_000;
/// Baud rate of the diagnostic console after RAM boot.
pub const DIAG_BAUD: u32 = 115_200;

/// Base address of the memory-mapped flash (XIP) space.
pub const FLASH_ADDRESS: u32 = 0x0800_0000;
/// Load address for RAM-boot payloads.
pub const RAM_ADDRESS: u32 = 0x1000_2000;

/// Marker printed by RAM-boot readout stubs to delimit their output.
pub const GREETING: &[u8; 16] = b"AmbZTool_Marker!";
/// Banner the ROM prints when download mode restarts.
pub const DOWNLOAD_BANNER: &[u8] = b"UARTIMG_Download";

/// ROM commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Change the UART baud rate to a rate-table index.
    SetBaudRate = 0x05,
    /// Enter XMODEM transfer mode.
    XmodemHandshake = 0x07,
    /// Erase a flash region.
    FlashErase = 0x17,
    /// Stream a flash region back to the host.
    FlashRead = 0x19,
    /// Read the flash status register.
    FlashGetStatus = 0x21,
    /// Write the flash status register.
    FlashSetStatus = 0x26,
    /// Leave XMODEM mode / reset the handshake state.
    XmodemCan = 0x18,
}

/// Known chip ids from the eFuse map.
pub const CHIP_TYPES: &[(u8, &str)] = &[
    (0xE0, "RTL8710BL"),
    (0xFF, "RTL8710BN"),
    (0xFE, "RTL8710BU"),
    (0xF6, "RTL8710BX"),
    (0xFB, "RTL8710L0"),
    (0xFD, "RTL8711BN"),
    (0xFC, "RTL8711BU"),
];

/// The ROM's fixed baud rate table; baud-change commands carry an index
/// into it.
pub const BAUD_TABLE: &[u32] = &[
    110, 300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 28800, 38400, 57600, 76800, 115200,
    128000, 153600, 230400, 380400, 460800, 500000, 921600, 1000000, 1382400, 1444400, 1500000,
    1843200, 2000000, 2100000, 2764800, 3000000, 3250000, 3692300, 3750000, 4000000, 6000000,
];

/// Index of a baud rate in the ROM table.
pub fn baud_index(baud: u32) -> Option<u8> {
    BAUD_TABLE
        .iter()
        .position(|&rate| rate == baud)
        .map(|index| index as u8)
}

/// Human-readable chip type for an eFuse chip id.
pub fn chip_type(chip_id: u8) -> String {
    CHIP_TYPES
        .iter()
        .find(|(id, _)| *id == chip_id)
        .map_or_else(|| format!("Unknown 0x{chip_id:02X}"), |(_, name)| (*name).to_string())
}

/// Flash size decoded from the third flash-id byte (a power of two), when
/// the id is in the plausible range.
pub fn flash_size_from_id(size_id: u8) -> Option<u32> {
    (0x14..=0x19).contains(&size_id).then(|| 1u32 << size_id)
}
