//! BK72xx boot ROM command bus.
//!
//! Requests ride on an escape-sequence bus shared with the chip's HCI UART:
//!
//! ```text
//! short:  01 E0 FC <len>        <cmd> <payload>
//! long:   01 E0 FC FF F4 <len16 LE> <cmd> <payload>
//! ```
//!
//! Responses are framed the same way behind a `04 0E` event header:
//!
//! ```text
//! short:  04 0E <len>     01 E0 FC <cmd> <payload>
//! long:   04 0E FF 01 E0 FC F4 <len16 LE> <cmd> <status> <payload>
//! ```
//!
//! `len` counts the command byte and payload. Bulk flash commands use the
//! long form; everything else is short.

use byteorder::{LittleEndian, WriteBytesExt};

/// Request frame prefix.
pub const TX_PREFIX: [u8; 3] = [0x01, 0xE0, 0xFC];
/// Response frame prefix.
pub const RX_PREFIX: [u8; 2] = [0x04, 0x0E];
/// Marker selecting the long frame form.
pub const LONG_MARKER: u8 = 0xF4;

/// Baud rate the boot ROM listens at.
pub const LINK_BAUD: u32 = 115_200;

/// Flash sector granularity of the bulk commands.
pub const SECTOR_SIZE: usize = 4096;

/// Flash capacity of the supported parts.
pub const FLASH_SIZE: u32 = 0x20_0000;

/// Delay carried in the baud-switch command; the device switches after it.
pub const BAUD_SWITCH_DELAY_MS: u8 = 20;

/// Boot ROM commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Liveness probe; the response arrives under `cmd + 1`.
    LinkCheck = 0x00,
    /// Write one 4 KiB sector (long form).
    FlashWrite4K = 0x07,
    /// Read one 4 KiB sector (long form).
    FlashRead4K = 0x09,
    /// Erase one 4 KiB sector.
    FlashErase4K = 0x0B,
    /// Reboot out of the boot ROM.
    Reboot = 0x0E,
    /// Switch the UART baud rate after a delay.
    SetBaudRate = 0x0F,
    /// CRC-32 over an inclusive flash range.
    CheckCrc = 0x10,
    /// Boot ROM version string.
    BootVersion = 0x11,
}

/// Request frame builder.
#[derive(Debug)]
pub struct CommandFrame {
    cmd: Command,
    payload: Vec<u8>,
    long: bool,
}

impl CommandFrame {
    fn new(cmd: Command, payload: Vec<u8>, long: bool) -> Self {
        Self { cmd, payload, long }
    }

    /// Liveness probe.
    pub fn link_check() -> Self {
        Self::new(Command::LinkCheck, Vec::new(), false)
    }

    /// Baud switch to `baud`, applied by the device after
    /// [`BAUD_SWITCH_DELAY_MS`].
    #[allow(clippy::unwrap_used)] // writing to Vec<u8> cannot fail
    pub fn set_baud_rate(baud: u32) -> Self {
        let mut payload = Vec::with_capacity(5);
        payload.write_u32::<LittleEndian>(baud).unwrap();
        payload.push(BAUD_SWITCH_DELAY_MS);
        Self::new(Command::SetBaudRate, payload, false)
    }

    /// Read the sector at `addr`.
    #[allow(clippy::unwrap_used)] // writing to Vec<u8> cannot fail
    pub fn flash_read_4k(addr: u32) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.write_u32::<LittleEndian>(addr).unwrap();
        Self::new(Command::FlashRead4K, payload, true)
    }

    /// Program the sector at `addr`.
    #[allow(clippy::unwrap_used)] // writing to Vec<u8> cannot fail
    pub fn flash_write_4k(addr: u32, data: &[u8]) -> Self {
        debug_assert_eq!(data.len(), SECTOR_SIZE);
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.write_u32::<LittleEndian>(addr).unwrap();
        payload.extend_from_slice(data);
        Self::new(Command::FlashWrite4K, payload, true)
    }

    /// Erase the sector at `addr`.
    #[allow(clippy::unwrap_used)] // writing to Vec<u8> cannot fail
    pub fn flash_erase_4k(addr: u32) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.write_u32::<LittleEndian>(addr).unwrap();
        Self::new(Command::FlashErase4K, payload, false)
    }

    /// CRC-32 over the inclusive range `[start, end]`.
    #[allow(clippy::unwrap_used)] // writing to Vec<u8> cannot fail
    pub fn check_crc(start: u32, end: u32) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.write_u32::<LittleEndian>(start).unwrap();
        payload.write_u32::<LittleEndian>(end).unwrap();
        Self::new(Command::CheckCrc, payload, false)
    }

    /// Reboot command.
    pub fn reboot() -> Self {
        Self::new(Command::Reboot, vec![0xA5], false)
    }

    /// Boot ROM version request.
    pub fn boot_version() -> Self {
        Self::new(Command::BootVersion, Vec::new(), false)
    }

    /// The command this frame carries.
    pub fn command(&self) -> Command {
        self.cmd
    }

    /// Build the wire bytes.
    #[allow(clippy::cast_possible_truncation)] // frame sizes stay below 64 KiB
    #[allow(clippy::unwrap_used)] // writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.payload.len());
        buf.extend_from_slice(&TX_PREFIX);
        if self.long {
            buf.push(0xFF);
            buf.push(LONG_MARKER);
            buf.write_u16::<LittleEndian>((self.payload.len() + 1) as u16)
                .unwrap();
        } else {
            buf.push((self.payload.len() + 1) as u8);
        }
        buf.push(self.cmd as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Parsed response frame.
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Echoed command byte.
    pub cmd: u8,
    /// Status byte (long frames only; short frames report 0).
    pub status: u8,
    /// Response payload.
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    /// Find and parse the first complete response frame in `data`.
    ///
    /// Returns the frame and the index just past it, or `None` while the
    /// buffer holds no complete frame yet. Garbage before the frame header
    /// is skipped.
    pub fn parse(data: &[u8]) -> Option<(Self, usize)> {
        let start = data
            .windows(RX_PREFIX.len())
            .position(|w| w == RX_PREFIX)?;
        let frame = &data[start..];
        if frame.len() < 3 {
            return None;
        }

        if frame[2] == 0xFF {
            // long: 04 0E FF 01 E0 FC F4 <len16> <cmd> <status> <payload>
            if frame.len() < 9 {
                return None;
            }
            if frame[3..6] != TX_PREFIX || frame[6] != LONG_MARKER {
                return None;
            }
            let len = u16::from_le_bytes([frame[7], frame[8]]) as usize;
            let total = 9 + len + 1; // len counts cmd+payload; +1 for status
            if len == 0 || frame.len() < total {
                return None;
            }
            Some((
                Self {
                    cmd: frame[9],
                    status: frame[10],
                    payload: frame[11..total].to_vec(),
                },
                start + total,
            ))
        } else {
            // short: 04 0E <len> 01 E0 FC <cmd> <payload>
            let len = frame[2] as usize;
            let total = 3 + 3 + len;
            if len == 0 || frame.len() < total {
                return None;
            }
            if frame[3..6] != TX_PREFIX {
                return None;
            }
            Some((
                Self {
                    cmd: frame[6],
                    status: 0,
                    payload: frame[7..total].to_vec(),
                },
                start + total,
            ))
        }
    }

    /// Encode a short response frame (used by tests and simulators).
    pub fn encode_short(cmd: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(7 + payload.len());
        buf.extend_from_slice(&RX_PREFIX);
        buf.push((payload.len() + 1) as u8);
        buf.extend_from_slice(&TX_PREFIX);
        buf.push(cmd);
        buf.extend_from_slice(payload);
        buf
    }

    /// Encode a long response frame (used by tests and simulators).
    pub fn encode_long(cmd: u8, status: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(11 + payload.len());
        buf.extend_from_slice(&RX_PREFIX);
        buf.push(0xFF);
        buf.extend_from_slice(&TX_PREFIX);
        buf.push(LONG_MARKER);
        buf.extend_from_slice(&((payload.len() + 1) as u16).to_le_bytes());
        buf.push(cmd);
        buf.push(status);
        buf.extend_from_slice(payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_check_frame() {
        let frame = CommandFrame::link_check().build();
        assert_eq!(frame, vec![0x01, 0xE0, 0xFC, 0x01, 0x00]);
    }

    #[test]
    fn test_set_baud_rate_frame() {
        let frame = CommandFrame::set_baud_rate(921_600).build();
        assert_eq!(&frame[..3], &TX_PREFIX);
        assert_eq!(frame[3], 6); // cmd + rate(4) + delay(1)
        assert_eq!(frame[4], Command::SetBaudRate as u8);
        assert_eq!(&frame[5..9], &921_600u32.to_le_bytes());
        assert_eq!(frame[9], BAUD_SWITCH_DELAY_MS);
    }

    #[test]
    fn test_flash_read_frame_is_long() {
        let frame = CommandFrame::flash_read_4k(0x11000).build();
        assert_eq!(&frame[..5], &[0x01, 0xE0, 0xFC, 0xFF, 0xF4]);
        assert_eq!(u16::from_le_bytes([frame[5], frame[6]]), 5); // cmd + addr
        assert_eq!(frame[7], Command::FlashRead4K as u8);
        assert_eq!(&frame[8..12], &0x11000u32.to_le_bytes());
    }

    #[test]
    fn test_check_crc_frame() {
        let frame = CommandFrame::check_crc(0x11000, 0x11FFF).build();
        assert_eq!(frame[4], Command::CheckCrc as u8);
        assert_eq!(&frame[5..9], &0x11000u32.to_le_bytes());
        assert_eq!(&frame[9..13], &0x11FFFu32.to_le_bytes());
    }

    #[test]
    fn test_parse_short_response() {
        let raw = ResponseFrame::encode_short(0x01, &[0x00]);
        let (frame, consumed) = ResponseFrame::parse(&raw).unwrap();
        assert_eq!(frame.cmd, 0x01);
        assert_eq!(frame.payload, vec![0x00]);
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_long_response() {
        let payload: Vec<u8> = (0..32).collect();
        let raw = ResponseFrame::encode_long(Command::FlashRead4K as u8, 0x00, &payload);
        let (frame, consumed) = ResponseFrame::parse(&raw).unwrap();
        assert_eq!(frame.cmd, Command::FlashRead4K as u8);
        assert_eq!(frame.status, 0x00);
        assert_eq!(frame.payload, payload);
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_skips_garbage_prefix() {
        let mut raw = vec![0xDE, 0xAD, 0x00];
        raw.extend_from_slice(&ResponseFrame::encode_short(0x01, &[0x00]));
        let (frame, consumed) = ResponseFrame::parse(&raw).unwrap();
        assert_eq!(frame.cmd, 0x01);
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_incomplete_frame() {
        let raw = ResponseFrame::encode_short(0x01, &[0x00]);
        assert!(ResponseFrame::parse(&raw[..raw.len() - 1]).is_none());
        assert!(ResponseFrame::parse(&[0x04]).is_none());
        assert!(ResponseFrame::parse(&[0xFF; 16]).is_none());
    }
}
