//! XMODEM-1K sender.
//!
//! Streams a data source into device memory through the classic packet
//! format:
//!
//! ```text
//! +-----+-----+------+------------------+-------------+
//! | STX | SEQ | ~SEQ |     PAYLOAD      | CHECK       |
//! +-----+-----+------+------------------+-------------+
//! | 1   | 1   | 1    | payload_size     | 1 or 2      |
//! +-----+-----+------+------------------+-------------+
//! ```
//!
//! The payload size is a configuration knob rather than a fixed 1024: boot
//! ROMs that want an address word in front of each packet get it from an
//! [`AddressPrefix`](crate::protocol::AddressPrefix) source, which makes
//! every packet 4 bytes longer than the nominal block.
//!
//! Two quirks of real receivers are supported explicitly:
//! - the start byte can be assumed instead of awaited, for ROMs that enter
//!   transfer mode by command and never send a greeting;
//! - the ACK for the final EOT can be synthesized, for targets that boot
//!   into the transferred image and lose that one byte.

use crate::error::{Error, Result};
use crate::progress::FlashProgress;
use crate::transport::Transport;
use crate::port::Port;
use crc::{Crc, CRC_16_XMODEM};
use log::{debug, trace};
use std::io::Read;
use std::time::Duration;

/// XMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Block size for SOH packets.
pub const SOH_BLOCK_SIZE: usize = 128;

/// Block size for STX packets (XMODEM-1K).
pub const STX_BLOCK_SIZE: usize = 1024;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Packet trailer variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// Single-byte arithmetic checksum (sum mod 256).
    Arithmetic,
    /// CRC-16/XMODEM, transmitted big-endian.
    Crc16,
}

/// How the transfer is initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Wait for the receiver's greeting: `C` selects CRC-16, NAK selects
    /// the arithmetic checksum.
    WaitReceiver,
    /// Skip the greeting and use the given trailer unconditionally.
    Assume(ChecksumKind),
}

/// XMODEM sender configuration.
#[derive(Debug, Clone)]
pub struct XmodemConfig {
    /// Wire payload bytes per packet.
    pub payload_size: usize,
    /// Timeout for a single control-byte read.
    pub char_timeout: Duration,
    /// Timeout for the receiver's greeting.
    pub start_timeout: Duration,
    /// Maximum transmission attempts per packet.
    pub max_retries: u32,
    /// Transfer initiation mode.
    pub start: StartMode,
    /// Treat EOT as acknowledged without reading the wire.
    pub synth_eot_ack: bool,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            payload_size: STX_BLOCK_SIZE,
            char_timeout: Duration::from_millis(1000),
            start_timeout: Duration::from_secs(60),
            max_retries: 10,
            start: StartMode::WaitReceiver,
            synth_eot_ack: false,
        }
    }
}

/// XMODEM transfer handler borrowing the link transport.
pub struct XmodemSender<'a, P: Port> {
    transport: &'a mut Transport<P>,
    config: XmodemConfig,
}

impl<'a, P: Port> XmodemSender<'a, P> {
    /// Create a sender with the given configuration.
    pub fn new(transport: &'a mut Transport<P>, config: XmodemConfig) -> Self {
        Self { transport, config }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let char_timeout = self.config.char_timeout;
        self.transport
            .with_timeout(char_timeout, |t| t.read_exact(1).map(|d| d[0]))
    }

    /// Wait for the receiver's greeting and derive the checksum mode.
    fn wait_for_start(&mut self) -> Result<ChecksumKind> {
        debug!("Waiting for receiver greeting...");
        let start = std::time::Instant::now();
        while start.elapsed() < self.config.start_timeout {
            match self.read_byte() {
                Ok(control::C) => return Ok(ChecksumKind::Crc16),
                Ok(control::NAK) => return Ok(ChecksumKind::Arithmetic),
                Ok(c) => trace!("Unexpected greeting byte: 0x{c:02X}"),
                Err(Error::LinkTimeout(_)) => {},
                Err(e) => return Err(e),
            }
        }
        Err(Error::LinkTimeout("no XMODEM greeting from receiver".into()))
    }

    /// Build one packet: header, sequence pair, payload, trailer.
    fn build_packet(seq: u8, payload: &[u8], checksum: ChecksumKind) -> Vec<u8> {
        let header = if payload.len() > SOH_BLOCK_SIZE {
            control::STX
        } else {
            control::SOH
        };
        let mut packet = Vec::with_capacity(3 + payload.len() + 2);
        packet.push(header);
        packet.push(seq);
        packet.push(!seq);
        packet.extend_from_slice(payload);
        match checksum {
            ChecksumKind::Arithmetic => {
                let sum = payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
                packet.push(sum);
            },
            ChecksumKind::Crc16 => {
                let crc = CRC16.checksum(payload);
                packet.push((crc >> 8) as u8);
                packet.push((crc & 0xFF) as u8);
            },
        }
        packet
    }

    /// Transmit a packet and wait for its ACK, with bounded retries.
    fn send_packet(&mut self, seq: u8, packet: &[u8]) -> Result<()> {
        let mut silent = true;
        for attempt in 0..self.config.max_retries {
            trace!("Sending block {seq} (attempt {})", attempt + 1);
            self.transport.write(packet)?;

            match self.read_byte() {
                Ok(control::ACK) => return Ok(()),
                Ok(control::NAK) => {
                    debug!("Block {seq} NAKed, retrying...");
                    silent = false;
                },
                Ok(control::CAN) => {
                    return Err(Error::ProtocolViolation(
                        "transfer cancelled by receiver".into(),
                    ));
                },
                Ok(c) => {
                    debug!("Unexpected response to block {seq}: 0x{c:02X}");
                    silent = false;
                },
                Err(Error::LinkTimeout(_)) => {
                    debug!("Timeout waiting for ACK of block {seq}, retrying...");
                },
                Err(e) => return Err(e),
            }
        }

        let retries = self.config.max_retries;
        if silent {
            Err(Error::LinkTimeout(format!(
                "block {seq} unacknowledged after {retries} attempts"
            )))
        } else {
            Err(Error::ProtocolViolation(format!(
                "block {seq} rejected after {retries} attempts"
            )))
        }
    }

    fn send_eot(&mut self) -> Result<()> {
        debug!("Sending EOT");
        if self.config.synth_eot_ack {
            // The receiver's ACK for this byte is lost when it boots into
            // the transferred image; consider it acknowledged.
            self.transport.write(&[control::EOT])?;
            return Ok(());
        }
        for _ in 0..self.config.max_retries {
            self.transport.write(&[control::EOT])?;
            match self.read_byte() {
                Ok(control::ACK) => return Ok(()),
                Ok(_) | Err(Error::LinkTimeout(_)) => {},
                Err(e) => return Err(e),
            }
        }
        Err(Error::LinkTimeout("EOT never acknowledged".into()))
    }

    /// Stream `source` to the receiver.
    ///
    /// Returns the number of wire payload bytes transferred. Cancellation
    /// is polled between packets only.
    pub fn send(
        &mut self,
        source: &mut dyn Read,
        progress: &mut dyn FlashProgress,
    ) -> Result<usize> {
        let checksum = match self.config.start {
            StartMode::WaitReceiver => self.wait_for_start()?,
            StartMode::Assume(kind) => kind,
        };
        debug!("XMODEM transfer starting ({checksum:?})");

        let mut seq: u8 = 1;
        let mut sent = 0usize;
        let mut payload = vec![0u8; self.config.payload_size];

        loop {
            if progress.should_cancel() {
                return Err(Error::Cancelled);
            }
            let n = read_fill(source, &mut payload)?;
            if n == 0 {
                break;
            }
            // classic xmodem padding for sources that end mid-block
            payload[n..].fill(0x1A);

            let packet = Self::build_packet(seq, &payload, checksum);
            self.send_packet(seq, &packet)?;
            seq = seq.wrapping_add(1);
            sent += payload.len();
            progress.on_update(payload.len());
        }

        self.send_eot()?;
        debug!("XMODEM transfer complete ({sent} bytes)");
        Ok(sent)
    }
}

fn read_fill(source: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(filled)
}

/// Total wire payload for `data_len` bytes sent through an address-prefixed
/// source with `chunk` data bytes per packet.
pub fn wire_length(data_len: usize, chunk: usize) -> usize {
    data_len.div_ceil(chunk) * (chunk + 4)
}
