//! BK72xx flasher: probe/reset link loop, sectored transfers, CRC checks.

use crate::error::{Error, Result};
use crate::layout::BoardLayout;
use crate::port::Port;
use crate::progress::{FlashProgress, NoProgress};
use crate::target::bk72xx::protocol::{
    Command, CommandFrame, ResponseFrame, BAUD_SWITCH_DELAY_MS, FLASH_SIZE, LINK_BAUD, SECTOR_SIZE,
};
use crate::target::{ChipFamily, Flasher, LinkState};
use crate::transport::Transport;
use crate::uf2::{OtaIndex, UploadContext};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, info, warn};
use std::io::{Cursor, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Maximum number of top-level link attempts.
const MAX_CONNECT_ATTEMPTS: u32 = 6;

/// Pause between consecutive probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(20);

/// Reset pulse width on the RTS line.
const RESET_PULSE: Duration = Duration::from_millis(200);

const BK72XX_GUIDE: &[&str] = &[
    "Connect the USB-TTL adapter to the chip's UART1:",
    "    RX  -> TX1",
    "    TX  -> RX1",
    "    GND -> GND",
    "The boot ROM listens right after power-on. If the flasher cannot",
    "link, power-cycle the chip (or pulse CEN low) while it is probing.",
    "Wiring RTS to CEN lets the flasher do this automatically.",
];

/// BK72xx flasher.
pub struct Bk72xxFlasher<P: Port> {
    transport: Transport<P>,
    state: LinkState,
    work_baud: u32,
}

impl<P: Port> Bk72xxFlasher<P> {
    /// Wrap an open port. `work_baud` is negotiated after linking.
    pub fn new(port: P, work_baud: u32) -> Self {
        Self {
            transport: Transport::new(port).with_read_timeout(Duration::from_millis(200)),
            state: LinkState::Unlinked,
            work_baud,
        }
    }

    /// Borrow the transport (mainly for tests).
    pub fn transport(&self) -> &Transport<P> {
        &self.transport
    }

    /// Mutably borrow the transport.
    pub fn transport_mut(&mut self) -> &mut Transport<P> {
        &mut self.transport
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Pulse the reset line (RTS wired to CEN) to restart the boot ROM.
    fn hw_reset_pulse(&mut self) -> Result<()> {
        debug!("Pulsing reset via RTS");
        let port = self.transport.port_mut();
        port.set_dtr(false)?;
        port.set_rts(true)?;
        thread::sleep(RESET_PULSE);
        port.set_rts(false)?;
        Ok(())
    }

    /// Send one command and collect its response frame.
    fn command(&mut self, frame: &CommandFrame, expect: u8) -> Result<ResponseFrame> {
        let raw = frame.build();
        self.transport.write(&raw)?;
        self.read_response(expect)
    }

    /// Accumulate reads until a complete frame for `expect` parses out.
    fn read_response(&mut self, expect: u8) -> Result<ResponseFrame> {
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let data = self.transport.read_max(SECTOR_SIZE + 64)?;
            buffer.extend_from_slice(&data);
            while let Some((frame, consumed)) = ResponseFrame::parse(&buffer) {
                buffer.drain(..consumed);
                if frame.cmd == expect {
                    return Ok(frame);
                }
                debug!("Skipping unexpected frame for cmd 0x{:02X}", frame.cmd);
            }
        }
    }

    /// Spam liveness probes until the ROM answers within the window.
    fn probe(&mut self) -> Result<()> {
        self.state = LinkState::Probing;
        self.transport.flush()?;
        let probe = CommandFrame::link_check().build();
        let deadline = Instant::now() + self.transport.link_timeout();
        let mut buffer: Vec<u8> = Vec::new();

        self.transport.push_timeout(PROBE_INTERVAL);
        let result = loop {
            if Instant::now() >= deadline {
                break Err(Error::LinkTimeout("no response to link probe".into()));
            }
            if let Err(e) = self.transport.write(&probe) {
                break Err(e);
            }
            match self.transport.read_max(64) {
                Ok(data) => buffer.extend_from_slice(&data),
                Err(Error::LinkTimeout(_)) => continue,
                Err(e) => break Err(e),
            }
            if let Some((frame, consumed)) = ResponseFrame::parse(&buffer) {
                buffer.drain(..consumed);
                // the probe response arrives under cmd + 1
                if frame.cmd == Command::LinkCheck as u8 + 1 {
                    break Ok(());
                }
            }
        };
        self.transport.pop_timeout();
        result
    }

    /// Switch the device and the local port to a new baud rate.
    ///
    /// The device applies the change [`BAUD_SWITCH_DELAY_MS`] after the
    /// command; the local port reopens mid-delay so the confirmation frame
    /// arrives at the new rate already.
    pub fn change_baud(&mut self, baud: u32) -> Result<()> {
        if self.transport.baud() == baud {
            return Ok(());
        }
        info!("Changing baud rate to {baud}");
        let frame = CommandFrame::set_baud_rate(baud);
        self.transport.write(&frame.build())?;
        thread::sleep(Duration::from_millis(u64::from(BAUD_SWITCH_DELAY_MS) / 2));
        self.transport.set_baud(baud)?;
        let resp = self.read_response(Command::SetBaudRate as u8)?;
        if resp.payload.len() < 4 || resp.payload[..4] != baud.to_le_bytes() {
            return Err(Error::ProtocolViolation(format!(
                "baud switch not confirmed: {:02X?}",
                resp.payload
            )));
        }
        Ok(())
    }

    /// Read one flash sector with bounded retries.
    fn read_sector(&mut self, addr: u32) -> Result<Vec<u8>> {
        let mut last = None;
        for attempt in 1..=self.transport.retry_count() {
            match self.try_read_sector(addr) {
                Ok(data) => return Ok(data),
                Err(e) => {
                    debug!("Sector read 0x{addr:X} failed (attempt {attempt}): {e}");
                    last = Some(e);
                    self.transport.flush()?;
                },
            }
        }
        Err(last.unwrap_or_else(|| Error::LinkTimeout(format!("sector read 0x{addr:X}"))))
    }

    fn try_read_sector(&mut self, addr: u32) -> Result<Vec<u8>> {
        let frame = CommandFrame::flash_read_4k(addr);
        let resp = self.command(&frame, Command::FlashRead4K as u8)?;
        if resp.status != 0 {
            return Err(Error::ProtocolViolation(format!(
                "sector read status 0x{:02X}",
                resp.status
            )));
        }
        if resp.payload.len() != 4 + SECTOR_SIZE {
            return Err(Error::ProtocolViolation(format!(
                "sector response of {} bytes",
                resp.payload.len()
            )));
        }
        let echoed = u32::from_le_bytes([
            resp.payload[0],
            resp.payload[1],
            resp.payload[2],
            resp.payload[3],
        ]);
        if echoed != addr {
            return Err(Error::ProtocolViolation(format!(
                "sector address echo 0x{echoed:X}, requested 0x{addr:X}"
            )));
        }
        Ok(resp.payload[4..].to_vec())
    }

    /// Erase + program one sector with bounded retries.
    fn write_sector(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let mut last = None;
        for attempt in 1..=self.transport.retry_count() {
            match self.try_write_sector(addr, data) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Sector write 0x{addr:X} failed (attempt {attempt}): {e}");
                    last = Some(e);
                    self.transport.flush()?;
                },
            }
        }
        Err(last.unwrap_or_else(|| Error::LinkTimeout(format!("sector write 0x{addr:X}"))))
    }

    fn try_write_sector(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let erase = CommandFrame::flash_erase_4k(addr);
        let resp = self.command(&erase, Command::FlashErase4K as u8)?;
        if resp.payload.first().copied().unwrap_or(1) != 0 {
            return Err(Error::ProtocolViolation(format!(
                "sector erase status {:02X?}",
                resp.payload.first()
            )));
        }

        let write = CommandFrame::flash_write_4k(addr, data);
        let resp = self.command(&write, Command::FlashWrite4K as u8)?;
        if resp.status != 0 {
            return Err(Error::ProtocolViolation(format!(
                "sector write status 0x{:02X}",
                resp.status
            )));
        }
        Ok(())
    }

    /// Device CRC-32 over `length` bytes from `start`.
    fn check_crc(&mut self, start: u32, length: u32) -> Result<u32> {
        let frame = CommandFrame::check_crc(start, start + length - 1);
        let resp = self.command(&frame, Command::CheckCrc as u8)?;
        if resp.payload.len() < 4 {
            return Err(Error::ProtocolViolation(format!(
                "CRC response of {} bytes",
                resp.payload.len()
            )));
        }
        Ok(u32::from_le_bytes([
            resp.payload[0],
            resp.payload[1],
            resp.payload[2],
            resp.payload[3],
        ]))
    }

    fn verify_range(&mut self, start: u32, data: &[u8]) -> Result<()> {
        let actual = CRC32.checksum(data);
        let expected = self.check_crc(start, data.len() as u32)?;
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                expected: expected.to_le_bytes().to_vec(),
                actual: actual.to_le_bytes().to_vec(),
            });
        }
        debug!("CRC verified over 0x{start:X}+0x{:X}", data.len());
        Ok(())
    }

    fn write_range(
        &mut self,
        offset: u32,
        data: &[u8],
        verify: bool,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        if offset as usize % SECTOR_SIZE != 0 {
            return Err(Error::OutOfBounds(format!(
                "write offset 0x{offset:X} not sector-aligned"
            )));
        }
        // pad the tail sector; erased flash reads back 0xFF
        let mut padded = data.to_vec();
        let aligned = padded.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        padded.resize(aligned, 0xFF);

        for (i, sector) in padded.chunks(SECTOR_SIZE).enumerate() {
            if progress.should_cancel() {
                return Err(Error::Cancelled);
            }
            let addr = offset + (i * SECTOR_SIZE) as u32;
            self.write_sector(addr, sector)?;
            progress.on_update(SECTOR_SIZE);
        }

        if verify {
            self.verify_range(offset, &padded)?;
        }
        Ok(())
    }
}

impl<P: Port> Flasher for Bk72xxFlasher<P> {
    fn family(&self) -> ChipFamily {
        ChipFamily::Bk72xx
    }

    fn connect(&mut self, progress: &mut dyn FlashProgress) -> Result<()> {
        if self.state == LinkState::Linked {
            return Ok(());
        }
        info!("Linking on {}...", self.transport.port().name());
        progress.on_message("Linking...");

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            if progress.should_cancel() {
                return Err(Error::Cancelled);
            }
            if attempt > 1 {
                warn!("Link attempt {attempt}/{MAX_CONNECT_ATTEMPTS}, pulsing reset");
                self.hw_reset_pulse()?;
            }
            match self.probe() {
                Ok(()) => {
                    if let Err(e) = self.change_baud(self.work_baud) {
                        // fall back to the linking rate rather than failing
                        warn!("Baud switch to {} failed: {e}", self.work_baud);
                        self.transport.set_baud(LINK_BAUD)?;
                        if self.probe().is_err() {
                            continue;
                        }
                    }
                    self.state = LinkState::Linked;
                    info!("Link established at {} baud", self.transport.baud());
                    return Ok(());
                },
                Err(e) if e.is_link_timeout() => {
                    warn!("Link failed (attempt {attempt}/{MAX_CONNECT_ATTEMPTS}): {e}");
                },
                Err(e) => return Err(e),
            }
        }

        for line in BK72XX_GUIDE {
            info!("{line}");
        }
        self.state = LinkState::Unlinked;
        Err(Error::LinkTimeout(format!(
            "no link after {MAX_CONNECT_ATTEMPTS} attempts"
        )))
    }

    fn disconnect(&mut self) -> Result<()> {
        self.state = LinkState::Unlinked;
        Ok(())
    }

    fn read_chip_info(&mut self) -> Result<Vec<(String, String)>> {
        self.connect(&mut NoProgress)?;
        let resp = self.command(&CommandFrame::boot_version(), Command::BootVersion as u8)?;
        let version = String::from_utf8_lossy(&resp.payload).trim().to_string();
        Ok(vec![
            ("Chip Type".into(), "BK72xx".into()),
            ("Boot Version".into(), version),
            ("Flash Size".into(), format!("{} KiB", FLASH_SIZE / 1024)),
        ])
    }

    fn flash_size(&mut self) -> Result<u32> {
        Ok(FLASH_SIZE)
    }

    fn read_raw(
        &mut self,
        offset: u32,
        length: u32,
        verify: bool,
        sink: &mut dyn Write,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        crate::layout::MemoryRange::new(offset, length).check_capacity(FLASH_SIZE)?;
        self.connect(&mut NoProgress)?;

        let start = offset & !(SECTOR_SIZE as u32 - 1);
        let end = (offset + length).div_ceil(SECTOR_SIZE as u32) * SECTOR_SIZE as u32;
        progress.on_total((end - start) as usize);

        let mut aligned = Vec::with_capacity((end - start) as usize);
        let mut addr = start;
        while addr < end {
            if progress.should_cancel() {
                return Err(Error::Cancelled);
            }
            let sector = self.read_sector(addr)?;
            aligned.extend_from_slice(&sector);
            progress.on_update(SECTOR_SIZE);
            addr += SECTOR_SIZE as u32;
        }

        if verify {
            let actual = CRC32.checksum(&aligned);
            let expected = self.check_crc(start, end - start)?;
            if expected != actual {
                return Err(Error::ChecksumMismatch {
                    expected: expected.to_le_bytes().to_vec(),
                    actual: actual.to_le_bytes().to_vec(),
                });
            }
        }

        let skip = (offset - start) as usize;
        sink.write_all(&aligned[skip..skip + length as usize])?;
        Ok(())
    }

    fn write_raw(
        &mut self,
        offset: u32,
        length: u32,
        source: &mut dyn Read,
        verify: bool,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        crate::layout::MemoryRange::new(offset, length).check_capacity(FLASH_SIZE)?;
        self.connect(&mut NoProgress)?;

        let mut data = vec![0u8; length as usize];
        source.read_exact(&mut data)?;
        progress.on_total(data.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE);
        self.write_range(offset, &data, verify, progress)
    }

    fn write_container(
        &mut self,
        ctx: &mut UploadContext,
        layout: &dyn BoardLayout,
        verify: bool,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        // collect before linking; parsing takes time the link won't survive
        let parts = ctx.collect(OtaIndex::Ota1, layout)?;
        self.connect(&mut NoProgress)?;

        progress.on_total(
            parts
                .values()
                .map(|data| data.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE)
                .sum(),
        );

        for (offset, data) in &parts {
            progress.on_message(&format!("OTA 1 (0x{offset:06X})"));
            info!("Writing {} bytes to 0x{offset:06X}", data.len());
            self.write_range(*offset, data, verify, progress)?;
        }

        progress.on_message("Rebooting");
        self.transport.write(&CommandFrame::reboot().build())?;
        self.state = LinkState::Unlinked;
        Ok(())
    }

    fn boot_guide(&self) -> &'static [&'static str] {
        BK72XX_GUIDE
    }
}
