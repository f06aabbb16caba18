//! AmebaZ flasher: link machine, XMODEM write path, chunked verified reads.

use crate::error::{Error, Result};
use crate::layout::BoardLayout;
use crate::port::Port;
use crate::progress::{FlashProgress, NoProgress};
use crate::protocol::stream::AddressPrefix;
use crate::protocol::xmodem::{
    self, ChecksumKind, StartMode, XmodemConfig, XmodemSender, STX_BLOCK_SIZE,
};
use crate::target::ambz::code;
use crate::target::ambz::protocol::{
    baud_index, chip_type, flash_size_from_id, Command, ACK, DIAG_BAUD, DOWNLOAD_BANNER,
    FLASH_ADDRESS, GREETING, NAK, RAM_ADDRESS, ROM_BAUD,
};
use crate::target::{ChipFamily, Flasher, LinkState};
use crate::transport::Transport;
use crate::uf2::{OtaIndex, UploadContext};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use std::io::{Cursor, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

/// Maximum number of top-level link attempts.
const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Delay between detach and re-probe while linking.
const DETACH_DELAY: Duration = Duration::from_millis(100);

/// Deadline for silencing the loud-handshake beacon.
const QUIET_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout during bulk XMODEM transfers.
const XFER_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for RAM-boot console output.
const RAM_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol read block and its acknowledgement granularity.
const READ_BLOCK: usize = 4096;
const READ_ACK_SIZE: usize = 1024;

/// Flash bytes requested per read command.
const READ_CHUNK: usize = 128 * 1024;

/// ROM entry vector table sent in front of RAM-boot payloads; entry 0 is
/// patched to the payload (or jump target) address.
const RAM_START_TABLE: [u32; 6] = [
    0x100021EE + 1,
    0x1000219A + 1,
    0x100021EE + 1,
    0x100020F4 + 1,
    0x100021EE + 1,
    0x08000540 + 1,
];

const AMBZ_GUIDE: &[&str] = &[
    "Connect UART2 of the Realtek chip to the USB-TTL adapter:",
    "    RX  -> TX2 (Log_TX / PA30)",
    "    TX  -> RX2 (Log_RX / PA29)",
    "    GND -> GND",
    "Using a good, stable 3.3V power supply is crucial; most flashing",
    "issues are caused by voltage drops during intensive flash operations.",
    "To enable download mode, in order:",
    " - connect CEN to GND",
    " - connect TX2 to GND",
    " - release CEN from GND",
    " - release TX2 from GND",
];

/// AmebaZ flasher.
///
/// Generic over the port type `P` so protocol tests can drive it with a
/// scripted port.
pub struct AmbzFlasher<P: Port> {
    transport: Transport<P>,
    state: LinkState,
    work_baud: u32,
    chip_id: Option<u8>,
    flash_id: Option<[u8; 3]>,
}

impl<P: Port> AmbzFlasher<P> {
    /// Wrap an open port. `work_baud` is negotiated after linking.
    pub fn new(port: P, work_baud: u32) -> Self {
        Self {
            transport: Transport::new(port).with_read_timeout(Duration::from_millis(200)),
            state: LinkState::Unlinked,
            work_baud,
            chip_id: None,
            flash_id: None,
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

    /// Probe until the ROM's loud-handshake beacon is seen, then confirm.
    ///
    /// The ROM beacons NAK bytes while listening; anything else means it is
    /// stuck in another mode, so the detach sequence is sent and the port
    /// forced back to the ROM baud rate before the next probe.
    pub fn link(&mut self) -> Result<()> {
        self.state = LinkState::Probing;
        self.transport.flush()?;
        let mut handshake: Vec<u8> = Vec::new();
        let deadline = Instant::now() + self.transport.link_timeout();
        let mut found = false;

        while Instant::now() < deadline {
            match self.transport.read_max(8) {
                Ok(data) => handshake.extend_from_slice(&data),
                Err(Error::LinkTimeout(_)) => {},
                Err(e) => return Err(e),
            }
            if handshake.len() > 4 {
                handshake.drain(..handshake.len() - 4);
            }
            if handshake.len() == 4 && handshake.iter().all(|&b| b == NAK) {
                found = true;
                break;
            }
            self.detach()?;
            thread::sleep(DETACH_DELAY);
            self.transport.set_baud(ROM_BAUD)?;
        }

        if !found {
            self.state = LinkState::Unlinked;
            return Err(Error::LinkTimeout("no handshake beacon from ROM".into()));
        }

        self.loud_handshake()?;
        self.state = LinkState::Linked;
        Ok(())
    }

    /// Send the detach sequence, returning the ROM to loud-handshake mode
    /// and resetting its baud rate.
    pub fn detach(&mut self) -> Result<()> {
        self.transport.write(&[
            Command::XmodemCan as u8,
            Command::XmodemHandshake as u8,
            Command::XmodemCan as u8,
        ])
    }

    /// Software reset: write the family magic on the diagnostic console.
    fn sw_reset(&mut self) -> Result<()> {
        let prev_baud = self.transport.baud();
        self.transport.set_baud(DIAG_BAUD)?;
        thread::sleep(Duration::from_millis(100));
        let mut magic = vec![0x55, 0xAA];
        magic.extend_from_slice(&0x9FFFD543u32.to_be_bytes());
        self.transport.write(&magic)?;
        thread::sleep(Duration::from_millis(500));
        self.transport.set_baud(prev_baud)?;
        Ok(())
    }

    /// Confirm loud-handshake mode: request the flash status and expect the
    /// beacon NAK right behind it.
    fn loud_handshake(&mut self) -> Result<()> {
        self.transport.flush()?;
        self.transport.write(&[Command::FlashGetStatus as u8])?;
        self.transport.read_exact(1)?; // status byte, discarded
        let resp = self.transport.read_exact(5)?;
        if resp[4] != NAK {
            return Err(Error::ProtocolViolation(format!(
                "no NAK for loud-handshake mode: {resp:02X?}"
            )));
        }
        Ok(())
    }

    /// Silence the beacon before bulk data commands.
    fn quiet_handshake(&mut self) -> Result<()> {
        self.transport.flush()?;
        self.transport.push_timeout(Duration::from_millis(100));
        let deadline = Instant::now() + QUIET_TIMEOUT;
        let mut quiet = false;
        let mut result = Ok(());
        while Instant::now() < deadline {
            if let Err(e) = self.transport.write(&[ACK]) {
                result = Err(e);
                break;
            }
            match self.transport.read_max(4) {
                Ok(_) => {},
                Err(Error::LinkTimeout(_)) => {
                    quiet = true;
                    break;
                },
                Err(e) => {
                    result = Err(e);
                    break;
                },
            }
        }
        self.transport.pop_timeout();
        result?;
        if !quiet {
            return Err(Error::LinkTimeout("beacon never went quiet".into()));
        }
        Ok(())
    }

    fn expect_ack(&mut self, doc: &str) -> Result<()> {
        let resp = self.transport.read_exact(1)?;
        if resp[0] != ACK {
            return Err(Error::ProtocolViolation(format!(
                "no ACK after {doc}: 0x{:02X}",
                resp[0]
            )));
        }
        Ok(())
    }

    /// Negotiate a new baud rate with the ROM, then follow locally.
    pub fn change_baud(&mut self, baud: u32) -> Result<()> {
        if self.transport.baud() == baud {
            return Ok(());
        }
        let index = baud_index(baud)
            .ok_or_else(|| Error::Unsupported(format!("baud rate {baud} not in the ROM table")))?;
        info!("Changing baud rate to {baud}");
        self.transport.flush()?;
        self.transport.write(&[Command::SetBaudRate as u8, index])?;
        self.expect_ack("baud rate change")?;
        self.transport.set_baud(baud)?;
        // confirm the ROM actually followed
        self.loud_handshake()
    }

    /// Stream `source` into device memory at `address` over XMODEM.
    ///
    /// Flash-space targets drop the link back to the ROM baud rate and
    /// renegotiate afterwards; RAM-space targets hand the UART to the booted
    /// code, so the port falls back to the diagnostic rate instead.
    pub fn memory_write(
        &mut self,
        address: u32,
        source: &mut dyn Read,
        progress: &mut dyn FlashProgress,
        synth_eot_ack: bool,
        keep_baud: bool,
    ) -> Result<()> {
        let prev_baud = self.transport.baud();
        self.loud_handshake()?;

        self.transport.write(&[Command::XmodemHandshake as u8])?;
        self.expect_ack("XMODEM handshake")?;

        debug!("XMODEM: transmitting to 0x{address:X}");
        let mut prefixed = AddressPrefix::new(source, address, STX_BLOCK_SIZE);
        let config = XmodemConfig {
            payload_size: STX_BLOCK_SIZE + 4,
            char_timeout: XFER_TIMEOUT,
            max_retries: self.transport.retry_count(),
            start: StartMode::Assume(ChecksumKind::Arithmetic),
            synth_eot_ack,
            ..XmodemConfig::default()
        };
        self.transport.push_timeout(XFER_TIMEOUT);
        let result = XmodemSender::new(&mut self.transport, config).send(&mut prefixed, progress);
        self.transport.pop_timeout();
        result?;

        match address >> 24 {
            0x08 => {
                // back to the ROM baud rate, then renegotiate and re-confirm
                self.transport.set_baud(ROM_BAUD)?;
                self.change_baud(prev_baud)?;
                self.loud_handshake()?;
            },
            0x10 if !keep_baud => {
                // the booted code re-enables the console UART
                self.transport.set_baud(DIAG_BAUD)?;
            },
            _ => {},
        }
        Ok(())
    }

    /// Boot a code stub in SRAM.
    fn ram_boot_code(&mut self, stub: &[u8], keep_baud: bool) -> Result<()> {
        let mut table = RAM_START_TABLE;
        // entry 0 points right behind the table, where the stub lands
        table[0] = (RAM_ADDRESS + (RAM_START_TABLE.len() as u32) * 4) | 1;
        let mut data = Vec::with_capacity(table.len() * 4 + stub.len());
        for word in table {
            data.extend_from_slice(&word.to_le_bytes());
        }
        data.extend_from_slice(stub);
        // the ACK for the EOT is lost when the ROM jumps into the payload
        self.memory_write(RAM_ADDRESS, &mut Cursor::new(data), &mut NoProgress, true, keep_baud)
    }

    /// Jump to code already present in memory.
    fn ram_boot_jump(&mut self, address: u32) -> Result<()> {
        let mut table = RAM_START_TABLE;
        table[0] = address | 1;
        let mut data = Vec::with_capacity(table.len() * 4);
        for word in table {
            data.extend_from_slice(&word.to_le_bytes());
        }
        self.memory_write(RAM_ADDRESS, &mut Cursor::new(data), &mut NoProgress, true, false)
    }

    /// Boot a stub and capture the console bytes it prints.
    ///
    /// The stub output is delimited by a greeting marker in front and the
    /// ROM's download-mode banner behind; afterwards the ROM link is
    /// restored at the previous baud rate.
    fn ram_boot_read(&mut self, stub: &[u8]) -> Result<Vec<u8>> {
        // RAM code prints on the console at 115200; switch now to avoid a
        // mid-output rate change
        let prev_baud = self.transport.baud();
        self.change_baud(DIAG_BAUD)?;

        let mut code_full = code::print_greeting(400, GREETING);
        code_full.extend_from_slice(stub);
        code_full.extend_from_slice(&code::download_mode());

        self.ram_boot_code(&code_full, true)?;

        let mut resp: Vec<u8> = Vec::new();
        self.transport.push_timeout(Duration::from_millis(100));
        let deadline = Instant::now() + RAM_READ_TIMEOUT;
        let mut read_err = None;
        while Instant::now() < deadline {
            match self.transport.read_burst() {
                Ok(data) => resp.extend_from_slice(&data),
                Err(Error::LinkTimeout(_)) => {},
                Err(e) => {
                    read_err = Some(e);
                    break;
                },
            }
            if find(&resp, DOWNLOAD_BANNER).is_some() {
                break;
            }
        }
        self.transport.pop_timeout();
        if let Some(e) = read_err {
            return Err(e);
        }

        let resp = if let Some(pos) = find(&resp, GREETING) {
            resp[pos + GREETING.len()..].to_vec()
        } else if let Some(pos) = find(&resp, &GREETING[GREETING.len() - 7..]) {
            warn!("Partial marker message found: {resp:02X?}");
            resp[pos + 7..].to_vec()
        } else {
            return Err(Error::ProtocolViolation(format!(
                "marker message not found in {} console bytes",
                resp.len()
            )));
        };
        let resp = match find(&resp, DOWNLOAD_BANNER) {
            Some(pos) => resp[..pos].to_vec(),
            None => {
                warn!("Download banner not found after stub output");
                resp
            },
        };

        self.transport.set_baud(ROM_BAUD)?;
        self.loud_handshake()?;
        if prev_baud != ROM_BAUD {
            self.change_baud(prev_baud)?;
        }
        Ok(resp)
    }

    fn query_chip_ids(&mut self) -> Result<()> {
        if self.chip_id.is_some() {
            return Ok(());
        }
        let mut stub = code::read_chip_id(0);
        stub.extend_from_slice(&code::read_flash_id(1));
        stub.extend_from_slice(&code::print_data(4, None));
        let data = self.ram_boot_read(&stub)?;
        if data.len() < 4 {
            return Err(Error::ProtocolViolation(format!(
                "chip id readout returned {} bytes",
                data.len()
            )));
        }
        debug!("Received chip info: {data:02X?}");
        self.chip_id = Some(data[0]);
        self.flash_id = Some([data[1], data[2], data[3]]);
        Ok(())
    }

    /// Device-computed MD5 over an absolute flash range.
    fn query_flash_md5(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut stub = code::read_data_md5(FLASH_ADDRESS | offset, length, 0);
        stub.extend_from_slice(&code::print_data(16, None));
        let digest = self.ram_boot_read(&stub)?;
        if digest.len() < 16 {
            return Err(Error::ProtocolViolation(format!(
                "digest readout returned {} bytes",
                digest.len()
            )));
        }
        Ok(digest[..16].to_vec())
    }

    /// Chunked flash read with an incremental MD5 and bounded resync.
    ///
    /// A failed sub-block is recovered by discarding and acknowledging the
    /// chunk's remaining blocks, which keeps the link consistent; the retry
    /// continues from the failure offset. Exhausting the retry budget
    /// surfaces the error with the transport resynchronized, so the caller
    /// may re-issue the read for the failed chunk range only.
    fn read_flash(
        &mut self,
        offset: u32,
        length: u32,
        verify: bool,
        sink: &mut dyn Write,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        let offset = offset & !3;
        let length = (length as usize).div_ceil(READ_BLOCK) as u32 * READ_BLOCK as u32;

        self.loud_handshake()?;
        progress.on_total(length as usize);

        let mut digest = Md5::new();
        let mut start = offset;
        let end = offset + length;

        while start < end {
            if progress.should_cancel() {
                return Err(Error::Cancelled);
            }
            let mut chunk_start = start;
            let mut chunk_left = ((end - start) as usize).min(READ_CHUNK);
            let chunk_end = chunk_start + chunk_left as u32;
            debug!("Dumping bytes: start=0x{chunk_start:X}, count=0x{chunk_left:X}");

            let mut attempts = 0;
            while chunk_left > 0 {
                match self.read_chunk_once(
                    &mut chunk_start,
                    &mut chunk_left,
                    &mut digest,
                    sink,
                    progress,
                ) {
                    Ok(()) => break,
                    Err(e) => {
                        attempts += 1;
                        let blocks_left = chunk_left / READ_BLOCK;
                        warn!(
                            "Data read error at 0x{chunk_start:X} (attempt {attempts}): {e}, \
                             discarding {blocks_left} blocks..."
                        );
                        // discard and acknowledge to keep the link consistent
                        let acks = vec![ACK; blocks_left + 1];
                        self.transport.write(&acks)?;
                        if attempts >= self.transport.retry_count() {
                            return Err(e);
                        }
                    },
                }
            }
            start = chunk_end;
        }

        self.loud_handshake()?;

        if verify {
            debug!("Final hash check: start=0x{offset:X}, count=0x{length:X}");
            let actual: Vec<u8> = digest.finalize().to_vec();
            let expected = self.query_flash_md5(offset, length)?;
            if expected != actual {
                return Err(Error::ChecksumMismatch { expected, actual });
            }
        }
        Ok(())
    }

    /// One read command covering `*chunk_left` bytes from `*chunk_start`;
    /// both advance past every completed block so retries resume in place.
    fn read_chunk_once(
        &mut self,
        chunk_start: &mut u32,
        chunk_left: &mut usize,
        digest: &mut Md5,
        sink: &mut dyn Write,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        // make sure there's no beacon NAK in the readout
        self.quiet_handshake()?;

        let mut request = vec![Command::FlashRead as u8];
        request.extend_from_slice(&chunk_start.to_le_bytes()[..3]);
        request.extend_from_slice(&((*chunk_left >> 12) as u16).to_le_bytes());
        self.transport.write(&request)?;

        let blocks = *chunk_left / READ_BLOCK;
        for _ in 0..blocks {
            let mut block = Vec::with_capacity(READ_BLOCK);
            for _ in 0..READ_BLOCK / READ_ACK_SIZE {
                let sub = self.transport.read_exact(READ_ACK_SIZE)?;
                block.extend_from_slice(&sub);
                self.transport.write(&[ACK])?;
            }
            digest.update(&block);
            sink.write_all(&block)?;
            *chunk_start += READ_BLOCK as u32;
            *chunk_left -= READ_BLOCK;
            progress.on_update(READ_BLOCK);
        }
        // force quiet-handshake mode
        self.transport.write(&[ACK])?;
        Ok(())
    }

    /// Active OTA index per the system data block at 0x9000.
    fn query_ota_index(&mut self, layout: &dyn BoardLayout) -> Result<OtaIndex> {
        let mut system = Vec::new();
        self.read_flash(0x9000, 256, false, &mut system, &mut NoProgress)?;
        if system.len() < 8 {
            return Err(Error::ProtocolViolation(
                "system data block too short".into(),
            ));
        }
        let ota2_addr = u32::from_le_bytes([system[0], system[1], system[2], system[3]]);
        let ota_switch = u32::from_le_bytes([system[4], system[5], system[6], system[7]]);
        // each toggle clears one more bit; an odd count selects OTA 2
        let index = if ota_switch.count_zeros() % 2 == 0 {
            OtaIndex::Ota1
        } else {
            OtaIndex::Ota2
        };

        if index == OtaIndex::Ota2 {
            let part_addr = layout
                .region("ota2")
                .ok_or_else(|| Error::UnknownPartition("ota2".into()))?
                .offset;
            if ota2_addr & 0x00FF_FFFF != part_addr {
                return Err(Error::ProtocolViolation(format!(
                    "OTA2 address on chip is 0x{:X}, layout expects 0x{part_addr:X}",
                    ota2_addr & 0x00FF_FFFF
                )));
            }
        }
        Ok(index)
    }

    fn write_flash(
        &mut self,
        offset: u32,
        length: u32,
        source: &mut dyn Read,
        verify: bool,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        let capacity = self.flash_size()?;
        crate::layout::MemoryRange::new(offset, length).check_capacity(capacity)?;

        if verify {
            let mut digest = Md5::new();
            let mut tee = DigestReader {
                inner: source,
                digest: &mut digest,
            };
            self.memory_write(FLASH_ADDRESS | offset, &mut tee, progress, false, false)?;
            let actual: Vec<u8> = digest.finalize().to_vec();
            let expected = self.query_flash_md5(offset, length)?;
            if expected != actual {
                return Err(Error::ChecksumMismatch { expected, actual });
            }
        } else {
            self.memory_write(FLASH_ADDRESS | offset, source, progress, false, false)?;
        }
        Ok(())
    }
}

struct DigestReader<'a, R: ?Sized> {
    inner: &'a mut R,
    digest: &'a mut Md5,
}

impl<R: Read + ?Sized> Read for DigestReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl<P: Port> Flasher for AmbzFlasher<P> {
    fn family(&self) -> ChipFamily {
        ChipFamily::Ambz
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
                warn!("Link attempt {attempt}/{MAX_CONNECT_ATTEMPTS}, resetting the chip");
                self.sw_reset()?;
            }
            match self.link() {
                Ok(()) => {
                    self.change_baud(self.work_baud)?;
                    info!("Link established at {} baud", self.transport.baud());
                    return Ok(());
                },
                Err(e) if e.is_link_timeout() => {
                    warn!("Link failed (attempt {attempt}/{MAX_CONNECT_ATTEMPTS}): {e}");
                },
                Err(e) => return Err(e),
            }
        }

        for line in AMBZ_GUIDE {
            info!("{line}");
        }
        Err(Error::LinkTimeout(format!(
            "no link after {MAX_CONNECT_ATTEMPTS} attempts"
        )))
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.state != LinkState::Unlinked {
            // best effort; the ROM may already be gone
            if let Err(e) = self.detach() {
                debug!("Detach failed: {e}");
            }
        }
        self.state = LinkState::Unlinked;
        Ok(())
    }

    fn read_chip_info(&mut self) -> Result<Vec<(String, String)>> {
        self.connect(&mut NoProgress)?;
        self.query_chip_ids()?;
        let chip_id = self.chip_id.unwrap_or(0);
        let flash_id = self.flash_id.unwrap_or([0; 3]);
        let flash_size = flash_size_from_id(flash_id[2])
            .map_or_else(|| "Unknown".to_string(), |size| format!("{} KiB", size / 1024));
        Ok(vec![
            ("Chip Type".into(), chip_type(chip_id)),
            (
                "Flash ID".into(),
                format!("{:02X} {:02X} {:02X}", flash_id[0], flash_id[1], flash_id[2]),
            ),
            ("Flash Size".into(), flash_size),
        ])
    }

    fn flash_size(&mut self) -> Result<u32> {
        if self.flash_id.is_none() {
            self.connect(&mut NoProgress)?;
            self.query_chip_ids()?;
        }
        let size_id = self.flash_id.map_or(0, |id| id[2]);
        Ok(flash_size_from_id(size_id).unwrap_or_else(|| {
            warn!("Couldn't process flash ID 0x{size_id:02X}, assuming 2 MiB");
            0x20_0000
        }))
    }

    fn read_raw(
        &mut self,
        offset: u32,
        length: u32,
        verify: bool,
        sink: &mut dyn Write,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        let capacity = self.flash_size()?;
        crate::layout::MemoryRange::new(offset, length).check_capacity(capacity)?;
        self.connect(&mut NoProgress)?;
        self.read_flash(offset, length, verify, sink, progress)
    }

    fn write_raw(
        &mut self,
        offset: u32,
        length: u32,
        source: &mut dyn Read,
        verify: bool,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        self.connect(&mut NoProgress)?;
        progress.on_total(xmodem::wire_length(length as usize, STX_BLOCK_SIZE));
        self.write_flash(offset, length, source, verify, progress)
    }

    fn write_container(
        &mut self,
        ctx: &mut UploadContext,
        layout: &dyn BoardLayout,
        verify: bool,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        self.connect(&mut NoProgress)?;

        progress.on_message("Checking OTA index...");
        let index = self.query_ota_index(layout)?;

        let parts = ctx.collect(index, layout)?;
        progress.on_total(
            parts
                .values()
                .map(|data| xmodem::wire_length(data.len(), STX_BLOCK_SIZE))
                .sum(),
        );

        for (offset, data) in &parts {
            if progress.should_cancel() {
                return Err(Error::Cancelled);
            }
            progress.on_message(&format!("{index} (0x{offset:06X})"));
            info!("Writing {} bytes to 0x{offset:06X}", data.len());
            self.write_flash(
                *offset,
                data.len() as u32,
                &mut Cursor::new(data),
                verify,
                progress,
            )?;
        }

        progress.on_message("Booting firmware");
        self.ram_boot_jump(0x00005405)?;
        self.state = LinkState::Unlinked;
        Ok(())
    }

    fn boot_guide(&self) -> &'static [&'static str] {
        AMBZ_GUIDE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockIo, MockPort};
    use crate::progress::NoProgress;

    const STATUS_RESPONSE: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x00, NAK];

    fn fast(mut flasher: AmbzFlasher<MockPort>) -> AmbzFlasher<MockPort> {
        flasher
            .transport_mut()
            .set_read_timeout(Duration::from_millis(10));
        flasher
            .transport_mut()
            .set_link_timeout(Duration::from_millis(300));
        flasher.transport_mut().set_retry_count(3);
        flasher
    }

    /// Simulated ROM: starts beaconing NAKs after the first detach sequence,
    /// answers the status and XMODEM commands.
    fn rom_responder() -> impl FnMut(&[u8], &mut MockIo) + Send + 'static {
        let mut detached = false;
        move |buf: &[u8], io: &mut MockIo| match buf {
            [0x18, 0x07, 0x18] => {
                detached = true;
                io.read_buf.extend([NAK; 4]);
            },
            [0x21] if detached => io.read_buf.extend(STATUS_RESPONSE),
            [0x05, _] if detached => io.read_buf.extend([ACK]),
            [0x07] if detached => io.read_buf.extend([ACK]),
            // XMODEM data packet or EOT
            [0x02, ..] | [0x04] if detached => io.read_buf.extend([ACK]),
            _ => {},
        }
    }

    #[test]
    fn test_link_waits_for_beacon() {
        let port = MockPort::new().on_write(rom_responder());
        let mut flasher = fast(AmbzFlasher::new(port, 460_800));
        flasher.link().unwrap();
        assert_eq!(flasher.state(), LinkState::Linked);
        // the probe loop forced the port back to the ROM rate
        assert!(flasher.transport().port().io.baud_history.contains(&ROM_BAUD));
    }

    #[test]
    fn test_link_times_out_without_beacon() {
        let port = MockPort::new();
        let mut flasher = fast(AmbzFlasher::new(port, 460_800));
        let err = flasher.link().unwrap_err();
        assert!(err.is_link_timeout(), "unexpected error: {err}");
        assert_eq!(flasher.state(), LinkState::Unlinked);
    }

    #[test]
    fn test_change_baud_sends_table_index() {
        let mut port = MockPort::new().on_write(|buf: &[u8], io: &mut MockIo| match buf {
            [0x05, _] => io.read_buf.extend([ACK]),
            [0x21] => io.read_buf.extend(STATUS_RESPONSE),
            _ => {},
        });
        port.io.baud_rate = ROM_BAUD;
        let mut flasher = fast(AmbzFlasher::new(port, 460_800));

        flasher.change_baud(460_800).unwrap();
        let io = &flasher.transport().port().io;
        // 460800 sits at index 18 of the ROM rate table
        assert_eq!(&io.written[..2], &[0x05, 18]);
        assert_eq!(io.baud_rate, 460_800);
    }

    #[test]
    fn test_change_baud_rejects_unknown_rate() {
        let port = MockPort::new();
        let mut flasher = fast(AmbzFlasher::new(port, 460_800));
        assert!(matches!(
            flasher.change_baud(123_456),
            Err(Error::Unsupported(_))
        ));
        // rejected before any I/O
        assert_eq!(flasher.transport().port().io.write_calls, 0);
    }

    #[test]
    fn test_memory_write_xmodem_flow() {
        let port = MockPort::new().on_write(rom_responder());
        let mut flasher = fast(AmbzFlasher::new(port, 460_800));
        flasher.link().unwrap();

        let data = vec![0x42u8; 100];
        flasher
            .memory_write(
                RAM_ADDRESS,
                &mut Cursor::new(data),
                &mut NoProgress,
                false,
                true,
            )
            .unwrap();

        let written = &flasher.transport().port().io.written;
        // the XMODEM handshake command went out
        assert!(written.contains(&0x07));
        // one STX packet carrying the RAM address prefix
        let stx = written
            .windows(7)
            .position(|w| w[0] == 0x02 && w[1] == 1 && w[2] == 0xFE)
            .expect("no XMODEM packet found");
        assert_eq!(&written[stx + 3..stx + 7], &RAM_ADDRESS.to_le_bytes());
        // EOT terminates the transfer
        assert_eq!(*written.last().unwrap(), 0x04);
    }

    /// Simulated read: serves 4 KiB of flash in 1 KiB sub-blocks, failing
    /// the first request short to exercise the discard-and-resync path.
    #[test]
    fn test_read_flash_retries_failed_chunk() {
        let image: Vec<u8> = (0..READ_BLOCK).map(|i| (i % 253) as u8).collect();
        let served = image.clone();
        let mut read_requests = 0usize;
        let port = MockPort::new().on_write(move |buf: &[u8], io: &mut MockIo| {
            match buf {
                [0x21] => io.read_buf.extend(STATUS_RESPONSE),
                [0x19, ..] => {
                    read_requests += 1;
                    if read_requests == 1 {
                        // short answer: only half a sub-block arrives
                        io.read_buf.extend(&served[..512]);
                    } else {
                        io.read_buf.extend(&served);
                    }
                },
                _ => {},
            }
        });
        let mut flasher = fast(AmbzFlasher::new(port, 460_800));

        let mut out = Vec::new();
        flasher
            .read_flash(0, READ_BLOCK as u32, false, &mut out, &mut NoProgress)
            .unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn test_read_flash_gives_up_after_retries() {
        let port = MockPort::new().on_write(move |buf: &[u8], io: &mut MockIo| match buf {
            [0x21] => io.read_buf.extend(STATUS_RESPONSE),
            // read requests get no data at all
            _ => {},
        });
        let mut flasher = fast(AmbzFlasher::new(port, 460_800));

        let mut out = Vec::new();
        let err = flasher
            .read_flash(0, READ_BLOCK as u32, false, &mut out, &mut NoProgress)
            .unwrap_err();
        assert!(err.is_link_timeout(), "unexpected error: {err}");
    }

    #[test]
    fn test_connect_prints_guide_after_exhaustion() {
        let port = MockPort::new();
        let mut flasher = fast(AmbzFlasher::new(port, 460_800));
        let err = flasher.connect(&mut NoProgress).unwrap_err();
        assert!(err.is_link_timeout());
        // sw-reset escalation toggled the console baud rate between attempts
        assert!(flasher
            .transport()
            .port()
            .io
            .baud_history
            .contains(&DIAG_BAUD));
    }
}
