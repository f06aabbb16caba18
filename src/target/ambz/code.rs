//! Thumb code stubs executed on the chip through RAM boot.
//!
//! Chip identification and digest queries have no download-mode commands;
//! instead, small fixed code templates are booted into SRAM. Each template
//! calls documented ROM routines and is followed by its little-endian
//! parameter words; results land in a scratch area that a final print stub
//! streams out over the console UART.

/// Scratch area the stubs read into and print from.
pub const DATA_ADDRESS: u32 = 0x1000_3000;

fn le32(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Delay, then print a fixed marker message (at most 16 bytes) on the
/// console UART. Used to delimit stub output from boot noise.
pub fn print_greeting(delay_ms: u32, message: &[u8]) -> Vec<u8> {
    debug_assert!(message.len() <= 16);
    let mut data = [0u8; 16];
    data[..message.len()].copy_from_slice(message);
    let mut code = Vec::new();
    // push/delay/print sequence calling DelayMs() and xmodem_uart_putdata()
    code.extend_from_slice(
        &[
            0x05, 0x48, 0x03, 0x4b, //
            0x98, 0x47, 0x06, 0xa0, //
            0x04, 0x49, 0x02, 0x4b, //
            0x98, 0x47, 0x0f, 0xe0, //
            0x6d, 0x34, 0x00, 0x00, // DelayMs()
            0x49, 0xec, 0x00, 0x00, // xmodem_uart_putdata()
        ],
    );
    code.extend_from_slice(&le32(delay_ms));
    code.extend_from_slice(&le32(message.len() as u32));
    code.extend_from_slice(&data);
    code
}

/// Disable booting to SRAM and restart the ROM download mode.
pub fn download_mode() -> Vec<u8> {
    let mut code = Vec::new();
    code.extend_from_slice(
        &[
            0x04, 0x4b, 0x18, 0x68, //
            0x04, 0x49, 0x08, 0x40, //
            0x18, 0x60, 0x02, 0x20, //
            0x00, 0x4b, 0x98, 0x47, //
            0x01, 0x09, 0x00, 0x00, // UARTIMG_Download()
            0x10, 0x02, 0x00, 0x40, // uartimg_boot_sram
            0xff, 0xff, 0xff, 0xef, // uartimg_boot_mask
        ],
    );
    code
}

/// Read the SPI flash id (command 0x9F, 3 bytes) into the scratch area.
pub fn read_flash_id(offset: u32) -> Vec<u8> {
    let mut code = Vec::new();
    code.extend_from_slice(
        &[
            0x9f, 0x20, 0x03, 0x21, //
            0x02, 0x4a, 0x01, 0x4b, //
            0x98, 0x47, 0x03, 0xe0, //
            0x65, 0x74, 0x00, 0x00, // FLASH_RxCmd()
        ],
    );
    code.extend_from_slice(&le32(DATA_ADDRESS + offset));
    code
}

/// Read the chip id byte (eFuse 0xF8) into the scratch area.
pub fn read_chip_id(offset: u32) -> Vec<u8> {
    let mut code = Vec::new();
    code.extend_from_slice(
        &[
            0x03, 0x48, 0xf8, 0x21, //
            0x04, 0x4a, 0x07, 0x23, //
            0x02, 0x4c, 0xa0, 0x47, //
            0x06, 0xe0, 0x00, 0x00, //
            0xae, 0x26, 0x00, 0x00, // CtrlSetting
            0x65, 0x6d, 0x00, 0x00, // EFUSE_OneByteReadROM()
        ],
    );
    code.extend_from_slice(&le32(DATA_ADDRESS + offset));
    code
}

/// MD5 over `length` bytes at `address`, via the ROM's md5 routines; the
/// 16-byte digest lands at the scratch offset.
pub fn read_data_md5(address: u32, length: u32, offset: u32) -> Vec<u8> {
    let mut code = Vec::new();
    code.extend_from_slice(
        &[
            0x0c, 0x48, 0x06, 0x4b, //
            0x98, 0x47, 0x0b, 0x48, //
            0x07, 0x49, 0x08, 0x4a, //
            0x04, 0x4b, 0x98, 0x47, //
            0x07, 0x48, 0x08, 0x49, //
            0x03, 0x4b, 0x98, 0x47, //
            0x0e, 0xe0, 0x00, 0x00, //
            0xf5, 0x1d, 0x01, 0x00, // rt_md5_init()
            0x25, 0x1e, 0x01, 0x00, // rt_md5_append()
            0xc9, 0x1e, 0x01, 0x00, // rt_md5_final()
        ],
    );
    code.extend_from_slice(&le32(address));
    code.extend_from_slice(&le32(length));
    code.extend_from_slice(&le32(DATA_ADDRESS + offset));
    code.extend_from_slice(&le32(DATA_ADDRESS + offset + 16));
    code
}

/// Print `length` bytes from the scratch area on the console UART.
pub fn print_data(length: u32, address: Option<u32>) -> Vec<u8> {
    let mut code = Vec::new();
    code.extend_from_slice(
        &[
            0x03, 0x48, 0x04, 0x49, //
            0x01, 0x4b, 0x98, 0x47, //
            0x06, 0xe0, 0x00, 0x00, //
            0x49, 0xec, 0x00, 0x00, // xmodem_uart_putdata()
        ],
    );
    code.extend_from_slice(&le32(address.unwrap_or(DATA_ADDRESS)));
    code.extend_from_slice(&le32(length));
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_parameter_words() {
        let stub = read_data_md5(0x0800_0000, 0x10000, 0);
        let params = &stub[stub.len() - 16..];
        assert_eq!(&params[0..4], &0x0800_0000u32.to_le_bytes());
        assert_eq!(&params[4..8], &0x10000u32.to_le_bytes());
        assert_eq!(&params[8..12], &DATA_ADDRESS.to_le_bytes());
        assert_eq!(&params[12..16], &(DATA_ADDRESS + 16).to_le_bytes());
    }

    #[test]
    fn test_greeting_pads_message() {
        let stub = print_greeting(400, b"Hi");
        assert_eq!(&stub[stub.len() - 16..stub.len() - 14], b"Hi");
        assert_eq!(&stub[stub.len() - 20..stub.len() - 16], &2u32.to_le_bytes());
    }
}
