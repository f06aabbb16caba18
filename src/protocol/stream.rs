//! Stream adapters composed around the packetizer's data source.

use std::io::Read;

/// Read adapter that prefixes every packet with its absolute target address.
///
/// Some boot ROMs expect each transmitted data block to start with the
/// 4-byte little-endian address the block is destined for, incrementing
/// automatically per block. Wrapping the source stream keeps the packetizer
/// itself address-agnostic: every read of `chunk` data bytes comes back as
/// `chunk + 4` bytes (address word first, data padded with 0xFF), and the
/// running address advances by the data consumed.
pub struct AddressPrefix<R> {
    inner: R,
    address: u32,
    chunk: usize,
}

impl<R: Read> AddressPrefix<R> {
    /// Wrap `inner`, starting at `address`, with `chunk` data bytes per
    /// packet.
    pub fn new(inner: R, address: u32, chunk: usize) -> Self {
        Self {
            inner,
            address,
            chunk,
        }
    }

    /// The address the next packet will carry.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Unwrap the adapter.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill_from_inner(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Read for AddressPrefix<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let packet = self.chunk + 4;
        if buf.len() < packet {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("address-prefixed packets need {packet}-byte reads"),
            ));
        }

        let mut data = vec![0u8; self.chunk];
        let n = self.fill_from_inner(&mut data)?;
        if n == 0 {
            return Ok(0);
        }

        buf[..4].copy_from_slice(&self.address.to_le_bytes());
        buf[4..4 + n].copy_from_slice(&data[..n]);
        buf[4 + n..packet].fill(0xFF);
        self.address = self.address.wrapping_add(n as u32);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_address_prefix_progression() {
        let data = vec![0xAB; 24];
        let mut adapter = AddressPrefix::new(Cursor::new(data), 0x8000, 16);
        let mut buf = [0u8; 20];

        assert_eq!(adapter.read(&mut buf).unwrap(), 20);
        assert_eq!(&buf[..4], &0x8000u32.to_le_bytes());
        assert_eq!(&buf[4..20], &[0xAB; 16]);

        // second packet: 8 data bytes left, padded with 0xFF
        assert_eq!(adapter.read(&mut buf).unwrap(), 20);
        assert_eq!(&buf[..4], &0x8010u32.to_le_bytes());
        assert_eq!(&buf[4..12], &[0xAB; 8]);
        assert_eq!(&buf[12..20], &[0xFF; 8]);
        assert_eq!(adapter.address(), 0x8018);

        // exhausted
        assert_eq!(adapter.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_address_prefix_rejects_short_buffer() {
        let mut adapter = AddressPrefix::new(Cursor::new(vec![0u8; 4]), 0, 16);
        let mut buf = [0u8; 8];
        assert!(adapter.read(&mut buf).is_err());
    }
}
