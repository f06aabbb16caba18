//! 512-byte container block codec.
//!
//! On-disk layout:
//!
//! ```text
//! +--------+--------+-------+---------+-----+-----+-------+--------+------+--------+
//! | magic1 | magic2 | flags | address | len | seq | count | family | data | magic3 |
//! +--------+--------+-------+---------+-----+-----+-------+--------+------+--------+
//! |   4    |   4    |   4   |    4    |  4  |  4  |   4   |   4    | 476  |   4    |
//! +--------+--------+-------+---------+-----+-----+-------+--------+------+--------+
//! ```
//!
//! The data region holds `payload_size` payload bytes followed by the tag
//! list (when the has-tags flag is set): each tag is a total-length byte, a
//! 24-bit little-endian id and the value, padded to 4-byte alignment. A zero
//! length or id byte terminates the list. When the has-md5 flag is set the
//! last 24 bytes of the data region are an MD5 trailer and tags stop short
//! of it.

use crate::error::{Error, Result};
use crate::uf2::flags::BlockFlags;
use crate::uf2::tag::{Tag, TagMap};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// First magic word.
pub const MAGIC_1: u32 = 0x0A324655;
/// Second magic word.
pub const MAGIC_2: u32 = 0x9E5D5157;
/// Trailing magic word.
pub const MAGIC_3: u32 = 0x0AB16F30;

/// On-disk block size.
pub const BLOCK_SIZE: usize = 512;
/// Size of the data region within a block.
pub const DATA_SIZE: usize = 476;
/// Size of the optional MD5 trailer inside the data region.
pub const MD5_TRAILER_SIZE: usize = 24;

/// One decoded container block.
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// Flag word.
    pub flags: BlockFlags,
    /// Target address (absolute, or partition-relative in tagged OTA runs).
    pub address: u32,
    /// Block sequence number; must be below `block_count`.
    pub block_seq: u32,
    /// Total number of blocks in the file.
    pub block_count: u32,
    /// File size or family id, depending on the has-family-id flag.
    pub family_or_size: u32,
    /// Payload bytes (`payload_size` long).
    pub data: Vec<u8>,
    /// Tags carried by this block.
    pub tags: TagMap,
    /// Raw MD5 trailer when the has-md5 flag is set.
    pub md5: Option<[u8; MD5_TRAILER_SIZE]>,
}

impl Block {
    /// Create a data block.
    #[must_use]
    pub fn with_data(address: u32, data: Vec<u8>, tags: TagMap) -> Self {
        Self {
            address,
            data,
            tags,
            ..Self::default()
        }
    }

    /// Encoded length of a tag list, including alignment padding.
    #[must_use]
    pub fn tags_length(tags: &TagMap) -> usize {
        tags.iter().map(|(_, v)| align4(4 + v.len())).sum()
    }

    /// Space left for tags given this block's payload.
    #[must_use]
    pub fn tag_capacity(&self) -> usize {
        let end = if self.md5.is_some() {
            DATA_SIZE - MD5_TRAILER_SIZE
        } else {
            DATA_SIZE
        };
        end.saturating_sub(self.data.len())
    }

    /// Encode into one on-disk block.
    pub fn encode(&self, family_id: Option<u32>) -> Result<[u8; BLOCK_SIZE]> {
        if self.data.len() > DATA_SIZE {
            return Err(Error::MalformedContainer(format!(
                "payload of {} bytes exceeds the {DATA_SIZE}-byte data region",
                self.data.len()
            )));
        }
        let tags_len = Self::tags_length(&self.tags);
        if tags_len > self.tag_capacity() {
            return Err(Error::MalformedContainer(format!(
                "tags need {tags_len} bytes but only {} remain after the payload",
                self.tag_capacity()
            )));
        }

        let mut flags = self.flags;
        flags.has_tags = !self.tags.is_empty();
        flags.has_md5 = self.md5.is_some();
        flags.has_family_id = family_id.is_some();

        let mut out = [0u8; BLOCK_SIZE];
        let mut cursor = Cursor::new(&mut out[..]);
        cursor.write_u32::<LittleEndian>(MAGIC_1)?;
        cursor.write_u32::<LittleEndian>(MAGIC_2)?;
        cursor.write_u32::<LittleEndian>(flags.encode())?;
        cursor.write_u32::<LittleEndian>(self.address)?;
        cursor.write_u32::<LittleEndian>(self.data.len() as u32)?;
        cursor.write_u32::<LittleEndian>(self.block_seq)?;
        cursor.write_u32::<LittleEndian>(self.block_count)?;
        cursor.write_u32::<LittleEndian>(family_id.unwrap_or(self.family_or_size))?;

        let data_start = 32;
        out[data_start..data_start + self.data.len()].copy_from_slice(&self.data);
        let mut pos = data_start + self.data.len();
        for (tag, value) in self.tags.iter() {
            let total = 4 + value.len();
            if total > 0xFF {
                return Err(Error::MalformedContainer(format!(
                    "tag {tag} value of {} bytes does not fit one tag record",
                    value.len()
                )));
            }
            out[pos] = total as u8;
            let id = tag.id();
            out[pos + 1] = (id & 0xFF) as u8;
            out[pos + 2] = ((id >> 8) & 0xFF) as u8;
            out[pos + 3] = ((id >> 16) & 0xFF) as u8;
            out[pos + 4..pos + total].copy_from_slice(value);
            pos += align4(total);
        }
        if let Some(md5) = &self.md5 {
            out[data_start + DATA_SIZE - MD5_TRAILER_SIZE..data_start + DATA_SIZE]
                .copy_from_slice(md5);
        }

        out[BLOCK_SIZE - 4..].copy_from_slice(&MAGIC_3.to_le_bytes());
        Ok(out)
    }

    /// Decode one on-disk block, validating all magic words.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != BLOCK_SIZE {
            return Err(Error::MalformedContainer(format!(
                "block is {} bytes, expected {BLOCK_SIZE}",
                raw.len()
            )));
        }
        let mut cursor = Cursor::new(raw);
        let magic1 = cursor.read_u32::<LittleEndian>()?;
        let magic2 = cursor.read_u32::<LittleEndian>()?;
        if magic1 != MAGIC_1 || magic2 != MAGIC_2 {
            return Err(Error::MalformedContainer(format!(
                "bad start magic {magic1:#010X}/{magic2:#010X}"
            )));
        }
        let flags = BlockFlags::decode(cursor.read_u32::<LittleEndian>()?);
        let address = cursor.read_u32::<LittleEndian>()?;
        let payload_size = cursor.read_u32::<LittleEndian>()? as usize;
        let block_seq = cursor.read_u32::<LittleEndian>()?;
        let block_count = cursor.read_u32::<LittleEndian>()?;
        let family_or_size = cursor.read_u32::<LittleEndian>()?;

        let magic3 = u32::from_le_bytes([raw[508], raw[509], raw[510], raw[511]]);
        if magic3 != MAGIC_3 {
            return Err(Error::MalformedContainer(format!(
                "bad end magic {magic3:#010X}"
            )));
        }
        if payload_size > DATA_SIZE {
            return Err(Error::MalformedContainer(format!(
                "payload size {payload_size} exceeds the data region"
            )));
        }
        if block_seq >= block_count {
            return Err(Error::MalformedContainer(format!(
                "block index {block_seq} not below block count {block_count}"
            )));
        }

        let data_region = &raw[32..32 + DATA_SIZE];
        let data = data_region[..payload_size].to_vec();

        let md5 = if flags.has_md5 {
            let mut trailer = [0u8; MD5_TRAILER_SIZE];
            trailer.copy_from_slice(&data_region[DATA_SIZE - MD5_TRAILER_SIZE..]);
            Some(trailer)
        } else {
            None
        };

        let mut tags = TagMap::new();
        if flags.has_tags {
            let tags_end = if flags.has_md5 {
                DATA_SIZE - MD5_TRAILER_SIZE
            } else {
                DATA_SIZE
            };
            let mut pos = payload_size;
            while pos + 4 <= tags_end {
                let total = data_region[pos] as usize;
                if total == 0 {
                    break;
                }
                let id = u32::from(data_region[pos + 1])
                    | u32::from(data_region[pos + 2]) << 8
                    | u32::from(data_region[pos + 3]) << 16;
                if id == 0 {
                    break;
                }
                if total < 4 || pos + total > tags_end {
                    return Err(Error::MalformedContainer(format!(
                        "truncated tag 0x{id:06X} at data offset {pos}"
                    )));
                }
                tags.insert(Tag::from_id(id), data_region[pos + 4..pos + total].to_vec());
                pos += align4(total);
            }
        }

        Ok(Self {
            flags,
            address,
            block_seq,
            block_count,
            family_or_size,
            data,
            tags,
            md5,
        })
    }
}

fn align4(len: usize) -> usize {
    len.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_round_trip() {
        let tags = TagMap::new()
            .with(Tag::Ota1Part, b"app".to_vec())
            .with(Tag::Unknown(0x424242), vec![0xDE, 0xAD, 0xBE, 0xEF, 0x99]);
        let mut block = Block::with_data(0x1000, vec![0x55; 256], tags.clone());
        block.block_count = 1;

        let raw = block.encode(Some(0x675A40B0)).unwrap();
        assert_eq!(&raw[..4], &MAGIC_1.to_le_bytes());
        assert_eq!(&raw[508..], &MAGIC_3.to_le_bytes());

        let decoded = Block::decode(&raw).unwrap();
        assert_eq!(decoded.address, 0x1000);
        assert_eq!(decoded.data, vec![0x55; 256]);
        assert_eq!(decoded.family_or_size, 0x675A40B0);
        assert!(decoded.flags.has_family_id && decoded.flags.has_tags);
        assert_eq!(decoded.tags, tags);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let block = Block {
            block_count: 1,
            ..Block::default()
        };
        let mut raw = block.encode(None).unwrap();
        raw[0] ^= 0xFF;
        assert!(matches!(
            Block::decode(&raw),
            Err(Error::MalformedContainer(_))
        ));

        let mut raw = block.encode(None).unwrap();
        raw[511] ^= 0xFF;
        assert!(matches!(
            Block::decode(&raw),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_decode_rejects_seq_not_below_count() {
        let block = Block {
            block_seq: 2,
            block_count: 2,
            ..Block::default()
        };
        let raw = block.encode(None).unwrap();
        assert!(matches!(
            Block::decode(&raw),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_tag() {
        let mut block = Block::with_data(0, vec![0u8; 300], TagMap::new());
        block.block_count = 1;
        let mut raw = block.encode(None).unwrap();
        // set the has-tags flag (0x8000)
        raw[9] |= 0x80;
        // craft a tag after the payload whose length runs off the region
        let pos = 32 + 300;
        raw[pos] = 0xFF;
        raw[pos + 1] = 0x43;
        raw[pos + 2] = 0xDE;
        raw[pos + 3] = 0x00;
        assert!(matches!(
            Block::decode(&raw),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_tag_alignment_padding() {
        // a 3-byte value makes a 7-byte record, padded to 8
        let tags = TagMap::new()
            .with(Tag::Ota1Part, b"app".to_vec())
            .with(Tag::Ota2Part, b"ota2".to_vec());
        assert_eq!(Block::tags_length(&tags), 8 + 8);

        let mut block = Block::with_data(0, vec![0xAA; 4], tags.clone());
        block.block_count = 1;
        let raw = block.encode(None).unwrap();
        let decoded = Block::decode(&raw).unwrap();
        assert_eq!(decoded.tags, tags);
    }

    #[test]
    fn test_md5_trailer_reserved() {
        let mut block = Block::with_data(0, vec![1, 2, 3], TagMap::new());
        block.block_count = 1;
        block.md5 = Some([0xAB; MD5_TRAILER_SIZE]);
        let raw = block.encode(None).unwrap();
        let decoded = Block::decode(&raw).unwrap();
        assert_eq!(decoded.md5, Some([0xAB; MD5_TRAILER_SIZE]));
        assert_eq!(decoded.tag_capacity(), DATA_SIZE - MD5_TRAILER_SIZE - 3);
    }
}
