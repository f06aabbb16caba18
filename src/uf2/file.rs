//! Container file reader and writer.

use crate::error::{Error, Result};
use crate::uf2::binpatch;
use crate::uf2::block::{Block, BLOCK_SIZE, DATA_SIZE};
use crate::uf2::tag::{Tag, TagMap};
use log::debug;
use std::io::{Read, Write};
use std::path::Path;

/// Default payload chunk size used when storing data runs.
///
/// Deliberately smaller than the 476-byte data region: the remainder is the
/// budget for tags, in particular per-block binary patches.
pub const DEFAULT_CHUNK: usize = 256;

/// A parsed (or under-construction) container file.
#[derive(Debug, Default)]
pub struct Uf2File {
    /// Family id carried by flagged blocks.
    pub family_id: Option<u32>,
    /// File-level tag map: merged from all blocks on read, written into the
    /// first block on write.
    pub tags: TagMap,
    /// Blocks in file order.
    pub blocks: Vec<Block>,
}

impl Uf2File {
    /// Create an empty container for the given family.
    #[must_use]
    pub fn new(family_id: u32) -> Self {
        Self {
            family_id: Some(family_id),
            ..Self::default()
        }
    }

    /// Parse a container from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        Self::from_bytes(&raw)
    }

    /// Parse a container from a file on disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading container from: {}", path.display());
        let mut file = std::fs::File::open(path)?;
        Self::read_from(&mut file)
    }

    /// Parse a container from raw bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() || raw.len() % BLOCK_SIZE != 0 {
            return Err(Error::MalformedContainer(format!(
                "file size {} is not a multiple of {BLOCK_SIZE}",
                raw.len()
            )));
        }

        let block_count = (raw.len() / BLOCK_SIZE) as u32;
        let mut file = Self::default();
        for (index, chunk) in raw.chunks_exact(BLOCK_SIZE).enumerate() {
            let block = Block::decode(chunk)?;
            if block.block_count != block_count {
                return Err(Error::MalformedContainer(format!(
                    "block {index} declares {} total blocks, file has {block_count}",
                    block.block_count
                )));
            }
            if block.block_seq != index as u32 {
                return Err(Error::MalformedContainer(format!(
                    "block {index} carries sequence number {}",
                    block.block_seq
                )));
            }
            if block.flags.has_family_id {
                match file.family_id {
                    None => file.family_id = Some(block.family_or_size),
                    Some(family) if family != block.family_or_size => {
                        return Err(Error::MalformedContainer(format!(
                            "conflicting family ids 0x{family:08X} and 0x{:08X}",
                            block.family_or_size
                        )));
                    },
                    Some(_) => {},
                }
            }
            file.tags.merge(&block.tags);
            file.blocks.push(block);
        }

        debug!(
            "Container: {} blocks, family {:?}, {} file tags",
            file.blocks.len(),
            file.family_id.map(|f| format!("0x{f:08X}")),
            file.tags.len()
        );
        Ok(file)
    }

    /// Store a data run at `address`, chunked into `chunk`-byte payloads.
    ///
    /// The tag map goes on the run's first block only. `chunk` is
    /// independent of the 512-byte physical block size; it bounds the
    /// payload so tags still fit alongside.
    pub fn store(&mut self, address: u32, data: &[u8], tags: TagMap, chunk: usize) -> Result<()> {
        if chunk == 0 || chunk > DATA_SIZE {
            return Err(Error::OutOfBounds(format!(
                "chunk size {chunk} not within 1..={DATA_SIZE}"
            )));
        }
        let mut tags = Some(tags);
        for (i, piece) in data.chunks(chunk).enumerate() {
            let block_tags = tags.take().unwrap_or_default();
            let block = Block::with_data(
                address + (i * chunk) as u32,
                piece.to_vec(),
                block_tags,
            );
            if Block::tags_length(&block.tags) > block.tag_capacity() {
                return Err(Error::MalformedContainer(
                    "tags do not fit beside the first payload chunk".into(),
                ));
            }
            self.blocks.push(block);
        }
        Ok(())
    }

    /// Store a dual-OTA pair of equal-length images.
    ///
    /// Windows where both variants match are stored once; differing windows
    /// are stored as OTA-1 bytes plus a binary patch deriving the OTA-2
    /// bytes, so the second image never ships in full.
    pub fn store_ota_pair(
        &mut self,
        address: u32,
        ota1: &[u8],
        ota2: &[u8],
        tags: TagMap,
    ) -> Result<()> {
        if ota1.len() != ota2.len() {
            return Err(Error::OutOfBounds(format!(
                "images must have the same length ({} vs {})",
                ota1.len(),
                ota2.len()
            )));
        }

        let mut tags = Some(tags);
        for offs in (0..ota1.len()).step_by(DEFAULT_CHUNK) {
            let end = (offs + DEFAULT_CHUNK).min(ota1.len());
            let window1 = &ota1[offs..end];
            let window2 = &ota2[offs..end];
            let mut block_tags = tags.take().unwrap_or_default();

            if window1 != window2 {
                let patch = binpatch::diff32(window1, window2)?;
                // the patch must fit beside the payload, the run tags and
                // its own 4-byte record header
                let budget = DATA_SIZE
                    .saturating_sub(window1.len())
                    .saturating_sub(Block::tags_length(&block_tags))
                    .saturating_sub(4);
                if patch.len() > budget {
                    return Err(Error::MalformedContainer(format!(
                        "binary patch of {} bytes exceeds the {budget}-byte tag budget",
                        patch.len()
                    )));
                }
                block_tags.insert(Tag::Binpatch, patch);
            }

            self.blocks
                .push(Block::with_data(address + offs as u32, window1.to_vec(), block_tags));
        }
        Ok(())
    }

    /// Set a string-valued file tag.
    pub fn put_str(&mut self, tag: Tag, value: &str) {
        self.tags.insert(tag, value.as_bytes().to_vec());
    }

    /// Set a little-endian u32 file tag.
    pub fn put_u32(&mut self, tag: Tag, value: u32) {
        self.tags.insert(tag, value.to_le_bytes().to_vec());
    }

    /// Set a single-byte file tag.
    pub fn put_u8(&mut self, tag: Tag, value: u8) {
        self.tags.insert(tag, vec![value]);
    }

    /// Serialize the container.
    ///
    /// Assigns `block_seq`/`block_count` across the final block list and
    /// merges the file-level tag map into the first block; files with no
    /// stored data get a single tag-only block.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> Result<()> {
        if self.blocks.is_empty() {
            self.blocks.push(Block::default());
        }

        let mut merged = self.tags.clone();
        let first = &mut self.blocks[0];
        merged.merge(&first.tags);
        if Block::tags_length(&merged) > first.tag_capacity() {
            return Err(Error::MalformedContainer(
                "file tags do not fit in the first block".into(),
            ));
        }
        first.tags = merged;

        let block_count = self.blocks.len() as u32;
        for (seq, block) in self.blocks.iter_mut().enumerate() {
            block.block_seq = seq as u32;
            block.block_count = block_count;
            let raw = block.encode(self.family_id)?;
            writer.write_all(&raw)?;
        }
        writer.flush()?;
        debug!("Wrote {} blocks", block_count);
        Ok(())
    }

    /// Serialize the container to a file on disk.
    pub fn write_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        self.write_to(&mut file)
    }

    /// Total payload byte count across all blocks.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_file(chunk: usize) -> Vec<u8> {
        let mut file = Uf2File::new(0x675A40B0);
        file.put_str(Tag::Board, "demo-board");
        file.put_str(Tag::Firmware, "example");
        let run_tags = TagMap::new().with(Tag::Ota1Part, b"app".to_vec());
        file.store(0x2000, &[0xA5; 700], run_tags, chunk).unwrap();
        let mut out = Vec::new();
        file.write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn test_round_trip_preserves_content() {
        let raw = build_file(256);
        let file = Uf2File::from_bytes(&raw).unwrap();
        assert_eq!(file.family_id, Some(0x675A40B0));
        assert_eq!(file.tags.get_str(Tag::Board).as_deref(), Some("demo-board"));
        assert_eq!(file.blocks.len(), 3);
        assert_eq!(file.blocks[0].address, 0x2000);
        assert_eq!(file.blocks[1].address, 0x2100);
        assert_eq!(file.data_len(), 700);
        assert_eq!(
            file.blocks[0].tags.get_str(Tag::Ota1Part).as_deref(),
            Some("app")
        );
        assert!(file.blocks[1].tags.is_empty());
    }

    #[test]
    fn test_chunking_choice_does_not_change_content() {
        let parse = |raw: &[u8]| {
            let file = Uf2File::from_bytes(raw).unwrap();
            let mut data = Vec::new();
            for block in &file.blocks {
                data.extend_from_slice(&block.data);
            }
            (data, file.tags.clone())
        };
        let (data_a, tags_a) = parse(&build_file(128));
        let (data_b, tags_b) = parse(&build_file(256));
        assert_eq!(data_a, data_b);
        assert_eq!(tags_a, tags_b);
    }

    #[test]
    fn test_rejects_truncated_file() {
        let mut raw = build_file(256);
        raw.truncate(raw.len() - 10);
        assert!(matches!(
            Uf2File::from_bytes(&raw),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_rejects_inconsistent_block_count() {
        let mut raw = build_file(256);
        // append a copy of the first block; its count no longer matches
        let extra = raw[..BLOCK_SIZE].to_vec();
        raw.extend_from_slice(&extra);
        assert!(matches!(
            Uf2File::from_bytes(&raw),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_on_disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.uf2");
        let raw = build_file(256);
        std::fs::write(&path, &raw).unwrap();

        let mut file = Uf2File::from_file(&path).unwrap();
        let path2 = dir.path().join("fw2.uf2");
        file.write_file(&path2).unwrap();
        assert_eq!(std::fs::read(&path2).unwrap(), raw);
    }

    #[test]
    fn test_store_ota_pair_patches_differing_windows() {
        let ota1 = vec![0x11; 512];
        let mut ota2 = ota1.clone();
        // change one word inside the second 256-byte window
        ota2[300..304].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());

        let mut file = Uf2File::new(0x9FFFD543);
        file.store_ota_pair(0, &ota1, &ota2, TagMap::new()).unwrap();
        assert_eq!(file.blocks.len(), 2);
        assert!(!file.blocks[0].tags.contains(Tag::Binpatch));
        assert!(file.blocks[1].tags.contains(Tag::Binpatch));

        // applying the stored patch to the stored bytes yields the OTA-2 window
        let mut window = file.blocks[1].data.clone();
        binpatch::apply(&mut window, file.blocks[1].tags.get(Tag::Binpatch).unwrap()).unwrap();
        assert_eq!(window, ota2[256..512]);
    }

    #[test]
    fn test_tag_only_file() {
        let mut file = Uf2File::new(0x9FFFD543);
        file.put_str(Tag::Firmware, "meta-only");
        let mut out = Vec::new();
        file.write_to(&mut out).unwrap();
        assert_eq!(out.len(), BLOCK_SIZE);

        let parsed = Uf2File::from_bytes(&out).unwrap();
        assert_eq!(
            parsed.tags.get_str(Tag::Firmware).as_deref(),
            Some("meta-only")
        );
        assert!(parsed.blocks[0].data.is_empty());
    }
}
