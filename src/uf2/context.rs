//! Container replay into contiguous write jobs.

use crate::error::{Error, Result};
use crate::layout::BoardLayout;
use crate::uf2::binpatch;
use crate::uf2::file::Uf2File;
use crate::uf2::tag::Tag;
use log::{debug, warn};
use std::collections::BTreeMap;

/// Which OTA interpretation of the container to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaIndex {
    /// First OTA variant: stored bytes as-is.
    Ota1,
    /// Second OTA variant: stored bytes with per-block patches applied.
    Ota2,
}

impl std::fmt::Display for OtaIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ota1 => write!(f, "OTA 1"),
            Self::Ota2 => write!(f, "OTA 2"),
        }
    }
}

/// Replays container blocks into `(partition, offset, data)` emissions and
/// merges them into per-start-offset buffers.
///
/// Each block may redeclare the active partition for either OTA index; an
/// empty partition tag clears the slot, so a single block sequence can
/// multiplex two independent images.
pub struct UploadContext {
    file: Uf2File,
    seq: usize,
    part1: Option<String>,
    part2: Option<String>,
}

impl UploadContext {
    /// Wrap a parsed container.
    pub fn new(file: Uf2File) -> Result<Self> {
        if file.blocks.is_empty() {
            return Err(Error::MalformedContainer(
                "container holds no blocks".into(),
            ));
        }
        Ok(Self {
            file,
            seq: 0,
            part1: None,
            part2: None,
        })
    }

    /// Firmware name from the file tags.
    #[must_use]
    pub fn fw_name(&self) -> Option<String> {
        self.file.tags.get_str(Tag::Firmware)
    }

    /// Firmware version from the file tags.
    #[must_use]
    pub fn fw_version(&self) -> Option<String> {
        self.file.tags.get_str(Tag::Version)
    }

    /// Board name from the file tags.
    #[must_use]
    pub fn board_name(&self) -> Option<String> {
        self.file.tags.get_str(Tag::Board)
    }

    /// Build date as a Unix timestamp.
    #[must_use]
    pub fn build_date(&self) -> Option<u32> {
        self.file.tags.get_u32(Tag::BuildDate)
    }

    /// Whether the file carries any OTA-1 data.
    #[must_use]
    pub fn has_ota1(&self) -> bool {
        self.file.tags.get_u32(Tag::HasOta1).unwrap_or(0) != 0
    }

    /// Whether the file carries any OTA-2 data.
    #[must_use]
    pub fn has_ota2(&self) -> bool {
        self.file.tags.get_u32(Tag::HasOta2).unwrap_or(0) != 0
    }

    /// Family id of the container.
    #[must_use]
    pub fn family_id(&self) -> Option<u32> {
        self.file.family_id
    }

    /// Restart the replay from the first block.
    pub fn rewind(&mut self) {
        self.seq = 0;
        self.part1 = None;
        self.part2 = None;
    }

    /// Read the next `(partition, relative_offset, data)` emission for the
    /// requested OTA index.
    pub fn read_next(&mut self, index: OtaIndex) -> Result<Option<(String, u32, Vec<u8>)>> {
        while self.seq < self.file.blocks.len() {
            let block = &self.file.blocks[self.seq];
            self.seq += 1;

            if let Some(part) = block.tags.get_str(Tag::Ota1Part) {
                self.part1 = (!part.is_empty()).then_some(part);
            }
            if let Some(part) = block.tags.get_str(Tag::Ota2Part) {
                self.part2 = (!part.is_empty()).then_some(part);
            }

            if block.data.is_empty() {
                continue;
            }
            let part = match index {
                OtaIndex::Ota1 => self.part1.clone(),
                OtaIndex::Ota2 => self.part2.clone(),
            };
            let Some(part) = part else {
                continue;
            };

            let mut data = block.data.clone();
            if index == OtaIndex::Ota2 {
                if let Some(patch) = block.tags.get(Tag::Binpatch) {
                    binpatch::apply(&mut data, patch)?;
                }
            }
            return Ok(Some((part, block.address, data)));
        }
        Ok(None)
    }

    /// Replay all blocks for the requested OTA index, resolving partitions
    /// through `layout` and merging address-adjacent emissions.
    ///
    /// Returns a map of absolute start offsets to write buffers. A new entry
    /// is only created when an emission does not abut an existing buffer.
    pub fn collect(
        &mut self,
        index: OtaIndex,
        layout: &dyn BoardLayout,
    ) -> Result<BTreeMap<u32, Vec<u8>>> {
        self.rewind();
        let mut out: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        while let Some((part, offs, data)) = self.read_next(index)? {
            let region = layout
                .region(&part)
                .ok_or_else(|| Error::UnknownPartition(part.clone()))?;
            if offs >= region.length {
                warn!(
                    "Partition '{part}' rel. offset 0x{offs:X} larger than 0x{:X}",
                    region.length
                );
                return Err(Error::OutOfBounds(format!(
                    "offset 0x{offs:X} beyond partition '{part}' of 0x{:X} bytes",
                    region.length
                )));
            }
            let abs = region.offset + offs;

            // extend an adjacent buffer when possible
            let adjacent = out
                .iter()
                .find(|(start, buf)| **start + buf.len() as u32 == abs)
                .map(|(start, _)| *start);
            if let Some(buf) = adjacent.and_then(|start| out.get_mut(&start)) {
                buf.extend_from_slice(&data);
            } else {
                out.insert(abs, data);
            }
        }

        debug!(
            "Collected {} write job(s) for {index}: {:?}",
            out.len(),
            out.iter()
                .map(|(offs, buf)| format!("0x{offs:X}+0x{:X}", buf.len()))
                .collect::<Vec<_>>()
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PartitionMap;
    use crate::uf2::tag::TagMap;

    fn layout() -> PartitionMap {
        PartitionMap::new()
            .with("app", 0x11000, 0x121000)
            .with("ota2", 0x132000, 0xAE000)
    }

    fn dual_tags(part1: &str, part2: &str) -> TagMap {
        TagMap::new()
            .with(Tag::Ota1Part, part1.as_bytes().to_vec())
            .with(Tag::Ota2Part, part2.as_bytes().to_vec())
    }

    #[test]
    fn test_single_image_end_to_end() {
        // one 64 KiB OTA-1-only image on partition "app"
        let mut file = Uf2File::new(0x675A40B0);
        file.put_str(Tag::Board, "demo");
        file.put_u8(Tag::HasOta1, 1);
        file.put_u8(Tag::HasOta2, 0);
        let tags = TagMap::new().with(Tag::Ota1Part, b"app".to_vec());
        file.store(0, &vec![0x42; 64 * 1024], tags, 256).unwrap();

        let mut raw = Vec::new();
        file.write_to(&mut raw).unwrap();
        let file = Uf2File::from_bytes(&raw).unwrap();
        let mut ctx = UploadContext::new(file).unwrap();

        assert!(ctx.has_ota1());
        assert!(!ctx.has_ota2());

        let parts = ctx.collect(OtaIndex::Ota1, &layout()).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[&0x11000], vec![0x42; 64 * 1024]);

        let parts = ctx.collect(OtaIndex::Ota2, &layout()).unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn test_interleaved_partitions_merge_and_split() {
        let mut file = Uf2File::new(0x9FFFD543);
        // run 1: both indexes active, two adjacent blocks
        file.store(0, &[0x11; 512], dual_tags("app", "ota2"), 256)
            .unwrap();
        // run 2: non-adjacent to run 1 within the same partitions
        file.store(0x4000, &[0x22; 256], dual_tags("app", "ota2"), 256)
            .unwrap();
        // run 3: OTA-2 slot cleared, only OTA-1 continues adjacent to run 2
        file.store(
            0x4100,
            &[0x33; 256],
            TagMap::new().with(Tag::Ota2Part, Vec::new()),
            256,
        )
        .unwrap();

        let mut ctx = UploadContext::new(build(&mut file)).unwrap();

        let ota1 = ctx.collect(OtaIndex::Ota1, &layout()).unwrap();
        assert_eq!(ota1.len(), 2);
        assert_eq!(ota1[&0x11000].len(), 512);
        // runs 2 and 3 merged into one 512-byte buffer
        let merged = &ota1[&0x15000];
        assert_eq!(merged.len(), 512);
        assert_eq!(&merged[..256], &[0x22; 256]);
        assert_eq!(&merged[256..], &[0x33; 256]);

        let ota2 = ctx.collect(OtaIndex::Ota2, &layout()).unwrap();
        assert_eq!(ota2.len(), 2);
        assert_eq!(ota2[&0x132000].len(), 512);
        assert_eq!(ota2[&0x136000].len(), 256);
    }

    #[test]
    fn test_binpatch_applied_for_ota2_only() {
        let ota1 = vec![0xAA; 256];
        let mut ota2 = ota1.clone();
        ota2[0..4].copy_from_slice(&0xAAAAAABBu32.to_le_bytes());

        let mut file = Uf2File::new(0x9FFFD543);
        file.store_ota_pair(0, &ota1, &ota2, dual_tags("app", "ota2"))
            .unwrap();
        let mut ctx = UploadContext::new(build(&mut file)).unwrap();

        let parts1 = ctx.collect(OtaIndex::Ota1, &layout()).unwrap();
        assert_eq!(parts1[&0x11000], ota1);

        let parts2 = ctx.collect(OtaIndex::Ota2, &layout()).unwrap();
        assert_eq!(parts2[&0x132000], ota2);
    }

    #[test]
    fn test_unknown_partition_fails() {
        let mut file = Uf2File::new(0x9FFFD543);
        let tags = TagMap::new().with(Tag::Ota1Part, b"missing".to_vec());
        file.store(0, &[0u8; 16], tags, 256).unwrap();
        let mut ctx = UploadContext::new(build(&mut file)).unwrap();
        assert!(matches!(
            ctx.collect(OtaIndex::Ota1, &layout()),
            Err(Error::UnknownPartition(_))
        ));
    }

    #[test]
    fn test_offset_beyond_partition_fails() {
        let mut file = Uf2File::new(0x9FFFD543);
        let tags = TagMap::new().with(Tag::Ota1Part, b"app".to_vec());
        file.store(0x200000, &[0u8; 16], tags, 256).unwrap();
        let mut ctx = UploadContext::new(build(&mut file)).unwrap();
        assert!(matches!(
            ctx.collect(OtaIndex::Ota1, &layout()),
            Err(Error::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_empty_container_rejected() {
        assert!(UploadContext::new(Uf2File::default()).is_err());
    }

    fn build(file: &mut Uf2File) -> Uf2File {
        let mut raw = Vec::new();
        file.write_to(&mut raw).unwrap();
        Uf2File::from_bytes(&raw).unwrap()
    }
}
