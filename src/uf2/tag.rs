//! Tag identifiers and the ordered tag map.

use std::fmt;

/// Tag identifier: a fixed 24-bit constant.
///
/// Unknown ids are preserved so foreign tags survive a read/write cycle
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Firmware description / name (UTF-8).
    Firmware,
    /// Firmware version (UTF-8 semver string).
    Version,
    /// Board name, lowercase code (UTF-8).
    Board,
    /// Build date/time as a little-endian Unix timestamp.
    BuildDate,
    /// Device type identifier (CRC32 of the board key).
    DeviceId,
    /// Description of the device (UTF-8).
    Device,
    /// Container format version marker.
    OtaVersion,
    /// Partition name for the OTA-1 interpretation of the block run.
    Ota1Part,
    /// Partition name for the OTA-2 interpretation of the block run.
    Ota2Part,
    /// Whether the file carries any OTA-1 data.
    HasOta1,
    /// Whether the file carries any OTA-2 data.
    HasOta2,
    /// Binary patch converting this block's OTA-1 bytes into OTA-2 bytes.
    Binpatch,
    /// Core/SDK version (semver).
    CoreVersion,
    /// SHA-2 checksum of the firmware.
    Sha2,
    /// Page size of the target device (32-bit unsigned).
    PageSize,
    /// Any id the core does not interpret.
    Unknown(u32),
}

impl Tag {
    /// The 24-bit wire id.
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Self::Firmware => 0x00DE43,
            Self::Version => 0x9FC7BC,
            Self::Board => 0xCA25C8,
            Self::BuildDate => 0x822F30,
            Self::DeviceId => 0xC8A729,
            Self::Device => 0x650D9D,
            Self::OtaVersion => 0x5D57D0,
            Self::Ota1Part => 0x805946,
            Self::Ota2Part => 0xA1E4D7,
            Self::HasOta1 => 0xBBD965,
            Self::HasOta2 => 0x92280E,
            Self::Binpatch => 0xB948DE,
            Self::CoreVersion => 0x59563D,
            Self::Sha2 => 0xB46DB0,
            Self::PageSize => 0x0BE9F7,
            Self::Unknown(id) => *id,
        }
    }

    /// Map a wire id back to a tag.
    #[must_use]
    pub fn from_id(id: u32) -> Self {
        match id {
            0x00DE43 => Self::Firmware,
            0x9FC7BC => Self::Version,
            0xCA25C8 => Self::Board,
            0x822F30 => Self::BuildDate,
            0xC8A729 => Self::DeviceId,
            0x650D9D => Self::Device,
            0x5D57D0 => Self::OtaVersion,
            0x805946 => Self::Ota1Part,
            0xA1E4D7 => Self::Ota2Part,
            0xBBD965 => Self::HasOta1,
            0x92280E => Self::HasOta2,
            0xB948DE => Self::Binpatch,
            0x59563D => Self::CoreVersion,
            0xB46DB0 => Self::Sha2,
            0x0BE9F7 => Self::PageSize,
            id => Self::Unknown(id),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(id) => write!(f, "Unknown(0x{id:06X})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Ordered tag map.
///
/// Preserves insertion order so containers round-trip byte-identically;
/// inserting an id that is already present replaces its value in place
/// (last write wins, matching decode semantics).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap {
    entries: Vec<(Tag, Vec<u8>)>,
}

impl TagMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tag value.
    pub fn insert(&mut self, tag: Tag, value: impl Into<Vec<u8>>) {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| *t == tag) {
            entry.1 = value;
        } else {
            self.entries.push((tag, value));
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, tag: Tag, value: impl Into<Vec<u8>>) -> Self {
        self.insert(tag, value);
        self
    }

    /// Look up a tag value.
    #[must_use]
    pub fn get(&self, tag: Tag) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    /// Tag value decoded as UTF-8 (lossy).
    #[must_use]
    pub fn get_str(&self, tag: Tag) -> Option<String> {
        self.get(tag)
            .map(|v| String::from_utf8_lossy(v).to_string())
    }

    /// Tag value decoded as a little-endian u32 (shorter values are
    /// zero-extended).
    #[must_use]
    pub fn get_u32(&self, tag: Tag) -> Option<u32> {
        self.get(tag).map(|v| {
            let mut word = [0u8; 4];
            let n = v.len().min(4);
            word[..n].copy_from_slice(&v[..n]);
            u32::from_le_bytes(word)
        })
    }

    /// Whether the map contains a tag.
    #[must_use]
    pub fn contains(&self, tag: Tag) -> bool {
        self.get(tag).is_some()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Tag, &[u8])> {
        self.entries.iter().map(|(t, v)| (*t, v.as_slice()))
    }

    /// Merge `other` into `self`, replacing duplicate ids.
    pub fn merge(&mut self, other: &TagMap) {
        for (tag, value) in other.iter() {
            self.insert(tag, value.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_round_trip() {
        for tag in [
            Tag::Firmware,
            Tag::Version,
            Tag::Board,
            Tag::BuildDate,
            Tag::Ota1Part,
            Tag::Ota2Part,
            Tag::HasOta1,
            Tag::HasOta2,
            Tag::Binpatch,
        ] {
            assert_eq!(Tag::from_id(tag.id()), tag);
        }
        assert_eq!(Tag::from_id(0x123456), Tag::Unknown(0x123456));
        assert_eq!(Tag::Unknown(0x123456).id(), 0x123456);
    }

    #[test]
    fn test_map_last_write_wins() {
        let mut map = TagMap::new();
        map.insert(Tag::Board, b"wb2l".to_vec());
        map.insert(Tag::Firmware, b"demo".to_vec());
        map.insert(Tag::Board, b"wb3s".to_vec());
        assert_eq!(map.len(), 2);
        assert_eq!(map.get_str(Tag::Board).as_deref(), Some("wb3s"));
        // insertion order of first writes is preserved
        let order: Vec<Tag> = map.iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec![Tag::Board, Tag::Firmware]);
    }

    #[test]
    fn test_get_u32_short_value() {
        let map = TagMap::new().with(Tag::HasOta1, vec![1u8]);
        assert_eq!(map.get_u32(Tag::HasOta1), Some(1));
    }
}
