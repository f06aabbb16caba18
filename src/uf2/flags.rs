//! Block flag word.

/// Decoded flags word of a container block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags {
    /// Block data is not meant for main flash.
    pub not_main_flash: bool,
    /// Block carries a file container payload.
    pub file_container: bool,
    /// The `family_or_size` word holds a family id.
    pub has_family_id: bool,
    /// The last 24 bytes of the data region hold an MD5 trailer.
    pub has_md5: bool,
    /// Tags follow the payload in the data region.
    pub has_tags: bool,
}

const NOT_MAIN_FLASH: u32 = 0x0000_0001;
const FILE_CONTAINER: u32 = 0x0000_1000;
const HAS_FAMILY_ID: u32 = 0x0000_2000;
const HAS_MD5: u32 = 0x0000_4000;
const HAS_TAGS: u32 = 0x0000_8000;

impl BlockFlags {
    /// Encode into the on-disk flags word.
    #[must_use]
    pub fn encode(&self) -> u32 {
        let mut val = 0;
        if self.not_main_flash {
            val |= NOT_MAIN_FLASH;
        }
        if self.file_container {
            val |= FILE_CONTAINER;
        }
        if self.has_family_id {
            val |= HAS_FAMILY_ID;
        }
        if self.has_md5 {
            val |= HAS_MD5;
        }
        if self.has_tags {
            val |= HAS_TAGS;
        }
        val
    }

    /// Decode from the on-disk flags word. Unknown bits are ignored.
    #[must_use]
    pub fn decode(word: u32) -> Self {
        Self {
            not_main_flash: word & NOT_MAIN_FLASH != 0,
            file_container: word & FILE_CONTAINER != 0,
            has_family_id: word & HAS_FAMILY_ID != 0,
            has_md5: word & HAS_MD5 != 0,
            has_tags: word & HAS_TAGS != 0,
        }
    }
}

impl std::fmt::Display for BlockFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.not_main_flash {
            names.push("NMF");
        }
        if self.file_container {
            names.push("FC");
        }
        if self.has_family_id {
            names.push("FID");
        }
        if self.has_md5 {
            names.push("MD5");
        }
        if self.has_tags {
            names.push("TAG");
        }
        write!(f, "{}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_round_trip() {
        let flags = BlockFlags {
            has_family_id: true,
            has_tags: true,
            ..BlockFlags::default()
        };
        let word = flags.encode();
        assert_eq!(word, 0xA000);
        assert_eq!(BlockFlags::decode(word), flags);
    }

    #[test]
    fn test_unknown_bits_ignored() {
        let flags = BlockFlags::decode(0xFFFF_FFFF);
        assert!(flags.not_main_flash && flags.has_tags && flags.has_md5);
        assert_eq!(flags.encode(), 0xF001);
    }

    #[test]
    fn test_display() {
        let flags = BlockFlags::decode(0xA000);
        assert_eq!(flags.to_string(), "FID,TAG");
    }
}
