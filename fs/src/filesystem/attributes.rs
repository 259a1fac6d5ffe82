//! Directory entry attribute byte.

/// The attribute byte at offset 11 of a directory entry.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Attributes(pub u8);

impl Attributes {
    const LFN: u8 = 0x0F;
    const VOLUME: u8 = 0x08;

    /// A regular file, as this crate creates them.
    pub const ARCHIVE: Attributes = Attributes(0x20);

    /// Part of a long-file-name sequence (all four low bits set).
    pub fn is_lfn(self) -> bool {
        self.0 & Self::LFN == Self::LFN
    }

    /// The volume label pseudo-entry.
    pub fn is_volume_label(self) -> bool {
        !self.is_lfn() && self.0 & Self::VOLUME != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lfn_entries_are_not_labels() {
        assert!(Attributes(0x0F).is_lfn());
        assert!(!Attributes(0x0F).is_volume_label());
    }

    #[test]
    fn label_bit_alone_is_a_label() {
        assert!(Attributes(0x08).is_volume_label());
        assert!(!Attributes(0x08).is_lfn());
    }

    #[test]
    fn archive_is_neither() {
        assert!(!Attributes::ARCHIVE.is_lfn());
        assert!(!Attributes::ARCHIVE.is_volume_label());
    }
}
