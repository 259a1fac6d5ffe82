//! 32-byte FAT directory entries.

use byteorder::{ByteOrder, LittleEndian};

use crate::filesystem::attributes::Attributes;
use crate::filesystem::filename::ShortFileName;
use crate::filesystem::timestamp::Timestamp;

/// Bytes per directory entry.
pub const DIR_ENTRY_LEN: usize = 32;

/// One directory entry, decoded.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: ShortFileName,
    pub attributes: Attributes,
    pub ctime: Timestamp,
    pub start_cluster: u32,
    pub size: u32,
}

impl DirEntry {
    /// Decode an entry from its 32 on-disk bytes.
    pub fn parse(raw: &[u8; DIR_ENTRY_LEN]) -> Self {
        let mut name = [0u8; 8];
        name.copy_from_slice(&raw[0..8]);
        let mut ext = [0u8; 3];
        ext.copy_from_slice(&raw[8..11]);
        let mut time = [0u8; 5];
        time.copy_from_slice(&raw[13..18]);
        let start_cluster = (u32::from(LittleEndian::read_u16(&raw[20..22])) << 16)
            | u32::from(LittleEndian::read_u16(&raw[26..28]));
        DirEntry {
            name: ShortFileName::from_bytes(name, ext),
            attributes: Attributes(raw[11]),
            ctime: Timestamp::unpack(&time),
            start_cluster,
            size: LittleEndian::read_u32(&raw[28..32]),
        }
    }

    /// Encode the entry into its 32 on-disk bytes. The creation time is
    /// also written into the last-modified slot.
    pub fn serialize(&self) -> [u8; DIR_ENTRY_LEN] {
        let mut raw = [0u8; DIR_ENTRY_LEN];
        raw[0..8].copy_from_slice(self.name.base());
        raw[8..11].copy_from_slice(self.name.extension());
        raw[11] = self.attributes.0;
        let time = self.ctime.pack();
        raw[13] = time[0];
        raw[14..18].copy_from_slice(&time[1..5]);
        LittleEndian::write_u16(&mut raw[20..22], (self.start_cluster >> 16) as u16);
        raw[22..26].copy_from_slice(&self.ctime.serialize_time_date());
        LittleEndian::write_u16(&mut raw[26..28], self.start_cluster as u16);
        LittleEndian::write_u32(&mut raw[28..32], self.size);
        raw
    }

    /// True for the entry that terminates a directory scan.
    pub fn is_end_of_directory(&self) -> bool {
        self.name.base()[0] == 0x00
    }

    /// True for a slot whose file was deleted.
    pub fn is_deleted(&self) -> bool {
        self.name.base()[0] == 0xE5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // LOG.TXT, archive, 2021-05-17 12:34:56, cluster 0x0001_0005, 600 bytes
    const FIXTURE: [u8; DIR_ENTRY_LEN] = hex!(
        "4C 4F 47 20 20 20 20 20 54 58 54 20 00 00 5C 64"
        "B1 52 00 00 01 00 5C 64 B1 52 05 00 58 02 00 00"
    );

    fn fixture_entry() -> DirEntry {
        DirEntry {
            name: ShortFileName::new("LOG.TXT"),
            attributes: Attributes::ARCHIVE,
            ctime: Timestamp {
                ms: 0,
                seconds: 56,
                minutes: 34,
                hour: 12,
                day: 17,
                month: 5,
                year: 41,
            },
            start_cluster: 0x0001_0005,
            size: 600,
        }
    }

    #[test]
    fn parses_the_fixture() {
        let entry = DirEntry::parse(&FIXTURE);
        assert_eq!(entry, fixture_entry());
    }

    #[test]
    fn serializes_back_to_the_fixture() {
        assert_eq!(fixture_entry().serialize(), FIXTURE);
    }

    #[test]
    fn recognizes_terminator_and_deleted_slots() {
        let mut raw = [0u8; DIR_ENTRY_LEN];
        assert!(DirEntry::parse(&raw).is_end_of_directory());
        raw[0] = 0xE5;
        assert!(DirEntry::parse(&raw).is_deleted());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
