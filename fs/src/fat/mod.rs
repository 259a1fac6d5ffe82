//! FAT32 subset: one volume, one (root) directory, 8.3 names.
//!
//! Every sector touched here goes through the [`BlockCache`]; nothing in
//! this module talks to the device directly. Cluster chains, directory
//! slots and the boot sector are all read and written in place through
//! partial-page cache operations.

use byteorder::{ByteOrder, LittleEndian};
use embassy_sync::mutex::Mutex;

use crate::blockdevice::{BlockDevice, BlockIdx};
use crate::cache::{BlockCache, POOL_SIZE};
use crate::filesystem::attributes::Attributes;
use crate::filesystem::directory::{DirEntry, DIR_ENTRY_LEN};
use crate::filesystem::filename::ShortFileName;
use crate::filesystem::timestamp::Timestamp;
use crate::{Error, RawMutex, BLOCK_LEN};

/// Marker for the last cluster of a chain.
pub const END_OF_CHAIN: u32 = 0x0FFF_FFF8;

/// First usable data cluster number.
const FIRST_CLUSTER: u32 = 2;

/// FAT entries per 512-byte sector (4 bytes each).
const ENTRIES_PER_SECTOR: u32 = 128;

const FOOTER_VALUE: u16 = 0xAA55;
const FOOTER_OFFSET: usize = 0x1FE;
const VERSION_OFFSET: usize = 0x52;
const VERSION_TAG: &[u8; 8] = b"FAT32   ";
const SECTORS_PER_CLUSTER_OFFSET: usize = 0x0D;
const RESERVED_SECTORS_OFFSET: usize = 0x0E;
const NUM_FATS_OFFSET: usize = 0x10;
const TOTAL_SECTORS_OFFSET: usize = 0x20;
const SECTORS_PER_FAT_OFFSET: usize = 0x24;
const ROOT_CLUSTER_OFFSET: usize = 0x2C;

const PARTITION_TYPE_OFFSET: usize = 0x1C2;
const PARTITION_LBA_OFFSET: usize = 0x1C6;
const PARTITION_ID_FAT32_CHS_LBA: u8 = 0x0B;
const PARTITION_ID_FAT32_LBA: u8 = 0x0C;

/// True if `cluster` is an end-of-chain marker rather than a successor.
pub fn is_end_of_chain(cluster: u32) -> bool {
    cluster & END_OF_CHAIN == END_OF_CHAIN
}

struct AllocatorState {
    /// Cluster just past the last allocation, where the next free-entry
    /// scan starts. 0 means scan from the beginning.
    last_free_cluster: u32,
}

/// A mounted FAT32 volume, borrowing the cache it reads through.
pub struct FatVolume<'d, D: BlockDevice, const N: usize = POOL_SIZE> {
    cache: &'d BlockCache<D, N>,
    sectors_per_cluster: u8,
    sectors_per_fat: u32,
    /// First sector of the first FAT copy.
    fat_start: u32,
    /// First sector of the data region (cluster 2).
    data_start: u32,
    root_cluster: u32,
    /// Highest valid data cluster number.
    max_cluster: u32,
    allocator: Mutex<RawMutex, AllocatorState>,
}

/// Read `buf.len()` bytes at `offset` within `page`, failing on a short
/// copy. The cache clamps at the page end, so a short result means the
/// caller's offset arithmetic is off.
async fn read_bytes<D: BlockDevice, const N: usize>(
    cache: &BlockCache<D, N>,
    page: BlockIdx,
    offset: usize,
    buf: &mut [u8],
) -> Result<(), Error<D::E>> {
    let n = cache.read(page, offset, buf).await?;
    debug_assert_eq!(n, buf.len());
    Ok(())
}

async fn write_bytes<D: BlockDevice, const N: usize>(
    cache: &BlockCache<D, N>,
    page: BlockIdx,
    offset: usize,
    buf: &[u8],
) -> Result<(), Error<D::E>> {
    let n = cache.write(page, offset, buf).await?;
    debug_assert_eq!(n, buf.len());
    Ok(())
}

/// Check that `sector` holds a FAT32 boot record; returns the sector
/// number back on success.
async fn check_fs<D: BlockDevice, const N: usize>(
    cache: &BlockCache<D, N>,
    sector: u32,
) -> Result<u32, Error<D::E>> {
    let mut footer = [0u8; 2];
    read_bytes(cache, BlockIdx(sector), FOOTER_OFFSET, &mut footer).await?;
    if LittleEndian::read_u16(&footer) != FOOTER_VALUE {
        return Err(Error::NotBootRecord);
    }
    let mut version = [0u8; 8];
    read_bytes(cache, BlockIdx(sector), VERSION_OFFSET, &mut version).await?;
    if &version != VERSION_TAG {
        return Err(Error::NotFat32);
    }
    Ok(sector)
}

impl<'d, D: BlockDevice, const N: usize> FatVolume<'d, D, N> {
    /// Mount the volume found on the cache's medium.
    ///
    /// Sector 0 is tried first as a boot record. If it carries a boot
    /// signature but is not FAT32, it is re-read as a master boot record
    /// and the first partition is followed, provided its type byte says
    /// FAT32.
    pub async fn mount(cache: &'d BlockCache<D, N>) -> Result<FatVolume<'d, D, N>, Error<D::E>> {
        let boot_sector = match check_fs(cache, 0).await {
            Ok(sector) => sector,
            Err(Error::NotFat32) => {
                let mut partition_type = [0u8; 1];
                read_bytes(cache, BlockIdx(0), PARTITION_TYPE_OFFSET, &mut partition_type).await?;
                if partition_type[0] != PARTITION_ID_FAT32_CHS_LBA
                    && partition_type[0] != PARTITION_ID_FAT32_LBA
                {
                    return Err(Error::NotFat32);
                }
                let mut lba = [0u8; 4];
                read_bytes(cache, BlockIdx(0), PARTITION_LBA_OFFSET, &mut lba).await?;
                check_fs(cache, LittleEndian::read_u32(&lba)).await?
            }
            Err(e) => return Err(e),
        };

        let page = BlockIdx(boot_sector);
        let mut byte = [0u8; 1];
        read_bytes(cache, page, SECTORS_PER_CLUSTER_OFFSET, &mut byte).await?;
        let sectors_per_cluster = byte[0];
        read_bytes(cache, page, NUM_FATS_OFFSET, &mut byte).await?;
        let num_fats = byte[0];

        let mut half = [0u8; 2];
        read_bytes(cache, page, RESERVED_SECTORS_OFFSET, &mut half).await?;
        let reserved_sectors = LittleEndian::read_u16(&half);

        let mut word = [0u8; 4];
        read_bytes(cache, page, TOTAL_SECTORS_OFFSET, &mut word).await?;
        let total_sectors = LittleEndian::read_u32(&word);
        read_bytes(cache, page, SECTORS_PER_FAT_OFFSET, &mut word).await?;
        let sectors_per_fat = LittleEndian::read_u32(&word);
        read_bytes(cache, page, ROOT_CLUSTER_OFFSET, &mut word).await?;
        let root_cluster = LittleEndian::read_u32(&word);

        let fat_start = boot_sector + u32::from(reserved_sectors);
        let data_start = fat_start + sectors_per_fat * u32::from(num_fats);
        let data_sectors = total_sectors - (data_start - boot_sector);
        let max_cluster = data_sectors / u32::from(sectors_per_cluster) + FIRST_CLUSTER - 1;

        debug!(
            "mounted FAT32 volume: boot sector {}, {} sectors, {} per cluster, root cluster {}",
            boot_sector, total_sectors, sectors_per_cluster, root_cluster
        );

        Ok(FatVolume {
            cache,
            sectors_per_cluster,
            sectors_per_fat,
            fat_start,
            data_start,
            root_cluster,
            max_cluster,
            allocator: Mutex::new(AllocatorState {
                last_free_cluster: 0,
            }),
        })
    }

    pub(crate) async fn read(
        &self,
        page: BlockIdx,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), Error<D::E>> {
        read_bytes(self.cache, page, offset, buf).await
    }

    pub(crate) async fn write(
        &self,
        page: BlockIdx,
        offset: usize,
        buf: &[u8],
    ) -> Result<(), Error<D::E>> {
        write_bytes(self.cache, page, offset, buf).await
    }

    /// Read one whole sector.
    pub(crate) async fn read_sector(
        &self,
        page: BlockIdx,
        buf: &mut [u8; BLOCK_LEN],
    ) -> Result<(), Error<D::E>> {
        self.read(page, 0, buf).await
    }

    /// Write one whole sector.
    pub(crate) async fn write_sector(
        &self,
        page: BlockIdx,
        buf: &[u8; BLOCK_LEN],
    ) -> Result<(), Error<D::E>> {
        self.write(page, 0, buf).await
    }

    pub(crate) fn sectors_per_cluster(&self) -> u8 {
        self.sectors_per_cluster
    }

    /// Sector and in-sector byte offset of the FAT entry for `cluster`.
    fn fat_location(&self, cluster: u32) -> (BlockIdx, usize) {
        let sector = self.fat_start + cluster / ENTRIES_PER_SECTOR;
        let offset = ((cluster % ENTRIES_PER_SECTOR) * 4) as usize;
        (BlockIdx(sector), offset)
    }

    fn check_cluster(&self, cluster: u32) -> Result<(), Error<D::E>> {
        if cluster < FIRST_CLUSTER || cluster > self.max_cluster {
            return Err(Error::BadCluster);
        }
        Ok(())
    }

    /// First data sector of `cluster`.
    pub(crate) fn first_sector(&self, cluster: u32) -> BlockIdx {
        BlockIdx(self.data_start + (cluster - FIRST_CLUSTER) * u32::from(self.sectors_per_cluster))
    }

    /// The FAT entry for `cluster`: either the next cluster of the chain
    /// or an [`END_OF_CHAIN`] marker.
    pub async fn get_next_cluster(&self, cluster: u32) -> Result<u32, Error<D::E>> {
        self.check_cluster(cluster)?;
        let (page, offset) = self.fat_location(cluster);
        let mut entry = [0u8; 4];
        self.read(page, offset, &mut entry).await?;
        Ok(LittleEndian::read_u32(&entry))
    }

    /// Point `cluster`'s FAT entry at `next`. `next` may be a valid
    /// cluster, an end-of-chain marker, or 0 (free).
    pub async fn set_next_cluster(&self, cluster: u32, next: u32) -> Result<(), Error<D::E>> {
        self.check_cluster(cluster)?;
        if next != 0 && !is_end_of_chain(next) {
            self.check_cluster(next)?;
        }
        let (page, offset) = self.fat_location(cluster);
        let mut entry = [0u8; 4];
        LittleEndian::write_u32(&mut entry, next);
        self.write(page, offset, &entry).await
    }

    /// Mark `cluster` free.
    pub async fn free_cluster(&self, cluster: u32) -> Result<(), Error<D::E>> {
        self.set_next_cluster(cluster, 0).await
    }

    /// Claim a free cluster, mark it end-of-chain and return it.
    ///
    /// The scan starts just past the previous allocation and runs to the
    /// end of the FAT. Failure resets the hint, so the next call starts
    /// over from the front and picks up entries freed below the hint.
    pub async fn find_empty_cluster(&self) -> Result<u32, Error<D::E>> {
        let mut allocator = self.allocator.lock().await;
        let total_entries = self.sectors_per_fat * ENTRIES_PER_SECTOR;
        let start = allocator.last_free_cluster.max(FIRST_CLUSTER);
        for cluster in start..total_entries {
            if cluster > self.max_cluster {
                break;
            }
            let (page, offset) = self.fat_location(cluster);
            let mut entry = [0u8; 4];
            if let Err(e) = self.read(page, offset, &mut entry).await {
                allocator.last_free_cluster = 0;
                return Err(e);
            }
            if LittleEndian::read_u32(&entry) != 0 {
                continue;
            }
            LittleEndian::write_u32(&mut entry, END_OF_CHAIN);
            if let Err(e) = self.write(page, offset, &entry).await {
                allocator.last_free_cluster = 0;
                return Err(e);
            }
            allocator.last_free_cluster = cluster + 1;
            return Ok(cluster);
        }
        allocator.last_free_cluster = 0;
        Err(Error::NoFreeCluster)
    }

    /// Walk the root directory looking for `name`.
    ///
    /// On a match returns the sector holding the 32-byte entry, the byte
    /// offset of the entry within that sector, and the parsed entry.
    pub async fn find(
        &self,
        name: &ShortFileName,
    ) -> Result<(BlockIdx, usize, DirEntry), Error<D::E>> {
        let mut cluster = self.root_cluster;
        while !is_end_of_chain(cluster) {
            let first = self.first_sector(cluster);
            for sector in 0..u32::from(self.sectors_per_cluster) {
                let page = BlockIdx(first.0 + sector);
                for index in (0..BLOCK_LEN).step_by(DIR_ENTRY_LEN) {
                    let mut raw = [0u8; DIR_ENTRY_LEN];
                    self.read(page, index, &mut raw).await?;
                    let entry = DirEntry::parse(&raw);
                    if entry.is_end_of_directory() {
                        return Err(Error::FileNotFound);
                    }
                    if entry.is_deleted()
                        || entry.attributes.is_lfn()
                        || entry.attributes.is_volume_label()
                    {
                        continue;
                    }
                    if entry.name == *name {
                        return Ok((page, index, entry));
                    }
                }
            }
            cluster = self.get_next_cluster(cluster).await?;
        }
        Err(Error::FileNotFound)
    }

    /// First reusable 32-byte slot in the root directory.
    async fn find_free_slot(&self) -> Result<(BlockIdx, usize), Error<D::E>> {
        let mut cluster = self.root_cluster;
        while !is_end_of_chain(cluster) {
            let first = self.first_sector(cluster);
            for sector in 0..u32::from(self.sectors_per_cluster) {
                let page = BlockIdx(first.0 + sector);
                for index in (0..BLOCK_LEN).step_by(DIR_ENTRY_LEN) {
                    let mut first_byte = [0u8; 1];
                    self.read(page, index, &mut first_byte).await?;
                    if first_byte[0] == 0x00 || first_byte[0] == 0xE5 {
                        return Ok((page, index));
                    }
                }
            }
            cluster = self.get_next_cluster(cluster).await?;
        }
        Err(Error::DirectoryFull)
    }

    /// Create an empty file named `name` with one freshly allocated
    /// cluster, and return its directory slot and entry.
    pub async fn create(
        &self,
        name: &ShortFileName,
    ) -> Result<(BlockIdx, usize, DirEntry), Error<D::E>> {
        match self.find(name).await {
            Ok(_) => return Err(Error::FileExists),
            Err(Error::FileNotFound) => {}
            Err(e) => return Err(e),
        }
        let (page, index) = self.find_free_slot().await?;
        let start_cluster = self.find_empty_cluster().await?;
        let entry = DirEntry {
            name: *name,
            attributes: Attributes::ARCHIVE,
            ctime: Timestamp::default(),
            start_cluster,
            size: 0,
        };
        self.write(page, index, &entry.serialize()).await?;
        debug!("created file at sector {}, slot {}", page.0, index / DIR_ENTRY_LEN);
        Ok((page, index, entry))
    }

    /// Remove `name`: mark its directory entry deleted and free its whole
    /// cluster chain.
    pub async fn delete(&self, name: &str) -> Result<(), Error<D::E>> {
        let short = ShortFileName::new(name);
        let (page, index, entry) = self.find(&short).await?;
        self.write(page, index, &[0xE5]).await?;
        let mut cluster = entry.start_cluster;
        while !is_end_of_chain(cluster) {
            let next = self.get_next_cluster(cluster).await?;
            self.free_cluster(cluster).await?;
            cluster = next;
        }
        Ok(())
    }

    /// Whether a file named `name` exists in the root directory.
    pub async fn file_exists(&self, name: &str) -> Result<bool, Error<D::E>> {
        let short = ShortFileName::new(name);
        match self.find(&short).await {
            Ok(_) => Ok(true),
            Err(Error::FileNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// On-disk size in bytes of the file named `name`.
    pub async fn get_file_size(&self, name: &str) -> Result<u32, Error<D::E>> {
        let short = ShortFileName::new(name);
        let (_, _, entry) = self.find(&short).await?;
        Ok(entry.size)
    }

    /// Overwrite the recorded size of the file named `name`.
    pub async fn set_file_size(&self, name: &str, size: u32) -> Result<(), Error<D::E>> {
        let short = ShortFileName::new(name);
        let (page, index, _) = self.find(&short).await?;
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, size);
        self.write(page, index + 28, &raw).await
    }

    /// The 11-byte volume label stored in the root directory, if any.
    pub async fn volume_label(&self) -> Result<[u8; 11], Error<D::E>> {
        let mut cluster = self.root_cluster;
        while !is_end_of_chain(cluster) {
            let first = self.first_sector(cluster);
            for sector in 0..u32::from(self.sectors_per_cluster) {
                let page = BlockIdx(first.0 + sector);
                for index in (0..BLOCK_LEN).step_by(DIR_ENTRY_LEN) {
                    let mut raw = [0u8; DIR_ENTRY_LEN];
                    self.read(page, index, &mut raw).await?;
                    let entry = DirEntry::parse(&raw);
                    if entry.is_end_of_directory() {
                        return Err(Error::FileNotFound);
                    }
                    if entry.is_deleted() || entry.attributes.is_lfn() {
                        continue;
                    }
                    if entry.attributes.is_volume_label() {
                        let mut label = [0u8; 11];
                        label[..8].copy_from_slice(entry.name.base());
                        label[8..].copy_from_slice(entry.name.extension());
                        return Ok(label);
                    }
                }
            }
            cluster = self.get_next_cluster(cluster).await?;
        }
        Err(Error::FileNotFound)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
