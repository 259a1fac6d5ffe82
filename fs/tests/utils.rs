#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use sdfs::blockdevice::BlockDevice;
use sdfs::BLOCK_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamError {
    Transfer,
    Reinit,
}

#[derive(Default)]
struct Faults {
    fail_reads: u32,
    fail_writes: u32,
    fail_reinit: bool,
    read_attempts: u32,
    write_attempts: u32,
    reinit_count: u32,
}

/// An in-memory block device. Clones share the same storage, so a test
/// can keep a handle for inspection and fault injection while the cache
/// owns another.
#[derive(Clone)]
pub struct RamDevice {
    blocks: Arc<Mutex<Vec<[u8; BLOCK_LEN]>>>,
    faults: Arc<Mutex<Faults>>,
}

impl RamDevice {
    pub fn new(num_blocks: usize) -> Self {
        RamDevice {
            blocks: Arc::new(Mutex::new(vec![[0u8; BLOCK_LEN]; num_blocks])),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn from_blocks(blocks: Vec<[u8; BLOCK_LEN]>) -> Self {
        RamDevice {
            blocks: Arc::new(Mutex::new(blocks)),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// A copy of the medium as it currently stands.
    pub fn snapshot(&self) -> Vec<[u8; BLOCK_LEN]> {
        self.blocks.lock().unwrap().clone()
    }

    /// Overwrite one block behind the cache's back.
    pub fn poke(&self, index: usize, block: [u8; BLOCK_LEN]) {
        self.blocks.lock().unwrap()[index] = block;
    }

    /// Make the next `n` reads fail.
    pub fn fail_reads(&self, n: u32) {
        self.faults.lock().unwrap().fail_reads = n;
    }

    /// Make the next `n` writes fail.
    pub fn fail_writes(&self, n: u32) {
        self.faults.lock().unwrap().fail_writes = n;
    }

    pub fn read_attempts(&self) -> u32 {
        self.faults.lock().unwrap().read_attempts
    }

    pub fn reinit_count(&self) -> u32 {
        self.faults.lock().unwrap().reinit_count
    }
}

impl BlockDevice for RamDevice {
    type E = RamError;

    async fn read_block(
        &mut self,
        address: u32,
        block: &mut [u8; BLOCK_LEN],
    ) -> Result<(), RamError> {
        let mut faults = self.faults.lock().unwrap();
        faults.read_attempts += 1;
        if faults.fail_reads > 0 {
            faults.fail_reads -= 1;
            return Err(RamError::Transfer);
        }
        drop(faults);
        *block = self.blocks.lock().unwrap()[address as usize];
        Ok(())
    }

    async fn write_block(&mut self, address: u32, block: &[u8; BLOCK_LEN]) -> Result<(), RamError> {
        let mut faults = self.faults.lock().unwrap();
        faults.write_attempts += 1;
        if faults.fail_writes > 0 {
            faults.fail_writes -= 1;
            return Err(RamError::Transfer);
        }
        drop(faults);
        self.blocks.lock().unwrap()[address as usize] = *block;
        Ok(())
    }

    async fn reinit(&mut self) -> Result<(), RamError> {
        let mut faults = self.faults.lock().unwrap();
        faults.reinit_count += 1;
        if faults.fail_reinit {
            return Err(RamError::Reinit);
        }
        Ok(())
    }
}

const RESERVED_SECTORS: u16 = 4;
const NUM_FATS: u8 = 2;
const END_OF_CHAIN: u32 = 0x0FFF_FFF8;

/// Geometry of a formatted test image.
pub struct Image {
    pub sectors_per_cluster: u8,
    pub sectors_per_fat: u32,
    /// First sector of the first FAT copy.
    pub fat_start: u32,
    /// First sector of the root directory (cluster 2).
    pub data_start: u32,
}

impl Image {
    fn new(sectors_per_cluster: u8, sectors_per_fat: u32) -> Self {
        let fat_start = u32::from(RESERVED_SECTORS);
        Image {
            sectors_per_cluster,
            sectors_per_fat,
            fat_start,
            data_start: fat_start + sectors_per_fat * u32::from(NUM_FATS),
        }
    }

    fn total_sectors(&self) -> u32 {
        let clusters = self.sectors_per_fat * 128 - 2;
        self.data_start + clusters * u32::from(self.sectors_per_cluster)
    }
}

fn put_u32(block: &mut [u8; BLOCK_LEN], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn boot_sector(image: &Image) -> [u8; BLOCK_LEN] {
    let mut block = [0u8; BLOCK_LEN];
    block[0x0D] = image.sectors_per_cluster;
    block[0x0E..0x10].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
    block[0x10] = NUM_FATS;
    put_u32(&mut block, 0x20, image.total_sectors());
    put_u32(&mut block, 0x24, image.sectors_per_fat);
    put_u32(&mut block, 0x2C, 2); // root cluster
    block[0x52..0x5A].copy_from_slice(b"FAT32   ");
    block[0x1FE] = 0x55;
    block[0x1FF] = 0xAA;
    block
}

fn fat_sector_zero() -> [u8; BLOCK_LEN] {
    let mut block = [0u8; BLOCK_LEN];
    put_u32(&mut block, 0, 0x0FFF_FFF8); // media descriptor entry
    put_u32(&mut block, 4, 0xFFFF_FFFF);
    put_u32(&mut block, 8, END_OF_CHAIN); // root directory, one cluster
    block
}

/// Build a freshly formatted FAT32 image and a device holding it.
pub fn format(sectors_per_cluster: u8, sectors_per_fat: u32) -> (RamDevice, Image) {
    let image = Image::new(sectors_per_cluster, sectors_per_fat);
    let mut blocks = vec![[0u8; BLOCK_LEN]; image.total_sectors() as usize];
    blocks[0] = boot_sector(&image);
    blocks[image.fat_start as usize] = fat_sector_zero();
    (RamDevice::from_blocks(blocks), image)
}

/// Like [`format`], but with a volume label entry in the root directory.
pub fn format_with_label(
    sectors_per_cluster: u8,
    sectors_per_fat: u32,
    label: &[u8; 11],
) -> (RamDevice, Image) {
    let (device, image) = format(sectors_per_cluster, sectors_per_fat);
    let mut root = [0u8; BLOCK_LEN];
    root[..11].copy_from_slice(label);
    root[11] = 0x08;
    device.poke(image.data_start as usize, root);
    (device, image)
}

/// Build an image whose boot sector sits behind a master boot record, the
/// way SD cards usually ship.
pub fn format_with_mbr(
    sectors_per_cluster: u8,
    sectors_per_fat: u32,
    lba: u32,
) -> (RamDevice, Image) {
    let mut image = Image::new(sectors_per_cluster, sectors_per_fat);
    image.fat_start += lba;
    image.data_start += lba;

    let total = lba
        + u32::from(RESERVED_SECTORS)
        + sectors_per_fat * u32::from(NUM_FATS)
        + (sectors_per_fat * 128 - 2) * u32::from(sectors_per_cluster);
    let mut blocks = vec![[0u8; BLOCK_LEN]; total as usize];

    let mut mbr = [0u8; BLOCK_LEN];
    mbr[0x1C2] = 0x0C; // FAT32 LBA
    put_u32(&mut mbr, 0x1C6, lba);
    mbr[0x1FE] = 0x55;
    mbr[0x1FF] = 0xAA;
    blocks[0] = mbr;

    let inner = Image::new(sectors_per_cluster, sectors_per_fat);
    let mut boot = boot_sector(&inner);
    // footer already present; the version tag is what mount keys on
    boot[0x1FE] = 0x55;
    boot[0x1FF] = 0xAA;
    blocks[lba as usize] = boot;
    blocks[image.fat_start as usize] = fat_sector_zero();

    (RamDevice::from_blocks(blocks), image)
}

/// A deterministic byte pattern for payload checks.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
