//! Persistent storage layer for an SD-card backed sensor node.
//!
//! Three layers, bottom up:
//!
//! - [`cache::BlockCache`] — a fixed pool of 512-byte write-back buffers
//!   over a raw [`blockdevice::BlockDevice`], drained by a background task;
//! - [`fat::FatVolume`] — a FAT32 subset (8.3 names, root directory only)
//!   whose every sector access goes through the cache;
//! - [`filesystem::files::File`] — a sequential cursor over one directory
//!   entry.
//!
//! The crate is executor-agnostic: the write-back task is a plain future
//! ([`cache::BlockCache::run`]) that the platform spawns. On the target it
//! runs under the embassy executor; the test suite drives it with tokio and
//! the `critical-section/std` implementation.

#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod blockdevice;
pub mod cache;
pub mod fat;
pub mod filesystem;

pub use blockdevice::{AddressMode, BlockDevice, BlockIdx};
pub use cache::BlockCache;
pub use fat::FatVolume;
pub use filesystem::files::File;

/// Number of bytes in one page/block/sector of the medium.
pub const BLOCK_LEN: usize = 512;

pub(crate) type RawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

/// Everything that can go wrong in this crate, from the medium up.
///
/// `E` is the device driver's own error type; it only ever appears inside
/// [`Error::Device`], after the cache has exhausted its retries.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<E> {
    /// The block transfer failed and retrying did not help.
    Device(E),
    /// Sector 0 (or the redirected partition start) has no boot signature.
    NotBootRecord,
    /// There is a boot record, but it is not a FAT32 one.
    NotFat32,
    /// A cluster index outside `2..=max_cluster` was used.
    BadCluster,
    /// The File Allocation Table has no free entry left.
    NoFreeCluster,
    /// The root directory has no free 32-byte slot left.
    DirectoryFull,
    /// A file with that name already exists (or the name space is spent).
    FileExists,
    /// No directory entry matches that name.
    FileNotFound,
}
