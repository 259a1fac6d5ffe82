//! Sequential file access.
//!
//! A [`File`] is a cursor over one directory entry: one cluster chain,
//! walked front to back through a caller-supplied page buffer. There is
//! no seeking. A file is either being appended to (after [`File::create`]
//! or [`File::create_next`]) or read from the start (after
//! [`File::open`]); mixing the two on one cursor corrupts the recorded
//! size, since every written byte is counted as growth.

use byteorder::{ByteOrder, LittleEndian};
use core::fmt::Write as _;

use crate::blockdevice::{BlockDevice, BlockIdx};
use crate::cache::POOL_SIZE;
use crate::fat::{is_end_of_chain, FatVolume};
use crate::filesystem::directory::DirEntry;
use crate::filesystem::filename::ShortFileName;
use crate::filesystem::timestamp::Timestamp;
use crate::{Error, BLOCK_LEN};

/// At most `max` leading bytes of `s`, backing off to a character
/// boundary so non-ASCII input truncates instead of panicking.
fn prefix(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Byte offset of the last-modified time within a directory entry.
const MTIME_OFFSET: usize = 22;
/// Byte offset of the file size within a directory entry.
const SIZE_OFFSET: usize = 28;

/// An open file on a [`FatVolume`].
///
/// The page buffer is borrowed rather than owned so the caller decides
/// where the 512 bytes live (a `static`, a stack frame, a pool slot).
pub struct File<'d, D: BlockDevice, const N: usize = POOL_SIZE> {
    volume: &'d FatVolume<'d, D, N>,
    pbuf: &'d mut [u8; BLOCK_LEN],
    current_cluster: u32,
    current_sector: BlockIdx,
    /// Sector within the current cluster.
    sector_index: u8,
    /// Next byte to use within `pbuf`.
    buffer_index: usize,
    /// Bytes consumed or produced since the start of the file.
    position: u32,
    /// Where the 32-byte directory entry lives, for size and time updates.
    descriptor_sector: BlockIdx,
    descriptor_index: usize,
    entry: DirEntry,
}

impl<'d, D: BlockDevice, const N: usize> File<'d, D, N> {
    fn from_entry(
        volume: &'d FatVolume<'d, D, N>,
        pbuf: &'d mut [u8; BLOCK_LEN],
        descriptor_sector: BlockIdx,
        descriptor_index: usize,
        entry: DirEntry,
    ) -> Self {
        File {
            current_cluster: entry.start_cluster,
            current_sector: volume.first_sector(entry.start_cluster),
            sector_index: 0,
            buffer_index: 0,
            position: 0,
            volume,
            pbuf,
            descriptor_sector,
            descriptor_index,
            entry,
        }
    }

    /// Create `name` in the root directory and return a cursor positioned
    /// for appending. Fails with [`Error::FileExists`] if the name is
    /// taken.
    pub async fn create(
        volume: &'d FatVolume<'d, D, N>,
        name: &str,
        pbuf: &'d mut [u8; BLOCK_LEN],
    ) -> Result<File<'d, D, N>, Error<D::E>> {
        let short = ShortFileName::new(name);
        let (sector, index, entry) = volume.create(&short).await?;
        Ok(Self::from_entry(volume, pbuf, sector, index, entry))
    }

    /// Open an existing file, positioned at its first byte.
    pub async fn open(
        volume: &'d FatVolume<'d, D, N>,
        name: &str,
        pbuf: &'d mut [u8; BLOCK_LEN],
    ) -> Result<File<'d, D, N>, Error<D::E>> {
        let short = ShortFileName::new(name);
        let (sector, index, entry) = volume.find(&short).await?;
        Ok(Self::from_entry(volume, pbuf, sector, index, entry))
    }

    /// Create the first unused file of the series `BASExx.EXT`, where
    /// `xx` counts up in hex from 00.
    ///
    /// `base` is truncated to 6 bytes and `ext` to 3 so the counter always
    /// fits. Fails with [`Error::FileExists`] once all 256 names of the
    /// series exist.
    pub async fn create_next(
        volume: &'d FatVolume<'d, D, N>,
        base: &str,
        ext: &str,
        pbuf: &'d mut [u8; BLOCK_LEN],
    ) -> Result<File<'d, D, N>, Error<D::E>> {
        let base = prefix(base, 6);
        let ext = prefix(ext, 3);
        for counter in 0u16..=255 {
            let mut candidate: heapless::String<12> = heapless::String::new();
            // 6 + 2 + 1 + 3 bytes, cannot overflow the capacity
            let _ = write!(candidate, "{}{:02X}.{}", base, counter, ext);
            let short = ShortFileName::new(&candidate);
            match volume.find(&short).await {
                Ok(_) => continue,
                Err(Error::FileNotFound) => {
                    let (sector, index, entry) = volume.create(&short).await?;
                    return Ok(Self::from_entry(volume, pbuf, sector, index, entry));
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::FileExists)
    }

    /// Bytes the directory entry currently records for this file. Bytes
    /// still sitting in the page buffer are included; they reach the disk
    /// at the next page boundary or on [`Self::close`].
    pub fn size(&self) -> u32 {
        self.entry.size
    }

    /// Append `buf`.
    ///
    /// Full pages are written out as they fill, growing the cluster chain
    /// as needed; the recorded size then covers everything written so
    /// far. The trailing partial page stays in the buffer until the next
    /// boundary or [`Self::close`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), Error<D::E>> {
        let mut written = 0;
        while written < buf.len() {
            if self.buffer_index == BLOCK_LEN {
                self.volume
                    .write_sector(self.current_sector, self.pbuf)
                    .await?;
                self.write_size().await?;
                self.advance_sector(true).await?;
                self.buffer_index = 0;
            }
            let chunk = (buf.len() - written).min(BLOCK_LEN - self.buffer_index);
            self.pbuf[self.buffer_index..self.buffer_index + chunk]
                .copy_from_slice(&buf[written..written + chunk]);
            self.buffer_index += chunk;
            self.position += chunk as u32;
            self.entry.size += chunk as u32;
            written += chunk;
        }
        Ok(())
    }

    /// Read the next bytes of the file into `buf`.
    ///
    /// Returns how many bytes were produced, which is `buf.len()` clamped
    /// to what is left before end of file. 0 means end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error<D::E>> {
        let remaining = self.entry.size.saturating_sub(self.position) as usize;
        let mut to_read = buf.len().min(remaining);
        let mut total = 0;
        while to_read > 0 {
            if self.buffer_index == BLOCK_LEN {
                self.advance_sector(false).await?;
                self.buffer_index = 0;
            }
            if self.buffer_index == 0 {
                self.volume
                    .read_sector(self.current_sector, self.pbuf)
                    .await?;
            }
            let chunk = to_read.min(BLOCK_LEN - self.buffer_index);
            buf[total..total + chunk]
                .copy_from_slice(&self.pbuf[self.buffer_index..self.buffer_index + chunk]);
            self.buffer_index += chunk;
            self.position += chunk as u32;
            total += chunk;
            to_read -= chunk;
        }
        Ok(total)
    }

    /// Flush the page buffer and the recorded size, consuming the cursor.
    ///
    /// The whole current page is written, trailing slack included.
    pub async fn close(self) -> Result<(), Error<D::E>> {
        self.volume
            .write_sector(self.current_sector, self.pbuf)
            .await?;
        self.write_size().await
    }

    /// Stamp the directory entry's last-modified time from a POSIX
    /// timestamp (2-second on-disk granularity).
    pub async fn update(&mut self, unix_time: u32) -> Result<(), Error<D::E>> {
        let stamp = Timestamp::from_unix(unix_time).serialize_time_date();
        self.volume
            .write(
                self.descriptor_sector,
                self.descriptor_index + MTIME_OFFSET,
                &stamp,
            )
            .await
    }

    /// Give the file a new 8.3 name. Fails with [`Error::FileExists`] if
    /// the name is already taken.
    pub async fn rename(&mut self, new_name: &str) -> Result<(), Error<D::E>> {
        if self.volume.file_exists(new_name).await? {
            return Err(Error::FileExists);
        }
        let short = ShortFileName::new(new_name);
        self.volume
            .write(self.descriptor_sector, self.descriptor_index, short.base())
            .await?;
        self.volume
            .write(
                self.descriptor_sector,
                self.descriptor_index + 8,
                short.extension(),
            )
            .await?;
        self.entry.name = short;
        Ok(())
    }

    /// Step the cursor to the next sector, crossing (and when `allocate`,
    /// extending) the cluster chain at cluster boundaries.
    async fn advance_sector(&mut self, allocate: bool) -> Result<(), Error<D::E>> {
        self.sector_index += 1;
        if self.sector_index == self.volume.sectors_per_cluster() {
            let next = if allocate {
                let next = self.volume.find_empty_cluster().await?;
                self.volume
                    .set_next_cluster(self.current_cluster, next)
                    .await?;
                next
            } else {
                let next = self.volume.get_next_cluster(self.current_cluster).await?;
                // The size said there was more, but the chain ended.
                if is_end_of_chain(next) {
                    return Err(Error::BadCluster);
                }
                next
            };
            self.current_cluster = next;
            self.current_sector = self.volume.first_sector(next);
            self.sector_index = 0;
        } else {
            self.current_sector = BlockIdx(self.current_sector.0 + 1);
        }
        Ok(())
    }

    async fn write_size(&self) -> Result<(), Error<D::E>> {
        let mut raw = [0u8; 4];
        LittleEndian::write_u32(&mut raw, self.entry.size);
        self.volume
            .write(self.descriptor_sector, self.descriptor_index + SIZE_OFFSET, &raw)
            .await
    }
}
