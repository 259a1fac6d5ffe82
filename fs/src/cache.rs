//! Write-back block cache.
//!
//! A fixed pool of [`POOL_SIZE`] page buffers sits between the filesystem
//! and the medium. Reads and writes of up to one page land in a buffer;
//! dirty buffers are drained to the medium by [`BlockCache::run`], a
//! background future the platform spawns once per cache.
//!
//! Each slot carries two locks. The header lock covers the page mapping
//! and the use counter and is only ever held briefly; the content lock
//! covers the 512 data bytes and is held for the whole transfer when the
//! slot is filled or flushed. Callers always take header before content;
//! the flusher releases content before touching the header again, so the
//! two orders never cross.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

use embassy_sync::channel::Channel;
use embassy_sync::mutex::{Mutex, MutexGuard};

use crate::blockdevice::{AddressMode, BlockDevice, BlockIdx};
use crate::{Error, RawMutex, BLOCK_LEN};

/// Default number of page buffers in the pool.
pub const POOL_SIZE: usize = 30;

/// Transfer attempts per page before the error is reported to the caller.
const MAX_RETRY: u32 = 3;

/// Consecutive failed transfers tolerated before the device is
/// re-initialized.
const MAX_FAILED_ATTEMPTS: u16 = 10;

/// Ceiling of the per-slot use counter.
const MAX_USE: u8 = 254;

struct Header {
    /// Page currently held by the slot. Only meaningful when
    /// `use_count > 0`.
    page: u32,
    /// 0 means free. Incremented on every hit, reset to 1 when the slot is
    /// (re)filled or flushed, so recently idle pages lose to busy ones
    /// when a victim is picked.
    use_count: u8,
}

impl Header {
    fn touch(&mut self) {
        if self.use_count < MAX_USE {
            self.use_count += 1;
        }
    }
}

struct Slot {
    header: Mutex<RawMutex, Header>,
    /// Set while the content differs from the medium. Transitions are made
    /// under the content lock; the flag itself is atomic so the header
    /// lock does not have to be taken to test it.
    dirty: AtomicBool,
    content: Mutex<RawMutex, [u8; BLOCK_LEN]>,
}

/// A pool of `N` write-back page buffers over a [`BlockDevice`].
///
/// All methods take `&self`; the cache is meant to be shared (by reference
/// or in a `static`) between the filesystem tasks and the one task that
/// awaits [`BlockCache::run`].
pub struct BlockCache<D: BlockDevice, const N: usize = POOL_SIZE> {
    slots: [Slot; N],
    device: Mutex<RawMutex, D>,
    mode: AddressMode,
    /// Serializes the lookup-then-reserve sequence on a miss so two tasks
    /// cannot bind the same page to two slots.
    miss_lock: Mutex<RawMutex, ()>,
    /// One token per buffer that became dirty; the write-back task blocks
    /// on it when everything is clean.
    dirty_tokens: Channel<RawMutex, (), N>,
    /// Woken by the write-back task when a flush completes and somebody is
    /// waiting for a free buffer.
    clean_tokens: Channel<RawMutex, (), 1>,
    num_waiting: AtomicUsize,
    failed_attempts: AtomicU16,
}

impl<D: BlockDevice, const N: usize> BlockCache<D, N> {
    /// Wrap `device`, with every slot initially free.
    pub fn new(device: D, mode: AddressMode) -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                header: Mutex::new(Header {
                    page: 0,
                    use_count: 0,
                }),
                dirty: AtomicBool::new(false),
                content: Mutex::new([0u8; BLOCK_LEN]),
            }),
            device: Mutex::new(device),
            mode,
            miss_lock: Mutex::new(()),
            dirty_tokens: Channel::new(),
            clean_tokens: Channel::new(),
            num_waiting: AtomicUsize::new(0),
            failed_attempts: AtomicU16::new(0),
        }
    }

    /// Read up to `buf.len()` bytes from `page`, starting at `offset`
    /// within the page. Returns the number of bytes actually copied, which
    /// is `buf.len()` clamped to the end of the page.
    pub async fn read(
        &self,
        page: BlockIdx,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, Error<D::E>> {
        let len = buf.len().min(BLOCK_LEN.saturating_sub(offset));
        if len == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..len];

        loop {
            if let Some(n) = self.lookup_read(page, offset, buf).await {
                return Ok(n);
            }

            {
                let _miss = self.miss_lock.lock().await;
                // Another task may have bound the page while we queued.
                if let Some(n) = self.lookup_read(page, offset, buf).await {
                    return Ok(n);
                }
                if let Some((index, mut header)) = self.reserve_buffer().await {
                    let slot = &self.slots[index];
                    let mut content = slot.content.lock().await;
                    if let Err(e) = self.fill(page, &mut content).await {
                        // Leave nothing half-read behind the mapping.
                        header.use_count = 0;
                        return Err(e);
                    }
                    header.page = page.0;
                    header.use_count = 1;
                    buf.copy_from_slice(&content[offset..offset + len]);
                    return Ok(len);
                }
            }

            // Pool entirely dirty; wait for the write-back task.
            self.wait_for_clean_buffer().await;
        }
    }

    /// Write up to `buf.len()` bytes to `page`, starting at `offset`
    /// within the page. Returns the number of bytes accepted.
    ///
    /// A partial write to an unmapped page reads the page from the medium
    /// first, so the untouched bytes survive; a full-page write skips the
    /// read.
    pub async fn write(
        &self,
        page: BlockIdx,
        offset: usize,
        buf: &[u8],
    ) -> Result<usize, Error<D::E>> {
        let len = buf.len().min(BLOCK_LEN.saturating_sub(offset));
        if len == 0 {
            return Ok(0);
        }
        let buf = &buf[..len];

        loop {
            if let Some(n) = self.lookup_write(page, offset, buf).await {
                return Ok(n);
            }

            {
                let _miss = self.miss_lock.lock().await;
                if let Some(n) = self.lookup_write(page, offset, buf).await {
                    return Ok(n);
                }
                if let Some((index, mut header)) = self.reserve_buffer().await {
                    let slot = &self.slots[index];
                    let mut content = slot.content.lock().await;
                    if len != BLOCK_LEN {
                        if let Err(e) = self.fill(page, &mut content).await {
                            header.use_count = 0;
                            return Err(e);
                        }
                    }
                    header.page = page.0;
                    header.use_count = 1;
                    content[offset..offset + len].copy_from_slice(buf);
                    if !slot.dirty.swap(true, Ordering::AcqRel) {
                        self.notify_dirty();
                    }
                    return Ok(len);
                }
            }

            self.wait_for_clean_buffer().await;
        }
    }

    /// Flush every dirty buffer and return once the medium is up to date.
    ///
    /// Buffers dirtied concurrently with the call may or may not be
    /// covered; buffers dirty before the call always are. A transfer error
    /// aborts the sweep.
    pub async fn sync(&self) -> Result<(), Error<D::E>> {
        for slot in &self.slots {
            let header = slot.header.lock().await;
            if header.use_count == 0 || !slot.dirty.load(Ordering::Acquire) {
                continue;
            }
            let page = header.page;
            let content = slot.content.lock().await;
            drop(header);
            // The flusher may have drained it between the two locks.
            if !slot.dirty.load(Ordering::Acquire) {
                continue;
            }
            if let Err(e) = self.transfer_write(page, &content).await {
                self.failed().await;
                return Err(Error::Device(e));
            }
            self.passed();
            slot.dirty.store(false, Ordering::Release);
            drop(content);
            let mut header = slot.header.lock().await;
            header.use_count = 1;
            drop(header);
            if self.num_waiting.load(Ordering::Acquire) > 0 {
                let _ = self.clean_tokens.try_send(());
            }
        }
        Ok(())
    }

    /// Drain dirty buffers to the medium, forever.
    ///
    /// Spawn exactly one of these per cache. It sleeps while everything is
    /// clean, picks the least-used dirty buffer otherwise, and after each
    /// successful flush wakes a task stuck in [`Self::read`]/[`Self::write`]
    /// waiting for a free buffer.
    pub async fn run(&self) -> ! {
        loop {
            self.dirty_tokens.receive().await;

            let mut victim: Option<(usize, MutexGuard<'_, RawMutex, Header>)> = None;
            for (index, slot) in self.slots.iter().enumerate() {
                if !slot.dirty.load(Ordering::Acquire) {
                    continue;
                }
                let header = slot.header.lock().await;
                if header.use_count == 0 {
                    continue;
                }
                let less_used = match &victim {
                    Some((_, best)) => header.use_count < best.use_count,
                    None => true,
                };
                if less_used {
                    victim = Some((index, header));
                }
            }
            // A stale token: sync() may have drained the buffer already.
            let Some((index, header)) = victim else {
                continue;
            };

            let slot = &self.slots[index];
            let content = slot.content.lock().await;
            let page = header.page;
            drop(header);

            match self.transfer_write(page, &content).await {
                Ok(()) => {
                    self.passed();
                    slot.dirty.store(false, Ordering::Release);
                    drop(content);
                    let mut header = slot.header.lock().await;
                    header.use_count = 1;
                    drop(header);
                    if self.num_waiting.load(Ordering::Acquire) > 0 {
                        let _ = self.clean_tokens.try_send(());
                    }
                }
                Err(e) => {
                    drop(content);
                    warn!("page {} flush failed: {:?}", page, e);
                    // The buffer is still dirty; put its token back.
                    self.notify_dirty();
                    self.failed().await;
                }
            }
        }
    }

    /// Probe the pool for `page` and copy out of it on a hit.
    async fn lookup_read(&self, page: BlockIdx, offset: usize, buf: &mut [u8]) -> Option<usize> {
        for slot in &self.slots {
            let mut header = slot.header.lock().await;
            if header.use_count == 0 || header.page != page.0 {
                continue;
            }
            header.touch();
            let content = slot.content.lock().await;
            drop(header);
            buf.copy_from_slice(&content[offset..offset + buf.len()]);
            return Some(buf.len());
        }
        None
    }

    /// Probe the pool for `page` and copy into it on a hit.
    async fn lookup_write(&self, page: BlockIdx, offset: usize, buf: &[u8]) -> Option<usize> {
        for slot in &self.slots {
            let mut header = slot.header.lock().await;
            if header.use_count == 0 || header.page != page.0 {
                continue;
            }
            header.touch();
            let mut content = slot.content.lock().await;
            drop(header);
            content[offset..offset + buf.len()].copy_from_slice(buf);
            if !slot.dirty.swap(true, Ordering::AcqRel) {
                self.notify_dirty();
            }
            return Some(buf.len());
        }
        None
    }

    /// Pick the least-used clean slot, returning its held header guard.
    ///
    /// Slots are examined in index order and the candidate's index is
    /// always below the slot being examined, so concurrent reservers
    /// cannot deadlock on each other's header locks.
    async fn reserve_buffer(&self) -> Option<(usize, MutexGuard<'_, RawMutex, Header>)> {
        let mut candidate: Option<(usize, MutexGuard<'_, RawMutex, Header>)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.dirty.load(Ordering::Acquire) {
                continue;
            }
            let header = slot.header.lock().await;
            if slot.dirty.load(Ordering::Acquire) {
                continue;
            }
            if header.use_count == 0 {
                return Some((index, header));
            }
            let less_used = match &candidate {
                Some((_, best)) => header.use_count < best.use_count,
                None => true,
            };
            if less_used {
                candidate = Some((index, header));
            }
        }
        candidate
    }

    fn notify_dirty(&self) {
        // At most one token per slot is ever outstanding, so the channel
        // (capacity N) cannot reject this.
        let _ = self.dirty_tokens.try_send(());
    }

    /// Park until the write-back task frees a buffer.
    async fn wait_for_clean_buffer(&self) {
        warn!("all {} cache buffers dirty, waiting for write-back", N);
        self.num_waiting.fetch_add(1, Ordering::AcqRel);
        // A flush finishing between our failed reservation and here would
        // otherwise be missed.
        let mut found_clean = false;
        for slot in &self.slots {
            if !slot.dirty.load(Ordering::Acquire) {
                found_clean = true;
                break;
            }
        }
        if !found_clean {
            self.clean_tokens.receive().await;
        }
        self.num_waiting.fetch_sub(1, Ordering::AcqRel);
    }

    /// Read `page` from the medium into `content`, retrying transient
    /// failures.
    async fn fill(&self, page: BlockIdx, content: &mut [u8; BLOCK_LEN]) -> Result<(), Error<D::E>> {
        let mut attempt = 0;
        loop {
            match self.transfer_read(page.0, content).await {
                Ok(()) => {
                    self.passed();
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    warn!("page {} read failed (attempt {}): {:?}", page.0, attempt, e);
                    self.failed().await;
                    if attempt >= MAX_RETRY {
                        return Err(Error::Device(e));
                    }
                }
            }
        }
    }

    async fn transfer_read(&self, page: u32, content: &mut [u8; BLOCK_LEN]) -> Result<(), D::E> {
        let address = self.mode.device_address(BlockIdx(page));
        let mut device = self.device.lock().await;
        device.read_block(address, content).await
    }

    async fn transfer_write(&self, page: u32, content: &[u8; BLOCK_LEN]) -> Result<(), D::E> {
        let address = self.mode.device_address(BlockIdx(page));
        let mut device = self.device.lock().await;
        device.write_block(address, content).await
    }

    fn passed(&self) {
        self.failed_attempts.store(0, Ordering::Release);
    }

    /// Record a transfer failure; after [`MAX_FAILED_ATTEMPTS`] in a row
    /// the device is re-initialized.
    ///
    /// Panics if re-initialization itself fails: at that point the medium
    /// is gone and dirty data cannot be saved.
    async fn failed(&self) {
        let count = self.failed_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if count > MAX_FAILED_ATTEMPTS {
            self.failed_attempts.store(0, Ordering::Release);
            warn!("{} consecutive transfer failures, re-initializing device", count);
            let mut device = self.device.lock().await;
            if let Err(e) = device.reinit().await {
                error!("device re-initialization failed: {:?}", e);
                panic!("storage device lost");
            }
        }
    }
}
