//! Interface to the physical block-transfer driver.
//!
//! The storage core never talks to hardware directly; it is handed
//! something that can move one 512-byte page at a time and can be
//! re-initialized when it misbehaves. An SD card behind SDIO or SPI, a
//! file, or a `Vec` of pages in a test all fit.

use crate::BLOCK_LEN;

/// A page number, counted from the start of the medium.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockIdx(pub u32);

impl BlockIdx {
    /// The byte offset of this page on a byte-addressed medium.
    pub const fn into_bytes(self) -> u32 {
        self.0 * BLOCK_LEN as u32
    }
}

/// How transfer addresses are formed for the medium.
///
/// Standard-capacity SD cards take byte offsets, high-capacity cards take
/// block indices. The cache is told which at construction and applies the
/// conversion on every transfer.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressMode {
    /// Addresses are byte offsets (standard-capacity media).
    Byte,
    /// Addresses are block indices (high-capacity media).
    Block,
}

impl AddressMode {
    pub(crate) fn device_address(self, page: BlockIdx) -> u32 {
        match self {
            AddressMode::Byte => page.into_bytes(),
            AddressMode::Block => page.0,
        }
    }
}

/// A block device the cache can sit on.
///
/// All three operations may suspend the caller until the transfer
/// completes; errors are returned, never retried at this level.
#[allow(async_fn_in_trait)]
pub trait BlockDevice {
    /// The error type returned by the driver.
    type E: core::fmt::Debug;

    /// Read one page into `block`. `address` is already in the medium's
    /// [`AddressMode`].
    async fn read_block(
        &mut self,
        address: u32,
        block: &mut [u8; BLOCK_LEN],
    ) -> Result<(), Self::E>;

    /// Write one page from `block`.
    async fn write_block(&mut self, address: u32, block: &[u8; BLOCK_LEN]) -> Result<(), Self::E>;

    /// Re-initialize the medium after repeated transfer failures.
    async fn reinit(&mut self) -> Result<(), Self::E>;
}
