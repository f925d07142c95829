//! The swap slot table: one bit per page-sized slot on the swap device.
//!
//! Nothing about the slots is persisted; the table starts empty at boot.

pub mod page_replacement;

use crate::block::{Block, BlockError, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use core::fmt;
use swapvm_shared::bitmap::Bitmap;
use swapvm_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};

/// Index of a page-sized slot on the swap device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }

    /// Device sector holding bytes `i * BLOCK_SECTOR_SIZE..` of this slot.
    fn sector(self, i: usize) -> Result<BlockSector, BlockError> {
        BlockSector::try_from(self.0 * SECTORS_PER_PAGE + i)
            .map_err(|_| BlockError::SectorOutOfBounds)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

struct SwapSpace {
    disk: Block,
    slots: Bitmap,
}

pub struct SwapTable {
    inner: Mutex<SwapSpace>,
}

impl SwapTable {
    /// Manage `disk` as swap. Any tail smaller than a page is left unused.
    pub fn new(disk: Block) -> Self {
        let slot_count = disk.get_size() as usize / SECTORS_PER_PAGE;
        log::info!(
            "swap: {} slots of {} sectors on \"{}\"",
            slot_count,
            SECTORS_PER_PAGE,
            disk.get_name()
        );
        Self {
            inner: Mutex::new(SwapSpace {
                disk,
                slots: Bitmap::new(slot_count),
            }),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.lock().slots.count_ones()
    }

    pub fn is_occupied(&self, slot: SlotId) -> bool {
        self.inner.lock().slots.get(slot.0)
    }

    /// Claims the lowest free slot.
    ///
    /// # Panics
    ///
    /// Running out of swap is fatal: there is nowhere left to put the page
    /// being evicted.
    pub fn acquire_slot(&self) -> SlotId {
        let mut swap = self.inner.lock();
        let Some(idx) = swap.slots.scan_and_set() else {
            panic!("swap: out of swap slots ({} in use)", swap.slots.len());
        };
        log::debug!("swap: acquired slot {}", idx);
        SlotId(idx)
    }

    /// # Panics
    ///
    /// Panics if `slot` is not currently occupied.
    pub fn release_slot(&self, slot: SlotId) {
        let mut swap = self.inner.lock();
        assert!(swap.slots.get(slot.0), "swap: {slot} released twice");
        swap.slots.set(slot.0, false);
        log::debug!("swap: released {}", slot);
    }

    /// Write one page to `slot`.
    pub fn write_slot(&self, slot: SlotId, page: &[u8]) -> Result<(), BlockError> {
        if page.len() != PAGE_FRAME_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        let mut swap = self.inner.lock();
        for (i, chunk) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            swap.disk.write(slot.sector(i)?, chunk)?;
        }
        Ok(())
    }

    /// Read one page from `slot`.
    pub fn read_slot(&self, slot: SlotId, page: &mut [u8]) -> Result<(), BlockError> {
        if page.len() != PAGE_FRAME_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        let mut swap = self.inner.lock();
        for (i, chunk) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            swap.disk.read(slot.sector(i)?, chunk)?;
        }
        Ok(())
    }

    /// Sector reads and writes issued to the swap device so far.
    pub fn disk_traffic(&self) -> (u32, u32) {
        let swap = self.inner.lock();
        (swap.disk.read_count(), swap.disk.write_count())
    }
}
