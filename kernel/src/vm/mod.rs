//! Demand paging.
//!
//! Every user address space keeps a [`SupplementalPageTable`] describing each
//! of its virtual pages. Pages start out without a frame; the first access
//! faults, and [`AddressSpace::handle_fault`] finds the page, obtains a frame
//! from the process-wide [`FrameTable`] (evicting another page if physical
//! memory is exhausted) and fills it:
//!
//! - an uninitialized page runs its [`LazyLoad`] once and becomes anonymous
//!   or file-backed,
//! - an anonymous page is read back from its swap slot, or zero-filled if it
//!   never left memory,
//! - a file-backed page is re-read from its file.
//!
//! Eviction is the reverse: anonymous pages go to a swap slot, dirty
//! file-backed pages are written back to their file.

mod address_space;
mod anon;
mod fault;
mod file;
mod frame_table;
mod page;
mod spt;
mod uninit;

#[cfg(test)]
mod tests;

pub use address_space::AddressSpace;
pub use anon::AnonPage;
pub use fault::{is_stack_access, FaultError, PageFault};
pub use file::{FilePage, MappedRegion};
pub use frame_table::{FrameOwner, FrameTable};
pub use page::{Page, PageKind, PageRef, PageType};
pub use spt::SupplementalPageTable;
pub use uninit::{FileSlice, LazyLoad};

use crate::block::{Block, BlockError};
use crate::mem::FrameAllocator;
use crate::swapping::SwapTable;
use crate::vfs;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use swapvm_shared::mem::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The swap device failed.
    Block(BlockError),
    /// A backing file failed.
    File(vfs::Error),
    /// A backing file ended before a page's worth of valid bytes.
    ShortRead { expected: usize, actual: usize },
    /// A backing file accepted fewer bytes than were written back.
    ShortWrite { expected: usize, actual: usize },
    /// A page is already registered at this address.
    AlreadyMapped(VirtAddr),
    /// Nothing is registered at this address.
    NotMapped(VirtAddr),
    /// The mapping request itself is malformed.
    InvalidMapping,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block(err) => write!(f, "swap device: {err}"),
            Self::File(err) => write!(f, "backing file: {err}"),
            Self::ShortRead { expected, actual } => {
                write!(f, "short read: wanted {expected} bytes, got {actual}")
            }
            Self::ShortWrite { expected, actual } => {
                write!(f, "short write: wanted {expected} bytes, wrote {actual}")
            }
            Self::AlreadyMapped(va) => write!(f, "{va} is already mapped"),
            Self::NotMapped(va) => write!(f, "{va} is not mapped"),
            Self::InvalidMapping => write!(f, "invalid mapping request"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        Self::Block(err)
    }
}

impl From<vfs::Error> for VmError {
    fn from(err: vfs::Error) -> Self {
        Self::File(err)
    }
}

/// Running totals, kept in atomics so they can be bumped under any lock.
#[derive(Default)]
pub struct VmStats {
    faults: AtomicUsize,
    evictions: AtomicUsize,
    swap_ins: AtomicUsize,
    swap_outs: AtomicUsize,
    write_backs: AtomicUsize,
    stack_growths: AtomicUsize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub faults: usize,
    pub evictions: usize,
    pub swap_ins: usize,
    pub swap_outs: usize,
    pub write_backs: usize,
    pub stack_growths: usize,
}

impl VmStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            stack_growths: self.stack_growths.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every address space: physical frames, swap, statistics.
///
/// The kernel keeps exactly one, installed at boot with
/// [`crate::system::vm_init`].
pub struct Vm {
    frames: FrameTable,
    swap: SwapTable,
    stats: VmStats,
}

impl Vm {
    pub fn new(allocator: impl FrameAllocator + 'static, swap_disk: Block) -> Self {
        let frames = FrameTable::new(allocator);
        let swap = SwapTable::new(swap_disk);
        log::info!(
            "vm: {} frames, {} swap slots",
            frames.capacity(),
            swap.slot_count()
        );
        Self {
            frames,
            swap,
            stats: VmStats::default(),
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &VmStats {
        &self.stats
    }

    /// Report what is still held at shutdown. Returns `true` if nothing leaked.
    pub fn shutdown(&self) -> bool {
        let frames = self.frames.resident_count();
        let slots = self.swap.slots_in_use();
        log::info!("vm: shutting down, {:?}", self.stats());
        if frames != 0 || slots != 0 {
            log::warn!("vm: {} frames and {} swap slots still in use", frames, slots);
            return false;
        }
        true
    }
}
