//! Hardware mapping primitives as seen by the VM layer.

use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use swapvm_shared::{mem::VirtAddr, paging::PageTableEntry};

/// Per-address-space page table operations.
///
/// Addresses passed in are page aligned user addresses. `unmap` also
/// invalidates any cached translation for the address.
pub trait Mmu: Send + Sync {
    /// Install a present mapping of `va` to frame number `frame`.
    fn map(&self, va: VirtAddr, frame: usize, writable: bool);
    /// Remove the mapping of `va`, if any.
    fn unmap(&self, va: VirtAddr);
    /// Frame number `va` is mapped to.
    fn translate(&self, va: VirtAddr) -> Option<usize>;
    fn is_dirty(&self, va: VirtAddr) -> bool;
    fn set_dirty(&self, va: VirtAddr, dirty: bool);
    fn is_accessed(&self, va: VirtAddr) -> bool;
    fn set_accessed(&self, va: VirtAddr, accessed: bool);
    /// Note an access to `va` made by the kernel on the user's behalf.
    ///
    /// On hardware the CPU sets the accessed and dirty bits itself while the
    /// kernel touches user memory, so implementations backed by real page
    /// tables may leave this empty.
    fn record_access(&self, va: VirtAddr, write: bool);
}

/// A page table kept entirely in software.
///
/// Holds one x86 [`PageTableEntry`] per mapped virtual page.
#[derive(Default)]
pub struct SoftPageTable {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of present mappings.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_writable(&self, va: VirtAddr) -> bool {
        self.entry(va).is_some_and(|pte| pte.read_write())
    }

    fn entry(&self, va: VirtAddr) -> Option<PageTableEntry> {
        self.entries.lock().get(&va.page_number()).copied()
    }

    fn update(&self, va: VirtAddr, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(pte) = self.entries.lock().get_mut(&va.page_number()) {
            *pte = f(*pte);
        }
    }
}

impl Mmu for SoftPageTable {
    fn map(&self, va: VirtAddr, frame: usize, writable: bool) {
        self.entries
            .lock()
            .insert(va.page_number(), PageTableEntry::user_mapping(frame, writable));
    }

    fn unmap(&self, va: VirtAddr) {
        self.entries.lock().remove(&va.page_number());
    }

    fn translate(&self, va: VirtAddr) -> Option<usize> {
        self.entry(va).map(|pte| pte.frame_number())
    }

    fn is_dirty(&self, va: VirtAddr) -> bool {
        self.entry(va).is_some_and(|pte| pte.dirty())
    }

    fn set_dirty(&self, va: VirtAddr, dirty: bool) {
        self.update(va, |pte| pte.with_dirty(dirty));
    }

    fn is_accessed(&self, va: VirtAddr) -> bool {
        self.entry(va).is_some_and(|pte| pte.accessed())
    }

    fn set_accessed(&self, va: VirtAddr, accessed: bool) {
        self.update(va, |pte| pte.with_accessed(accessed));
    }

    fn record_access(&self, va: VirtAddr, write: bool) {
        self.update(va, |pte| pte.with_accessed(true).with_dirty(pte.dirty() || write));
    }
}
