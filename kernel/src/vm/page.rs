use super::{AnonPage, FilePage, FrameTable, LazyLoad, VmError, VmStats};
use crate::mem::PhysFrame;
use crate::paging::Mmu;
use crate::swapping::page_replacement::PageReplacementPolicy;
use crate::swapping::{SlotId, SwapTable};
use crate::sync::Mutex;
use alloc::sync::Arc;
use core::fmt;
use core::mem;
use swapvm_shared::mem::VirtAddr;

/// Pages are shared between their supplemental page table, which owns them,
/// and the frame table, which only refers back to them weakly.
pub type PageRef = Arc<Mutex<Page>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Uninit,
    Anon,
    File,
}

#[derive(Debug)]
pub enum PageKind {
    Uninit(LazyLoad),
    Anon(AnonPage),
    File(FilePage),
}

/// One virtual page of a user address space.
pub struct Page {
    va: VirtAddr,
    writable: bool,
    kind: PageKind,
    frame: Option<PhysFrame>,
    /// Set once [`Page::destroy`] ran. The kind no longer holds resources.
    destroyed: bool,
}

impl Page {
    pub fn new_uninit(va: VirtAddr, writable: bool, load: LazyLoad) -> Self {
        Self::new(va, writable, PageKind::Uninit(load))
    }

    /// An anonymous page that reads as zeroes until first written.
    pub fn new_anon(va: VirtAddr, writable: bool) -> Self {
        Self::new(va, writable, PageKind::Anon(AnonPage::default()))
    }

    fn new(va: VirtAddr, writable: bool, kind: PageKind) -> Self {
        assert!(va.is_page_aligned(), "page address {va} is not aligned");
        Self {
            va,
            writable,
            kind,
            frame: None,
            destroyed: false,
        }
    }

    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn page_type(&self) -> PageType {
        match self.kind {
            PageKind::Uninit(_) => PageType::Uninit,
            PageKind::Anon(_) => PageType::Anon,
            PageKind::File(_) => PageType::File,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn frame_number(&self) -> Option<usize> {
        self.frame.as_ref().map(PhysFrame::number)
    }

    pub fn swap_slot(&self) -> Option<SlotId> {
        match &self.kind {
            PageKind::Anon(anon) => anon.slot(),
            _ => None,
        }
    }

    pub(super) fn frame_mut(&mut self) -> Option<&mut PhysFrame> {
        self.frame.as_mut()
    }

    /// Bind a frame already filled by [`Page::swap_in`].
    pub(super) fn attach(&mut self, frame: PhysFrame) {
        assert!(self.frame.is_none(), "page {} is already resident", self.va);
        self.frame = Some(frame);
    }

    /// Fill `frame` with this page's contents.
    ///
    /// An uninitialized page runs its loader and becomes anonymous or
    /// file-backed; if the loader fails the page is left as it was.
    pub(super) fn swap_in(
        &mut self,
        frame: &mut PhysFrame,
        swap: &SwapTable,
        stats: &VmStats,
    ) -> Result<(), VmError> {
        debug_assert!(self.frame.is_none());
        if let PageKind::Uninit(load) = &self.kind {
            load.populate(frame.as_mut_slice())?;
            self.initialize();
            return Ok(());
        }
        match &mut self.kind {
            PageKind::Anon(anon) => anon.swap_in(frame.as_mut_slice(), swap, stats),
            PageKind::File(file) => file.swap_in(frame.as_mut_slice(), stats),
            PageKind::Uninit(_) => unreachable!(),
        }
    }

    fn initialize(&mut self) {
        let placeholder = PageKind::Anon(AnonPage::default());
        if let PageKind::Uninit(load) = mem::replace(&mut self.kind, placeholder) {
            self.kind = load.into_kind();
        }
    }

    /// Give up the frame, saving the contents wherever this kind keeps them.
    /// The frame is returned for reuse. On error the page stays resident and
    /// mapped.
    pub(super) fn swap_out(
        &mut self,
        mmu: &dyn Mmu,
        swap: &SwapTable,
        stats: &VmStats,
    ) -> Result<PhysFrame, VmError> {
        let Some(frame) = self.frame.as_ref() else {
            panic!("swap out of non-resident page {}", self.va);
        };
        match &mut self.kind {
            PageKind::Anon(anon) => anon.swap_out(self.va, self.writable, frame, mmu, swap, stats)?,
            PageKind::File(file) => file.swap_out(self.va, self.writable, frame, mmu, stats)?,
            PageKind::Uninit(_) => unreachable!("uninitialized page {} is resident", self.va),
        }
        self.frame
            .take()
            .ok_or(VmError::NotMapped(self.va))
    }

    /// Release everything the page holds: a dirty file page is written
    /// back, a swap slot is freed, the frame goes back to the frame table
    /// and file handles are closed. The record itself stays with its owner.
    pub(super) fn destroy<P: PageReplacementPolicy>(
        &mut self,
        mmu: &dyn Mmu,
        frames: &FrameTable<P>,
        swap: &SwapTable,
        stats: &VmStats,
    ) {
        if mem::replace(&mut self.destroyed, true) {
            return;
        }
        match mem::replace(&mut self.kind, PageKind::Anon(AnonPage::default())) {
            PageKind::Anon(anon) => anon.destroy(swap),
            PageKind::File(file) => file.destroy(self.va, self.frame.as_ref(), mmu, stats),
            PageKind::Uninit(_) => {}
        }
        if let Some(frame) = self.frame.take() {
            mmu.unmap(self.va);
            frames.release(frame);
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("va", &self.va)
            .field("writable", &self.writable)
            .field("kind", &self.kind)
            .field("frame", &self.frame_number())
            .finish()
    }
}
