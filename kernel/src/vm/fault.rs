//! The page fault resolver.

use super::{AddressSpace, FrameOwner, Page, PageRef, VmError, VmStats};
use alloc::sync::Arc;
use core::fmt;
use swapvm_shared::mem::{VirtAddr, MAX_STACK_SIZE, STACK_FAULT_SLACK, USER_STACK_TOP};

/// What the trap handler knows about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: VirtAddr,
    pub write: bool,
    /// `false` for a protection violation on a present page.
    pub not_present: bool,
    pub user: bool,
    /// The user stack pointer at the time of the fault.
    pub stack_pointer: VirtAddr,
}

/// Why a fault could not be resolved. The caller kills the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No page covers the address and it does not look like stack growth.
    Unmapped(VirtAddr),
    /// The page is present; the access itself was not allowed.
    AlreadyResident(VirtAddr),
    /// A write to a read-only page.
    ReadOnly(VirtAddr),
    /// Getting a frame or loading the contents failed.
    Load(VmError),
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmapped(va) => write!(f, "no page at {va}"),
            Self::AlreadyResident(va) => write!(f, "protection fault on resident page {va}"),
            Self::ReadOnly(va) => write!(f, "write to read-only page {va}"),
            Self::Load(err) => write!(f, "page load failed: {err}"),
        }
    }
}

impl core::error::Error for FaultError {}

impl From<VmError> for FaultError {
    fn from(err: VmError) -> Self {
        Self::Load(err)
    }
}

/// Whether a fault at `addr` with stack pointer `sp` should grow the stack.
///
/// Accepts addresses no more than [`STACK_FAULT_SLACK`] bytes below `sp`
/// (an x86 `pusha` touches memory 32 bytes below before moving `sp`) that
/// fall inside the `MAX_STACK_SIZE` region under `USER_STACK_TOP`.
pub fn is_stack_access(addr: VirtAddr, sp: VirtAddr) -> bool {
    let addr = addr.as_usize();
    addr < USER_STACK_TOP
        && addr >= USER_STACK_TOP - MAX_STACK_SIZE
        && addr >= sp.as_usize().saturating_sub(STACK_FAULT_SLACK)
}

impl AddressSpace {
    /// Resolve `fault`. On success the faulting access can be restarted.
    pub fn handle_fault(&self, fault: &PageFault) -> Result<(), FaultError> {
        let addr = fault.addr;
        VmStats::bump(&self.vm().counters().faults);
        log::trace!("vm: fault at {} ({:?})", addr, fault);

        if !addr.is_user() || addr.as_usize() == 0 {
            return Err(FaultError::Unmapped(addr));
        }
        if !fault.not_present {
            return Err(if fault.write {
                FaultError::ReadOnly(addr)
            } else {
                FaultError::AlreadyResident(addr)
            });
        }

        let page_ref = match self.spt.find(addr) {
            Some(page_ref) => page_ref,
            None if is_stack_access(addr, fault.stack_pointer) => self.grow_stack(addr)?,
            None => return Err(FaultError::Unmapped(addr)),
        };

        let mut page = page_ref.lock();
        if page.is_destroyed() {
            return Err(FaultError::Unmapped(addr));
        }
        if fault.write && !page.writable() {
            return Err(FaultError::ReadOnly(addr));
        }
        if page.is_resident() {
            // Another thread of this process got here first.
            return Ok(());
        }
        self.load_locked(&page_ref, &mut page)?;
        Ok(())
    }

    fn grow_stack(&self, addr: VirtAddr) -> Result<PageRef, FaultError> {
        let va = addr.page_round_down();
        match self.spt.insert(Page::new_anon(va, true)) {
            Ok(page_ref) => {
                VmStats::bump(&self.vm().counters().stack_growths);
                log::debug!("vm: stack grew to {}", va);
                Ok(page_ref)
            }
            // Lost a race with another thread growing the same page.
            Err(VmError::AlreadyMapped(_)) => self.spt.find(va).ok_or(FaultError::Unmapped(addr)),
            Err(err) => Err(FaultError::Load(err)),
        }
    }

    /// Get a frame for the locked, non-resident `page`, fill it and map it.
    /// On failure the frame goes back and the page is unchanged.
    pub(super) fn load_locked(&self, page_ref: &PageRef, page: &mut Page) -> Result<(), VmError> {
        let vm = self.vm();
        let owner = FrameOwner {
            page: Arc::downgrade(page_ref),
            va: page.va(),
            mmu: Arc::clone(self.mmu()),
        };
        let mut frame = vm.frames().allocate(owner, vm.swap(), vm.counters())?;
        if let Err(err) = page.swap_in(&mut frame, vm.swap(), vm.counters()) {
            log::debug!("vm: loading {} failed: {}", page.va(), err);
            vm.frames().release(frame);
            return Err(err);
        }
        self.mmu().map(page.va(), frame.number(), page.writable());
        page.attach(frame);
        Ok(())
    }
}
