use super::{Page, PageRef, Vm, VmError};
use crate::paging::Mmu;
use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use swapvm_shared::mem::VirtAddr;

/// Every page of one address space, keyed by page-aligned address.
///
/// Lock order: this table, then a page, then the frame table, then swap.
/// The table lock is never held while a page is being loaded.
pub struct SupplementalPageTable {
    vm: Arc<Vm>,
    mmu: Arc<dyn Mmu>,
    pages: Mutex<BTreeMap<VirtAddr, PageRef>>,
}

impl SupplementalPageTable {
    pub fn new(vm: Arc<Vm>, mmu: Arc<dyn Mmu>) -> Self {
        Self {
            vm,
            mmu,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn mmu(&self) -> &Arc<dyn Mmu> {
        &self.mmu
    }

    /// The page containing `va`, which need not be aligned.
    pub fn find(&self, va: VirtAddr) -> Option<PageRef> {
        self.pages.lock().get(&va.page_round_down()).cloned()
    }

    pub fn insert(&self, page: Page) -> Result<PageRef, VmError> {
        let va = page.va();
        let mut pages = self.pages.lock();
        if pages.contains_key(&va) {
            return Err(VmError::AlreadyMapped(va));
        }
        let page = Arc::new(Mutex::new(page));
        pages.insert(va, Arc::clone(&page));
        Ok(page)
    }

    /// Insert all of `pages` or, if any address is taken, none of them.
    pub fn insert_all(&self, pages: Vec<Page>) -> Result<(), VmError> {
        let mut table = self.pages.lock();
        if let Some(taken) = pages.iter().find(|page| table.contains_key(&page.va())) {
            return Err(VmError::AlreadyMapped(taken.va()));
        }
        for page in pages {
            table.insert(page.va(), Arc::new(Mutex::new(page)));
        }
        Ok(())
    }

    /// Unregister the page at `va` and release what it holds.
    pub fn remove(&self, va: VirtAddr) -> Result<(), VmError> {
        let page = self
            .pages
            .lock()
            .remove(&va.page_round_down())
            .ok_or(VmError::NotMapped(va))?;
        self.destroy(&page);
        Ok(())
    }

    /// Destroy and drop every page. Safe to call more than once.
    pub fn teardown(&self) {
        let pages = core::mem::take(&mut *self.pages.lock());
        if !pages.is_empty() {
            log::debug!("vm: tearing down {} pages", pages.len());
        }
        for page in pages.values() {
            self.destroy(page);
        }
    }

    fn destroy(&self, page: &PageRef) {
        page.lock().destroy(
            &*self.mmu,
            self.vm.frames(),
            self.vm.swap(),
            self.vm.counters(),
        );
    }

    /// Whether no page overlaps `start..start + length`.
    pub fn is_range_free(&self, start: VirtAddr, length: usize) -> bool {
        let first = start.page_round_down();
        let Some(end) = start.checked_add(length) else {
            return false;
        };
        let pages = self.pages.lock();
        pages.range(first..end).next().is_none()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses of all registered pages, lowest first.
    pub fn addresses(&self) -> Vec<VirtAddr> {
        self.pages.lock().keys().copied().collect()
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.teardown();
    }
}
