use super::{FaultError, LazyLoad, MappedRegion, Page, SupplementalPageTable, Vm, VmError, VmStats};
use crate::paging::Mmu;
use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use swapvm_shared::mem::{VirtAddr, PAGE_FRAME_SIZE};

/// The user half of one process's memory.
///
/// Dropping it releases everything, exactly as [`AddressSpace::exit`] does.
pub struct AddressSpace {
    pub(super) spt: SupplementalPageTable,
    pub(super) mappings: Mutex<BTreeMap<VirtAddr, MappedRegion>>,
}

impl AddressSpace {
    pub fn new(vm: Arc<Vm>, mmu: Arc<dyn Mmu>) -> Self {
        Self {
            spt: SupplementalPageTable::new(vm, mmu),
            mappings: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn vm(&self) -> &Arc<Vm> {
        self.spt.vm()
    }

    pub fn mmu(&self) -> &Arc<dyn Mmu> {
        self.spt.mmu()
    }

    /// Register a zero-filled anonymous page at `va`.
    pub fn alloc_anon(&self, va: VirtAddr, writable: bool) -> Result<(), VmError> {
        check_page_va(va)?;
        self.spt.insert(Page::new_anon(va, writable)).map(drop)
    }

    /// Register a page at `va` whose contents come from `load` on first
    /// access. On error `load` is dropped, closing any file it holds.
    pub fn alloc_lazy(&self, va: VirtAddr, writable: bool, load: LazyLoad) -> Result<(), VmError> {
        check_page_va(va)?;
        self.spt
            .insert(Page::new_uninit(va, writable, load))
            .map(drop)
    }

    /// Make the page at `va` resident now. Already resident pages are left
    /// alone.
    pub fn claim(&self, va: VirtAddr) -> Result<(), VmError> {
        let page_ref = self.spt.find(va).ok_or(VmError::NotMapped(va))?;
        let mut page = page_ref.lock();
        if page.is_destroyed() {
            return Err(VmError::NotMapped(va));
        }
        if page.is_resident() {
            return Ok(());
        }
        self.load_locked(&page_ref, &mut page)
    }

    /// Copy `bytes` into user memory at `va`, faulting pages in as needed.
    pub fn write_bytes(&self, va: VirtAddr, bytes: &[u8]) -> Result<(), FaultError> {
        self.access(va, bytes.len(), true, |chunk, done| {
            chunk.copy_from_slice(&bytes[done..done + chunk.len()]);
        })
    }

    /// Copy user memory at `va` into `buf`, faulting pages in as needed.
    pub fn read_bytes(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), FaultError> {
        let len = buf.len();
        self.access(va, len, false, |chunk, done| {
            buf[done..done + chunk.len()].copy_from_slice(chunk);
        })
    }

    /// Each page is locked while its bytes are copied, so it cannot be
    /// evicted halfway through.
    fn access(
        &self,
        va: VirtAddr,
        len: usize,
        write: bool,
        mut copy: impl FnMut(&mut [u8], usize),
    ) -> Result<(), FaultError> {
        let mut done = 0;
        while done < len {
            let addr = va.checked_add(done).ok_or(FaultError::Unmapped(va))?;
            if !addr.is_user() {
                return Err(FaultError::Unmapped(addr));
            }
            let offset = addr.page_offset();
            let chunk = (PAGE_FRAME_SIZE - offset).min(len - done);

            let page_ref = self.spt.find(addr).ok_or(FaultError::Unmapped(addr))?;
            let mut page = page_ref.lock();
            if page.is_destroyed() {
                return Err(FaultError::Unmapped(addr));
            }
            if write && !page.writable() {
                return Err(FaultError::ReadOnly(addr));
            }
            if !page.is_resident() {
                VmStats::bump(&self.vm().counters().faults);
                self.load_locked(&page_ref, &mut page)
                    .map_err(FaultError::Load)?;
            }
            let Some(frame) = page.frame_mut() else {
                unreachable!("page {} lost its frame while locked", addr);
            };
            copy(&mut frame.as_mut_slice()[offset..offset + chunk], done);
            self.mmu().record_access(addr, write);
            done += chunk;
        }
        Ok(())
    }

    /// Tear the address space down: unmap every mapped file, then destroy
    /// every remaining page.
    pub fn exit(self) {
        let starts: Vec<VirtAddr> = self.mappings.lock().keys().copied().collect();
        for start in starts {
            if let Err(err) = self.unmap_file(start) {
                log::warn!("vm: exit could not unmap {}: {}", start, err);
            }
        }
        self.spt.teardown();
    }
}

fn check_page_va(va: VirtAddr) -> Result<(), VmError> {
    if va.as_usize() == 0 || !va.is_page_aligned() || !va.is_user() {
        return Err(VmError::InvalidMapping);
    }
    Ok(())
}
