//! File-backed pages and the `mmap` regions built from them.

use super::uninit::read_exact_at;
use super::{AddressSpace, FileSlice, LazyLoad, Page, VmError, VmStats};
use crate::mem::PhysFrame;
use crate::paging::Mmu;
use crate::vfs::File;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use swapvm_shared::mem::{VirtAddr, OFFSET, PAGE_FRAME_SIZE};

/// A page backed by `length` bytes of a file at `offset`. Bytes past
/// `length` read as zero and are never written back.
pub struct FilePage {
    file: Box<dyn File>,
    offset: u64,
    length: usize,
}

impl From<FileSlice> for FilePage {
    fn from(slice: FileSlice) -> Self {
        let (file, offset, length) = slice.into_parts();
        Self {
            file,
            offset,
            length,
        }
    }
}

impl fmt::Debug for FilePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePage")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl FilePage {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub(super) fn swap_in(&self, page: &mut [u8], stats: &VmStats) -> Result<(), VmError> {
        read_exact_at(&*self.file, self.offset, &mut page[..self.length])?;
        page[self.length..].fill(0);
        VmStats::bump(&stats.swap_ins);
        Ok(())
    }

    /// Drop the mapping, writing the valid prefix back first if it is dirty.
    /// On a failed write the mapping and its dirty bit are restored.
    pub(super) fn swap_out(
        &self,
        va: VirtAddr,
        writable: bool,
        frame: &PhysFrame,
        mmu: &dyn Mmu,
        stats: &VmStats,
    ) -> Result<(), VmError> {
        let dirty = mmu.is_dirty(va);
        mmu.unmap(va);
        if dirty {
            if let Err(err) = self.write_back(frame, stats) {
                mmu.map(va, frame.number(), writable);
                mmu.set_dirty(va, true);
                log::warn!("vm: write back of {} failed: {}", va, err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Write back if resident and dirty. The handle closes when `self` drops.
    pub(super) fn destroy(
        self,
        va: VirtAddr,
        frame: Option<&PhysFrame>,
        mmu: &dyn Mmu,
        stats: &VmStats,
    ) {
        let Some(frame) = frame else { return };
        if mmu.is_dirty(va) {
            if let Err(err) = self.write_back(frame, stats) {
                log::error!("vm: lost dirty page {} on unmap: {}", va, err);
            }
        }
    }

    fn write_back(&self, frame: &PhysFrame, stats: &VmStats) -> Result<(), VmError> {
        let actual = self
            .file
            .write_at(self.offset, &frame.as_slice()[..self.length])?;
        if actual != self.length {
            return Err(VmError::ShortWrite {
                expected: self.length,
                actual,
            });
        }
        VmStats::bump(&stats.write_backs);
        Ok(())
    }
}

/// One successful `mmap`: the pages `start..start + length` and the handle
/// the region holds open for as long as it exists.
pub struct MappedRegion {
    start: VirtAddr,
    length: usize,
    _file: Box<dyn File>,
}

impl MappedRegion {
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn page_count(&self) -> usize {
        self.length.div_ceil(PAGE_FRAME_SIZE)
    }

    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        (0..self.page_count()).map(|i| self.start + i * PAGE_FRAME_SIZE)
    }
}

impl AddressSpace {
    /// Map `length` bytes of `file` starting at `offset` to `addr`.
    ///
    /// Nothing is read until the pages fault. The region and each of its
    /// pages get their own handle, so the caller may close `file` right
    /// away. Either every page is registered or none is.
    pub fn map_file(
        &self,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: &dyn File,
        offset: u64,
    ) -> Result<VirtAddr, VmError> {
        if length == 0
            || addr.as_usize() == 0
            || !addr.is_page_aligned()
            || offset % PAGE_FRAME_SIZE as u64 != 0
        {
            return Err(VmError::InvalidMapping);
        }
        let end = addr.checked_add(length).ok_or(VmError::InvalidMapping)?;
        if end.as_usize() > OFFSET {
            return Err(VmError::InvalidMapping);
        }
        // The last byte of the region must still have a file offset.
        u64::try_from(length)
            .ok()
            .and_then(|length| offset.checked_add(length))
            .ok_or(VmError::InvalidMapping)?;
        if file.length()? == 0 {
            return Err(VmError::InvalidMapping);
        }
        if !self.spt.is_range_free(addr, length) {
            return Err(VmError::AlreadyMapped(addr));
        }

        let region_file = file.reopen()?;
        let page_count = length.div_ceil(PAGE_FRAME_SIZE);
        let mut pages = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let done = i * PAGE_FRAME_SIZE;
            // Pages built so far close their handles when `pages` drops.
            let handle = file.reopen()?;
            let slice = FileSlice::new(
                handle,
                offset + done as u64,
                (length - done).min(PAGE_FRAME_SIZE),
            );
            pages.push(Page::new_uninit(addr + done, writable, LazyLoad::Mmap(slice)));
        }
        self.spt.insert_all(pages)?;

        log::debug!("vm: mapped {} pages at {}", page_count, addr);
        self.mappings.lock().insert(
            addr,
            MappedRegion {
                start: addr,
                length,
                _file: region_file,
            },
        );
        Ok(addr)
    }

    /// Undo the [`AddressSpace::map_file`] that returned `addr`, writing
    /// dirty pages back and closing every handle the region opened.
    pub fn unmap_file(&self, addr: VirtAddr) -> Result<(), VmError> {
        let region = self
            .mappings
            .lock()
            .remove(&addr)
            .ok_or(VmError::NotMapped(addr))?;
        for va in region.pages() {
            if self.spt.remove(va).is_err() {
                log::warn!("vm: mapped page {} was already gone", va);
            }
        }
        log::debug!("vm: unmapped {} pages at {}", region.page_count(), addr);
        Ok(())
    }

    /// `(start, length)` of every live mapping, lowest first.
    pub fn mapped_regions(&self) -> Vec<(VirtAddr, usize)> {
        self.mappings
            .lock()
            .values()
            .map(|region| (region.start, region.length))
            .collect()
    }
}
