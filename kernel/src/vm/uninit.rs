use super::{AnonPage, FilePage, PageKind, PageType, VmError};
use crate::vfs::File;
use alloc::boxed::Box;
use core::fmt;
use swapvm_shared::mem::PAGE_FRAME_SIZE;

/// Up to one page of a file: `length` bytes starting at `offset`.
///
/// The handle is private to the page that holds the slice.
pub struct FileSlice {
    file: Box<dyn File>,
    offset: u64,
    length: usize,
}

impl FileSlice {
    pub fn new(file: Box<dyn File>, offset: u64, length: usize) -> Self {
        assert!(length <= PAGE_FRAME_SIZE, "file slice longer than a page");
        Self {
            file,
            offset,
            length,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub(super) fn into_parts(self) -> (Box<dyn File>, u64, usize) {
        (self.file, self.offset, self.length)
    }

    /// Fill `page` with the slice, zeroing everything past `length`.
    pub(super) fn read_into(&self, page: &mut [u8]) -> Result<(), VmError> {
        read_exact_at(&*self.file, self.offset, &mut page[..self.length])?;
        page[self.length..].fill(0);
        Ok(())
    }
}

pub(super) fn read_exact_at(file: &dyn File, offset: u64, buf: &mut [u8]) -> Result<(), VmError> {
    let actual = file.read_at(offset, buf)?;
    if actual != buf.len() {
        return Err(VmError::ShortRead {
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}

impl fmt::Debug for FileSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSlice")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// How an uninitialized page gets its first contents.
///
/// Runs at most once. On success the page turns into the kind named by
/// [`LazyLoad::target_type`]; on failure it stays uninitialized and the
/// fault can be retried.
#[derive(Debug)]
pub enum LazyLoad {
    /// All zeroes, then anonymous. Used for bss and heap pages.
    Zero,
    /// A slice of an executable, zero-padded, then anonymous: once loaded
    /// the page goes to swap and never back to the executable.
    Segment(FileSlice),
    /// A slice of a memory-mapped file, zero-padded, then file-backed.
    Mmap(FileSlice),
}

impl LazyLoad {
    pub fn target_type(&self) -> PageType {
        match self {
            Self::Zero | Self::Segment(_) => PageType::Anon,
            Self::Mmap(_) => PageType::File,
        }
    }

    pub(super) fn populate(&self, page: &mut [u8]) -> Result<(), VmError> {
        match self {
            Self::Zero => {
                page.fill(0);
                Ok(())
            }
            Self::Segment(slice) | Self::Mmap(slice) => slice.read_into(page),
        }
    }

    /// The kind the page becomes once [`LazyLoad::populate`] succeeded.
    pub(super) fn into_kind(self) -> PageKind {
        match self {
            // The executable handle is closed here.
            Self::Zero | Self::Segment(_) => PageKind::Anon(AnonPage::default()),
            Self::Mmap(slice) => PageKind::File(FilePage::from(slice)),
        }
    }
}
