use crate::sync::Mutex;
use crate::vfs::{Error, File, Result};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cmp::min;
use core::sync::atomic::{AtomicUsize, Ordering};

struct TempINode {
    data: Mutex<Vec<u8>>,
    open_handles: AtomicUsize,
    write_calls: AtomicUsize,
    reopens_left: AtomicUsize,
}

/// An open handle to an in-memory file.
///
/// Every handle reopened from a `TempFile` shares its data. The inode keeps
/// count of open handles and write calls so callers can observe closes and
/// write-back traffic.
pub struct TempFile {
    inode: Arc<TempINode>,
}

impl TempFile {
    /// Create a file holding `contents` and open a handle to it.
    pub fn new(contents: &[u8]) -> Self {
        Self::open(Arc::new(TempINode {
            data: Mutex::new(contents.to_vec()),
            open_handles: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            reopens_left: AtomicUsize::new(usize::MAX),
        }))
    }

    fn open(inode: Arc<TempINode>) -> Self {
        inode.open_handles.fetch_add(1, Ordering::Relaxed);
        Self { inode }
    }

    /// Snapshot of the file's current data.
    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }

    /// Handles to this file that have not been closed, including this one.
    pub fn open_handles(&self) -> usize {
        self.inode.open_handles.load(Ordering::Relaxed)
    }

    /// Number of `write_at` calls made through any handle.
    pub fn write_calls(&self) -> usize {
        self.inode.write_calls.load(Ordering::Relaxed)
    }

    /// Allow only `count` more successful reopens of this file.
    pub fn limit_reopens(&self, count: usize) {
        self.inode.reopens_left.store(count, Ordering::Relaxed);
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        self.inode.open_handles.fetch_sub(1, Ordering::Relaxed);
    }
}

impl File for TempFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.inode.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let n = min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let start = usize::try_from(offset).map_err(|_| Error::NoSpace)?;
        let end = start.checked_add(buf.len()).ok_or(Error::NoSpace)?;
        let mut data = self.inode.data.lock();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.inode.write_calls.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn length(&self) -> Result<u64> {
        Ok(self.inode.data.lock().len() as u64)
    }

    fn reopen(&self) -> Result<Box<dyn File>> {
        self.inode
            .reopens_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
            .map_err(|_| Error::TooManyOpenFiles)?;
        Ok(Box::new(Self::open(Arc::clone(&self.inode))))
    }
}
