pub mod tempfs;

use alloc::boxed::Box;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// the underlying device failed
    Io,
    /// no space left on device
    NoSpace,
    /// the per-file open handle limit was reached
    TooManyOpenFiles,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io => write!(f, "input/output error"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::TooManyOpenFiles => write!(f, "too many open files"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// An open regular file, as seen by the VM layer.
///
/// Each handle has its own lifetime; dropping a handle closes it. Handles
/// obtained through [`File::reopen`] refer to the same file but are closed
/// independently of the handle they were reopened from.
pub trait File: Send + Sync {
    /// Read from the file at `offset` into `buf`.
    ///
    /// Returns the number of bytes read, which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    /// Write `buf` to the file at `offset`, growing it if needed.
    ///
    /// Returns the number of bytes written.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;
    /// Size in bytes.
    fn length(&self) -> Result<u64>;
    /// Open a new, independent handle to the same file.
    fn reopen(&self) -> Result<Box<dyn File>>;
}
