use super::{OFFSET, PAGE_FRAME_SIZE};
use core::fmt;
use core::ops::{Add, Sub};

/// A virtual address in some address space.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Rounds down to the start of the containing page.
    pub const fn page_round_down(self) -> Self {
        Self(self.0 & !(PAGE_FRAME_SIZE - 1))
    }

    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_FRAME_SIZE - 1)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Virtual page number.
    pub const fn page_number(self) -> usize {
        self.0 / PAGE_FRAME_SIZE
    }

    pub const fn is_user(self) -> bool {
        self.0 < OFFSET
    }

    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;

    fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl Sub<usize> for VirtAddr {
    type Output = Self;

    fn sub(self, bytes: usize) -> Self {
        Self(self.0 - bytes)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VirtAddr({:#X})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}
