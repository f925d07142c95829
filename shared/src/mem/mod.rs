mod addr;

pub use addr::VirtAddr;

use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

/// Number of contiguous disk sectors backing one page-sized swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// The user stack grows down from here.
pub const USER_STACK_TOP: usize = 0x4748_0000;

/// Stack growth is refused once the stack would exceed this size.
pub const MAX_STACK_SIZE: usize = MB;

/// How far below the stack pointer a fault may land and still count as a
/// stack access. `pusha` writes 32 bytes below `esp` before updating it.
pub const STACK_FAULT_SLACK: usize = 32;
