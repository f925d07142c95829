//! A demand-paging virtual memory manager for a small teaching kernel.
//!
//! The hardware-facing pieces (frame allocator, page table, disks, files)
//! sit behind traits so the same code runs in the kernel and in hosted
//! tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod vfs;
pub mod vm;

#[cfg(test)]
mod testing;
