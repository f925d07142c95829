//! Fixtures for hosted tests.

use crate::block::{Block, BlockSector};
use crate::drivers::mem_disk::MemDisk;
use crate::mem::FramePool;
use crate::paging::SoftPageTable;
use crate::vm::{AddressSpace, Vm};
use std::sync::Arc;
use swapvm_shared::mem::SECTORS_PER_PAGE;

pub fn swap_disk(slots: usize) -> Block {
    let sectors = BlockSector::try_from(slots * SECTORS_PER_PAGE).unwrap();
    Block::new("swap", sectors, MemDisk::new(sectors))
}

/// A VM with `frames` physical frames and `slots` swap slots.
pub fn vm_with(frames: usize, slots: usize) -> Vm {
    Vm::new(FramePool::new(frames), swap_disk(slots))
}

/// A fresh address space on `vm`, plus its page table for inspection.
pub fn address_space(vm: &Arc<Vm>) -> (AddressSpace, Arc<SoftPageTable>) {
    let mmu = Arc::new(SoftPageTable::new());
    let space = AddressSpace::new(Arc::clone(vm), Arc::clone(&mmu) as _);
    (space, mmu)
}
