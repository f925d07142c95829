use super::{VmError, VmStats};
use crate::mem::PhysFrame;
use crate::paging::Mmu;
use crate::swapping::{SlotId, SwapTable};
use swapvm_shared::mem::VirtAddr;

/// A page with no backing file.
///
/// While resident the slot is always `None`. While evicted it names the
/// swap slot holding the contents. A page that is neither resident nor
/// swapped has never been written and reads as zeroes.
#[derive(Debug, Default)]
pub struct AnonPage {
    slot: Option<SlotId>,
}

impl AnonPage {
    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    pub(super) fn swap_in(
        &mut self,
        page: &mut [u8],
        swap: &SwapTable,
        stats: &VmStats,
    ) -> Result<(), VmError> {
        let Some(slot) = self.slot else {
            page.fill(0);
            return Ok(());
        };
        swap.read_slot(slot, page)?;
        swap.release_slot(slot);
        self.slot = None;
        VmStats::bump(&stats.swap_ins);
        Ok(())
    }

    /// Move the contents of `frame` to a fresh swap slot.
    ///
    /// The mapping is removed before the write so the process cannot change
    /// the page behind our back. If the write fails the mapping is restored
    /// and the slot freed.
    pub(super) fn swap_out(
        &mut self,
        va: VirtAddr,
        writable: bool,
        frame: &PhysFrame,
        mmu: &dyn Mmu,
        swap: &SwapTable,
        stats: &VmStats,
    ) -> Result<(), VmError> {
        mmu.unmap(va);
        let slot = swap.acquire_slot();
        if let Err(err) = swap.write_slot(slot, frame.as_slice()) {
            swap.release_slot(slot);
            mmu.map(va, frame.number(), writable);
            log::warn!("vm: swap out of {} failed: {}", va, err);
            return Err(err.into());
        }
        log::trace!("vm: {} -> {}", va, slot);
        self.slot = Some(slot);
        VmStats::bump(&stats.swap_outs);
        Ok(())
    }

    pub(super) fn destroy(self, swap: &SwapTable) {
        if let Some(slot) = self.slot {
            swap.release_slot(slot);
        }
    }
}
