//! The process-wide table of frames handed to user pages.
//!
//! Eviction runs with the table locked and only ever `try_lock`s the victim
//! page, so a thread that holds a page lock may call into the table without
//! deadlocking against an eviction aimed at that same page. When every
//! resident page is locked, the allocating thread lets go of the table and
//! scans again until one of them is released.

use super::{Page, VmError, VmStats};
use crate::mem::{FrameAllocator, PhysFrame};
use crate::paging::Mmu;
use crate::swapping::page_replacement::{DefaultPolicy, PageReplacementPolicy, Resident};
use crate::swapping::SwapTable;
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use swapvm_shared::mem::VirtAddr;

/// Who a frame currently belongs to.
pub struct FrameOwner {
    pub page: Weak<Mutex<Page>>,
    pub va: VirtAddr,
    pub mmu: Arc<dyn Mmu>,
}

struct FrameEntry {
    owner: FrameOwner,
    queued_at: u64,
}

impl Resident for FrameEntry {
    fn accessed(&self) -> bool {
        self.owner.mmu.is_accessed(self.owner.va)
    }

    fn clear_accessed(&self) {
        self.owner.mmu.set_accessed(self.owner.va, false);
    }

    fn queued_at(&self) -> u64 {
        self.queued_at
    }
}

struct Frames<P> {
    allocator: Box<dyn FrameAllocator>,
    /// Keyed by frame number.
    frames: BTreeMap<usize, FrameEntry>,
    policy: P,
    next_seq: u64,
}

impl<P: PageReplacementPolicy> Frames<P> {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Push one resident page out and return its frame to the allocator.
    ///
    /// Returns `Ok(false)` if every candidate was locked by its owner, in
    /// which case the caller must drop the table lock and try again.
    fn evict_one(&mut self, swap: &SwapTable, stats: &VmStats) -> Result<bool, VmError> {
        // Every frame gets a chance to lose its accessed bit and then be
        // picked; anything beyond that means every owner is busy or gone.
        let attempts = 2 * self.frames.len() + 1;
        let mut busy = false;
        for _ in 0..attempts {
            let Some(number) = self.policy.select_victim(&self.frames) else {
                break;
            };
            let Some(entry) = self.frames.get(&number) else {
                break;
            };
            let page = entry.owner.page.upgrade();
            let mmu = Arc::clone(&entry.owner.mmu);

            let Some(page) = page else {
                log::warn!("vm: frame {} outlived its page", number);
                self.requeue(number);
                continue;
            };
            // Held by a fault, a user copy or a teardown.
            let Some(mut victim) = page.try_lock() else {
                busy = true;
                self.requeue(number);
                continue;
            };

            log::trace!("vm: evicting {} from frame {}", victim.va(), number);
            let frame = victim.swap_out(&*mmu, swap, stats)?;
            drop(victim);
            self.frames.remove(&number);
            self.allocator.free(frame);
            VmStats::bump(&stats.evictions);
            return Ok(true);
        }
        if busy {
            return Ok(false);
        }
        panic!(
            "vm: no evictable frame among {} resident frames",
            self.frames.len()
        );
    }

    fn requeue(&mut self, number: usize) {
        let seq = self.next_seq();
        if let Some(entry) = self.frames.get_mut(&number) {
            entry.queued_at = seq;
        }
    }
}

pub struct FrameTable<P = DefaultPolicy> {
    inner: Mutex<Frames<P>>,
}

impl FrameTable {
    pub fn new(allocator: impl FrameAllocator + 'static) -> Self {
        Self::with_policy(allocator)
    }
}

impl<P: PageReplacementPolicy> FrameTable<P> {
    pub fn with_policy(allocator: impl FrameAllocator + 'static) -> Self {
        Self {
            inner: Mutex::new(Frames {
                allocator: Box::new(allocator),
                frames: BTreeMap::new(),
                policy: P::default(),
                next_seq: 0,
            }),
        }
    }

    /// Hand out a zeroed frame for `owner`, evicting some other page first
    /// if none is free.
    ///
    /// The caller holds the lock of the owner page and has not yet bound the
    /// frame to it. If every resident page is locked, this spins until one
    /// of them is released.
    pub fn allocate(
        &self,
        owner: FrameOwner,
        swap: &SwapTable,
        stats: &VmStats,
    ) -> Result<PhysFrame, VmError> {
        loop {
            let mut table = self.inner.lock();
            let frame = match table.allocator.alloc_zeroed() {
                Some(frame) => frame,
                None => {
                    if !table.evict_one(swap, stats)? {
                        drop(table);
                        core::hint::spin_loop();
                        continue;
                    }
                    let Some(frame) = table.allocator.alloc_zeroed() else {
                        panic!("vm: eviction did not free a frame");
                    };
                    frame
                }
            };
            let queued_at = table.next_seq();
            let previous = table
                .frames
                .insert(frame.number(), FrameEntry { owner, queued_at });
            assert!(previous.is_none(), "frame {} handed out twice", frame.number());
            return Ok(frame);
        }
    }

    pub fn release(&self, frame: PhysFrame) {
        let mut table = self.inner.lock();
        let entry = table.frames.remove(&frame.number());
        assert!(entry.is_some(), "frame {} released but not owned", frame.number());
        table.allocator.free(frame);
    }

    /// `(frame number, owner address)` of every frame in use, by frame number.
    pub fn resident(&self) -> Vec<(usize, VirtAddr)> {
        self.inner
            .lock()
            .frames
            .iter()
            .map(|(&number, entry)| (number, entry.owner.va))
            .collect()
    }

    pub fn resident_count(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().allocator.capacity()
    }
}
