use alloc::boxed::Box;
use alloc::vec;
use bitbybit::bitfield;
use core::ptr::NonNull;
use core::slice;
use swapvm_shared::mem::PAGE_FRAME_SIZE;

/// A page-sized region of physical memory, reachable through its kernel
/// virtual address.
///
/// A `PhysFrame` is the only handle to its memory until it is given back to
/// the allocator that produced it, so it is deliberately not `Clone`.
#[derive(Debug)]
pub struct PhysFrame {
    number: usize,
    kva: NonNull<u8>,
}

// SAFETY: The frame's memory is owned exclusively by whoever holds the handle.
unsafe impl Send for PhysFrame {}
unsafe impl Sync for PhysFrame {}

impl PhysFrame {
    /// # Safety
    ///
    /// `kva` must point to `PAGE_FRAME_SIZE` bytes that nothing else accesses
    /// until the frame is freed, and `number` must identify those bytes.
    pub unsafe fn new(number: usize, kva: NonNull<u8>) -> Self {
        Self { number, kva }
    }

    /// Stable physical frame number.
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: Exclusive, page-sized and live for as long as `self` is.
        unsafe { slice::from_raw_parts(self.kva.as_ptr(), PAGE_FRAME_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: Exclusive, page-sized and live for as long as `self` is.
        unsafe { slice::from_raw_parts_mut(self.kva.as_ptr(), PAGE_FRAME_SIZE) }
    }
}

/// The raw physical frame allocator the VM layer draws on.
///
/// # Safety
///
/// Implementations must hand out every frame at most once until it is freed,
/// and the memory behind each [`PhysFrame`] must stay valid while allocated.
pub unsafe trait FrameAllocator: Send {
    /// Allocate one zero-filled frame, or `None` if physical memory is exhausted.
    fn alloc_zeroed(&mut self) -> Option<PhysFrame>;

    /// Return a frame previously produced by this allocator.
    fn free(&mut self, frame: PhysFrame);

    /// Total frames managed.
    fn capacity(&self) -> usize;

    /// Frames currently handed out.
    fn in_use(&self) -> usize;
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

#[repr(C, align(4096))]
struct PageBuf([u8; PAGE_FRAME_SIZE]);

/// A next-fit frame allocator over a contiguous run of frames, with one
/// coremap entry per frame.
pub struct FramePool {
    start: NonNull<u8>,
    core_map: Box<[CoreMapEntry]>,
    frames_allocated: usize,
    /// The next frame number to start searching for free frames.
    position: usize,
    /// Keeps the memory alive when the pool allocated it itself.
    _arena: Option<Box<[PageBuf]>>,
}

// SAFETY: The pool owns (or was given exclusive use of) the memory it manages.
unsafe impl Send for FramePool {}

impl FramePool {
    /// A pool of `frames` frames carved out of the kernel heap.
    pub fn new(frames: usize) -> Self {
        let mut arena: Box<[PageBuf]> = (0..frames)
            .map(|_| PageBuf([0; PAGE_FRAME_SIZE]))
            .collect();
        let start = NonNull::from(&mut *arena).cast::<u8>();
        Self {
            start,
            core_map: vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
            frames_allocated: 0,
            position: 0,
            _arena: Some(arena),
        }
    }

    /// A pool managing `frames` frames of memory starting at `start`.
    ///
    /// # Safety
    ///
    /// `start + frames * PAGE_FRAME_SIZE` must be within bounds, page aligned,
    /// and not used by anything else for the lifetime of the pool.
    pub unsafe fn from_raw(start: NonNull<u8>, frames: usize) -> Self {
        Self {
            start,
            core_map: vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
            frames_allocated: 0,
            position: 0,
            _arena: None,
        }
    }

    fn find_free(&self) -> Option<usize> {
        let total_frames = self.core_map.len();
        (0..total_frames)
            .map(|i| (self.position + i) % total_frames)
            .find(|&frame| !self.core_map[frame].allocated())
    }
}

// SAFETY: The coremap guarantees each frame is handed out once until freed.
unsafe impl FrameAllocator for FramePool {
    fn alloc_zeroed(&mut self) -> Option<PhysFrame> {
        let number = self.find_free()?;
        self.core_map[number] = self.core_map[number].with_allocated(true);
        self.position = (number + 1) % self.core_map.len();
        self.frames_allocated += 1;

        // SAFETY: `number` is within the pool and was free until now.
        let mut frame = unsafe {
            PhysFrame::new(number, self.start.add(number * PAGE_FRAME_SIZE))
        };
        frame.as_mut_slice().fill(0);
        Some(frame)
    }

    fn free(&mut self, frame: PhysFrame) {
        let number = frame.number();
        assert!(
            number < self.core_map.len() && self.core_map[number].allocated(),
            "freeing frame {number} which is not allocated"
        );
        self.core_map[number] = self.core_map[number].with_allocated(false);
        self.frames_allocated -= 1;
    }

    fn capacity(&self) -> usize {
        self.core_map.len()
    }

    fn in_use(&self) -> usize {
        self.frames_allocated
    }
}
