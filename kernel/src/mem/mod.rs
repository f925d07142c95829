pub mod frame_allocator;

pub use frame_allocator::{FrameAllocator, FramePool, PhysFrame};
