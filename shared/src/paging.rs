// https://wiki.osdev.org/Paging

use arbitrary_int::u20;
use bitbybit::bitfield;

/// An x86 (non-PAE) page table entry.
///
/// The accessed and dirty bits are set by the CPU on access; the VM layer
/// reads and clears them to drive replacement and write-back decisions.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user mapping of frame number `frame`.
    ///
    /// # Panics
    ///
    /// Panics if `frame` does not fit in the 20-bit frame field.
    pub fn user_mapping(frame: usize, writable: bool) -> Self {
        let frame = u32::try_from(frame)
            .ok()
            .and_then(|frame| u20::try_new(frame).ok())
            .unwrap_or_else(|| panic!("frame number {frame:#X} does not fit in a PTE"));
        Self::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(frame)
    }

    /// Frame number this entry points at.
    pub fn frame_number(&self) -> usize {
        self.page_frame_address().value() as usize
    }
}
