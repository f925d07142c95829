use super::*;
use crate::block::{Block, BlockOp, BlockSector};
use crate::mem::FramePool;
use crate::paging::Mmu;
use crate::testing::{address_space, vm_with};
use crate::vfs::tempfs::TempFile;
use crate::vfs::File;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use swapvm_shared::mem::{VirtAddr, MAX_STACK_SIZE, PAGE_FRAME_SIZE, USER_STACK_TOP};

const PAGE: usize = PAGE_FRAME_SIZE;
const BASE: VirtAddr = VirtAddr::new(0x1000_0000);

fn page_va(i: usize) -> VirtAddr {
    BASE + i * PAGE
}

/// Distinct, recognizable contents for page `i`.
fn pattern(i: usize) -> Vec<u8> {
    let mut page = vec![(i % 251) as u8; PAGE];
    page[..8].copy_from_slice(&(i as u64).to_le_bytes());
    page[PAGE - 8..].copy_from_slice(&(!i as u64).to_le_bytes());
    page
}

fn read_page(space: &AddressSpace, va: VirtAddr) -> Vec<u8> {
    let mut buf = vec![0; PAGE];
    space.read_bytes(va, &mut buf).unwrap();
    buf
}

fn fault(addr: VirtAddr, write: bool) -> PageFault {
    PageFault {
        addr,
        write,
        not_present: true,
        user: true,
        stack_pointer: VirtAddr::new(USER_STACK_TOP),
    }
}

fn page_type(space: &AddressSpace, va: VirtAddr) -> PageType {
    space.spt().find(va).unwrap().lock().page_type()
}

#[test]
fn twenty_megabytes_of_anonymous_memory_round_trip_through_swap() {
    let pages = 20 * 1024 * 1024 / PAGE;
    let vm = Arc::new(vm_with(64, pages + 16));
    let (space, _) = address_space(&vm);

    for i in 0..pages {
        space.alloc_anon(page_va(i), true).unwrap();
        space.write_bytes(page_va(i), &pattern(i)).unwrap();
    }
    assert!(vm.swap().slots_in_use() >= pages - 64);

    for i in 0..pages {
        assert_eq!(read_page(&space, page_va(i)), pattern(i), "page {i}");
    }
    let stats = vm.stats();
    assert!(stats.swap_outs >= pages - 64);
    assert!(stats.swap_ins >= pages - 64);

    space.exit();
    assert!(vm.shutdown());
}

#[test]
fn swap_slots_are_never_shared() {
    let vm = Arc::new(vm_with(4, 64));
    let (space, _) = address_space(&vm);
    for i in 0..40 {
        space.alloc_anon(page_va(i), true).unwrap();
        space.write_bytes(page_va(i), &pattern(i)).unwrap();
    }
    for i in (0..40).step_by(3) {
        assert_eq!(read_page(&space, page_va(i)), pattern(i));
    }

    let slots: Vec<_> = (0..40)
        .filter_map(|i| space.spt().find(page_va(i)).unwrap().lock().swap_slot())
        .collect();
    let unique: HashSet<_> = slots.iter().copied().collect();
    assert_eq!(unique.len(), slots.len());
    assert_eq!(slots.len(), vm.swap().slots_in_use());
    assert_eq!(slots.len() + vm.frames().resident_count(), 40);
}

#[test]
fn a_resident_page_has_no_slot_and_a_swapped_page_no_frame() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, _) = address_space(&vm);
    for i in 0..6 {
        space.alloc_anon(page_va(i), true).unwrap();
        space.write_bytes(page_va(i), &pattern(i)).unwrap();
    }
    for i in 0..6 {
        let page = space.spt().find(page_va(i)).unwrap();
        let page = page.lock();
        assert!(page.is_resident() != page.swap_slot().is_some(), "page {i}");
    }
}

#[test]
fn threads_sharing_frames_never_share_a_frame() {
    let vm = Arc::new(vm_with(16, 256));
    let workers: Vec<_> = (0..4)
        .map(|t| {
            let vm = Arc::clone(&vm);
            thread::spawn(move || {
                let (space, _) = address_space(&vm);
                for round in 0..3 {
                    for i in 0..32 {
                        let va = page_va(i);
                        if round == 0 {
                            space.alloc_anon(va, true).unwrap();
                        }
                        space.write_bytes(va, &pattern(t * 1000 + i + round)).unwrap();
                    }
                    for i in 0..32 {
                        assert_eq!(read_page(&space, page_va(i)), pattern(t * 1000 + i + round));
                    }
                }
                space
            })
        })
        .collect();
    let spaces: Vec<AddressSpace> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let mut owners = HashSet::new();
    for space in &spaces {
        for va in space.spt().addresses() {
            if let Some(frame) = space.spt().find(va).unwrap().lock().frame_number() {
                assert!(owners.insert(frame), "frame {frame} has two owners");
            }
        }
    }
    assert_eq!(owners.len(), vm.frames().resident_count());

    drop(spaces);
    assert!(vm.shutdown());
}

#[test]
fn threads_of_one_process_fault_concurrently() {
    let vm = Arc::new(vm_with(8, 128));
    let (space, _) = address_space(&vm);
    let space = Arc::new(space);
    for i in 0..64 {
        space.alloc_anon(page_va(i), true).unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let space = Arc::clone(&space);
            thread::spawn(move || {
                for i in (t..64).step_by(4) {
                    space.write_bytes(page_va(i), &pattern(i)).unwrap();
                }
                // Everyone also reads the shared pages.
                for i in 0..64 {
                    let mut head = [0; 8];
                    space.read_bytes(page_va(i), &mut head).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    for i in 0..64 {
        assert_eq!(read_page(&space, page_va(i)), pattern(i));
    }
}

#[test]
fn zero_pages_read_as_zero_without_touching_swap() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, mmu) = address_space(&vm);
    space.alloc_lazy(page_va(0), true, LazyLoad::Zero).unwrap();
    assert_eq!(page_type(&space, page_va(0)), PageType::Uninit);

    space.handle_fault(&fault(page_va(0) + 12, false)).unwrap();
    assert_eq!(page_type(&space, page_va(0)), PageType::Anon);
    assert!(mmu.translate(page_va(0)).is_some());
    assert_eq!(read_page(&space, page_va(0)), vec![0; PAGE]);
    assert_eq!(vm.swap().disk_traffic(), (0, 0));
}

#[test]
fn faulting_a_resident_page_again_is_harmless() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, mmu) = address_space(&vm);
    space.alloc_anon(page_va(0), true).unwrap();
    space.handle_fault(&fault(page_va(0), true)).unwrap();
    let frame = mmu.translate(page_va(0));
    space.handle_fault(&fault(page_va(0), true)).unwrap();
    assert_eq!(mmu.translate(page_va(0)), frame);
    assert_eq!(vm.frames().resident_count(), 1);
    space.claim(page_va(0)).unwrap();
    assert_eq!(vm.frames().resident_count(), 1);
}

#[test]
fn faults_outside_any_page_are_rejected() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, _) = address_space(&vm);
    assert_eq!(
        space.handle_fault(&fault(page_va(3), false)),
        Err(FaultError::Unmapped(page_va(3)))
    );
    let kernel = VirtAddr::new(0xC000_0000);
    assert_eq!(
        space.handle_fault(&fault(kernel, false)),
        Err(FaultError::Unmapped(kernel))
    );
    assert_eq!(
        space.handle_fault(&fault(VirtAddr::new(0), false)),
        Err(FaultError::Unmapped(VirtAddr::new(0)))
    );
    assert_eq!(space.claim(page_va(3)), Err(VmError::NotMapped(page_va(3))));
}

#[test]
fn writes_to_read_only_pages_are_rejected() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, mmu) = address_space(&vm);
    space.alloc_anon(page_va(0), false).unwrap();

    assert_eq!(
        space.handle_fault(&fault(page_va(0), true)),
        Err(FaultError::ReadOnly(page_va(0)))
    );
    assert_eq!(
        space.write_bytes(page_va(0) + 5, b"no"),
        Err(FaultError::ReadOnly(page_va(0) + 5))
    );

    space.handle_fault(&fault(page_va(0), false)).unwrap();
    assert!(!mmu.is_writable(page_va(0)));
    let protection = PageFault {
        not_present: false,
        ..fault(page_va(0), true)
    };
    assert_eq!(
        space.handle_fault(&protection),
        Err(FaultError::ReadOnly(page_va(0)))
    );
}

#[test]
fn stack_grows_only_just_below_the_stack_pointer() {
    let vm = Arc::new(vm_with(4, 8));
    let (space, _) = address_space(&vm);
    let top = VirtAddr::new(USER_STACK_TOP);
    let sp = top - 100;

    let push = PageFault {
        stack_pointer: sp,
        ..fault(sp - 4, true)
    };
    space.handle_fault(&push).unwrap();
    assert_eq!(page_type(&space, sp), PageType::Anon);
    assert_eq!(vm.stats().stack_growths, 1);

    // pusha writes 32 bytes below sp before moving it.
    let sp = top - PAGE - 8;
    let pusha = PageFault {
        stack_pointer: sp,
        ..fault(sp - 32, true)
    };
    space.handle_fault(&pusha).unwrap();
    assert_eq!(vm.stats().stack_growths, 2);

    let wild = PageFault {
        stack_pointer: sp,
        ..fault(sp - 33 - PAGE, true)
    };
    assert!(matches!(space.handle_fault(&wild), Err(FaultError::Unmapped(_))));

    let floor = top - MAX_STACK_SIZE;
    let too_deep = PageFault {
        stack_pointer: floor - 16,
        ..fault(floor - 8, true)
    };
    assert!(matches!(space.handle_fault(&too_deep), Err(FaultError::Unmapped(_))));
    assert_eq!(vm.stats().stack_growths, 2);
}

#[test]
fn stack_access_heuristic() {
    let top = VirtAddr::new(USER_STACK_TOP);
    assert!(is_stack_access(top - 1, top - 1));
    assert!(is_stack_access(top - 64, top - 32));
    assert!(!is_stack_access(top - 65, top - 32));
    assert!(!is_stack_access(top, top));
    assert!(is_stack_access(top - MAX_STACK_SIZE, top - MAX_STACK_SIZE));
    assert!(!is_stack_access(top - MAX_STACK_SIZE - 1, top - MAX_STACK_SIZE - 1));
    assert!(!is_stack_access(VirtAddr::new(4), VirtAddr::new(8)));
}

#[test]
fn a_failed_load_gives_the_frame_back() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, mmu) = address_space(&vm);
    let exe = TempFile::new(&[7; 10]);
    let slice = FileSlice::new(exe.reopen().unwrap(), 0, 100);
    space.alloc_lazy(page_va(0), true, LazyLoad::Segment(slice)).unwrap();

    let short = VmError::ShortRead {
        expected: 100,
        actual: 10,
    };
    assert_eq!(space.claim(page_va(0)), Err(short));
    assert_eq!(
        space.handle_fault(&fault(page_va(0), false)),
        Err(FaultError::Load(short))
    );
    assert_eq!(vm.frames().resident_count(), 0);
    assert_eq!(mmu.mapped_pages(), 0);
    assert_eq!(page_type(&space, page_va(0)), PageType::Uninit);
}

#[test]
fn executable_pages_go_to_swap_never_back_to_the_file() {
    let vm = Arc::new(vm_with(1, 8));
    let (space, _) = address_space(&vm);
    let exe = TempFile::new(&pattern(5)[..PAGE - 100]);
    let slice = FileSlice::new(exe.reopen().unwrap(), 0, PAGE - 100);
    space.alloc_lazy(page_va(0), true, LazyLoad::Segment(slice)).unwrap();
    assert_eq!(exe.open_handles(), 2);

    let mut expected = pattern(5);
    expected[PAGE - 100..].fill(0);
    assert_eq!(read_page(&space, page_va(0)), expected);
    // Loaded once; the page no longer needs the executable.
    assert_eq!(page_type(&space, page_va(0)), PageType::Anon);
    assert_eq!(exe.open_handles(), 1);

    space.write_bytes(page_va(0), b"patched").unwrap();
    expected[..7].copy_from_slice(b"patched");

    space.alloc_anon(page_va(1), true).unwrap();
    space.write_bytes(page_va(1), b"evict").unwrap();
    assert!(space.spt().find(page_va(0)).unwrap().lock().swap_slot().is_some());
    assert_eq!(exe.write_calls(), 0);

    assert_eq!(read_page(&space, page_va(0)), expected);
    assert_eq!(exe.write_calls(), 0);
}

#[test]
fn overlapping_mappings_are_refused_whole() {
    let vm = Arc::new(vm_with(4, 8));
    let (space, _) = address_space(&vm);
    let file = TempFile::new(&[1; 3 * PAGE]);

    space.map_file(page_va(2), 3 * PAGE, true, &file, 0).unwrap();
    assert_eq!(space.spt().len(), 3);
    assert_eq!(file.open_handles(), 5);

    assert_eq!(
        space.map_file(page_va(0), 3 * PAGE, true, &file, 0),
        Err(VmError::AlreadyMapped(page_va(0)))
    );
    space.alloc_anon(page_va(7), true).unwrap();
    assert_eq!(
        space.map_file(page_va(5), 3 * PAGE, true, &file, 0),
        Err(VmError::AlreadyMapped(page_va(5)))
    );
    assert_eq!(space.spt().len(), 4);
    assert_eq!(file.open_handles(), 5);
    assert_eq!(space.mapped_regions(), vec![(page_va(2), 3 * PAGE)]);
}

#[test]
fn a_mapping_that_fails_midway_leaves_nothing_behind() {
    let vm = Arc::new(vm_with(4, 8));
    let (space, _) = address_space(&vm);
    let file = TempFile::new(&[1; 4 * PAGE]);
    // The region handle and two page handles, then the third page fails.
    file.limit_reopens(3);

    assert_eq!(
        space.map_file(page_va(0), 4 * PAGE, true, &file, 0),
        Err(VmError::File(crate::vfs::Error::TooManyOpenFiles))
    );
    assert!(space.spt().is_empty());
    assert!(space.mapped_regions().is_empty());
    assert_eq!(file.open_handles(), 1);
}

#[test]
fn malformed_mappings_are_rejected() {
    let vm = Arc::new(vm_with(4, 8));
    let (space, _) = address_space(&vm);
    let file = TempFile::new(&[1; PAGE]);
    let empty = TempFile::new(&[]);

    let invalid = Err(VmError::InvalidMapping);
    assert_eq!(space.map_file(page_va(0), 0, true, &file, 0), invalid);
    assert_eq!(space.map_file(page_va(0) + 1, PAGE, true, &file, 0), invalid);
    assert_eq!(space.map_file(VirtAddr::new(0), PAGE, true, &file, 0), invalid);
    assert_eq!(space.map_file(page_va(0), PAGE, true, &file, 12), invalid);
    assert_eq!(space.map_file(page_va(0), PAGE, true, &empty, 0), invalid);
    assert_eq!(
        space.map_file(VirtAddr::new(0xC000_0000), PAGE, true, &file, 0),
        invalid
    );
    assert_eq!(
        space.map_file(VirtAddr::new(0x7FFF_F000), 2 * PAGE, true, &file, 0),
        invalid
    );
    // File offsets past the end of the offset space.
    let last = u64::MAX - (PAGE as u64 - 1);
    assert_eq!(space.map_file(page_va(0), 2 * PAGE, true, &file, last), invalid);
    assert_eq!(space.map_file(page_va(0), PAGE, true, &file, last), invalid);
    assert!(space.spt().is_empty());
    assert_eq!(file.open_handles(), 1);
}

#[test]
fn unaligned_or_kernel_page_addresses_are_rejected() {
    let vm = Arc::new(vm_with(4, 8));
    let (space, _) = address_space(&vm);
    let invalid = Err(VmError::InvalidMapping);

    assert_eq!(space.alloc_anon(page_va(0) + 1, true), invalid);
    assert_eq!(space.alloc_anon(VirtAddr::new(0), true), invalid);
    assert_eq!(space.alloc_anon(VirtAddr::new(0xC000_0000), true), invalid);
    assert_eq!(space.alloc_lazy(page_va(1) + 12, true, LazyLoad::Zero), invalid);

    let exe = TempFile::new(&[7; PAGE]);
    let slice = FileSlice::new(exe.reopen().unwrap(), 0, PAGE);
    assert_eq!(
        space.alloc_lazy(page_va(2) + 100, false, LazyLoad::Segment(slice)),
        invalid
    );
    assert_eq!(exe.open_handles(), 1);
    assert!(space.spt().is_empty());

    space.alloc_anon(page_va(0), true).unwrap();
    assert_eq!(space.spt().addresses().len(), 1);
}

#[test]
fn only_dirty_pages_are_written_back_on_unmap() {
    let vm = Arc::new(vm_with(4, 8));
    let (space, _) = address_space(&vm);
    let mut data = vec![b'a'; PAGE];
    data.extend_from_slice(&[b'b'; 100]);
    let file = TempFile::new(&data);

    let addr = space.map_file(page_va(0), data.len(), true, &file, 0).unwrap();
    assert_eq!(page_type(&space, addr), PageType::Uninit);
    space.write_bytes(addr + 10, b"XYZ").unwrap();
    assert_eq!(page_type(&space, addr), PageType::File);
    let mut tail = [0; 100];
    space.read_bytes(addr + PAGE, &mut tail).unwrap();
    assert_eq!(tail, [b'b'; 100]);
    assert_eq!(file.write_calls(), 0);

    space.unmap_file(addr).unwrap();
    assert_eq!(file.write_calls(), 1);
    assert_eq!(&file.contents()[8..14], b"aaXYZa");
    assert_eq!(file.contents().len(), data.len());
    assert!(space.spt().is_empty());
    assert_eq!(file.open_handles(), 1);
    assert_eq!(vm.frames().resident_count(), 0);
    assert_eq!(vm.stats().write_backs, 1);
}

#[test]
fn clean_mapped_pages_are_never_written() {
    let vm = Arc::new(vm_with(1, 8));
    let (space, _) = address_space(&vm);
    let file = TempFile::new(&pattern(3));
    space.map_file(page_va(0), PAGE, false, &file, 0).unwrap();

    assert_eq!(read_page(&space, page_va(0)), pattern(3));
    // Evict it, bring it back from the file, unmap.
    space.alloc_anon(page_va(1), true).unwrap();
    space.claim(page_va(1)).unwrap();
    assert_eq!(read_page(&space, page_va(0)), pattern(3));
    space.unmap_file(page_va(0)).unwrap();

    assert_eq!(file.write_calls(), 0);
    assert_eq!(vm.swap().slots_in_use(), 1);
}

#[test]
fn dirty_mapped_pages_are_written_back_on_eviction() {
    let vm = Arc::new(vm_with(1, 8));
    let (space, _) = address_space(&vm);
    let file = TempFile::new(&[0; PAGE]);
    space.map_file(page_va(0), PAGE, true, &file, 0).unwrap();
    space.write_bytes(page_va(0) + 100, b"dirty").unwrap();

    space.alloc_anon(page_va(1), true).unwrap();
    space.write_bytes(page_va(1), b"evict").unwrap();
    assert_eq!(file.write_calls(), 1);
    assert_eq!(&file.contents()[100..105], b"dirty");
    assert_eq!(vm.stats().evictions, 1);
    // A file page never takes a swap slot.
    assert!(space.spt().find(page_va(0)).unwrap().lock().swap_slot().is_none());

    let mut buf = [0; 5];
    space.read_bytes(page_va(0) + 100, &mut buf).unwrap();
    assert_eq!(&buf, b"dirty");
    // Reloaded clean; unmapping writes nothing more.
    space.unmap_file(page_va(0)).unwrap();
    assert_eq!(file.write_calls(), 1);
}

#[test]
fn tail_of_the_last_mapped_page_is_zero_and_stays_in_memory() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, _) = address_space(&vm);
    let file = TempFile::new(&[0xAA; 100]);
    space.map_file(page_va(0), 100, true, &file, 0).unwrap();

    let page = read_page(&space, page_va(0));
    assert_eq!(&page[..100], &[0xAA; 100][..]);
    assert!(page[100..].iter().all(|&byte| byte == 0));

    space.write_bytes(page_va(0), &[0xBB]).unwrap();
    space.write_bytes(page_va(0) + 200, &[1; 10]).unwrap();
    space.unmap_file(page_va(0)).unwrap();

    let contents = file.contents();
    assert_eq!(contents.len(), 100);
    assert_eq!(contents[0], 0xBB);
    assert!(contents[1..].iter().all(|&byte| byte == 0xAA));
}

#[test]
fn mapping_at_an_offset_reads_the_right_part_of_the_file() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, _) = address_space(&vm);
    let mut data = pattern(0);
    data.extend(pattern(1));
    let file = TempFile::new(&data);
    space.map_file(page_va(4), PAGE, false, &file, PAGE as u64).unwrap();
    assert_eq!(read_page(&space, page_va(4)), pattern(1));
}

#[test]
fn unmapping_one_region_leaves_another_of_the_same_file() {
    let vm = Arc::new(vm_with(4, 8));
    let (space, _) = address_space(&vm);
    let file = TempFile::new(&pattern(9));
    space.map_file(page_va(0), PAGE, true, &file, 0).unwrap();
    space.map_file(page_va(16), PAGE, true, &file, 0).unwrap();

    space.unmap_file(page_va(0)).unwrap();
    assert!(space.spt().find(page_va(0)).is_none());
    assert_eq!(read_page(&space, page_va(16)), pattern(9));
    assert_eq!(space.unmap_file(page_va(0)), Err(VmError::NotMapped(page_va(0))));
    assert_eq!(space.unmap_file(page_va(3)), Err(VmError::NotMapped(page_va(3))));
    assert_eq!(space.mapped_regions(), vec![(page_va(16), PAGE)]);
}

#[test]
fn supplemental_page_table_bookkeeping() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, _) = address_space(&vm);
    let spt = space.spt();

    spt.insert(Page::new_anon(page_va(0), true)).unwrap();
    assert_eq!(
        spt.insert(Page::new_anon(page_va(0), false)).err(),
        Some(VmError::AlreadyMapped(page_va(0)))
    );
    assert!(spt.find(page_va(0) + 123).is_some());
    assert!(spt.find(page_va(1)).is_none());
    assert!(!spt.is_range_free(page_va(0) + 8, 1));
    assert!(spt.is_range_free(page_va(1), 4 * PAGE));

    space.write_bytes(page_va(0), b"x").unwrap();
    assert_eq!(vm.frames().resident_count(), 1);
    spt.remove(page_va(0)).unwrap();
    assert_eq!(vm.frames().resident_count(), 0);
    assert_eq!(spt.remove(page_va(0)), Err(VmError::NotMapped(page_va(0))));
}

#[test]
fn teardown_releases_frames_slots_and_handles() {
    let vm = Arc::new(vm_with(2, 8));
    let (space, mmu) = address_space(&vm);
    let file = TempFile::new(&[3; 2 * PAGE]);
    space.map_file(page_va(0), 2 * PAGE, true, &file, 0).unwrap();
    space.write_bytes(page_va(1), b"keep").unwrap();
    for i in 2..6 {
        space.alloc_anon(page_va(i), true).unwrap();
        space.write_bytes(page_va(i), &pattern(i)).unwrap();
    }
    space
        .alloc_lazy(page_va(6), true, LazyLoad::Zero)
        .unwrap();
    assert!(vm.swap().slots_in_use() > 0);

    space.exit();
    assert_eq!(vm.frames().resident_count(), 0);
    assert_eq!(vm.swap().slots_in_use(), 0);
    assert_eq!(mmu.mapped_pages(), 0);
    assert_eq!(file.open_handles(), 1);
    assert_eq!(&file.contents()[PAGE..PAGE + 4], b"keep");
    assert!(vm.shutdown());
}

#[test]
fn dropping_an_address_space_tears_it_down() {
    let vm = Arc::new(vm_with(2, 8));
    let file = TempFile::new(&[3; PAGE]);
    {
        let (space, _) = address_space(&vm);
        space.map_file(page_va(0), PAGE, true, &file, 0).unwrap();
        for i in 1..4 {
            space.alloc_anon(page_va(i), true).unwrap();
            space.write_bytes(page_va(i), &pattern(i)).unwrap();
        }
    }
    assert!(vm.shutdown());
    assert_eq!(file.open_handles(), 1);
}

#[test]
fn stats_track_faults_and_evictions() {
    let vm = Arc::new(vm_with(1, 8));
    let (space, _) = address_space(&vm);
    space.alloc_anon(page_va(0), true).unwrap();
    space.alloc_anon(page_va(1), true).unwrap();

    space.handle_fault(&fault(page_va(0), true)).unwrap();
    space.handle_fault(&fault(page_va(1), true)).unwrap();
    let stats = vm.stats();
    assert_eq!(stats.faults, 2);
    assert_eq!(stats.evictions, 1);
    // Page 0 was never written through the MMU, but it left memory once.
    assert_eq!(stats.swap_outs, 1);
    assert_eq!(stats.swap_ins, 0);
}

#[test]
fn eviction_waits_for_a_busy_victim() {
    let vm = Arc::new(vm_with(1, 8));
    let (space, _) = address_space(&vm);
    let space = Arc::new(space);
    space.alloc_anon(page_va(0), true).unwrap();
    space.alloc_anon(page_va(1), true).unwrap();
    space.write_bytes(page_va(0), &pattern(0)).unwrap();

    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = {
        let space = Arc::clone(&space);
        thread::spawn(move || {
            let busy = space.spt().find(page_va(0)).unwrap();
            let guard = busy.lock();
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            drop(guard);
        })
    };
    locked_rx.recv().unwrap();

    // The only resident page is locked until the holder lets go.
    space.claim(page_va(1)).unwrap();
    holder.join().unwrap();

    assert_eq!(vm.stats().evictions, 1);
    assert_eq!(read_page(&space, page_va(0)), pattern(0));
}

#[test]
fn more_threads_than_frames_all_make_progress() {
    let vm = Arc::new(vm_with(2, 64));
    let (space, _) = address_space(&vm);
    let space = Arc::new(space);
    for i in 0..4 {
        space.alloc_anon(page_va(i), true).unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let space = Arc::clone(&space);
            thread::spawn(move || {
                for round in 0..2000 {
                    let stamp = (round as u64).to_le_bytes();
                    space.write_bytes(page_va(t), &stamp).unwrap();
                    let mut back = [0; 8];
                    space.read_bytes(page_va(t), &mut back).unwrap();
                    assert_eq!(back, stamp, "thread {t} round {round}");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(vm.frames().resident_count() <= 2);
}

#[test]
#[should_panic(expected = "out of swap slots")]
fn running_out_of_swap_is_fatal() {
    let vm = Arc::new(vm_with(1, 1));
    let (space, _) = address_space(&vm);
    for i in 0..3 {
        space.alloc_anon(page_va(i), true).unwrap();
        space.write_bytes(page_va(i), &pattern(i)).unwrap();
    }
}

/// Fails every write once armed.
struct FlakyDisk {
    sectors: Vec<[u8; 512]>,
    failing: Arc<AtomicBool>,
}

impl BlockOp for FlakyDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), crate::block::BlockError> {
        buf.copy_from_slice(&self.sectors[sector as usize]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), crate::block::BlockError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(crate::block::BlockError::WriteError);
        }
        self.sectors[sector as usize].copy_from_slice(buf);
        Ok(())
    }
}

#[test]
fn a_failed_swap_write_keeps_the_victim_resident() {
    let failing = Arc::new(AtomicBool::new(false));
    let disk = FlakyDisk {
        sectors: vec![[0; 512]; 64],
        failing: Arc::clone(&failing),
    };
    let vm = Arc::new(Vm::new(
        FramePool::new(1),
        Block::new("flaky", 64, disk),
    ));
    let (space, mmu) = address_space(&vm);
    space.alloc_anon(page_va(0), true).unwrap();
    space.alloc_anon(page_va(1), true).unwrap();
    space.write_bytes(page_va(0), &pattern(0)).unwrap();

    failing.store(true, Ordering::Relaxed);
    assert_eq!(
        space.claim(page_va(1)),
        Err(VmError::Block(crate::block::BlockError::WriteError))
    );
    assert!(mmu.translate(page_va(0)).is_some());
    assert_eq!(vm.swap().slots_in_use(), 0);
    assert_eq!(vm.frames().resident_count(), 1);

    failing.store(false, Ordering::Relaxed);
    space.claim(page_va(1)).unwrap();
    assert_eq!(read_page(&space, page_va(0)), pattern(0));
}
