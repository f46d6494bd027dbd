//! Test coverage of the page allocator.

use std::{
    cell::Cell,
    collections::HashSet,
    ptr::NonNull,
    sync::{Barrier, Mutex},
};

use kpool::{
    Cpu, FrameAllocator, InterruptGuard, OutOfMemory, Page, PhysAddr,
    param::{ALLOC_FILL, FREE_FILL, PAGE_SIZE, STEAL_QUOTA},
};

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
    static INTERRUPTS: Cell<bool> = const { Cell::new(true) };
}

/// Treats each test thread as a core, with whatever id it last set.
struct ThreadCpu;
impl Cpu for ThreadCpu {
    fn id(&self) -> usize {
        CPU_ID.get()
    }

    fn interrupts_enabled(&self) -> bool {
        INTERRUPTS.get()
    }

    fn set_interrupts(&self, enabled: bool) {
        INTERRUPTS.set(enabled);
    }
}

fn on_cpu(id: usize) {
    CPU_ID.set(id);
}

/// Leak some page-aligned memory for an allocator to manage.
fn pages<const N: usize>() -> &'static mut [Page; N] {
    let pages: Box<[Page]> = (0..N).map(|_| Page::ZERO).collect();
    let pages: Box<[Page; N]> = pages
        .try_into()
        .unwrap_or_else(|_| unreachable!("Collected exactly {N} pages"));
    Box::leak(pages)
}

fn page_bytes<const N: usize, const NCPU: usize>(
    allocator: &FrameAllocator<ThreadCpu, N, NCPU>,
    addr: PhysAddr,
) -> [u8; PAGE_SIZE] {
    // SAFETY: The test holds the page, or it's free and nobody else is running.
    unsafe { allocator.frame_ptr(addr).as_ref() }.0
}

#[test]
fn test_allocate_single_owner() {
    on_cpu(0);
    let allocator = FrameAllocator::<_, 8, 2>::new(ThreadCpu, pages());
    assert_eq!(allocator.total_free(), 8);

    let addr = allocator.allocate().expect("Out of memory");
    assert_eq!(addr.addr() % PAGE_SIZE, 0);
    assert_eq!(allocator.refcounts().get(allocator.index_of(addr)), 1);
    assert!(page_bytes(&allocator, addr).iter().all(|&b| b == ALLOC_FILL));
    assert_eq!(allocator.total_free(), 7);
    assert!(INTERRUPTS.get(), "Interrupts should be restored");

    let zeroed = allocator.allocate_zeroed().expect("Out of memory");
    assert!(page_bytes(&allocator, zeroed).iter().all(|&b| b == 0));
}

#[test]
fn test_free_reclaims() {
    on_cpu(0);
    let allocator = FrameAllocator::<_, 8, 2>::new(ThreadCpu, pages());
    let addr = allocator.allocate().expect("Out of memory");
    allocator.free(addr);
    assert_eq!(allocator.total_free(), 8);
    assert_eq!(allocator.refcounts().get(allocator.index_of(addr)), 0);
    assert!(page_bytes(&allocator, addr).iter().all(|&b| b == FREE_FILL));
}

#[test]
fn test_shared_frame_survives_one_free() {
    on_cpu(0);
    let allocator = FrameAllocator::<_, 8, 2>::new(ThreadCpu, pages());
    let addr = allocator.allocate().expect("Out of memory");
    assert_eq!(allocator.share(addr), 2);

    allocator.free(addr);
    assert_eq!(allocator.total_free(), 7, "Still referenced once");
    assert!(page_bytes(&allocator, addr).iter().all(|&b| b == ALLOC_FILL));

    allocator.free(addr);
    assert_eq!(allocator.total_free(), 8);
}

#[test]
#[should_panic(expected = "has no references")]
fn test_double_free_panics() {
    on_cpu(0);
    let allocator = FrameAllocator::<_, 4, 1>::new(ThreadCpu, pages());
    let addr = allocator.allocate().expect("Out of memory");
    allocator.free(addr);
    allocator.free(addr);
}

#[test]
#[should_panic(expected = "is not a managed page")]
fn test_misaligned_free_panics() {
    on_cpu(0);
    let allocator = FrameAllocator::<_, 4, 1>::new(ThreadCpu, pages());
    let addr = allocator.allocate().expect("Out of memory");
    allocator.free(PhysAddr::new(addr.addr() + 8));
}

#[test]
#[should_panic(expected = "is not a managed page")]
fn test_out_of_range_free_panics() {
    on_cpu(0);
    let allocator = FrameAllocator::<_, 4, 1>::new(ThreadCpu, pages());
    let past_end = allocator.addr_of(3).addr() + PAGE_SIZE;
    allocator.free(PhysAddr::new(past_end));
}

#[test]
fn test_exhaustion_is_recoverable() {
    on_cpu(0);
    let allocator = FrameAllocator::<_, 8, 2>::new(ThreadCpu, pages());
    let held: Vec<_> = (0..8)
        .map(|_| allocator.allocate().expect("Out of memory"))
        .collect();
    assert_eq!(allocator.allocate(), Err(OutOfMemory));
    on_cpu(1);
    assert_eq!(allocator.allocate(), Err(OutOfMemory));

    allocator.free(held[3]);
    assert_eq!(allocator.free_frames(1), 1, "Freed onto the calling core");
    on_cpu(0);
    assert_eq!(allocator.allocate(), Ok(held[3]), "Stolen back from core 1");
}

#[test]
fn test_empty_core_steals_a_batch() {
    const FRAMES: usize = STEAL_QUOTA * 2 + 8;

    on_cpu(0);
    let allocator = FrameAllocator::<_, FRAMES, 2>::new(ThreadCpu, pages());
    assert_eq!(allocator.free_frames(0), FRAMES);
    assert_eq!(allocator.free_frames(1), 0);

    on_cpu(1);
    let addr = allocator.allocate().expect("Out of memory");
    assert_eq!(allocator.refcounts().get(allocator.index_of(addr)), 1);
    assert_eq!(allocator.free_frames(0), FRAMES - STEAL_QUOTA);
    assert_eq!(allocator.free_frames(1), STEAL_QUOTA - 1);

    // The rest of the batch is served locally.
    for _ in 1..STEAL_QUOTA {
        allocator.allocate().expect("Out of memory");
    }
    assert_eq!(allocator.free_frames(0), FRAMES - STEAL_QUOTA);
    assert_eq!(allocator.free_frames(1), 0);
}

#[test]
fn test_steal_gathers_from_several_cores() {
    on_cpu(0);
    let allocator = FrameAllocator::<_, 6, 4>::new(ThreadCpu, pages());
    let held: Vec<_> = (0..6)
        .map(|_| allocator.allocate().expect("Out of memory"))
        .collect();
    // Scatter frames over cores 0, 1 and 2.
    for (i, &addr) in held.iter().enumerate() {
        on_cpu(i % 3);
        allocator.free(addr);
    }
    on_cpu(3);
    allocator.allocate().expect("Out of memory");
    assert_eq!(allocator.total_free(), 5);
    assert_eq!(allocator.free_frames(3), 5, "Every other core drained");
}

#[test]
fn test_interrupts_stay_disabled_if_they_were() {
    on_cpu(0);
    let allocator = FrameAllocator::<_, 4, 1>::new(ThreadCpu, pages());
    INTERRUPTS.set(false);
    let addr = allocator.allocate().expect("Out of memory");
    allocator.free(addr);
    assert!(!INTERRUPTS.get());
    INTERRUPTS.set(true);
}

#[test]
fn test_concurrent_cores_never_share_frames() {
    const CORES: usize = 4;
    const PER_CORE: usize = 12;
    // Enough that frames in other cores' half-assembled steal batches can't starve anyone.
    const FRAMES: usize = 128;

    on_cpu(0);
    let allocator = FrameAllocator::<_, FRAMES, CORES>::new(ThreadCpu, pages());
    let barrier = Barrier::new(CORES);
    let handed_out = Mutex::new(Vec::new());
    std::thread::scope(|s| {
        for core in 0..CORES {
            let allocator = &allocator;
            let barrier = &barrier;
            let handed_out = &handed_out;
            s.spawn(move || {
                on_cpu(core);
                for _ in 0..50 {
                    let frames: Vec<_> = (0..PER_CORE)
                        .map(|_| allocator.allocate().expect("Out of memory"))
                        .collect();
                    allocator.free(frames[0]);
                    allocator.free(allocator.allocate().expect("Out of memory"));
                    for &addr in &frames[1..] {
                        allocator.free(addr);
                    }
                }
                barrier.wait();
                let frames: Vec<_> = (0..PER_CORE)
                    .map(|_| allocator.allocate().expect("Out of memory"))
                    .collect();
                handed_out.lock().expect("Poisoned").extend(frames);
                barrier.wait();
            });
        }
    });

    let handed_out = handed_out.into_inner().expect("Poisoned");
    let unique: HashSet<_> = handed_out.iter().copied().collect();
    assert_eq!(unique.len(), CORES * PER_CORE, "A frame was handed out twice");
    assert_eq!(allocator.total_free(), FRAMES - CORES * PER_CORE);
    for addr in handed_out {
        assert_eq!(allocator.refcounts().get(allocator.index_of(addr)), 1);
    }
}

static mut STATIC_POOL: [Page; 8] = [const { Page::ZERO }; 8];
static STATIC_ALLOCATOR: FrameAllocator<ThreadCpu, 8, 2> =
    // SAFETY: Nothing else touches the pool.
    unsafe { FrameAllocator::from_raw(ThreadCpu, NonNull::new_unchecked(&raw mut STATIC_POOL)) };

#[test]
fn test_allocator_in_a_static() {
    on_cpu(1);
    assert_eq!(STATIC_ALLOCATOR.free_frames(0), 8, "Frames start on the boot core");
    let addr = STATIC_ALLOCATOR.allocate().expect("Out of memory");
    assert!(
        page_bytes(&STATIC_ALLOCATOR, addr)
            .iter()
            .all(|&b| b == ALLOC_FILL)
    );
    assert_eq!(STATIC_ALLOCATOR.refcounts().get(STATIC_ALLOCATOR.index_of(addr)), 1);
    STATIC_ALLOCATOR.free(addr);
    assert_eq!(STATIC_ALLOCATOR.free_frames(1), 8, "Stolen, then freed locally");
    assert_eq!(STATIC_ALLOCATOR.total_free(), 8);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "Migrated cores with interrupts disabled")]
fn test_interrupt_guard_pins_the_core() {
    on_cpu(0);
    let guard = InterruptGuard::new(&ThreadCpu);
    assert_eq!(guard.cpu_id(), 0);
    on_cpu(1);
    drop(guard);
}
