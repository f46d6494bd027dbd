//! Physical page allocator.
//!
//! Each core has its own free list and lock, so cores allocating and freeing at the same time
//! don't contend. A core whose list runs dry steals a batch of frames from the others.
//!
//! Frames are reference counted (see [`RefCountTable`]) so copy-on-write mappings can share them:
//! [`FrameAllocator::free`] only reclaims a frame once its last reference is gone.

use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use util::sync::{SpinLock, SpinLockGuard};

use crate::{
    error::OutOfMemory,
    hal::{Cpu, InterruptGuard},
    param::{self, ALLOC_FILL, FREE_FILL, PAGE_SIZE, STEAL_QUOTA},
    refcount::RefCountTable,
};

/// One page of physical memory.
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);
impl Page {
    /// A page of zeroes.
    pub const ZERO: Self = Self([0; PAGE_SIZE]);
}
const _: () = assert!(size_of::<Page>() == PAGE_SIZE && align_of::<Page>() == PAGE_SIZE);

/// A physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);
impl PhysAddr {
    /// Wrap a raw address.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// The raw address.
    pub const fn addr(self) -> usize {
        self.0
    }
}
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#X})", self.0)
    }
}

/// Marks the end of an index-linked list.
const NIL: usize = usize::MAX;

/// A free list, linked through [`FrameAllocator::links`].
struct FreeList {
    head: usize,
    len: usize,
}
impl FreeList {
    const fn new() -> Self {
        Self { head: NIL, len: 0 }
    }
}

/// Frames taken from other cores, not yet visible on any list.
struct StolenBatch {
    head: usize,
    tail: usize,
    len: usize,
}

/// Allocates the `NFRAME` pages of a fixed memory range across `NCPU` cores.
pub struct FrameAllocator<C: Cpu, const NFRAME: usize, const NCPU: usize = { param::NCPU }> {
    cpu: C,
    /// The first managed page.
    base: NonNull<Page>,
    freelists: [SpinLock<FreeList>; NCPU],
    /// The next frame on the same list, by frame index.
    ///
    /// A frame's link belongs to whoever holds the lock of the list the frame is on, or to the
    /// core assembling a stolen batch containing it.
    links: [AtomicUsize; NFRAME],
    refcounts: RefCountTable<NFRAME>,
}

impl<C: Cpu, const NFRAME: usize, const NCPU: usize> FrameAllocator<C, NFRAME, NCPU> {
    /// Take over `pages` and put every frame on the boot core's (core 0's) free list.
    ///
    /// Other cores start empty and fill up by stealing.
    pub const fn new(cpu: C, pages: &'static mut [Page; NFRAME]) -> Self {
        // SAFETY:
        // A `&'static mut` is non-null and gives us the memory for good.
        unsafe { Self::from_raw(cpu, NonNull::new_unchecked(ptr::from_mut(pages))) }
    }

    /// Like [`Self::new`], for memory the caller can only name by address, such as a
    /// `static mut` pool in another static's initializer.
    ///
    /// The page contents are left as they are until each frame is first allocated.
    ///
    /// # Safety
    /// `pages` must be valid for reads and writes for as long as the allocator lives, and nothing
    /// else may access it in that time.
    pub const unsafe fn from_raw(cpu: C, pages: NonNull<[Page; NFRAME]>) -> Self {
        const { assert!(NCPU > 0, "Need at least one core") };
        let mut this = Self {
            cpu,
            base: pages.cast(),
            freelists: [const { SpinLock::new(FreeList::new()) }; NCPU],
            links: [const { AtomicUsize::new(NIL) }; NFRAME],
            refcounts: RefCountTable::unreferenced(),
        };
        let mut frame = 0;
        while frame + 1 < NFRAME {
            this.links[frame] = AtomicUsize::new(frame + 1);
            frame += 1;
        }
        if NFRAME > 0 {
            let boot = this.freelists[0].get_mut();
            boot.head = 0;
            boot.len = NFRAME;
        }
        this
    }

    /// Allocate one page.
    ///
    /// The page is filled with [`ALLOC_FILL`] and has a reference count of 1.
    pub fn allocate(&self) -> Result<PhysAddr, OutOfMemory> {
        let frame = {
            let intr = InterruptGuard::new(&self.cpu);
            let me = intr.cpu_id();
            let popped = self.pop(&mut self.local(me).lock());
            match popped {
                Some(frame) => frame,
                None => self.steal(me).ok_or(OutOfMemory)?,
            }
        };
        self.refcounts.reset(frame);
        // SAFETY:
        // We just took the frame off a free list, so nothing else refers to it.
        unsafe { self.fill(frame, ALLOC_FILL) };
        Ok(self.addr_of(frame))
    }

    /// Allocate one page, and erase the memory.
    pub fn allocate_zeroed(&self) -> Result<PhysAddr, OutOfMemory> {
        let addr = self.allocate()?;
        // SAFETY:
        // A fresh allocation is referenced only by us.
        unsafe { self.fill(self.index_of(addr), 0) };
        Ok(addr)
    }

    /// Drop one reference to the page at `addr`, reclaiming it if that was the last one.
    ///
    /// Reclaimed pages are filled with [`FREE_FILL`] to make dangling uses stand out, and go to
    /// the calling core's free list no matter which core allocated them.
    ///
    /// # Panics
    /// Panics if `addr` is misaligned, outside the managed range, or has no references left.
    pub fn free(&self, addr: PhysAddr) {
        let frame = self.index_of(addr);
        if self.refcounts.decrement(frame) > 0 {
            return;
        }
        // SAFETY:
        // The count just reached zero and the frame isn't on a list yet, so it's ours alone.
        unsafe { self.fill(frame, FREE_FILL) };

        let intr = InterruptGuard::new(&self.cpu);
        let mut list = self.local(intr.cpu_id()).lock();
        self.push(&mut list, frame);
    }

    /// Add a reference to an allocated page, returning the new count.
    ///
    /// Used when a mapping is duplicated instead of copied.
    pub fn share(&self, addr: PhysAddr) -> u32 {
        self.refcounts.increment(self.index_of(addr))
    }

    /// The reference counts of every managed frame.
    pub fn refcounts(&self) -> &RefCountTable<NFRAME> {
        &self.refcounts
    }

    /// The frame index of a managed address.
    ///
    /// # Panics
    /// Panics if `addr` isn't the start of a managed page.
    pub fn index_of(&self, addr: PhysAddr) -> usize {
        let base = self.base.addr().get();
        assert!(
            addr.addr().is_multiple_of(PAGE_SIZE)
                && addr.addr() >= base
                && addr.addr() < base + NFRAME * PAGE_SIZE,
            "kfree: {addr:?} is not a managed page"
        );
        (addr.addr() - base) / PAGE_SIZE
    }

    /// The address of a managed frame.
    pub fn addr_of(&self, frame: usize) -> PhysAddr {
        assert!(frame < NFRAME, "frame {frame} out of range");
        PhysAddr(self.base.addr().get() + frame * PAGE_SIZE)
    }

    /// A pointer to the memory of the page at `addr`.
    ///
    /// The pointer is valid for as long as the allocator lives; it's on the caller to only use
    /// it while holding a reference to the page.
    pub fn frame_ptr(&self, addr: PhysAddr) -> NonNull<Page> {
        // SAFETY:
        // `index_of` checked the frame is inside the managed range.
        unsafe { self.base.add(self.index_of(addr)) }
    }

    /// The number of frames on a core's free list.
    pub fn free_frames(&self, cpu: usize) -> usize {
        self.local(cpu).lock().len
    }

    /// The number of frames on all free lists.
    pub fn total_free(&self) -> usize {
        (0..NCPU).map(|cpu| self.free_frames(cpu)).sum()
    }

    fn local(&self, cpu: usize) -> &SpinLock<FreeList> {
        self.freelists
            .get(cpu)
            .unwrap_or_else(|| panic!("kalloc: cpu {cpu} beyond NCPU={NCPU}"))
    }

    /// Gather up to [`STEAL_QUOTA`] frames from the other cores, keeping one for the caller and
    /// putting the rest on `me`'s list.
    ///
    /// Holds at most one free-list lock at a time.
    fn steal(&self, me: usize) -> Option<usize> {
        let mut batch = StolenBatch {
            head: NIL,
            tail: NIL,
            len: 0,
        };
        for victim in (0..NCPU).filter(|&cpu| cpu != me) {
            if batch.len >= STEAL_QUOTA {
                break;
            }
            let mut list = self.freelists[victim].lock();
            while batch.len < STEAL_QUOTA {
                let Some(frame) = self.pop(&mut list) else {
                    break;
                };
                self.links[frame].store(batch.head, Ordering::Relaxed);
                if batch.tail == NIL {
                    batch.tail = frame;
                }
                batch.head = frame;
                batch.len += 1;
            }
        }
        if batch.len == 0 {
            log::warn!("cpu {me}: no free frames on any core");
            return None;
        }
        log::debug!("cpu {me}: stole {} frames", batch.len);

        let mut local = self.freelists[me].lock();
        self.links[batch.tail].store(local.head, Ordering::Relaxed);
        local.head = batch.head;
        local.len += batch.len;
        self.pop(&mut local)
    }

    fn push(&self, list: &mut SpinLockGuard<'_, FreeList>, frame: usize) {
        self.links[frame].store(list.head, Ordering::Relaxed);
        list.head = frame;
        list.len += 1;
    }

    fn pop(&self, list: &mut SpinLockGuard<'_, FreeList>) -> Option<usize> {
        let frame = list.head;
        if frame == NIL {
            return None;
        }
        list.head = self.links[frame].swap(NIL, Ordering::Relaxed);
        list.len -= 1;
        Some(frame)
    }

    /// Overwrite a whole frame with `byte`.
    ///
    /// # Safety
    /// The caller must be the only one referencing `frame`.
    unsafe fn fill(&self, frame: usize, byte: u8) {
        // SAFETY:
        // `frame` is in range, and by precondition nothing else is accessing it.
        unsafe {
            self.base
                .add(frame)
                .cast::<u8>()
                .write_bytes(byte, PAGE_SIZE);
        }
    }
}

// SAFETY:
// `base` came from a `&'static mut`, so the allocator is the only owner of the memory, and every
// page is only touched by whoever holds its last reference or the free-list lock it's on.
unsafe impl<C: Cpu + Send, const NFRAME: usize, const NCPU: usize> Send
    for FrameAllocator<C, NFRAME, NCPU>
{
}
// SAFETY:
// As above; all shared state is behind locks or atomics.
unsafe impl<C: Cpu, const NFRAME: usize, const NCPU: usize> Sync
    for FrameAllocator<C, NFRAME, NCPU>
{
}
