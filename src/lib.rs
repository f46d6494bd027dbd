//! The kernel's fixed-pool resource managers: the disk block buffer cache and the physical page
//! allocator.
//!
//! Both hand out units from a pool sized at boot to many cores at once, and both keep to a strict
//! lock order so that they can't deadlock. Hardware and scheduler services come in through the
//! traits in [`hal`].

#![cfg_attr(not(test), no_std)]

pub mod bio;
pub mod error;
pub mod hal;
pub mod kalloc;
pub mod logger;
pub mod param;
pub mod refcount;

pub use bio::{Buf, BufferCache, PinnedBuf};
pub use error::{Error, ErrorKind, OutOfMemory, Result};
pub use hal::{BlockDevice, BlockId, Cpu, Direction, InterruptGuard, Sched};
pub use kalloc::{FrameAllocator, Page, PhysAddr};
pub use refcount::RefCountTable;
