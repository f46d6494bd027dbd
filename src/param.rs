//! Compile-time sizing for the kernel's fixed resource pools.

/// The size of one disk block, and therefore of one cache buffer's contents.
pub const BLOCK_SIZE: usize = 1024;

/// Number of independently locked buckets in the buffer cache.
///
/// A prime keeps block numbers with a common stride spread over many buckets.
pub const NBUCKET: usize = 13;

/// Total number of buffers in the cache.
pub const NBUF: usize = NBUCKET * 3;

/// The size of a single page in memory.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of cores the allocator keeps free lists for.
pub const NCPU: usize = 8;

/// How many frames an empty core takes from the other cores in one go.
pub const STEAL_QUOTA: usize = 16;

/// Byte written over a frame when it goes back on a free list.
pub const FREE_FILL: u8 = 0x01;

/// Byte written over a frame when it is handed out.
pub const ALLOC_FILL: u8 = 0x05;
