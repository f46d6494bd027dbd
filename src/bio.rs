//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk blocks in a fixed pool of buffers. Caching
//! reduces the number of disk reads and gives the file system a synchronization point for blocks
//! used by several processes at once.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call [`BufferCache::read`].
//! * After changing buffer data, call [`BufferCache::write`] to write it to disk.
//! * When done with the buffer, drop it (or call [`BufferCache::release`]).
//! * Only one context at a time can use a buffer, so don't keep them longer than necessary.
//!
//! Buffers are spread over [`NBUCKET`](crate::param::NBUCKET) buckets keyed by block number, each
//! with its own lock. A miss first recycles the least recently released free buffer of its own
//! bucket, then falls back to the least recently released free buffer anywhere, moving it over.
//! Lock order: a bucket lock is never held while taking another bucket lock or the table lock.

use core::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use hex_display::HexDisplayExt as _;
use util::sync::{SleepLock, SleepLockGuard, SpinLock};

use crate::{
    error::Result,
    hal::{BlockDevice, BlockId, Direction, Sched},
    param::{self, BLOCK_SIZE},
};

/// Marks the end of a bucket's list, or a buffer that is between buckets.
const NIL: usize = usize::MAX;

fn key_of(id: BlockId) -> u64 {
    (u64::from(id.dev) << 32) | u64::from(id.blockno)
}

fn id_of(key: u64) -> BlockId {
    BlockId::new((key >> 32) as u32, key as u32)
}

/// The head of one bucket's list of buffers.
struct Bucket {
    head: usize,
}

/// Bookkeeping for one buffer.
///
/// Changed only under the lock of the bucket the buffer is linked into, or by the context that
/// unlinked it while it moves between buckets. The table-wide victim scan reads these fields
/// without the bucket lock and re-checks them once it has the lock.
struct BufMeta {
    key: AtomicU64,
    /// Whether `key` names a block. Empty and parked buffers have no identity.
    labeled: AtomicBool,
    refcnt: AtomicU32,
    /// Tick count of the last release that dropped `refcnt` to zero.
    timestamp: AtomicU32,
    /// The bucket the buffer is linked into, or [`NIL`] while it moves.
    bucket: AtomicUsize,
    /// The next buffer in the same bucket.
    next: AtomicUsize,
    /// Whether the contents have been read from disk.
    ///
    /// Cleared under the bucket lock when the buffer is relabeled (nobody holds the data lock
    /// then, since the buffer was unreferenced), otherwise only touched with the data lock held.
    valid: AtomicBool,
}
impl BufMeta {
    fn holds(&self, key: u64) -> bool {
        self.labeled.load(Ordering::Relaxed) && self.key.load(Ordering::Relaxed) == key
    }

    fn block(&self) -> Option<BlockId> {
        self.labeled
            .load(Ordering::Relaxed)
            .then(|| id_of(self.key.load(Ordering::Relaxed)))
    }
}

struct BufSlot {
    meta: BufMeta,
    data: SleepLock<[u8; BLOCK_SIZE]>,
}
impl BufSlot {
    /// An empty buffer linked into `bucket` ahead of `next`.
    const fn new(bucket: usize, next: usize) -> Self {
        Self {
            meta: BufMeta {
                key: AtomicU64::new(0),
                labeled: AtomicBool::new(false),
                refcnt: AtomicU32::new(0),
                timestamp: AtomicU32::new(0),
                bucket: AtomicUsize::new(bucket),
                next: AtomicUsize::new(next),
                valid: AtomicBool::new(false),
            },
            data: SleepLock::new([0; BLOCK_SIZE]),
        }
    }
}

/// A cache of `NBUF` disk blocks split over `NBUCKET` buckets.
pub struct BufferCache<
    D: BlockDevice,
    S: Sched,
    const NBUF: usize = { param::NBUF },
    const NBUCKET: usize = { param::NBUCKET },
> {
    device: D,
    sched: S,
    /// Serializes table-wide victim scans.
    table: SpinLock<()>,
    buckets: [SpinLock<Bucket>; NBUCKET],
    bufs: [BufSlot; NBUF],
}

impl<D: BlockDevice, S: Sched, const NBUF: usize, const NBUCKET: usize>
    BufferCache<D, S, NBUF, NBUCKET>
{
    /// Build a cache with every buffer empty, spread evenly over the buckets.
    ///
    /// Buffer `i` goes to bucket `i % NBUCKET`. This is a `const fn` so the kernel can keep the
    /// cache in a `static` instead of building it on a stack.
    pub const fn new(device: D, sched: S) -> Self {
        const { assert!(NBUF > 0 && NBUCKET > 0, "Cache needs buffers and buckets") };
        let mut this = Self {
            device,
            sched,
            table: SpinLock::new(()),
            buckets: [const { SpinLock::new(Bucket { head: NIL }) }; NBUCKET],
            bufs: [const { BufSlot::new(NIL, NIL) }; NBUF],
        };
        let mut idx = 0;
        while idx < NBUF {
            let next = idx + NBUCKET;
            this.bufs[idx] = BufSlot::new(idx % NBUCKET, if next < NBUF { next } else { NIL });
            if idx < NBUCKET {
                this.buckets[idx].get_mut().head = idx;
            }
            idx += 1;
        }
        this
    }

    /// The underlying block device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Return a locked buffer for the given block, without reading it from disk.
    ///
    /// The buffer's contents are stale unless [`Buf::is_valid`] says otherwise; callers which
    /// overwrite the whole block can skip the read this way.
    ///
    /// # Panics
    /// Panics if every buffer is in use. The cache is sized so this can't happen in a working
    /// kernel.
    pub fn get(&self, dev: u32, blockno: u32) -> Buf<'_, D, S, NBUF, NBUCKET> {
        let key = key_of(BlockId::new(dev, blockno));
        let target = blockno as usize % NBUCKET;

        let found = {
            let bucket = self.buckets[target].lock();
            if let Some(idx) = self.lookup(&bucket, key) {
                self.meta(idx).refcnt.fetch_add(1, Ordering::Relaxed);
                Some(idx)
            } else if let Some(idx) = self.bucket_victim(&bucket) {
                self.relabel(idx, key);
                Some(idx)
            } else {
                None
            }
        };
        let idx = found.unwrap_or_else(|| self.steal_victim(key, target));

        Buf {
            cache: self,
            idx,
            data: ManuallyDrop::new(self.bufs[idx].data.lock_with(|| self.sched.yield_now())),
        }
    }

    /// Return a locked buffer with the contents of the given block.
    ///
    /// On a device error the buffer is released again and stays invalid.
    pub fn read(&self, dev: u32, blockno: u32) -> Result<Buf<'_, D, S, NBUF, NBUCKET>> {
        let mut buf = self.get(dev, blockno);
        if !buf.is_valid() {
            let id = buf.id();
            self.device.transfer(id, &mut buf.data, Direction::Read)?;
            log::trace!("bread: {id:?} starts {}", buf.data[..16].hex());
            buf.meta().valid.store(true, Ordering::Relaxed);
        }
        Ok(buf)
    }

    /// Write the buffer's contents to disk.
    ///
    /// # Panics
    /// Panics if the buffer's lock isn't held.
    #[expect(
        clippy::panic_in_result_fn,
        reason = "Writing an unlocked buffer is a kernel bug, not an I/O error"
    )]
    pub fn write(&self, buf: &mut Buf<'_, D, S, NBUF, NBUCKET>) -> Result<()> {
        assert!(buf.data.is_held(), "bwrite: buffer not locked");
        let id = buf.id();
        log::trace!("bwrite: {id:?} starts {}", buf.data[..16].hex());
        self.device.transfer(id, &mut buf.data, Direction::Write)
    }

    /// Unlock the buffer and drop the caller's reference to it.
    ///
    /// This is what dropping a [`Buf`] does; do not use the buffer's contents afterward.
    pub fn release(&self, buf: Buf<'_, D, S, NBUF, NBUCKET>) {
        drop(buf);
    }

    /// Keep the buffer cached after it's released, until [`Self::unpin`].
    ///
    /// The log layer uses this to keep blocks it has yet to install from being recycled.
    pub fn pin(&self, buf: &Buf<'_, D, S, NBUF, NBUCKET>) -> PinnedBuf {
        let meta = self.meta(buf.idx);
        let _bucket = self.buckets[meta.bucket.load(Ordering::Relaxed)].lock();
        meta.refcnt.fetch_add(1, Ordering::Relaxed);
        PinnedBuf { idx: buf.idx }
    }

    /// Drop the reference taken by [`Self::pin`].
    ///
    /// Unlike a release this doesn't update the buffer's age.
    pub fn unpin(&self, pin: PinnedBuf) {
        let meta = self.meta(pin.idx);
        let _bucket = self.buckets[meta.bucket.load(Ordering::Relaxed)].lock();
        Self::drop_ref(meta, "bunpin");
    }

    /// The number of references to the cached buffer for a block, if there is one.
    pub fn refcount(&self, dev: u32, blockno: u32) -> Option<u32> {
        let key = key_of(BlockId::new(dev, blockno));
        let bucket = self.buckets[blockno as usize % NBUCKET].lock();
        self.lookup(&bucket, key)
            .map(|idx| self.meta(idx).refcnt.load(Ordering::Relaxed))
    }

    /// The blocks currently linked into a bucket, in list order.
    ///
    /// Empty buffers are left out.
    pub fn bucket_blocks(&self, bucket: usize, mut f: impl FnMut(BlockId, u32)) {
        let bucket = self.buckets[bucket].lock();
        for idx in self.members(&bucket) {
            let meta = self.meta(idx);
            if let Some(id) = meta.block() {
                f(id, meta.refcnt.load(Ordering::Relaxed));
            }
        }
    }

    fn meta(&self, idx: usize) -> &BufMeta {
        &self.bufs[idx].meta
    }

    fn members<'a>(&'a self, bucket: &'a Bucket) -> impl Iterator<Item = usize> + 'a {
        core::iter::successors(Some(bucket.head).filter(|&idx| idx != NIL), |&idx| {
            Some(self.meta(idx).next.load(Ordering::Relaxed)).filter(|&next| next != NIL)
        })
    }

    fn lookup(&self, bucket: &Bucket, key: u64) -> Option<usize> {
        self.members(bucket)
            .find(|&idx| self.meta(idx).holds(key))
    }

    /// The least recently released free buffer in `bucket`.
    fn bucket_victim(&self, bucket: &Bucket) -> Option<usize> {
        self.members(bucket)
            .filter(|&idx| self.meta(idx).refcnt.load(Ordering::Relaxed) == 0)
            .min_by_key(|&idx| self.meta(idx).timestamp.load(Ordering::Relaxed))
    }

    /// Give an unreferenced buffer a new identity, referenced once by the caller.
    ///
    /// Must hold the lock of the bucket the buffer is linked into.
    fn relabel(&self, idx: usize, key: u64) {
        let meta = self.meta(idx);
        meta.key.store(key, Ordering::Relaxed);
        meta.labeled.store(true, Ordering::Relaxed);
        meta.valid.store(false, Ordering::Relaxed);
        meta.refcnt.store(1, Ordering::Relaxed);
    }

    /// Find the least recently released free buffer in the whole cache and move it into bucket
    /// `target` for `key`.
    ///
    /// Called with no locks held.
    fn steal_victim(&self, key: u64, target: usize) -> usize {
        loop {
            let candidate = {
                let _table = self.table.lock();
                (0..NBUF)
                    .filter(|&idx| self.meta(idx).refcnt.load(Ordering::Relaxed) == 0)
                    .min_by_key(|&idx| self.meta(idx).timestamp.load(Ordering::Relaxed))
            };
            let Some(victim) = candidate else {
                panic!("bget: no buffers");
            };

            let meta = self.meta(victim);
            let owner = meta.bucket.load(Ordering::Relaxed);
            if owner == NIL {
                // Someone else claimed it after our scan and is moving it.
                continue;
            }
            {
                let mut bucket = self.buckets[owner].lock();
                if meta.refcnt.load(Ordering::Relaxed) != 0
                    || meta.bucket.load(Ordering::Relaxed) != owner
                {
                    continue;
                }
                self.unlink(&mut bucket, victim);
                // Claim it before dropping the lock so no other scan can pick it.
                meta.refcnt.store(1, Ordering::Relaxed);
                meta.bucket.store(NIL, Ordering::Relaxed);
            }

            let chosen = {
                let mut bucket = self.buckets[target].lock();
                // The block may have been brought in by someone else while we held no lock.
                let existing = self.lookup(&bucket, key);
                self.link(&mut bucket, victim, target);
                match existing {
                    Some(existing) => {
                        meta.labeled.store(false, Ordering::Relaxed);
                        meta.valid.store(false, Ordering::Relaxed);
                        meta.refcnt.store(0, Ordering::Relaxed);
                        self.meta(existing).refcnt.fetch_add(1, Ordering::Relaxed);
                        existing
                    }
                    None => {
                        self.relabel(victim, key);
                        victim
                    }
                }
            };
            if chosen == victim {
                log::debug!("bget: moved buffer {victim} from bucket {owner} to {target}");
            } else {
                log::debug!("bget: parked buffer {victim} in bucket {target}, block was cached");
            }
            return chosen;
        }
    }

    fn link(&self, bucket: &mut Bucket, idx: usize, bucket_idx: usize) {
        let meta = self.meta(idx);
        meta.next.store(bucket.head, Ordering::Relaxed);
        meta.bucket.store(bucket_idx, Ordering::Relaxed);
        bucket.head = idx;
    }

    fn unlink(&self, bucket: &mut Bucket, idx: usize) {
        let next = self.meta(idx).next.swap(NIL, Ordering::Relaxed);
        if bucket.head == idx {
            bucket.head = next;
            return;
        }
        let prev = self
            .members(bucket)
            .find(|&prev| self.meta(prev).next.load(Ordering::Relaxed) == idx)
            .unwrap_or_else(|| panic!("bget: buffer {idx} missing from its bucket"));
        self.meta(prev).next.store(next, Ordering::Relaxed);
    }

    /// Drop one reference, returning the new count.
    ///
    /// Must hold the buffer's bucket lock.
    fn drop_ref(meta: &BufMeta, op: &str) -> u32 {
        let refcnt = meta.refcnt.load(Ordering::Relaxed);
        assert!(refcnt > 0, "{op}: buffer has no references");
        meta.refcnt.store(refcnt - 1, Ordering::Relaxed);
        refcnt - 1
    }

    /// The second half of releasing a buffer, once its data lock is already dropped.
    fn release_ref(&self, idx: usize) {
        let meta = self.meta(idx);
        let _bucket = self.buckets[meta.bucket.load(Ordering::Relaxed)].lock();
        if Self::drop_ref(meta, "brelse") == 0 {
            meta.timestamp.store(self.sched.ticks(), Ordering::Relaxed);
        }
    }
}

/// A locked buffer, holding one reference to its block.
///
/// Dereferences to the block's bytes. Dropping it unlocks the buffer and releases the reference.
pub struct Buf<'a, D: BlockDevice, S: Sched, const NBUF: usize, const NBUCKET: usize> {
    cache: &'a BufferCache<D, S, NBUF, NBUCKET>,
    idx: usize,
    data: ManuallyDrop<SleepLockGuard<'a, [u8; BLOCK_SIZE]>>,
}
impl<D: BlockDevice, S: Sched, const NBUF: usize, const NBUCKET: usize>
    Buf<'_, D, S, NBUF, NBUCKET>
{
    fn meta(&self) -> &BufMeta {
        self.cache.meta(self.idx)
    }

    /// The block this buffer holds.
    pub fn id(&self) -> BlockId {
        id_of(self.meta().key.load(Ordering::Relaxed))
    }

    /// The device number of the block.
    pub fn dev(&self) -> u32 {
        self.id().dev
    }

    /// The block number.
    pub fn blockno(&self) -> u32 {
        self.id().blockno
    }

    /// Whether the contents have been read from disk.
    pub fn is_valid(&self) -> bool {
        self.meta().valid.load(Ordering::Relaxed)
    }

    /// The slot this buffer occupies in the cache.
    ///
    /// Two handles with the same slot index are the same buffer.
    pub fn slot(&self) -> usize {
        self.idx
    }

    /// Decode a value stored at `offset` in the block.
    ///
    /// # Panics
    /// Panics if the value would extend past the end of the block.
    pub fn read_pod<T: bytemuck::Pod>(&self, offset: usize) -> T {
        bytemuck::pod_read_unaligned(&self.data[offset..offset + size_of::<T>()])
    }

    /// Encode a value at `offset` in the block.
    ///
    /// The change only reaches the disk once the buffer is written.
    ///
    /// # Panics
    /// Panics if the value would extend past the end of the block.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, offset: usize, value: &T) {
        self.data[offset..offset + size_of::<T>()].copy_from_slice(bytemuck::bytes_of(value));
    }
}
impl<D: BlockDevice, S: Sched, const NBUF: usize, const NBUCKET: usize> Deref
    for Buf<'_, D, S, NBUF, NBUCKET>
{
    type Target = [u8; BLOCK_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
impl<D: BlockDevice, S: Sched, const NBUF: usize, const NBUCKET: usize> DerefMut
    for Buf<'_, D, S, NBUF, NBUCKET>
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}
impl<D: BlockDevice, S: Sched, const NBUF: usize, const NBUCKET: usize> Drop
    for Buf<'_, D, S, NBUF, NBUCKET>
{
    fn drop(&mut self) {
        assert!(self.data.is_held(), "brelse: buffer not locked");
        // SAFETY:
        // The guard isn't touched again after this.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.release_ref(self.idx);
    }
}

/// An extra reference keeping a buffer cached, from [`BufferCache::pin`].
///
/// Hand it back to [`BufferCache::unpin`] on the same cache.
#[must_use = "the buffer stays pinned until this is passed to `unpin`"]
#[derive(Debug)]
pub struct PinnedBuf {
    idx: usize,
}
