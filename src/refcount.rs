//! Reference counts for physical page frames.
//!
//! A frame mapped by several address spaces (after a copy-on-write fork) stays allocated until
//! the last mapping goes away. The copy-on-write fault handler uses [`RefCountTable::decrement`]
//! and [`RefCountTable::increment`] directly; the allocator uses them in `free` and when sharing
//! a frame.

use util::sync::SpinLock;

/// One count per frame, all behind a single lock.
pub struct RefCountTable<const N: usize> {
    counts: SpinLock<[u32; N]>,
}
impl<const N: usize> RefCountTable<N> {
    /// A table with every frame referenced exactly once.
    pub const fn new() -> Self {
        Self {
            counts: SpinLock::new([1; N]),
        }
    }

    /// A table with no frame referenced, for frames that start out free.
    pub(crate) const fn unreferenced() -> Self {
        Self {
            counts: SpinLock::new([0; N]),
        }
    }

    /// Add a reference to a frame, returning the new count.
    pub fn increment(&self, frame: usize) -> u32 {
        let mut counts = self.counts.lock();
        let count = Self::slot(&mut counts, frame, "increment");
        *count = count
            .checked_add(1)
            .unwrap_or_else(|| panic!("refcount increment: frame {frame} overflowed"));
        *count
    }

    /// Drop a reference to a frame, returning the new count.
    ///
    /// A result of zero means the caller held the last reference and may reclaim the frame.
    pub fn decrement(&self, frame: usize) -> u32 {
        let mut counts = self.counts.lock();
        let count = Self::slot(&mut counts, frame, "decrement");
        *count = count
            .checked_sub(1)
            .unwrap_or_else(|| panic!("refcount decrement: frame {frame} has no references"));
        *count
    }

    /// The current count of a frame.
    pub fn get(&self, frame: usize) -> u32 {
        *Self::slot(&mut self.counts.lock(), frame, "get")
    }

    /// Mark a frame as having a single owner.
    ///
    /// Used on allocation, when nothing else can see the frame yet.
    pub(crate) fn reset(&self, frame: usize) {
        *Self::slot(&mut self.counts.lock(), frame, "reset") = 1;
    }

    fn slot<'a>(counts: &'a mut [u32; N], frame: usize, op: &str) -> &'a mut u32 {
        counts
            .get_mut(frame)
            .unwrap_or_else(|| panic!("refcount {op}: frame {frame} out of range (have {N})"))
    }
}
impl<const N: usize> Default for RefCountTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::RefCountTable;

    #[test]
    fn counts_start_at_one() {
        let table = RefCountTable::<4>::new();
        assert!((0..4).all(|frame| table.get(frame) == 1));
    }

    #[test]
    fn share_then_drop() {
        let table = RefCountTable::<4>::new();
        assert_eq!(table.increment(2), 2);
        assert_eq!(table.decrement(2), 1);
        assert_eq!(table.decrement(2), 0);
        assert_eq!(table.get(1), 1, "Other frames are untouched");
        table.reset(2);
        assert_eq!(table.get(2), 1);
    }

    #[test]
    #[should_panic(expected = "has no references")]
    fn decrement_below_zero() {
        let table = RefCountTable::<1>::new();
        table.decrement(0);
        table.decrement(0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn index_out_of_range() {
        RefCountTable::<4>::new().increment(4);
    }
}
