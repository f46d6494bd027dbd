//! The machine and driver services the resource managers rely on.
//!
//! The kernel implements these on real hardware; tests implement them with threads and memory.

use crate::{error::Result, param::BLOCK_SIZE};

/// Which way a block transfer goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Disk to memory.
    Read,
    /// Memory to disk.
    Write,
}

/// The identity of one block on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    /// Device number.
    pub dev: u32,
    /// Block number within the device.
    pub blockno: u32,
}
impl BlockId {
    /// Construct a block identity.
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }
}

/// A disk driver.
pub trait BlockDevice: Sync {
    /// Synchronously move one block between the device and `data`.
    ///
    /// Returns once the transfer is complete.
    fn transfer(
        &self,
        block: BlockId,
        data: &mut [u8; BLOCK_SIZE],
        direction: Direction,
    ) -> Result<()>;
}

/// Time and scheduling services.
pub trait Sched: Sync {
    /// The current value of a monotonic tick counter.
    fn ticks(&self) -> u32;

    /// Give up the processor while waiting for a sleep lock.
    fn yield_now(&self) {
        core::hint::spin_loop();
    }
}

/// Per-core machine state.
pub trait Cpu: Sync {
    /// The index of the core the caller is running on.
    ///
    /// Only stable while interrupts are disabled; see [`InterruptGuard`].
    fn id(&self) -> usize;

    /// Whether device interrupts are enabled on this core.
    fn interrupts_enabled(&self) -> bool;

    /// Enable or disable device interrupts on this core.
    fn set_interrupts(&self, enabled: bool);
}

/// Keeps interrupts disabled on the current core while alive.
///
/// With interrupts off the caller can't be preempted or migrated, so the core id read at
/// construction stays valid until the guard is dropped. Guards nest: each restores the state it
/// found.
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct InterruptGuard<'a, C: Cpu + ?Sized> {
    cpu: &'a C,
    was_enabled: bool,
    cpu_id: usize,
}
impl<'a, C: Cpu + ?Sized> InterruptGuard<'a, C> {
    /// Disable interrupts and pin the caller to its current core.
    pub fn new(cpu: &'a C) -> Self {
        let was_enabled = cpu.interrupts_enabled();
        cpu.set_interrupts(false);
        Self {
            cpu,
            was_enabled,
            cpu_id: cpu.id(),
        }
    }

    /// The core this guard is pinned to.
    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }
}
impl<C: Cpu + ?Sized> Drop for InterruptGuard<'_, C> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.cpu.id(),
            self.cpu_id,
            "Migrated cores with interrupts disabled"
        );
        if self.was_enabled {
            self.cpu.set_interrupts(true);
        }
    }
}
