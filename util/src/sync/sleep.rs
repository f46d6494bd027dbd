//! A lock for long-held exclusive access.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A lock whose waiters give up the processor instead of spinning.
///
/// This crate knows nothing about scheduling, so the caller passes in whatever "wait a bit"
/// operation fits its context (a scheduler yield in the kernel, [`std::thread::yield_now`] in
/// host tests). Holders may keep the lock across device I/O.
///
/// [`std::thread::yield_now`]: https://doc.rust-lang.org/std/thread/fn.yield_now.html
pub struct SleepLock<T: ?Sized> {
    /// Whether some context holds the lock.
    locked: AtomicBool,
    /// The protected value.
    value: UnsafeCell<T>,
}
impl<T> SleepLock<T> {
    /// Construct an unlocked [`SleepLock`].
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Lock, calling `wait` each time the lock is found to be held by someone else.
    pub fn lock_with(&self, mut wait: impl FnMut()) -> SleepLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            wait();
        }
    }

    /// Attempt to lock without waiting.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SleepLockGuard { lock: self })
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Access the value through an exclusive reference, without locking.
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

// SAFETY:
// Like a mutex, sharing the lock only ever hands the value to one context at a time.
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

/// An RAII guard for a [`SleepLock`].
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
}
impl<T: ?Sized> SleepLockGuard<'_, T> {
    /// Whether the underlying lock is held.
    ///
    /// This is always `true` for a live guard; it exists so callers can check the lock's own
    /// state rather than trusting the type.
    pub fn is_held(&self) -> bool {
        self.lock.is_locked()
    }
}
impl<T: ?Sized> Deref for SleepLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // SAFETY:
        // The guard only exists while `locked` is set by us, so no other reference exists.
        unsafe { &*self.lock.value.get() }
    }
}
impl<T: ?Sized> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY:
        // The guard only exists while `locked` is set by us, and we have `&mut self`.
        unsafe { &mut *self.lock.value.get() }
    }
}
impl<T: ?Sized> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
