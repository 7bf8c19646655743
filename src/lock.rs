//! Spin locks.
//!
//! `Spinlock<T>` is the building block for every piece of shared mutable
//! state in the crate: the cache pool, the open-inode table, the frame
//! table, the swap bitmap, per-SPTE state, and per-inode bookkeeping.
//! `RwxLock` layers the per-inode access-class protocol on top of it.

use core::cell::UnsafeCell;
use core::fmt;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinlock {
    locked: AtomicBool,
}

impl RawSpinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock. Loops (spins) until the lock is acquired.
    ///
    /// An atomic exchange with `Acquire` ordering pairs with the `Release`
    /// store in `release()`, so all stores done in one critical section are
    /// visible to loads in the next.
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    /// Acquires the lock only if it is free right now.
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A spin lock that owns its data.
pub struct Spinlock<T> {
    name: &'static str,
    lock: RawSpinlock,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to the inner data.
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            lock: RawSpinlock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.lock.acquire();
        SpinlockGuard { lock: self }
    }

    /// Returns a guard only if the lock is free right now.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.lock.try_acquire() {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the inner data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spinlock {{ name: {:?} }}", self.name)
    }
}

/// Guard of a `Spinlock<T>`. The lock is released on drop.
pub struct SpinlockGuard<'s, T> {
    lock: &'s Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the lock is held and `&mut self` is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

/// Access class currently holding an `RwxLock`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Mode {
    Free,
    Reader,
    Writer,
    Excl,
}

struct RwxState {
    mode: Mode,
    count: u32,
}

/// The per-inode reader/writer/exclusive protocol.
///
/// At most one access class is active at a time. Within the reader and
/// writer classes any number of holders proceed concurrently; the exclusive
/// class (extending writes, directory mutation, creation, close) admits a
/// single holder and excludes both other classes. Class entry is re-entrant
/// for readers and writers, which path traversal and directory scans rely
/// on.
pub struct RwxLock {
    state: Spinlock<RwxState>,
}

impl RwxLock {
    pub const fn new() -> Self {
        Self {
            state: Spinlock::new(
                "rwx",
                RwxState {
                    mode: Mode::Free,
                    count: 0,
                },
            ),
        }
    }

    fn enter(&self, want: Mode) {
        loop {
            {
                let mut state = self.state.lock();
                if state.mode == Mode::Free {
                    state.mode = want;
                    state.count = 1;
                    return;
                }
                if state.mode == want && want != Mode::Excl {
                    state.count += 1;
                    return;
                }
            }
            spin_loop();
        }
    }

    fn exit(&self, want: Mode) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.mode, want);
        debug_assert!(state.count > 0);
        state.count -= 1;
        if state.count == 0 {
            state.mode = Mode::Free;
        }
    }

    pub fn read_enter(&self) {
        self.enter(Mode::Reader);
    }

    pub fn read_exit(&self) {
        self.exit(Mode::Reader);
    }

    pub fn write_enter(&self) {
        self.enter(Mode::Writer);
    }

    pub fn write_exit(&self) {
        self.exit(Mode::Writer);
    }

    pub fn excl_enter(&self) {
        self.enter(Mode::Excl);
    }

    pub fn excl_exit(&self) {
        self.exit(Mode::Excl);
    }

    /// Converts a held exclusive class into a writer-class hold without a
    /// window in which another class can slip in.
    pub fn downgrade_to_write(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.mode, Mode::Excl);
        debug_assert_eq!(state.count, 1);
        state.mode = Mode::Writer;
    }
}

impl fmt::Debug for RwxLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(f, "RwxLock {{ mode: {:?}, count: {} }}", state.mode, state.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn spinlock_serializes() {
        let counter = Arc::new(Spinlock::new("counter", 0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *counter.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new("l", ());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn readers_are_concurrent() {
        let lock = RwxLock::new();
        lock.read_enter();
        lock.read_enter();
        lock.read_exit();
        lock.read_exit();
    }

    #[test]
    fn excl_excludes_readers() {
        let lock = Arc::new(RwxLock::new());
        lock.excl_enter();
        let l2 = lock.clone();
        let reader = thread::spawn(move || {
            l2.read_enter();
            l2.read_exit();
        });
        // The reader cannot enter until the exclusive hold is dropped.
        thread::sleep(std::time::Duration::from_millis(10));
        assert!(!reader.is_finished());
        lock.excl_exit();
        reader.join().unwrap();
    }

    #[test]
    fn downgrade_keeps_out_excl() {
        let lock = Arc::new(RwxLock::new());
        lock.excl_enter();
        lock.downgrade_to_write();
        // Another writer may now join.
        lock.write_enter();
        lock.write_exit();
        lock.write_exit();
    }
}
