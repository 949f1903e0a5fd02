//! Packed-word reader/writer spinlock.
//!
//! A single `AtomicUsize` carries the whole lock state: bit 0 is the writer
//! flag, the remaining bits are the reader count. Readers are preferred —
//! a reader never waits behind a pending writer, only behind one already
//! holding the lock — matching the original's `spin_lock`/`spin_lock_read`.
//! `acquire_irq`/`release_irq` additionally mask local IRQs for the
//! duration of the hold, for state also touched from interrupt context.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use machine::exception::asynchronous::{local_irq_mask_save, local_irq_restore};

const WRITER_BIT: usize = 1;
const READER_STEP: usize = 2;

/// A packed-word reader/writer spinlock.
pub struct Spinlock<T: ?Sized> {
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create a free lock wrapping `data`.
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Spinlock<T> {
    fn spin_acquire_write(&self) {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
        }
    }

    fn release_write(&self) {
        self.state.store(0, Ordering::Release);
    }

    fn spin_acquire_read(&self) {
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & WRITER_BIT != 0 {
                core::hint::spin_loop();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(
                    cur,
                    cur + READER_STEP,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    fn release_read(&self) {
        self.state.fetch_sub(READER_STEP, Ordering::Release);
    }

    /// Acquire exclusive access, spinning until available.
    pub fn acquire(&self) -> SpinlockGuard<'_, T> {
        self.spin_acquire_write();
        SpinlockGuard { lock: self, saved_daif: None }
    }

    /// Acquire exclusive access with local IRQs masked for the duration.
    pub fn acquire_irq(&self) -> SpinlockGuard<'_, T> {
        let saved = local_irq_mask_save();
        self.spin_acquire_write();
        SpinlockGuard { lock: self, saved_daif: Some(saved) }
    }

    /// Acquire shared (read) access, spinning until available.
    pub fn acquire_read(&self) -> SpinlockReadGuard<'_, T> {
        self.spin_acquire_read();
        SpinlockReadGuard { lock: self }
    }
}

/// RAII guard for [`Spinlock::acquire`]/[`Spinlock::acquire_irq`].
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
    saved_daif: Option<u64>,
}

impl<'a, T: ?Sized> Deref for SpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_write();
        if let Some(saved) = self.saved_daif {
            local_irq_restore(saved);
        }
    }
}

/// RAII guard for [`Spinlock::acquire_read`].
pub struct SpinlockReadGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<'a, T: ?Sized> Deref for SpinlockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinlockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_sees_update() {
        let lock = Spinlock::new(0u32);
        *lock.acquire() = 42;
        assert_eq!(*lock.acquire_read(), 42);
    }

    #[test]
    fn concurrent_readers_share_the_count() {
        let lock = Spinlock::new(7u32);
        let a = lock.acquire_read();
        let b = lock.acquire_read();
        assert_eq!(*a, 7);
        assert_eq!(*b, 7);
    }
}
