//! Sleepable reader/writer lock with upgrade-priority-by-vruntime
//! semantics, ported from the original's `lock_acquire_exclusive` /
//! `lock_acquire_shared` / `lock_release_*`.
//!
//! Parking is delegated to whatever scheduler registers itself via
//! [`register_scheduler_ops`] — `memory` has no business knowing about
//! `Task`/`Thread`, only about "park the caller on this channel" and
//! "wake whoever is parked there".

use core::cell::UnsafeCell;

use crate::sync::spinlock::Spinlock;

/// Scheduler-side hooks a `Lock` needs to block and wake callers, without
/// `memory` depending on the crate that owns `Task`/`Thread`.
pub trait SchedulerOps: Sync {
    /// Virtual runtime of the currently running thread, used to decide
    /// upgrade priority among competing shared-to-exclusive requests.
    fn current_vruntime(&self) -> u64;

    /// Opaque id of the currently running thread.
    fn current_thread_id(&self) -> usize;

    /// Mark the calling thread as sleeping on `channel`, call `unlock` once
    /// it is queued (this is where the caller drops its spinlock guard),
    /// then yield. Returns once woken.
    fn sleep_on(&self, channel: usize, unlock: &mut dyn FnMut());

    /// Wake every thread parked on `channel`.
    fn wake_all(&self, channel: usize);

    /// Wake the thread identified by `thread_id` if parked on `channel`.
    fn wake_one(&self, channel: usize, thread_id: usize);
}

struct NullSchedulerOps;

impl SchedulerOps for NullSchedulerOps {
    fn current_vruntime(&self) -> u64 {
        0
    }
    fn current_thread_id(&self) -> usize {
        0
    }
    fn sleep_on(&self, _channel: usize, unlock: &mut dyn FnMut()) {
        unlock();
    }
    fn wake_all(&self, _channel: usize) {}
    fn wake_one(&self, _channel: usize, _thread_id: usize) {}
}

static NULL_SCHEDULER_OPS: NullSchedulerOps = NullSchedulerOps;
static mut SCHEDULER_OPS: &'static dyn SchedulerOps = &NULL_SCHEDULER_OPS;

/// Register the scheduler implementation. Must happen once, before any
/// `Lock` can block, during the fixed singleton init order (spec §9).
///
/// # Safety
///
/// Must not be called concurrently with itself or with `scheduler_ops()`.
pub unsafe fn register_scheduler_ops(ops: &'static dyn SchedulerOps) {
    SCHEDULER_OPS = ops;
}

fn scheduler_ops() -> &'static dyn SchedulerOps {
    unsafe { SCHEDULER_OPS }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LockState {
    Free,
    Shared,
    Exclusive,
    ExclusiveUpgrade,
}

struct LockInner {
    state: LockState,
    shared_count: u32,
    /// Thread id that currently holds (or is waiting to upgrade into)
    /// exclusive ownership.
    thread: Option<usize>,
    /// Vruntime of `thread` when it registered as the upgrade candidate;
    /// compared against competing upgraders so the one with the lowest
    /// vruntime wins, same as the original.
    upgrade_vruntime: Option<u64>,
}

/// A sleepable reader/writer lock.
pub struct Lock<T: ?Sized> {
    interlock: Spinlock<LockInner>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Lock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Lock<T> {}

impl<T> Lock<T> {
    /// Create a free lock wrapping `data`.
    pub const fn new(data: T) -> Self {
        Self {
            interlock: Spinlock::new(LockInner {
                state: LockState::Free,
                shared_count: 0,
                thread: None,
                upgrade_vruntime: None,
            }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Lock<T> {
    fn channel(&self) -> usize {
        self as *const Self as *const () as usize
    }

    /// Block until exclusive ownership is granted.
    pub fn acquire_exclusive(&self) -> ExclusiveGuard<'_, T> {
        let channel = self.channel();
        let mut guard = Some(self.interlock.acquire_irq());

        loop {
            let state = guard.as_ref().unwrap().state;
            if state == LockState::Free {
                break;
            }

            let ops = scheduler_ops();
            let my_vruntime = ops.current_vruntime();
            let my_id = ops.current_thread_id();

            {
                let inner = guard.as_mut().unwrap();
                match inner.state {
                    LockState::Shared => {
                        inner.thread = Some(my_id);
                        inner.upgrade_vruntime = Some(my_vruntime);
                        inner.state = LockState::ExclusiveUpgrade;
                    }
                    LockState::ExclusiveUpgrade => {
                        if my_vruntime < inner.upgrade_vruntime.unwrap_or(u64::MAX) {
                            inner.thread = Some(my_id);
                            inner.upgrade_vruntime = Some(my_vruntime);
                        }
                    }
                    _ => {}
                }
            }

            let mut to_drop = guard.take();
            ops.sleep_on(channel, &mut || {
                to_drop.take();
            });
            guard = Some(self.interlock.acquire_irq());
        }

        let inner = guard.as_mut().unwrap();
        inner.thread = Some(scheduler_ops().current_thread_id());
        inner.state = LockState::Exclusive;

        ExclusiveGuard { lock: self }
    }

    /// Non-blocking exclusive acquire.
    pub fn try_acquire_exclusive(&self) -> Option<ExclusiveGuard<'_, T>> {
        let mut guard = self.interlock.acquire_irq();
        if guard.state != LockState::Free {
            return None;
        }
        guard.thread = Some(scheduler_ops().current_thread_id());
        guard.state = LockState::Exclusive;
        drop(guard);
        Some(ExclusiveGuard { lock: self })
    }

    /// Block until shared ownership is granted.
    pub fn acquire_shared(&self) -> SharedGuard<'_, T> {
        let channel = self.channel();
        let mut guard = Some(self.interlock.acquire_irq());

        loop {
            let blocks = {
                let inner = guard.as_ref().unwrap();
                let my_vruntime = scheduler_ops().current_vruntime();
                inner.state == LockState::Exclusive
                    || (inner.state == LockState::ExclusiveUpgrade
                        && my_vruntime > inner.upgrade_vruntime.unwrap_or(0))
            };
            if !blocks {
                break;
            }

            let mut to_drop = guard.take();
            scheduler_ops().sleep_on(channel, &mut || {
                to_drop.take();
            });
            guard = Some(self.interlock.acquire_irq());
        }

        let inner = guard.as_mut().unwrap();
        inner.shared_count += 1;
        if inner.state != LockState::ExclusiveUpgrade {
            inner.state = LockState::Shared;
        }

        SharedGuard { lock: self }
    }

    /// Non-blocking shared acquire.
    pub fn try_acquire_shared(&self) -> Option<SharedGuard<'_, T>> {
        let mut guard = self.interlock.acquire_irq();
        let my_vruntime = scheduler_ops().current_vruntime();
        if guard.state == LockState::Exclusive
            || (guard.state == LockState::ExclusiveUpgrade
                && my_vruntime > guard.upgrade_vruntime.unwrap_or(0))
        {
            return None;
        }
        guard.shared_count += 1;
        if guard.state != LockState::ExclusiveUpgrade {
            guard.state = LockState::Shared;
        }
        drop(guard);
        Some(SharedGuard { lock: self })
    }

    fn release_exclusive(&self) {
        let mut guard = self.interlock.acquire_irq();
        debug_assert_eq!(guard.state, LockState::Exclusive);
        guard.thread = None;
        guard.upgrade_vruntime = None;
        guard.state = LockState::Free;
        drop(guard);
        scheduler_ops().wake_all(self.channel());
    }

    fn release_shared(&self) {
        let mut guard = self.interlock.acquire_irq();
        debug_assert!(guard.shared_count > 0);

        let upgrader = if guard.state == LockState::ExclusiveUpgrade {
            guard.thread
        } else {
            None
        };

        guard.shared_count -= 1;
        let do_wake = guard.shared_count == 0;
        if do_wake {
            guard.state = LockState::Free;
        }
        drop(guard);

        if do_wake {
            match upgrader {
                Some(tid) => scheduler_ops().wake_one(self.channel(), tid),
                None => scheduler_ops().wake_all(self.channel()),
            }
        }
    }
}

/// RAII guard for [`Lock::acquire_exclusive`].
pub struct ExclusiveGuard<'a, T: ?Sized> {
    lock: &'a Lock<T>,
}

impl<'a, T: ?Sized> core::ops::Deref for ExclusiveGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> core::ops::DerefMut for ExclusiveGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for ExclusiveGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

/// RAII guard for [`Lock::acquire_shared`].
pub struct SharedGuard<'a, T: ?Sized> {
    lock: &'a Lock<T>,
}

impl<'a, T: ?Sized> core::ops::Deref for SharedGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SharedGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_exclusive_round_trips() {
        let lock = Lock::new(5i32);
        {
            let mut g = lock.acquire_exclusive();
            *g += 1;
        }
        assert_eq!(*lock.acquire_shared(), 6);
    }

    #[test]
    fn try_exclusive_fails_while_shared_held() {
        let lock = Lock::new(0i32);
        let _reader = lock.acquire_shared();
        assert!(lock.try_acquire_exclusive().is_none());
    }

    #[test]
    fn multiple_shared_readers_coexist() {
        let lock = Lock::new(3i32);
        let a = lock.acquire_shared();
        let b = lock.try_acquire_shared().expect("second reader allowed");
        assert_eq!(*a, 3);
        assert_eq!(*b, 3);
    }
}
