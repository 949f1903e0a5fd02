//! CFS-lite scheduler: a single vruntime-ordered run queue.
//!
//! Ported from `original_source/kernel/proc/proc_scheduler.c`. The
//! original's tree node carries a bare `unsigned long vruntime` and its
//! `rbtree_insert` tolerates two threads tying on it. [`memory::primitives::RbTree`]
//! rejects a duplicate key outright, so [`Thread`]'s `RbNode` key is
//! `(vruntime, tid)` — `tid` is already unique and breaks every tie without
//! disturbing vruntime order.
//!
//! The original also calls an undeclared `proc_scheduler_wake` from
//! `proc_thread_wake`/`proc_thread_wake_one` — no such function exists
//! anywhere in that source tree, original or header. [`wake`] below is what
//! it must have meant: re-admit the thread exactly like [`add`] does.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use memory::{primitives::RbTree, sync::Spinlock};

use crate::thread::{self, Thread, ThreadState};

struct Scheduler {
    rb_threads: Spinlock<RbTree<Thread>>,
    num_threads: AtomicUsize,
    /// Smallest vruntime currently in the tree; newly-admitted threads are
    /// clamped to this so a thread that slept a long time doesn't come back
    /// with an unfairly stale (low) vruntime.
    min_vruntime: AtomicU64,
    /// When the currently running thread was scheduled in, for charging it
    /// its slice on the next `choose_next`/`sleep`.
    exec_start: AtomicU64,
}

static SCHEDULER: Scheduler = Scheduler {
    rb_threads: Spinlock::new(RbTree::new()),
    num_threads: AtomicUsize::new(1),
    min_vruntime: AtomicU64::new(0),
    exec_start: AtomicU64::new(0),
};

fn now_us() -> u64 {
    machine::time::time_manager().uptime().as_micros() as u64
}

/// `proc_scheduler_init`: reset run-queue bookkeeping for the bootstrap
/// thread and register this scheduler as the sleepable-lock subsystem's
/// parking backend, replacing `memory::sync`'s no-op default.
///
/// # Safety
///
/// Must run once, after [`thread::init`], during the fixed boot sequence.
pub unsafe fn init() {
    SCHEDULER.num_threads.store(1, Ordering::Relaxed);
    SCHEDULER.min_vruntime.store(0, Ordering::Relaxed);
    SCHEDULER.exec_start.store(now_us(), Ordering::Relaxed);
    memory::sync::register_scheduler_ops(&SCHED_OPS);
}

/// `proc_scheduler_add`: admit a new or newly-woken thread.
pub fn add(thread: &'static Thread) {
    let mut tree = SCHEDULER.rb_threads.acquire_irq();
    SCHEDULER.num_threads.fetch_add(1, Ordering::AcqRel);
    thread.set_state(ThreadState::Runnable);
    thread.set_vruntime(SCHEDULER.min_vruntime.load(Ordering::Acquire));
    unsafe { tree.insert(NonNull::from(thread)) };
}

/// `proc_scheduler_remove`.
pub fn remove(thread: &'static Thread) {
    let mut tree = SCHEDULER.rb_threads.acquire_irq();
    SCHEDULER.num_threads.fetch_sub(1, Ordering::AcqRel);
    thread.set_state(ThreadState::Suspended);
    unsafe { tree.remove(NonNull::from(thread)) };
}

/// `_proc_scheduler_choose`: pull the least-deserving-of-more-time thread
/// out of the tree and mark it running. Caller holds `tree`'s lock.
fn pop_next(tree: &mut RbTree<Thread>) -> &'static Thread {
    let node = tree.first().expect("at least one thread is always runnable");
    let thread = unsafe { node.as_ref() };
    unsafe { tree.remove(node) };
    thread.set_state(ThreadState::Running);
    SCHEDULER.min_vruntime.store(thread.vruntime(), Ordering::Release);
    SCHEDULER.exec_start.store(now_us(), Ordering::Release);
    thread
}

/// `proc_scheduler_choose`: charge the running thread for the slice it just
/// used, put it back in the tree as runnable, and switch to whichever
/// thread now has the smallest vruntime. A no-op if that's still `current`.
pub fn choose_next() {
    let current = thread::current();
    let mut tree = SCHEDULER.rb_threads.acquire_irq();

    current.set_state(ThreadState::Runnable);
    let elapsed = now_us() - SCHEDULER.exec_start.load(Ordering::Acquire);
    current.set_vruntime(current.vruntime() + elapsed);
    unsafe { tree.insert(NonNull::from(current)) };

    let next = pop_next(&mut tree);
    drop(tree);

    if !core::ptr::eq(next, current) {
        thread::switch(next);
    }
}

/// `proc_scheduler_sleep`: the caller has already parked `current` off the
/// run queue (see [`thread::sleep`]); charge it for the slice it used and
/// hand the CPU to the next thread.
pub fn sleep() {
    let current = thread::current();
    let mut tree = SCHEDULER.rb_threads.acquire_irq();

    SCHEDULER.num_threads.fetch_sub(1, Ordering::AcqRel);
    current.set_state(ThreadState::Sleeping);
    let elapsed = now_us() - SCHEDULER.exec_start.load(Ordering::Acquire);
    current.set_vruntime(current.vruntime() + elapsed);

    let next = pop_next(&mut tree);
    drop(tree);

    thread::switch(next);
}

/// Re-admit a thread a wake call pulled off an event bucket. Same
/// admission rule as [`add`] (vruntime clamped to the current minimum).
pub fn wake(thread: &'static Thread) {
    add(thread);
}

struct KernelSchedulerOps;

impl memory::sync::SchedulerOps for KernelSchedulerOps {
    fn current_vruntime(&self) -> u64 {
        thread::current().vruntime()
    }

    fn current_thread_id(&self) -> usize {
        thread::current().tid as usize
    }

    fn sleep_on(&self, channel: usize, unlock: &mut dyn FnMut()) {
        thread::sleep(channel, unlock, false);
    }

    fn wake_all(&self, channel: usize) {
        thread::wake(channel);
    }

    fn wake_one(&self, channel: usize, thread_id: usize) {
        thread::wake_thread(channel, thread_id as u32);
    }
}

static SCHED_OPS: KernelSchedulerOps = KernelSchedulerOps;
