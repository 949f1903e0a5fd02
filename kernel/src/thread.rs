//! Threads: the schedulable unit, one kernel stack and one saved context
//! each.
//!
//! Ported from `original_source/kernel/proc/proc_thread.c`. Allocation
//! again goes through a pair of [`memory::slab::Slab`]s (`proc_thread_t`
//! and its kernel stack, `PROC_THREAD_SLAB_NUM`/`KERNEL_STACK_SLAB_NUM` in
//! the original), and sleep/wake goes through an event hash table keyed the
//! same way [`memory::vm_page::hash`] keys its object/offset table —
//! FNV-1a of the event value, modulo bucket count.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use memory::{
    primitives::{Linked, List, ListLink},
    slab::Slab,
    sync::Spinlock,
};

use crate::{
    context_switch::{self, ThreadContext},
    scheduler,
    task::Task,
};

/// `proc_thread_state_t`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Suspended,
    Runnable,
    Running,
    Sleeping,
    Terminated,
}

/// Marker [`Linked`] tag for a thread's membership in its task's thread list.
pub struct TaskTag;
/// Marker [`Linked`] tag for a thread's membership in an event hash bucket.
pub struct EventTag;

/// `proc_event_t`: an opaque value threads sleep on and callers wake by.
/// Usually the address of whatever the thread is waiting for (a `Lock`'s
/// channel, an IRQ number) cast to a `usize`.
pub type Event = usize;

/// `proc_thread_t`.
pub struct Thread {
    lock: Spinlock<ThreadInner>,
    pub tid: u32,
    pub task: NonNull<Task>,
    kernel_stack: NonNull<u8>,
    tnode: ListLink<Thread>,
    enode: ListLink<Thread>,
    /// `proc_scheduler_context_t`: run-queue linkage and vruntime.
    rb_node: memory::primitives::RbLink<Thread>,
    vruntime: core::cell::Cell<u64>,
    pub(crate) context: core::cell::UnsafeCell<ThreadContext>,
}

struct ThreadInner {
    state: ThreadState,
    suspend_cnt: u32,
    refcnt: u32,
    event: Option<Event>,
}

unsafe impl Sync for Thread {}

impl Linked<TaskTag> for Thread {
    fn link(&self) -> &ListLink<Thread> {
        &self.tnode
    }
}

impl Linked<EventTag> for Thread {
    fn link(&self) -> &ListLink<Thread> {
        &self.enode
    }
}

impl memory::primitives::RbNode for Thread {
    type Key = (u64, u32);

    fn link(&self) -> &memory::primitives::RbLink<Thread> {
        &self.rb_node
    }

    fn key(&self) -> Self::Key {
        (self.vruntime.get(), self.tid)
    }
}

impl Thread {
    fn inner(&self) -> memory::sync::SpinlockGuard<'_, ThreadInner> {
        self.lock.acquire_irq()
    }

    pub fn state(&self) -> ThreadState {
        self.inner().state
    }

    /// Used by [`crate::scheduler`] to record run-queue transitions.
    pub(crate) fn set_state(&self, state: ThreadState) {
        self.inner().state = state;
    }

    pub fn vruntime(&self) -> u64 {
        self.vruntime.get()
    }

    pub(crate) fn set_vruntime(&self, v: u64) {
        self.vruntime.set(v);
    }

    /// `proc_thread_reference`.
    pub fn reference(&self) {
        self.inner().refcnt += 1;
    }

    /// `proc_thread_unreference`.
    pub fn unreference(&self) {
        let mut inner = self.inner();
        inner.refcnt -= 1;
        if inner.refcnt == 0 {
            drop(inner);
            unsafe { self.task.as_ref().remove_thread(NonNull::from(self)) };
            unsafe {
                KERNEL_STACK_SLAB.free(self.kernel_stack);
                THREAD_SLAB.free(NonNull::new_unchecked(self as *const Thread as *mut u8));
            }
        }
    }

    /// `proc_thread_resume`.
    pub fn resume(&self) {
        let mut inner = self.inner();
        inner.suspend_cnt -= 1;
        if inner.suspend_cnt == 0 {
            drop(inner);
            scheduler::add(self);
        }
    }

    /// `proc_thread_suspend`.
    pub fn suspend(&self) {
        self.inner().suspend_cnt += 1;
    }
}

const THREAD_SLAB_NUM: usize = 1024;
const THREAD_SLAB_BYTES: usize = THREAD_SLAB_NUM * core::mem::size_of::<Thread>();
const KERNEL_STACK_SIZE: usize = machine::arch::aarch64::memory::PAGE_SIZE;
const KERNEL_STACK_SLAB_NUM: usize = 1024;
const KERNEL_STACK_SLAB_BYTES: usize = KERNEL_STACK_SLAB_NUM * KERNEL_STACK_SIZE;

static THREAD_SLAB: Slab<'static> = Slab::new(core::mem::size_of::<Thread>());
static mut THREAD_SLAB_STORAGE: [u8; THREAD_SLAB_BYTES] = [0; THREAD_SLAB_BYTES];

static KERNEL_STACK_SLAB: Slab<'static> = Slab::new(KERNEL_STACK_SIZE);
static mut KERNEL_STACK_SLAB_STORAGE: [u8; KERNEL_STACK_SLAB_BYTES] = [0; KERNEL_STACK_SLAB_BYTES];

const NUM_EVENT_BUCKETS: usize = 1024;

struct EventHashTable {
    buckets: [Spinlock<List<Thread, EventTag>>; NUM_EVENT_BUCKETS],
}

static EVENT_TABLE: EventHashTable = EventHashTable {
    buckets: [const { Spinlock::new(List::new()) }; NUM_EVENT_BUCKETS],
};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn event_bucket(event: Event) -> usize {
    let mut hash = FNV_OFFSET_BASIS;
    for b in (event as u64).to_ne_bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % NUM_EVENT_BUCKETS as u64) as usize
}

static NEXT_TID: AtomicUsize = AtomicUsize::new(1);

static mut CURRENT_THREAD: Option<NonNull<Thread>> = None;

/// `proc_thread_current()`.
pub fn current() -> &'static Thread {
    unsafe { CURRENT_THREAD.expect("thread::init must run before current()").as_ref() }
}

fn set_current(thread: NonNull<Thread>) {
    unsafe { CURRENT_THREAD = Some(thread) };
}

/// `proc_thread_init`: grows both slabs, and turns the code currently
/// running (the boot stack) into the kernel task's first thread.
///
/// # Safety
///
/// Must run exactly once, after [`crate::task::init`], with interrupts
/// still masked.
pub unsafe fn init(kernel_task: &'static Task) {
    THREAD_SLAB.grow(&mut THREAD_SLAB_STORAGE).expect("thread slab backing buffer is block-size aligned");
    KERNEL_STACK_SLAB
        .grow(&mut KERNEL_STACK_SLAB_STORAGE)
        .expect("kernel stack slab backing buffer is page aligned");

    let block = THREAD_SLAB.zalloc().expect("thread slab has room for the bootstrap thread");
    let thread_ptr = block.as_ptr() as *mut Thread;

    thread_ptr.write(Thread {
        lock: Spinlock::new(ThreadInner {
            state: ThreadState::Running,
            suspend_cnt: 0,
            refcnt: 1,
            event: None,
        }),
        tid: tid_alloc(),
        task: NonNull::from(kernel_task),
        kernel_stack: NonNull::dangling(), // the boot stack, not slab-owned
        tnode: ListLink::new(),
        enode: ListLink::new(),
        rb_node: memory::primitives::RbLink::new(),
        vruntime: core::cell::Cell::new(0),
        context: core::cell::UnsafeCell::new(ThreadContext::zeroed()),
    });

    let thread = NonNull::new_unchecked(thread_ptr);
    crate::task::register_thread(kernel_task, thread);
    set_current(thread);
}

fn tid_alloc() -> u32 {
    NEXT_TID.fetch_add(1, Ordering::Relaxed) as u32
}

/// `proc_thread_create`: allocate a new, suspended thread in `task` with
/// its own one-page kernel stack, `entry` as its first-run program counter.
pub fn create(task: &'static Task, entry: extern "C" fn() -> !) -> Option<&'static Thread> {
    let stack = KERNEL_STACK_SLAB.zalloc()?;
    let block = match THREAD_SLAB.zalloc() {
        Some(b) => b,
        None => {
            unsafe { KERNEL_STACK_SLAB.free(stack) };
            return None;
        }
    };
    let thread_ptr = block.as_ptr() as *mut Thread;

    unsafe {
        thread_ptr.write(Thread {
            lock: Spinlock::new(ThreadInner {
                state: ThreadState::Suspended,
                suspend_cnt: task.suspend_cnt() + 1,
                refcnt: 1,
                event: None,
            }),
            tid: tid_alloc(),
            task: NonNull::from(task),
            kernel_stack: stack,
            tnode: ListLink::new(),
            enode: ListLink::new(),
            rb_node: memory::primitives::RbLink::new(),
            vruntime: core::cell::Cell::new(0),
            context: core::cell::UnsafeCell::new(ThreadContext::first_run(
                stack.as_ptr(),
                KERNEL_STACK_SIZE,
                entry,
            )),
        });

        let thread = &*thread_ptr;
        crate::task::register_thread(task, NonNull::from(thread));
        Some(thread)
    }
}

/// `proc_thread_switch`: context switch to `new_thread`, taking both
/// threads' locks in address order to avoid an ABBA deadlock against a
/// concurrent switch the other way, same as the original. The original
/// also calls `pmap_deactivate`/`pmap_activate` here when `new_thread.task
/// != old_thread.task`; every thread still belongs to the single kernel
/// task for now, so there is no second address space to switch into and
/// nothing to call.
pub fn switch(new_thread: &'static Thread) {
    let cur = current();
    let cur_ptr = cur as *const Thread;
    let new_ptr = new_thread as *const Thread;

    if core::ptr::eq(cur, new_thread) {
        let _g = new_thread.lock.acquire_irq();
        return;
    }

    let (_first, _second) = if (cur_ptr as usize) < (new_ptr as usize) {
        (cur.lock.acquire_irq(), new_thread.lock.acquire_irq())
    } else {
        (new_thread.lock.acquire_irq(), cur.lock.acquire_irq())
    };

    set_current(NonNull::from(new_thread));
    unsafe { context_switch::switch(cur.context.get(), new_thread.context.get()) };
    // Execution resumes here once some other thread switches back to `cur`.
}

/// `proc_thread_sleep`: park the current thread on `event`, release
/// `unlock` once queued, then ask the scheduler for someone else to run.
/// `interruptible` is accepted for parity with the original's signature but
/// unused — nothing yet generates the signals that would need it.
pub fn sleep(event: Event, unlock: &mut dyn FnMut(), _interruptible: bool) {
    let bucket = event_bucket(event);
    let cur = current();

    let mut bucket_guard = EVENT_TABLE.buckets[bucket].acquire_irq();
    let mut cur_guard = cur.inner();
    cur_guard.event = Some(event);
    unsafe { bucket_guard.push_back(NonNull::from(cur)) };
    drop(cur_guard);

    unlock();

    drop(bucket_guard);

    scheduler::sleep();
}

/// Which sleepers on an event bucket a wake call should take.
enum WakeFilter {
    /// Every thread sleeping on the event.
    All,
    /// Just the first match.
    One,
    /// Just the named thread, if it's sleeping on this event.
    Thread(u32),
}

impl WakeFilter {
    fn matches(&self, tid: u32) -> bool {
        match self {
            WakeFilter::Thread(t) => *t == tid,
            _ => true,
        }
    }

    fn stop_after_first(&self) -> bool {
        !matches!(self, WakeFilter::All)
    }
}

fn wake_matching(event: Event, filter: WakeFilter) {
    let bucket = event_bucket(event);
    let mut guard = EVENT_TABLE.buckets[bucket].acquire_irq();

    let mut woken = alloc_none();
    for node in guard.iter() {
        let thread = unsafe { node.as_ref() };
        if thread.inner().event == Some(event) && filter.matches(thread.tid) {
            woken.push(node);
            if filter.stop_after_first() {
                break;
            }
        }
    }
    for node in &woken {
        unsafe { guard.remove(*node) };
    }
    drop(guard);

    for node in woken {
        let thread = unsafe { node.as_ref() };
        thread.inner().event = None;
        scheduler::wake(thread);
    }
}

/// A thread can only ever be on one event bucket at a time (`NUM_EVENT_BUCKETS`
/// entries to remove is bounded well below any array-backed alternative), so a
/// small fixed-capacity scratch list avoids pulling in an allocator here.
fn alloc_none() -> heapless_list::FixedVec {
    heapless_list::FixedVec::new()
}

mod heapless_list {
    use core::ptr::NonNull;

    use super::Thread;

    const CAP: usize = 64;

    pub struct FixedVec {
        items: [Option<NonNull<Thread>>; CAP],
        len: usize,
    }

    impl FixedVec {
        pub fn new() -> Self {
            Self { items: [None; CAP], len: 0 }
        }

        pub fn push(&mut self, item: NonNull<Thread>) {
            if self.len < CAP {
                self.items[self.len] = Some(item);
                self.len += 1;
            }
        }
    }

    impl IntoIterator for FixedVec {
        type Item = NonNull<Thread>;
        type IntoIter = core::iter::Flatten<core::array::IntoIter<Option<NonNull<Thread>>, CAP>>;

        fn into_iter(self) -> Self::IntoIter {
            self.items.into_iter().flatten()
        }
    }

    impl<'a> IntoIterator for &'a FixedVec {
        type Item = &'a NonNull<Thread>;
        type IntoIter = core::iter::Flatten<core::slice::Iter<'a, Option<NonNull<Thread>>>>;

        fn into_iter(self) -> Self::IntoIter {
            self.items[..self.len].iter().flatten()
        }
    }
}

/// `proc_thread_wake`: wake every thread sleeping on `event`.
pub fn wake(event: Event) {
    wake_matching(event, WakeFilter::All);
}

/// `proc_thread_wake_one`: wake only the first thread sleeping on `event`.
pub fn wake_one(event: Event) {
    wake_matching(event, WakeFilter::One);
}

/// Wake `tid` specifically, if it's currently sleeping on `event`. Backs
/// [`memory::sync::lock::SchedulerOps::wake_one`], which names the thread
/// an exclusive-upgrade lock release should hand off to.
pub(crate) fn wake_thread(event: Event, tid: u32) {
    wake_matching(event, WakeFilter::Thread(tid));
}
