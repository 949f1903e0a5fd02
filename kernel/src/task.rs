//! Tasks: the address-space-owning container threads run inside.
//!
//! Ported from `original_source/kernel/proc/proc_task.c`. `proc_task_t`
//! becomes [`Task`]; the fixed-size slab it's carved from
//! (`PROC_TASK_SLAB_NUM`) becomes a [`memory::slab::Slab`] over a static
//! backing buffer, the same treatment [`memory::slab`] itself already
//! gives fixed-block allocation.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use memory::{
    primitives::{List, ListLink, Linked},
    slab::Slab,
    sync::{Spinlock, SpinlockGuard},
    vm_map::VmMap,
};

use crate::thread::Thread;

/// `proc_task_state_t`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    New,
    Active,
    Suspended,
    Terminated,
}

/// `proc_task_t`.
pub struct Task {
    lock: Spinlock<TaskInner>,
    /// Task/process id, stable for the task's lifetime.
    pub pid: u32,
    refcnt: AtomicU32,
    /// Virtual memory map owned by this task. Every thread in the task
    /// runs against this address space.
    pub vm_map: &'static VmMap<'static>,
    tnode: ListLink<Task>,
}

struct TaskInner {
    state: TaskState,
    threads: List<Thread, crate::thread::TaskTag>,
    num_threads: usize,
    suspend_cnt: u32,
    parent: Option<NonNull<Task>>,
}

unsafe impl Sync for Task {}

impl Linked for Task {
    fn link(&self) -> &ListLink<Task> {
        &self.tnode
    }
}

impl Task {
    /// Reference this task's lock-protected mutable state. Held only for
    /// the duration of a single field read/update, same granularity as
    /// the original's `spinlock_acquire_irq(&task->lock)`.
    fn inner(&self) -> SpinlockGuard<'_, TaskInner> {
        self.lock.acquire_irq()
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.inner().state
    }

    /// Number of threads currently attached.
    pub fn num_threads(&self) -> usize {
        self.inner().num_threads
    }

    fn add_thread(&self, thread: NonNull<Thread>) {
        let mut inner = self.inner();
        unsafe { inner.threads.push_back(thread) };
        inner.num_threads += 1;
    }

    /// Used by [`Thread::unreference`] to pull a terminated thread back out.
    pub(crate) fn remove_thread(&self, thread: NonNull<Thread>) {
        let mut inner = self.inner();
        unsafe { inner.threads.remove(thread) };
        inner.num_threads -= 1;
    }

    /// `proc_task_reference`.
    pub fn reference(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// `proc_task_unreference`. Terminates the task once the count reaches
    /// zero; terminating is left `unimplemented!` for now, same gap the
    /// original leaves with its `FIXME need to terminate or suspend`.
    pub fn unreference(&self) {
        if self.refcnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut inner = self.inner();
            inner.state = TaskState::Terminated;
        }
    }

    /// `proc_task_suspend`: increments `suspend_cnt`; the task and its
    /// threads are actually suspended the next time each thread re-enters
    /// the kernel, same deferred semantics as the original.
    pub fn suspend(&self) {
        self.inner().suspend_cnt += 1;
    }

    /// `proc_task_resume`.
    pub fn resume(&self) {
        let mut inner = self.inner();
        inner.suspend_cnt -= 1;
        if inner.suspend_cnt == 0 {
            inner.state = TaskState::Active;
        }
    }

    /// Suspend count new threads in this task should inherit (`proc_thread_create`
    /// sets a thread's own `suspend_cnt` to `task->suspend_cnt + 1`).
    pub(crate) fn suspend_cnt(&self) -> u32 {
        self.inner().suspend_cnt
    }
}

const TASK_SLAB_NUM: usize = 256;
const TASK_SLAB_BYTES: usize = TASK_SLAB_NUM * core::mem::size_of::<Task>();

static TASK_SLAB: Slab<'static> = Slab::new(core::mem::size_of::<Task>());
static mut TASK_SLAB_STORAGE: [u8; TASK_SLAB_BYTES] = [0; TASK_SLAB_BYTES];

static TASK_LIST_LOCK: Spinlock<List<Task>> = Spinlock::new(List::new());

static NEXT_PID: AtomicUsize = AtomicUsize::new(1);

static mut KERNEL_TASK: Option<Task> = None;

/// `proc_task_kernel()`.
pub fn kernel_task() -> &'static Task {
    unsafe { KERNEL_TASK.as_ref().expect("task::init must run before kernel_task()") }
}

/// `proc_task_init`: grows the task slab and sets up the kernel task, whose
/// `vm_map` is the address space constructed earlier in the boot sequence
/// (spec §9's fixed init order: `vm_init` before `proc_init`).
pub fn init(kernel_map: &'static VmMap<'static>) {
    unsafe {
        TASK_SLAB
            .grow(&mut TASK_SLAB_STORAGE)
            .expect("task slab backing buffer is block-size aligned");

        KERNEL_TASK = Some(Task {
            lock: Spinlock::new(TaskInner {
                state: TaskState::Active,
                threads: List::new(),
                num_threads: 0,
                suspend_cnt: 0,
                parent: None,
            }),
            pid: 0,
            refcnt: AtomicU32::new(1),
            vm_map: kernel_map,
            tnode: ListLink::new(),
        });

        let kt = NonNull::from(KERNEL_TASK.as_ref().unwrap());
        TASK_LIST_LOCK.acquire().push_back(kt);
    }
}

/// `proc_task_create`: allocate a new task, child of `parent`. `inherit`
/// would copy `parent`'s vm_map rather than taking the caller-supplied one;
/// not exercised yet (no fork-style caller exists), so `inherit` is
/// accepted but always behaves as `false`, matching no observed caller of
/// the `true` path in the original.
pub fn create(parent: &'static Task, _inherit: bool, vm_map: &'static VmMap<'static>) -> Option<&'static Task> {
    let block = TASK_SLAB.zalloc()?;
    let task_ptr = block.as_ptr() as *mut Task;

    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed) as u32;

    unsafe {
        task_ptr.write(Task {
            lock: Spinlock::new(TaskInner {
                state: TaskState::New,
                threads: List::new(),
                num_threads: 0,
                suspend_cnt: 0,
                parent: Some(NonNull::from(parent)),
            }),
            pid,
            refcnt: AtomicU32::new(1),
            vm_map,
            tnode: ListLink::new(),
        });

        let task = &*task_ptr;
        TASK_LIST_LOCK.acquire().push_back(NonNull::from(task));
        Some(task)
    }
}

pub(crate) fn register_thread(task: &Task, thread: NonNull<Thread>) {
    task.add_thread(thread);
}
