//! Locking primitives used throughout `pmap`/`vm_page`/`vm_object`/`vm_map`.
//!
//! Two flavors, matching the two the original kernel carries side by side:
//! a non-sleeping [`Spinlock`] for state also touched from IRQ context, and
//! a sleepable [`Lock`] for longer critical sections (an object's resident
//! page list, a map's mapping trees) that park the caller through whatever
//! scheduler is registered via [`register_scheduler_ops`].

pub mod lock;
pub mod spinlock;

pub use lock::{register_scheduler_ops, ExclusiveGuard, Lock, SchedulerOps, SharedGuard};
pub use spinlock::{Spinlock, SpinlockGuard, SpinlockReadGuard};
