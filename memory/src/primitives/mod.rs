//! Intrusive, allocation-free building blocks shared by `vm_page`,
//! `vm_map`, `pmap`'s reverse index, and the scheduler's run queue.

pub mod bitmap;
pub mod list;
pub mod rbtree;

pub use bitmap::Bitmap;
pub use list::{Linked, List, ListLink};
pub use rbtree::{InsertSlot, RbLink, RbNode, RbTree};
