//! A single VA-range mapping record, and the fixed-capacity pool it's
//! allocated from.
//!
//! Ported from `vm_mapping_t` (`original_source/include/kernel/vmm/vm_map.h`):
//! one record per contiguous, uniformly-protected VA range, threaded onto
//! its owning map's address-ordered list and its two rbtrees (by `vstart`,
//! by trailing `hole_size`).

use core::ptr::NonNull;

use crate::{
    error::{Error, Result},
    pmap::attrs::Prot,
    primitives::{Linked, List, ListLink, RbLink, RbNode},
    sync::Spinlock,
    vm_object::VmObject,
};

/// Marker [`RbNode`] tag for the by-`vstart` tree.
pub struct ByStart;
/// Marker [`RbNode`] tag for the by-`hole_size` tree.
pub struct ByHole;

/// One mapping record. Lives in a [`MappingPool`]'s backing storage; never
/// individually allocated or freed through a general-purpose allocator.
pub struct Mapping {
    ll: ListLink<Mapping>,
    rb_start: RbLink<Mapping>,
    rb_hole: RbLink<Mapping>,
    pub(super) vstart: usize,
    pub(super) vend: usize,
    pub(super) prot: Prot,
    pub(super) object: Option<NonNull<VmObject>>,
    pub(super) offset: u64,
    pub(super) wired: bool,
    pub(super) hole_size: usize,
}

impl Mapping {
    const fn new() -> Self {
        Self {
            ll: ListLink::new(),
            rb_start: RbLink::new(),
            rb_hole: RbLink::new(),
            vstart: 0,
            vend: 0,
            prot: Prot::empty(),
            object: None,
            offset: 0,
            wired: false,
            hole_size: 0,
        }
    }

    pub(super) fn size(&self) -> usize {
        self.vend - self.vstart
    }
}

impl Default for Mapping {
    fn default() -> Self {
        Self::new()
    }
}

impl Linked for Mapping {
    fn link(&self) -> &ListLink<Mapping> {
        &self.ll
    }
}

impl RbNode<ByStart> for Mapping {
    type Key = usize;

    fn link(&self) -> &RbLink<Mapping> {
        &self.rb_start
    }

    fn key(&self) -> usize {
        self.vstart
    }
}

impl RbNode<ByHole> for Mapping {
    type Key = (usize, usize);

    fn link(&self) -> &RbLink<Mapping> {
        &self.rb_hole
    }

    fn key(&self) -> (usize, usize) {
        (self.hole_size, self.vstart)
    }
}

// Every `Mapping` is reached exclusively through the `Lock` of whichever
// `VmMap` currently owns it, or (while unlinked) through the pool's own
// spinlock — never both at once.
unsafe impl Sync for Mapping {}

/// A fixed-capacity source of [`Mapping`] records, shared by every
/// [`super::VmMap`] that draws from it.
///
/// The original allocates `vm_mapping_t` from `kmem_slab_alloc`. This port
/// builds `vm_map` before `slab`/`vm_km` exist (spec §0's dependency order
/// has `vm_map` ahead of `slab`), so mapping nodes instead come from a
/// dedicated pool over caller-supplied storage — the same shape as
/// [`crate::pmap::reverse_index::ReverseIndex`]'s and [`crate::vm_page::PageArray`]'s
/// caller-provided backing arrays. A free node's own (currently unused)
/// list link chains it onto the pool's free list, so no extra bookkeeping
/// field is needed.
pub struct MappingPool<'a> {
    free: Spinlock<List<Mapping>>,
    _storage: core::marker::PhantomData<&'a [Mapping]>,
}

impl<'a> MappingPool<'a> {
    /// Wrap a pre-sized, zero-initialized backing array, seeding the free
    /// list with every slot.
    pub fn new(storage: &'a [Mapping]) -> Self {
        let free = Spinlock::new(List::new());
        {
            let mut guard = free.acquire();
            for m in storage {
                unsafe { guard.push_back(NonNull::from(m)) };
            }
        }
        Self {
            free,
            _storage: core::marker::PhantomData,
        }
    }

    /// Take one mapping out of the pool, detached and zeroed.
    pub(super) fn alloc(&self) -> Result<NonNull<Mapping>> {
        self.free.acquire().pop_front().ok_or(Error::ResourceShortage)
    }

    /// Return a mapping to the pool.
    ///
    /// # Safety
    ///
    /// `node` must not currently be linked into any map's list or trees.
    pub(super) unsafe fn free(&self, node: NonNull<Mapping>) {
        (*node.as_ptr()) = Mapping::new();
        self.free.acquire().push_back(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_round_trips_a_node() {
        let storage: [Mapping; 2] = core::array::from_fn(|_| Mapping::new());
        let pool = MappingPool::new(&storage);

        let a = pool.alloc().expect("first alloc succeeds");
        let b = pool.alloc().expect("second alloc succeeds");
        assert!(pool.alloc().is_err());

        unsafe { pool.free(a) };
        pool.alloc().expect("freed node is reusable");
        let _ = b;
    }
}
