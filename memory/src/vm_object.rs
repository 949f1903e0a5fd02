//! RW-locked container of resident pages backing a region of virtual
//! address space.
//!
//! Ported from `vm_object_init`/`vm_object_reference`/`vm_object_destroy`/
//! `vm_object_set_size` (`original_source/kernel/vm/vm_object.c`). The
//! original keeps `kernel_object`/`kernel_lva_object` as free-standing
//! globals populated by `vm_object_init`; here they're constructed once by
//! [`crate::vm_page::init`] and handed out through [`kernel_object`]/
//! [`kernel_lva_object`].

use crate::{
    primitives::List,
    sync::lock::{ExclusiveGuard, Lock},
    vm_page::{Page, Resident},
};

pub(crate) struct VmObjectInner {
    pub(crate) resident: List<Page, Resident>,
    refcnt: u64,
    pub(crate) size: u64,
}

/// A virtual memory object: something that can be mapped into one or more
/// address spaces and may be only partially resident. `memory` only models
/// wired, anonymous objects (`kernel_object`/`kernel_lva_object`); file- and
/// swap-backed objects are out of scope.
pub struct VmObject {
    inner: Lock<VmObjectInner>,
}

impl VmObject {
    /// An object with no resident pages and no references.
    pub const fn new() -> Self {
        Self {
            inner: Lock::new(VmObjectInner {
                resident: List::new(),
                refcnt: 0,
                size: 0,
            }),
        }
    }

    /// Increment the reference count.
    pub fn reference(&self) {
        self.inner.acquire_exclusive().refcnt += 1;
    }

    /// Decrement the reference count.
    ///
    /// The original leaves reclaiming the object and its pages at refcnt
    /// zero as a known gap (`FIXME clean up object when refcnt drops to
    /// zero`); this carries the same gap rather than inventing a teardown
    /// path the original never had.
    pub fn destroy(&self) {
        self.inner.acquire_exclusive().refcnt -= 1;
    }

    /// Current reference count.
    pub fn refcount(&self) -> u64 {
        self.inner.acquire_shared().refcnt
    }

    /// Grow the object's size to `new_size` if it is larger than the
    /// current size. Objects never shrink.
    pub fn set_size(&self, new_size: u64) {
        let mut inner = self.inner.acquire_exclusive();
        if new_size > inner.size {
            inner.size = new_size;
        }
    }

    /// Current size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.acquire_shared().size
    }

    /// Hold the object locked exclusively, for `vm_page` to link/unlink
    /// pages on `ll_resident`, grow `size`, and serialize wire/unwire — the
    /// counterpart to the original's `spinlock_write_acquire(&object->lock)`
    /// bracketing around `_vm_page_insert`/`_vm_page_remove`/`vm_page_wire`.
    pub(crate) fn inner_exclusive(&self) -> ExclusiveGuard<'_, VmObjectInner> {
        self.inner.acquire_exclusive()
    }
}

impl Default for VmObject {
    fn default() -> Self {
        Self::new()
    }
}

// `inner` is only ever touched through `Lock`'s guards; the `VmObject`
// itself is always reached through a `&'static` reference so sharing across
// cores is sound.
unsafe impl Sync for VmObject {}

static KERNEL_OBJECT: VmObject = VmObject::new();
static KERNEL_LVA_OBJECT: VmObject = VmObject::new();

/// All wired kernel memory belongs to this object.
pub fn kernel_object() -> &'static VmObject {
    &KERNEL_OBJECT
}

/// The linear-mapped KVA space (excluding the kernel code/data area) belongs
/// to this object.
pub fn kernel_lva_object() -> &'static VmObject {
    &KERNEL_LVA_OBJECT
}

/// Take the initial reference on both singleton objects. Call once, after
/// `vm_page::init`, mirroring the original's `vm_object_init`.
pub fn init() {
    KERNEL_OBJECT.reference();
    KERNEL_LVA_OBJECT.reference();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_then_destroy_round_trips_refcount() {
        let obj = VmObject::new();
        obj.reference();
        obj.reference();
        assert_eq!(obj.refcount(), 2);
        obj.destroy();
        assert_eq!(obj.refcount(), 1);
    }

    #[test]
    fn set_size_never_shrinks() {
        let obj = VmObject::new();
        obj.set_size(4096);
        obj.set_size(2048);
        assert_eq!(obj.size(), 4096);
        obj.set_size(8192);
        assert_eq!(obj.size(), 8192);
    }

    #[test]
    fn kernel_singletons_start_referenced_after_init() {
        init();
        assert!(kernel_object().refcount() >= 1);
        assert!(kernel_lva_object().refcount() >= 1);
    }
}
