//! Kernel-virtual memory allocator.
//!
//! Ported from `vm_km_alloc`/`vm_km_free` (`original_source/kernel/vm/vm_km.c`).
//! Combines [`crate::vm_map::VmMap::enter`] on the kernel map with, by
//! default, page allocation and `pmap_enter` for each page. Constructing the
//! kernel map itself (`kernel_vmap` in the original) is left to the crate
//! that owns boot sequencing, the same division [`crate::vm_map::VmMap`] and
//! [`crate::pmap::bootstrap`] already draw.

use bitflags::bitflags;
use machine::arch::aarch64::memory::PAGE_SIZE;

use crate::{
    addr::VirtAddr,
    error::{Error, Result},
    pmap::{
        attrs::{PmapFlags, Prot},
        reverse_index::ReverseIndex,
        Pmap,
    },
    vm_map::VmMap,
    vm_object::VmObject,
    vm_page::{PageArray, PageHashTable},
};

bitflags! {
    /// `vm_km_flags_t`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct KmFlags: u32 {
        const WIRED = 0x1;
        const VAONLY = 0x2;
        const ZERO = 0x4;
        const EXEC = 0x8;
        const CANFAIL = 0x10;
    }
}

/// `vm_km_alloc`: reserve `size` bytes of kernel-virtual space in `map`,
/// backed by `object` starting at `object`'s current size so repeated calls
/// against the same object lay out contiguously. Unless `VAONLY`, allocates
/// and wires in a physical page for every page of the range.
///
/// Without `CANFAIL`, the original panics on a failed `vm_map_enter` or
/// `pmap_enter` rather than returning an error code; this keeps that
/// behavior rather than inventing a recoverable path the original never
/// had.
#[allow(clippy::too_many_arguments)]
pub fn alloc(
    map: &VmMap<'_>,
    object: &VmObject,
    pages: &PageArray<'_>,
    hash: &PageHashTable<'_>,
    pmap: &Pmap,
    reverse_idx: &ReverseIndex<'_>,
    size: usize,
    flags: KmFlags,
) -> Result<VirtAddr> {
    let prot = if flags.contains(KmFlags::EXEC) { Prot::ALL } else { Prot::DEFAULT };
    let size = VirtAddr::new(size).round_page().as_raw();
    let offset = object.size();

    let vstart = match map.enter(size, Some(object), offset, prot, flags.contains(KmFlags::WIRED)) {
        Ok(v) => v,
        Err(e) if flags.contains(KmFlags::CANFAIL) => return Err(e),
        Err(e) => panic!("vm_km alloc: vm_map_enter failed: {e:?}"),
    };

    if flags.contains(KmFlags::VAONLY) {
        return Ok(vstart);
    }

    let mut pmap_flags = PmapFlags::WRITE_BACK;
    if flags.contains(KmFlags::WIRED) {
        pmap_flags |= PmapFlags::WIRED;
    }
    if flags.contains(KmFlags::CANFAIL) {
        pmap_flags |= PmapFlags::CANFAIL;
    }

    let vend = vstart.as_raw() + size;
    let mut va = vstart.as_raw();
    let mut obj_offset = offset;
    while va < vend {
        let page = match pages.alloc(Some(object), obj_offset, hash) {
            Some(p) => p,
            None if flags.contains(KmFlags::CANFAIL) => return Err(Error::ResourceShortage),
            None => panic!("vm_km alloc: vm_page_alloc failed"),
        };
        let pa = pages.page_to_pa(unsafe { page.as_ref() });

        if let Err(e) = pmap.enter(VirtAddr::new(va), pa, prot, pmap_flags, reverse_idx) {
            if flags.contains(KmFlags::CANFAIL) {
                return Err(e);
            }
            panic!("vm_km alloc: pmap_enter failed: {e:?}");
        }

        va += PAGE_SIZE;
        obj_offset += PAGE_SIZE as u64;
    }

    if flags.contains(KmFlags::ZERO) {
        unsafe { core::ptr::write_bytes(vstart.as_raw() as *mut u8, 0, size) };
    }

    Ok(vstart)
}

/// `vm_km_free`: release `[va, va + size)` from `map`, unmapping and
/// unreferencing every page over the range.
///
/// Left as an empty stub in the original (`void vm_km_free(...) { }`);
/// implemented here as `VmMap::remove` over the range, the same treatment
/// given [`crate::vm_map::VmMap::lookup`]'s empty original body — a kernel
/// allocator that can reserve space but never release it back is not a
/// complete allocator.
pub fn free(
    map: &VmMap<'_>,
    pages: &PageArray<'_>,
    hash: &PageHashTable<'_>,
    reverse_idx: &ReverseIndex<'_>,
    va: VirtAddr,
    size: usize,
) -> Result<()> {
    map.remove(va, size, pages, hash, reverse_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pmap::reverse_index::{Bucket, ReverseIndex},
        primitives::List,
        sync::Spinlock,
        vm_map::mapping::{Mapping, MappingPool},
        vm_page::{Onode, Page},
    };

    fn pmap() -> Pmap {
        // Tests below only exercise `VAONLY` allocations, which never touch
        // `self.pmap`; see the matching helper in `vm_map`'s own tests.
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn vaonly_alloc_reserves_space_without_pages() {
        let pool_storage: [Mapping; 4] = core::array::from_fn(|_| Mapping::default());
        let pool = MappingPool::new(&pool_storage);
        let pm = pmap();
        let map = VmMap::new(&pm, &pool, VirtAddr::new(0x4000_0000), VirtAddr::new(0x4010_0000));

        let pages: [Page; 1] = core::array::from_fn(|_| Page::new());
        let arr = PageArray::new(&pages, crate::addr::PhysAddr::new(0), 12);
        let buckets: [Spinlock<List<Page, Onode>>; 1] = core::array::from_fn(|_| Spinlock::new(List::new()));
        let hash = PageHashTable::new(&buckets);
        let rbuckets: [Spinlock<Bucket>; 1] = core::array::from_fn(|_| Spinlock::new(Bucket::new()));
        let reverse_idx = ReverseIndex::new(&rbuckets);

        let object = VmObject::new();
        let vstart = alloc(&map, &object, &arr, &hash, &pm, &reverse_idx, PAGE_SIZE, KmFlags::VAONLY)
            .expect("VAONLY alloc reserves VA without touching pages or pmap");
        assert_eq!(vstart, VirtAddr::new(0x4000_0000));

        free(&map, &arr, &hash, &reverse_idx, vstart, PAGE_SIZE).expect("free unmaps the reservation");
    }

    #[test]
    fn repeated_vaonly_allocs_lay_out_contiguously() {
        let pool_storage: [Mapping; 4] = core::array::from_fn(|_| Mapping::default());
        let pool = MappingPool::new(&pool_storage);
        let pm = pmap();
        let map = VmMap::new(&pm, &pool, VirtAddr::new(0x5000_0000), VirtAddr::new(0x5010_0000));

        let pages: [Page; 1] = core::array::from_fn(|_| Page::new());
        let arr = PageArray::new(&pages, crate::addr::PhysAddr::new(0), 12);
        let buckets: [Spinlock<List<Page, Onode>>; 1] = core::array::from_fn(|_| Spinlock::new(List::new()));
        let hash = PageHashTable::new(&buckets);
        let rbuckets: [Spinlock<Bucket>; 1] = core::array::from_fn(|_| Spinlock::new(Bucket::new()));
        let reverse_idx = ReverseIndex::new(&rbuckets);

        let object = VmObject::new();
        let a = alloc(&map, &object, &arr, &hash, &pm, &reverse_idx, PAGE_SIZE, KmFlags::VAONLY).unwrap();
        let b = alloc(&map, &object, &arr, &hash, &pm, &reverse_idx, PAGE_SIZE, KmFlags::VAONLY).unwrap();
        assert_eq!(b, VirtAddr::new(a.as_raw() + PAGE_SIZE));
    }
}
