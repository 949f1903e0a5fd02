//! Per-address-space mapping tree.
//!
//! Ported from `original_source/kernel/vm/vm_map.c`. A map keeps three
//! synchronized views over the same [`Mapping`] records: an address-ordered
//! list (iteration, boundary walks), a tree keyed by `vstart` (point lookup,
//! overlap test), and a tree keyed by `hole_size` (first-fit placement). The
//! "hole" after a mapping is the gap between its `vend` and the next
//! mapping's `vstart`, or the map's `end` for the last mapping.

pub mod mapping;

use core::{ptr::NonNull, sync::atomic::{AtomicU32, Ordering}};

use machine::arch::aarch64::memory::PAGE_SIZE;

pub use mapping::Mapping;
use mapping::{ByHole, ByStart, MappingPool};

use crate::{
    addr::VirtAddr,
    error::{Error, Result},
    pmap::{
        attrs::{PmapFlags, Prot},
        reverse_index::ReverseIndex,
        Pmap,
    },
    primitives::{List, RbTree},
    sync::{lock::ExclusiveGuard, Lock},
    vm_object::VmObject,
    vm_page::{PageArray, PageHashTable},
};

struct VmMapInner {
    mappings: List<Mapping>,
    by_start: RbTree<Mapping, ByStart>,
    by_hole: RbTree<Mapping, ByHole>,
    start: usize,
    end: usize,
}

/// An address space: a `pmap` to install translations in, plus the
/// mapping bookkeeping above it. `kernel_map` is the kernel's own instance,
/// built during boot over the kernel's reserved VA range; each task gets
/// its own over user VA space. Constructing the `kernel_map`/`kernel_pmap`
/// singletons themselves is left to the crate that owns boot sequencing —
/// `memory` only provides the type, the same division as `Pmap`'s own
/// `bootstrap()` handing back a value rather than a static.
pub struct VmMap<'a> {
    inner: Lock<VmMapInner>,
    pmap: &'a Pmap,
    pool: &'a MappingPool<'a>,
    refcount: AtomicU32,
}

fn hole_for(inner: &VmMapInner, node: NonNull<Mapping>) -> usize {
    let vend = unsafe { node.as_ref().vend };
    let next_start = match inner.by_start.next(node) {
        Some(next) => unsafe { next.as_ref().vstart },
        None => inner.end,
    };
    next_start.saturating_sub(vend)
}

fn hole_insert(inner: &mut VmMapInner, node: NonNull<Mapping>) {
    let hole = hole_for(inner, node);
    unsafe { (*node.as_ptr()).hole_size = hole };
    unsafe { inner.by_hole.insert(node) };
}

fn hole_update(inner: &mut VmMapInner, node: NonNull<Mapping>) {
    let new_hole = hole_for(inner, node);
    if unsafe { node.as_ref().hole_size } != new_hole {
        unsafe { inner.by_hole.remove(node) };
        unsafe { (*node.as_ptr()).hole_size = new_hole };
        unsafe { inner.by_hole.insert(node) };
    }
}

/// True if `a` and `b` can be merged into a single mapping: adjacent,
/// same object (or both anonymous), same protection, same wire state, and
/// (for an object-backed mapping) contiguous offsets.
fn mergeable(a: &Mapping, vstart: usize, object: Option<NonNull<VmObject>>, offset: u64, prot: Prot, wired: bool) -> bool {
    a.vend == vstart
        && a.prot == prot
        && a.wired == wired
        && a.object == object
        && object.map(|_| a.offset + a.size() as u64 == offset).unwrap_or(true)
}

impl<'a> VmMap<'a> {
    /// A fresh, empty map over `[start, end)`.
    pub fn new(pmap: &'a Pmap, pool: &'a MappingPool<'a>, start: VirtAddr, end: VirtAddr) -> Self {
        Self {
            inner: Lock::new(VmMapInner {
                mappings: List::new(),
                by_start: RbTree::new(),
                by_hole: RbTree::new(),
                start: start.as_raw(),
                end: end.as_raw(),
            }),
            pmap,
            pool,
            refcount: AtomicU32::new(1),
        }
    }

    /// `vm_map_reference`.
    pub fn reference(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// `vm_map_deallocate`. Tearing down every remaining mapping when the
    /// count reaches zero is left undone, the same known gap
    /// [`crate::vm_object::VmObject::destroy`] carries forward from the
    /// original.
    pub fn destroy(&self) {
        self.refcount.fetch_sub(1, Ordering::Relaxed);
    }

    /// Start of this map's VA range.
    pub fn start(&self) -> VirtAddr {
        VirtAddr::new(self.inner.acquire_shared().start)
    }

    /// End of this map's VA range.
    pub fn end(&self) -> VirtAddr {
        VirtAddr::new(self.inner.acquire_shared().end)
    }

    fn enter_at_locked(
        &self,
        inner: &mut ExclusiveGuard<'_, VmMapInner>,
        vstart: usize,
        size: usize,
        object: Option<&VmObject>,
        offset: u64,
        prot: Prot,
        wired: bool,
    ) -> Result<VirtAddr> {
        if size == 0 || vstart % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        let vend = vstart.checked_add(size).ok_or(Error::InvalidArgument)?;
        if vstart < inner.start || vend > inner.end {
            return Err(Error::InvalidArgument);
        }

        let object_ptr = object.map(NonNull::from);

        let pred = inner.by_start.find_at_most(&vstart);
        if let Some(p) = pred {
            let p_ref = unsafe { p.as_ref() };
            if p_ref.vstart == vstart {
                return Err(Error::NoSpace);
            }
            if p_ref.vend > vstart {
                return Err(Error::NoSpace);
            }
        }
        let succ = match pred {
            Some(p) => inner.by_start.next(p),
            None => inner.by_start.first(),
        };
        if let Some(s) = succ {
            if unsafe { s.as_ref().vstart } < vend {
                return Err(Error::NoSpace);
            }
        }

        if let Some(object) = object {
            let new_size = offset + size as u64;
            object.set_size(new_size);
        }

        if let Some(p) = pred {
            if mergeable(unsafe { p.as_ref() }, vstart, object_ptr, offset, prot, wired) {
                unsafe { (*p.as_ptr()).vend = vend };
                hole_update(inner, p);
                return Ok(VirtAddr::new(vstart));
            }
        }

        let node = self.pool.alloc()?;
        unsafe {
            (*node.as_ptr()).vstart = vstart;
            (*node.as_ptr()).vend = vend;
            (*node.as_ptr()).prot = prot;
            (*node.as_ptr()).object = object_ptr;
            (*node.as_ptr()).offset = offset;
            (*node.as_ptr()).wired = wired;
        }
        if let Some(object) = object {
            object.reference();
        }

        unsafe { inner.by_start.insert(node) };
        match pred {
            Some(p) => unsafe { inner.mappings.insert_after(p, node) },
            None => unsafe { inner.mappings.push_front(node) },
        }
        hole_insert(inner, node);
        if let Some(p) = pred {
            hole_update(inner, p);
        }

        Ok(VirtAddr::new(vstart))
    }

    /// `vm_map_enter_at`: place a mapping at an exact address.
    pub fn enter_at(
        &self,
        vaddr: VirtAddr,
        size: usize,
        object: Option<&VmObject>,
        offset: u64,
        prot: Prot,
        wired: bool,
    ) -> Result<VirtAddr> {
        let mut inner = self.inner.acquire_exclusive();
        self.enter_at_locked(&mut inner, vaddr.as_raw(), size, object, offset, prot, wired)
    }

    /// `vm_map_enter`: first-fit placement over the hole tree.
    pub fn enter(
        &self,
        size: usize,
        object: Option<&VmObject>,
        offset: u64,
        prot: Prot,
        wired: bool,
    ) -> Result<VirtAddr> {
        let mut inner = self.inner.acquire_exclusive();

        let gap_before_first = match inner.mappings.front() {
            Some(first) => unsafe { first.as_ref().vstart } - inner.start,
            None => inner.end - inner.start,
        };

        let vstart = if gap_before_first >= size {
            inner.start
        } else {
            let candidate = inner
                .by_hole
                .find_at_least(&(size, 0))
                .ok_or(Error::NoSpace)?;
            unsafe { candidate.as_ref().vend }
        };

        self.enter_at_locked(&mut inner, vstart, size, object, offset, prot, wired)
    }

    /// Split the mapping containing `at` into two records at that address,
    /// sharing the object with a fresh reference (spec's splitting rule).
    /// `node` must currently span across `at` (`vstart < at < vend`).
    fn split_at(&self, inner: &mut VmMapInner, node: NonNull<Mapping>, at: usize) -> Result<NonNull<Mapping>> {
        let tail = self.pool.alloc()?;
        let (object, offset_delta, vend) = unsafe {
            let n = node.as_ref();
            (n.object, (at - n.vstart) as u64, n.vend)
        };

        unsafe {
            (*tail.as_ptr()).vstart = at;
            (*tail.as_ptr()).vend = vend;
            (*tail.as_ptr()).prot = node.as_ref().prot;
            (*tail.as_ptr()).object = object;
            (*tail.as_ptr()).offset = node.as_ref().offset + offset_delta;
            (*tail.as_ptr()).wired = node.as_ref().wired;
            (*node.as_ptr()).vend = at;
        }
        if let Some(object) = object {
            unsafe { object.as_ref() }.reference();
        }

        unsafe { inner.by_start.insert(tail) };
        unsafe { inner.mappings.insert_after(node, tail) };
        hole_insert(inner, tail);
        hole_update(inner, node);

        Ok(tail)
    }

    /// Split the mapping (if any) straddling `at`, leaving the tree/list in
    /// a state where `at` is either outside every mapping or exactly the
    /// `vstart` of one.
    fn split_boundary(&self, inner: &mut VmMapInner, at: usize) -> Result<()> {
        if let Some(node) = inner.by_start.find_at_most(&at) {
            let (vstart, vend) = unsafe { (node.as_ref().vstart, node.as_ref().vend) };
            if vstart < at && at < vend {
                self.split_at(inner, node, at)?;
            }
        }
        Ok(())
    }

    fn unlink_node(&self, inner: &mut VmMapInner, node: NonNull<Mapping>) {
        let pred = inner.by_start.prev(node);
        unsafe {
            inner.by_hole.remove(node);
            inner.by_start.remove(node);
            inner.mappings.remove(node);
            self.pool.free(node);
        }
        if let Some(p) = pred {
            hole_update(inner, p);
        }
    }

    /// `vm_map_remove`: unmap `[vaddr, vaddr + size)`, unreferencing each
    /// removed mapping's object.
    pub fn remove(
        &self,
        vaddr: VirtAddr,
        size: usize,
        pages: &PageArray<'_>,
        hash: &PageHashTable<'_>,
        reverse_idx: &ReverseIndex<'_>,
    ) -> Result<()> {
        let start = vaddr.as_raw();
        let end = start.checked_add(size).ok_or(Error::InvalidArgument)?;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.acquire_exclusive();
        self.split_boundary(&mut inner, start)?;
        self.split_boundary(&mut inner, end)?;

        let mut cur = inner.by_start.find_at_least(&start);
        while let Some(node) = cur {
            if unsafe { node.as_ref().vstart } >= end {
                break;
            }
            let next = inner.by_start.next(node);

            let (vstart, vend, object, offset) = unsafe {
                let n = node.as_ref();
                (n.vstart, n.vend, n.object, n.offset)
            };
            let mut va = vstart;
            while va < vend {
                if let Some(object) = object {
                    let obj_offset = offset + (va - vstart) as u64;
                    if let Some(page) = hash.lookup(unsafe { object.as_ref() }, obj_offset) {
                        let pa = pages.page_to_pa(unsafe { page.as_ref() });
                        let _ = self.pmap.remove(VirtAddr::new(va), pa, reverse_idx);
                    }
                }
                va += PAGE_SIZE;
            }
            if let Some(object) = object {
                unsafe { object.as_ref() }.destroy();
            }

            self.unlink_node(&mut inner, node);
            cur = next;
        }

        Ok(())
    }

    /// `vm_map_protect`: change protection over `[vaddr, vaddr + size)`.
    pub fn protect(
        &self,
        vaddr: VirtAddr,
        size: usize,
        prot: Prot,
        reverse_idx: &ReverseIndex<'_>,
    ) -> Result<()> {
        let start = vaddr.as_raw();
        let end = start.checked_add(size).ok_or(Error::InvalidArgument)?;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.acquire_exclusive();
        self.split_boundary(&mut inner, start)?;
        self.split_boundary(&mut inner, end)?;

        let mut cur = inner.by_start.find_at_least(&start);
        while let Some(node) = cur {
            let (vstart, vend) = unsafe { (node.as_ref().vstart, node.as_ref().vend) };
            if vstart >= end {
                break;
            }
            let next = inner.by_start.next(node);

            unsafe { (*node.as_ptr()).prot = prot };
            let mut va = vstart;
            while va < vend {
                let _ = self.pmap.protect(VirtAddr::new(va), prot, reverse_idx);
                va += PAGE_SIZE;
            }

            cur = next;
        }

        Ok(())
    }

    /// `vm_map_wire`: fault in and wire every page over `[vaddr, vaddr +
    /// size)`, installing `pmap` translations with the wired flag.
    pub fn wire(
        &self,
        vaddr: VirtAddr,
        size: usize,
        pages: &PageArray<'_>,
        hash: &PageHashTable<'_>,
        reverse_idx: &ReverseIndex<'_>,
    ) -> Result<()> {
        let start = vaddr.as_raw();
        let end = start.checked_add(size).ok_or(Error::InvalidArgument)?;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.acquire_exclusive();
        self.split_boundary(&mut inner, start)?;
        self.split_boundary(&mut inner, end)?;

        let mut cur = inner.by_start.find_at_least(&start);
        while let Some(node) = cur {
            let (vstart, vend, object, offset, prot) = unsafe {
                let n = node.as_ref();
                (n.vstart, n.vend, n.object, n.offset, n.prot)
            };
            if vstart >= end {
                break;
            }
            let next = inner.by_start.next(node);

            unsafe { (*node.as_ptr()).wired = true };
            if let Some(object) = object {
                let object = unsafe { object.as_ref() };
                let mut va = vstart;
                while va < vend {
                    let obj_offset = offset + (va - vstart) as u64;
                    let page = match hash.lookup(object, obj_offset) {
                        Some(p) => p,
                        None => pages
                            .alloc(Some(object), obj_offset, hash)
                            .ok_or(Error::ResourceShortage)?,
                    };
                    let pa = pages.page_to_pa(unsafe { page.as_ref() });
                    self.pmap
                        .enter(VirtAddr::new(va), pa, prot, PmapFlags::WIRED, reverse_idx)?;
                    pages.wire(unsafe { page.as_ref() });
                    va += PAGE_SIZE;
                }
            }

            cur = next;
        }

        Ok(())
    }

    /// `vm_map_unwire`: drop the wired flag and each page's wire count
    /// over `[vaddr, vaddr + size)`. Does not unmap or free pages.
    pub fn unwire(&self, vaddr: VirtAddr, size: usize, pages: &PageArray<'_>, hash: &PageHashTable<'_>) -> Result<()> {
        let start = vaddr.as_raw();
        let end = start.checked_add(size).ok_or(Error::InvalidArgument)?;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        let inner = self.inner.acquire_exclusive();
        let mut cur = inner.by_start.find_at_least(&start);
        while let Some(node) = cur {
            let (vstart, vend, object, offset) = unsafe {
                let n = node.as_ref();
                (n.vstart, n.vend, n.object, n.offset)
            };
            if vstart >= end {
                break;
            }
            unsafe { (*node.as_ptr()).wired = false };
            if let Some(object) = object {
                let object = unsafe { object.as_ref() };
                let mut va = vstart;
                while va < vend {
                    let obj_offset = offset + (va - vstart) as u64;
                    if let Some(page) = hash.lookup(object, obj_offset) {
                        pages.unwire(unsafe { page.as_ref() });
                    }
                    va += PAGE_SIZE;
                }
            }
            cur = inner.by_start.next(node);
        }

        Ok(())
    }

    /// `vm_map_lookup`: resolve `vaddr` to its containing mapping's object,
    /// object-relative offset, and protection.
    ///
    /// Left as an empty stub in the original (`kresult_t vm_map_lookup(...)
    /// { }`, no body) — implemented here as the natural containing-mapping
    /// query every other operation already performs internally, since a
    /// fault handler has no other way to learn what backs a faulting
    /// address.
    pub fn lookup(&self, vaddr: VirtAddr) -> Result<(Option<&'a VmObject>, u64, Prot)> {
        let inner = self.inner.acquire_shared();
        let addr = vaddr.as_raw();
        let node = inner.by_start.find_at_most(&addr).ok_or(Error::NotFound)?;
        let n = unsafe { node.as_ref() };
        if addr >= n.vend {
            return Err(Error::NotFound);
        }
        let delta = (addr - n.vstart) as u64;
        let object = n.object.map(|o| unsafe { &*o.as_ptr() });
        Ok((object, n.offset + delta, n.prot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmap() -> Pmap {
        // `Pmap` has no public constructor yet (spec's kernel_pmap is built
        // by `pmap::bootstrap` instead); tests exercise `VmMap` bookkeeping
        // without needing a real translation table, so they never call
        // `enter`/`remove`/`protect`/`wire` paths that touch `self.pmap`.
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn enter_at_then_lookup_resolves_offset() {
        let pool_storage: [Mapping; 8] = core::array::from_fn(|_| Mapping::default());
        let pool = MappingPool::new(&pool_storage);
        let pm = pmap();
        let map = VmMap::new(&pm, &pool, VirtAddr::new(0x1000_0000), VirtAddr::new(0x2000_0000));

        let object = VmObject::new();
        let vaddr = map
            .enter_at(VirtAddr::new(0x1000_0000), 2 * PAGE_SIZE, Some(&object), 0, Prot::DEFAULT, false)
            .expect("enter_at succeeds");
        assert_eq!(vaddr, VirtAddr::new(0x1000_0000));

        let (obj, offset, prot) = map.lookup(VirtAddr::new(0x1000_0000 + 100)).unwrap();
        assert!(obj.is_some());
        assert_eq!(offset, 100);
        assert_eq!(prot, Prot::DEFAULT);

        assert!(map.lookup(VirtAddr::new(0x1000_0000 + 2 * PAGE_SIZE)).is_err());
    }

    #[test]
    fn adjacent_same_object_enter_merges() {
        let pool_storage: [Mapping; 8] = core::array::from_fn(|_| Mapping::default());
        let pool = MappingPool::new(&pool_storage);
        let pm = pmap();
        let map = VmMap::new(&pm, &pool, VirtAddr::new(0x1000_0000), VirtAddr::new(0x2000_0000));

        let object = VmObject::new();
        map.enter_at(VirtAddr::new(0x1000_0000), PAGE_SIZE, Some(&object), 0, Prot::DEFAULT, false)
            .unwrap();
        map.enter_at(
            VirtAddr::new(0x1000_0000 + PAGE_SIZE),
            PAGE_SIZE,
            Some(&object),
            PAGE_SIZE as u64,
            Prot::DEFAULT,
            false,
        )
        .unwrap();

        // A merge keeps a single record spanning both ranges rather than
        // allocating a second node from the pool.
        assert_eq!(map.inner.acquire_shared().by_start.len(), 1);
        assert_eq!(map.inner.acquire_shared().mappings.len(), 1);
        let (_, offset, _) = map.lookup(VirtAddr::new(0x1000_0000 + PAGE_SIZE + 10)).unwrap();
        assert_eq!(offset, PAGE_SIZE as u64 + 10);
    }

    #[test]
    fn enter_finds_first_fit_gap() {
        let pool_storage: [Mapping; 8] = core::array::from_fn(|_| Mapping::default());
        let pool = MappingPool::new(&pool_storage);
        let pm = pmap();
        let map = VmMap::new(&pm, &pool, VirtAddr::new(0), VirtAddr::new(0x10_0000));

        let a = map.enter(PAGE_SIZE, None, 0, Prot::DEFAULT, false).unwrap();
        assert_eq!(a, VirtAddr::new(0));
        let b = map.enter(PAGE_SIZE, None, 0, Prot::DEFAULT, false).unwrap();
        assert_eq!(b, VirtAddr::new(PAGE_SIZE));
    }

    #[test]
    fn overlapping_enter_at_is_rejected() {
        let pool_storage: [Mapping; 8] = core::array::from_fn(|_| Mapping::default());
        let pool = MappingPool::new(&pool_storage);
        let pm = pmap();
        let map = VmMap::new(&pm, &pool, VirtAddr::new(0), VirtAddr::new(0x10_0000));

        map.enter_at(VirtAddr::new(0), 2 * PAGE_SIZE, None, 0, Prot::DEFAULT, false)
            .unwrap();
        let err = map.enter_at(VirtAddr::new(PAGE_SIZE), PAGE_SIZE, None, 0, Prot::DEFAULT, false);
        assert_eq!(err, Err(Error::NoSpace));
    }
}
