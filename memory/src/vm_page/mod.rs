//! Physical page frame database: a pfn-indexed array of [`Page`] descriptors
//! plus a buddy allocator over it.
//!
//! Ported from `original_source/kernel/vm/vm_page.c`. Physical memory is
//! split into `NUM_BINS` buddy bins; bin `i` holds free runs of `1 << i`
//! pages. `vm_page_alloc_contiguous`/`vm_page_free_contiguous` pop/push runs,
//! splitting or merging buddies on the way, same as the original's
//! `_vm_page_bin_pop`/`_vm_page_bin_push`. Pages resident in a
//! [`crate::vm_object::VmObject`] are additionally linked into that object's
//! resident list and a crate-wide object/offset hash table ([`hash`]).

pub mod hash;

use core::{cell::Cell, ptr::NonNull};

pub use hash::PageHashTable;

use crate::{
    addr::PhysAddr,
    primitives::{Linked, List, ListLink},
    sync::Spinlock,
    vm_object::VmObject,
};

/// Number of buddy bins. Bin `i` holds runs of `1 << i` pages, so the
/// largest single contiguous allocation is `1 << (NUM_BINS - 1)` pages.
pub const NUM_BINS: usize = 20;

/// `1 << (NUM_BINS - 1)`: the largest run `alloc_contiguous` can satisfy.
pub const MAX_CONTIGUOUS_PAGES: usize = 1 << (NUM_BINS - 1);

fn round_down_pow2(n: usize) -> usize {
    1usize << (usize::BITS - 1 - n.leading_zeros())
}

/// Marker [`Linked`] tag for a page's object/offset hash bucket chain.
pub struct Onode;

/// Marker [`Linked`] tag for a page's resident-in-object chain, reused as
/// its buddy-bin chain while free — a page is never on both at once, same
/// as the original's single `ll_rnode` field serving both roles.
pub struct Resident;

#[derive(Clone, Copy, Default)]
struct Status {
    wired_count: u16,
    referenced: bool,
    dirty: bool,
    active: bool,
    busy: bool,
}

/// One physical page frame's bookkeeping. Lives in a long-lived, crate-wide
/// array indexed by page frame number; never individually allocated or
/// freed.
pub struct Page {
    status: Cell<Status>,
    onode: ListLink<Page>,
    rnode: ListLink<Page>,
    object: Cell<Option<NonNull<VmObject>>>,
    offset: Cell<u64>,
}

impl Page {
    /// A detached, unowned page descriptor.
    pub const fn new() -> Self {
        Self {
            status: Cell::new(Status {
                wired_count: 0,
                referenced: false,
                dirty: false,
                active: false,
                busy: false,
            }),
            onode: ListLink::new(),
            rnode: ListLink::new(),
            object: Cell::new(None),
            offset: Cell::new(0),
        }
    }

    /// The object this page is resident in, if any.
    pub fn object(&self) -> Option<NonNull<VmObject>> {
        self.object.get()
    }

    /// This page's offset within its object.
    pub fn offset(&self) -> u64 {
        self.offset.get()
    }

    /// Whether this page is mapped in some virtual address map.
    pub fn is_active(&self) -> bool {
        self.status.get().active
    }

    /// Current wire count (how many virtual maps have wired this page).
    pub fn wired_count(&self) -> u16 {
        self.status.get().wired_count
    }

    fn set_active(&self, active: bool) {
        let mut s = self.status.get();
        s.active = active;
        self.status.set(s);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Linked<Onode> for Page {
    fn link(&self) -> &ListLink<Page> {
        &self.onode
    }
}

impl Linked<Resident> for Page {
    fn link(&self) -> &ListLink<Page> {
        &self.rnode
    }
}

// Every field is a `Cell`, mutated only while the page's bin lock or
// object lock is held; `Page` is never accessed outside that discipline.
unsafe impl Sync for Page {}

/// The pfn-indexed page array plus its buddy free bins.
pub struct PageArray<'a> {
    pages: &'a [Page],
    base_pa: PhysAddr,
    page_shift: usize,
    bins: [Spinlock<List<Page, Resident>>; NUM_BINS],
}

impl<'a> PageArray<'a> {
    /// Wrap a pre-sized, zero-initialized page array covering
    /// `[base_pa, base_pa + pages.len() * (1 << page_shift))`. Does not seed
    /// the free bins — call [`seed_free_bins`](Self::seed_free_bins) once,
    /// then [`reserve_pa`](Self::reserve_pa) for every frame already in use
    /// (kernel image, page tables, this array's own backing memory),
    /// mirroring `vm_page_init`'s sequence.
    pub fn new(pages: &'a [Page], base_pa: PhysAddr, page_shift: usize) -> Self {
        Self {
            pages,
            base_pa,
            page_shift,
            bins: core::array::from_fn(|_| Spinlock::new(List::new())),
        }
    }

    /// Total number of page frames tracked.
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Physical address of `page`'s frame.
    pub fn page_to_pa(&self, page: &Page) -> PhysAddr {
        let index = self.index_of(page);
        PhysAddr::new(self.base_pa.as_raw() + ((index as u64) << self.page_shift))
    }

    /// The [`Page`] covering `pa`'s frame.
    pub fn page_from_pa(&self, pa: PhysAddr) -> &Page {
        let index = ((pa.as_raw() - self.base_pa.as_raw()) >> self.page_shift) as usize;
        &self.pages[index]
    }

    fn index_of(&self, page: &Page) -> usize {
        let base = self.pages.as_ptr() as usize;
        let p = page as *const Page as usize;
        (p - base) / core::mem::size_of::<Page>()
    }

    fn bin_index(num_pages: usize) -> usize {
        num_pages.trailing_zeros() as usize
    }

    /// Split the whole array into the largest power-of-two-aligned runs
    /// possible and place each in its bin, same as `vm_page_init`'s initial
    /// carve-up. Call once, before any `reserve_pa`/`alloc*`.
    pub fn seed_free_bins(&self) {
        let mut i = 0usize;
        while i < self.pages.len() {
            let remaining = self.pages.len() - i;
            let group = round_down_pow2(remaining).min(MAX_CONTIGUOUS_PAGES);
            let bin = Self::bin_index(group);
            let node = NonNull::from(&self.pages[i]);
            unsafe { self.bins[bin].acquire().push_back(node) };
            i += group;
        }
    }

    /// Pop a free run of exactly `num_pages` frames (already a power of
    /// two), splitting a larger buddy if the matching bin is empty.
    fn bin_pop(&self, num_pages: usize) -> Option<NonNull<Page>> {
        let bin = Self::bin_index(num_pages);
        if bin >= NUM_BINS {
            return None;
        }

        {
            let mut guard = self.bins[bin].acquire();
            if let Some(node) = guard.pop_front() {
                return Some(node);
            }
        }

        let first = self.bin_pop(num_pages << 1)?;
        let buddy_index = self.index_of(unsafe { first.as_ref() }) ^ num_pages;
        let buddy = NonNull::from(&self.pages[buddy_index]);
        unsafe { self.bins[bin].acquire().push_back(buddy) };
        Some(first)
    }

    /// Push a freed run of `num_pages` frames back, merging with its buddy
    /// (and that buddy's buddy, recursively) whenever one is found free in
    /// the same bin.
    ///
    /// The original keeps each bin's list sorted by ascending page index so
    /// a buddy match is a cheap `prev`/`next` check; this scans the bin's
    /// (typically short) list for a matching index instead, trading that
    /// optimization for not needing an allocation-free sorted-insert
    /// primitive.
    fn bin_push(&self, pages: NonNull<Page>, num_pages: usize) {
        let mut pages = pages;
        let mut num_pages = num_pages;
        loop {
            let bin = Self::bin_index(num_pages);
            if bin >= NUM_BINS {
                return;
            }

            let index = self.index_of(unsafe { pages.as_ref() });
            let buddy_index = index ^ num_pages;

            let mut guard = self.bins[bin].acquire();
            let buddy = guard
                .iter()
                .find(|node| self.index_of(unsafe { node.as_ref() }) == buddy_index);

            match buddy {
                Some(buddy) => {
                    unsafe { guard.remove(buddy) };
                    drop(guard);
                    let merged_index = index.min(buddy_index);
                    pages = NonNull::from(&self.pages[merged_index]);
                    num_pages <<= 1;
                }
                None => {
                    unsafe { guard.push_back(pages) };
                    return;
                }
            }
        }
    }

    fn insert_resident(
        &self,
        first: NonNull<Page>,
        num_pages: usize,
        object: &VmObject,
        starting_offset: u64,
        hash: &PageHashTable<'_>,
    ) {
        let base_index = self.index_of(unsafe { first.as_ref() });
        let mut inner = object.inner_exclusive();
        for p in 0..num_pages {
            let page = &self.pages[base_index + p];
            let offset = starting_offset + ((p as u64) << self.page_shift);
            if offset >= inner.size {
                inner.size = offset + (1u64 << self.page_shift);
            }
            page.object.set(Some(NonNull::from(object)));
            page.offset.set(offset);
            unsafe { inner.resident.push_back(NonNull::from(page)) };
            unsafe { hash.insert(NonNull::from(page)) };
        }
    }

    fn remove_resident(&self, first: NonNull<Page>, num_pages: usize, hash: &PageHashTable<'_>) {
        let base_index = self.index_of(unsafe { first.as_ref() });
        let Some(object_ptr) = self.pages[base_index].object.get() else {
            return;
        };
        let object = unsafe { object_ptr.as_ref() };
        let mut inner = object.inner_exclusive();
        for p in 0..num_pages {
            let page = &self.pages[base_index + p];
            unsafe { hash.remove(NonNull::from(page)) };
            unsafe { inner.resident.remove(NonNull::from(page)) };
            page.object.set(None);
            page.offset.set(0);
        }
    }

    /// Allocate `num_pages` contiguous frames (rounded up to a power of
    /// two), optionally inserting them into `object` at `offset`.
    pub fn alloc_contiguous(
        &self,
        num_pages: usize,
        object: Option<&VmObject>,
        offset: u64,
        hash: &PageHashTable<'_>,
    ) -> Option<NonNull<Page>> {
        let num_pages = num_pages.next_power_of_two();
        if num_pages > self.pages.len() || num_pages > MAX_CONTIGUOUS_PAGES {
            return None;
        }

        let first = self.bin_pop(num_pages)?;
        let base_index = self.index_of(unsafe { first.as_ref() });
        for p in &self.pages[base_index..base_index + num_pages] {
            p.set_active(true);
        }

        if let Some(object) = object {
            self.insert_resident(first, num_pages, object, offset, hash);
        }

        Some(first)
    }

    /// Free a contiguous run previously returned by
    /// [`alloc_contiguous`](Self::alloc_contiguous).
    pub fn free_contiguous(&self, pages: NonNull<Page>, num_pages: usize, hash: &PageHashTable<'_>) {
        let num_pages = num_pages.next_power_of_two();
        let base_index = self.index_of(unsafe { pages.as_ref() });
        debug_assert_eq!(base_index & (num_pages - 1), 0, "run must be buddy-aligned");

        self.remove_resident(pages, num_pages, hash);
        self.bin_push(pages, num_pages);

        for p in &self.pages[base_index..base_index + num_pages] {
            p.set_active(false);
        }
    }

    /// Allocate a single page, optionally into `object` at `offset`.
    pub fn alloc(
        &self,
        object: Option<&VmObject>,
        offset: u64,
        hash: &PageHashTable<'_>,
    ) -> Option<NonNull<Page>> {
        self.alloc_contiguous(1, object, offset, hash)
    }

    /// Free a single page.
    pub fn free(&self, page: NonNull<Page>, hash: &PageHashTable<'_>) {
        self.free_contiguous(page, 1, hash)
    }

    /// Increment `page`'s wire count, serialized by its object's lock (if
    /// it has one), same as `vm_page_wire`.
    pub fn wire(&self, page: &Page) {
        let _guard = page.object().map(|o| unsafe { o.as_ref() }.inner_exclusive());
        let mut s = page.status.get();
        s.wired_count += 1;
        page.status.set(s);
    }

    /// Decrement `page`'s wire count, same as `vm_page_unwire`.
    pub fn unwire(&self, page: &Page) {
        let _guard = page.object().map(|o| unsafe { o.as_ref() }.inner_exclusive());
        let mut s = page.status.get();
        s.wired_count = s.wired_count.saturating_sub(1);
        page.status.set(s);
    }

    /// Pull the already-allocated frame at `pa` out of the free bins and
    /// wire it into `object`, splitting buddies as needed. Used during boot
    /// to tell the buddy allocator which frames the kernel image, page
    /// tables, and this array's own backing memory already occupy, same as
    /// `vm_page_reserve_pa`.
    pub fn reserve_pa(&self, pa: PhysAddr) -> Option<&Page> {
        let page = self.page_from_pa(pa);
        let index = self.index_of(page);

        for bin in 0..NUM_BINS {
            let buddy_index = index & !((1usize << bin) - 1);
            let buddy_ptr = NonNull::from(&self.pages[buddy_index]);

            let found = {
                let guard = self.bins[bin].acquire();
                guard.iter().any(|n| n == buddy_ptr)
            };
            if !found {
                continue;
            }

            {
                let mut guard = self.bins[bin].acquire();
                unsafe { guard.remove(buddy_ptr) };
            }

            page.set_active(true);
            let mut s = page.status.get();
            s.wired_count += 1;
            page.status.set(s);

            // Split the buddy down through every lower bin, keeping the
            // half containing `index` and freeing the other half each time.
            for i in (1..=bin).rev() {
                let num_pages = 1usize << (i - 1);
                let whole_start = index & !((1usize << i) - 1);
                let half_start = index & !(num_pages - 1);
                let free_start = if whole_start == half_start {
                    whole_start + num_pages
                } else {
                    whole_start
                };
                let free_ptr = NonNull::from(&self.pages[free_start]);
                self.bin_push(free_ptr, num_pages);
            }

            return Some(page);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_array(pages: &[Page]) -> PageArray<'_> {
        let arr = PageArray::new(pages, PhysAddr::new(0), 12);
        arr.seed_free_bins();
        arr
    }

    #[test]
    fn single_page_alloc_and_free_round_trips() {
        const N: usize = 4;
        let pages: [Page; N] = core::array::from_fn(|_| Page::new());
        let arr = page_array(&pages);
        let buckets: [Spinlock<List<Page, Onode>>; 8] = core::array::from_fn(|_| Spinlock::new(List::new()));
        let hash = PageHashTable::new(&buckets);

        let p = arr.alloc(None, 0, &hash).expect("page available");
        assert!(unsafe { p.as_ref() }.is_active());
        arr.free(p, &hash);
        assert!(!unsafe { p.as_ref() }.is_active());
    }

    #[test]
    fn contiguous_alloc_splits_and_merges_back() {
        const N: usize = 8;
        let pages: [Page; N] = core::array::from_fn(|_| Page::new());
        let arr = page_array(&pages);
        let buckets: [Spinlock<List<Page, Onode>>; 8] = core::array::from_fn(|_| Spinlock::new(List::new()));
        let hash = PageHashTable::new(&buckets);

        let run = arr.alloc_contiguous(2, None, 0, &hash).expect("2-page run");
        arr.free_contiguous(run, 2, &hash);

        // The whole array should have re-merged into a single free run of
        // size N, recoverable as one allocation.
        let whole = arr
            .alloc_contiguous(N, None, 0, &hash)
            .expect("fully merged back into one run");
        arr.free_contiguous(whole, N, &hash);
    }

    #[test]
    fn alloc_into_object_updates_size_and_hash() {
        const N: usize = 4;
        let pages: [Page; N] = core::array::from_fn(|_| Page::new());
        let arr = page_array(&pages);
        let buckets: [Spinlock<List<Page, Onode>>; 8] = core::array::from_fn(|_| Spinlock::new(List::new()));
        let hash = PageHashTable::new(&buckets);
        let object = VmObject::new();

        let page = arr.alloc(Some(&object), 0, &hash).expect("page available");
        assert_eq!(object.size(), 4096);
        assert_eq!(unsafe { page.as_ref() }.offset(), 0);
        assert_eq!(hash.lookup(&object, 0), Some(page));

        arr.free(page, &hash);
        assert_eq!(hash.lookup(&object, 0), None);
    }

    #[test]
    fn wire_and_unwire_track_count() {
        let pages: [Page; 1] = core::array::from_fn(|_| Page::new());
        let arr = page_array(&pages);
        arr.wire(&pages[0]);
        arr.wire(&pages[0]);
        assert_eq!(pages[0].wired_count(), 2);
        arr.unwire(&pages[0]);
        assert_eq!(pages[0].wired_count(), 1);
    }
}
