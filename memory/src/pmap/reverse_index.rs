//! Reverse index: for each physical frame, the set of `(pmap, va)` pairs
//! currently mapping it. Used by `pmap_page_protect` to walk every mapping
//! of a page without the page itself knowing about pmaps.
//!
//! Ported from `pte_page_list_t` / `_pmap_pte_page_insert` /
//! `_pmap_pte_page_remove`: one bucket per physical frame, each with its
//! own lock. **The lock ordering rule (spec §5) is load-bearing**: callers
//! must never hold a `Pmap`'s own lock while calling into this module —
//! release it first, call, then reacquire, exactly as the original's
//! comment warns ("otherwise there's a possibility of deadlock with
//! pmap_page_protect").

use crate::{
    addr::VirtAddr,
    error::{Error, Result},
    sync::Spinlock,
};

/// Entries held per frame. The original uses an unbounded `list_t`; this
/// crate has no allocator, so each frame can record at most
/// [`ENTRIES_PER_FRAME`] concurrent mappings. In practice a frame is rarely
/// mapped by more than a couple of pmaps (COW-shared pages, kernel aliasing)
/// so this is not expected to bind in ordinary operation; exhausting it
/// surfaces as [`Error::ResourceShortage`] rather than silently dropping an
/// entry.
pub const ENTRIES_PER_FRAME: usize = 4;

#[derive(Clone, Copy)]
struct Entry {
    pmap_id: u32,
    va: VirtAddr,
}

/// One frame's bucket of reverse-mapping entries.
pub struct Bucket {
    entries: [Option<Entry>; ENTRIES_PER_FRAME],
}

impl Bucket {
    /// An empty bucket.
    pub const fn new() -> Self {
        Self {
            entries: [None; ENTRIES_PER_FRAME],
        }
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

/// The reverse index over a caller-provided, frame-count-sized array of
/// buckets (typically carved out of `pmap_steal_memory`-style bootstrap
/// memory, sized to the number of physical frames).
pub struct ReverseIndex<'a> {
    buckets: &'a [Spinlock<Bucket>],
}

impl<'a> ReverseIndex<'a> {
    /// Wrap a pre-sized, zero-initialized bucket array.
    pub fn new(buckets: &'a [Spinlock<Bucket>]) -> Self {
        Self { buckets }
    }

    /// Record that `pmap_id` maps frame `pfn` at `va`.
    pub fn insert(&self, pfn: usize, pmap_id: u32, va: VirtAddr) -> Result<()> {
        let mut bucket = self.buckets[pfn].acquire();
        let slot = bucket
            .entries
            .iter_mut()
            .find(|e| e.is_none())
            .ok_or(Error::ResourceShortage)?;
        *slot = Some(Entry { pmap_id, va });
        Ok(())
    }

    /// Remove the `(pmap_id, _)` entry for frame `pfn`, if present.
    pub fn remove(&self, pfn: usize, pmap_id: u32) {
        let mut bucket = self.buckets[pfn].acquire();
        for slot in bucket.entries.iter_mut() {
            if slot.map(|e| e.pmap_id) == Some(pmap_id) {
                *slot = None;
                return;
            }
        }
    }

    /// Invoke `f` for every `(pmap_id, va)` currently mapping frame `pfn`.
    pub fn for_each(&self, pfn: usize, mut f: impl FnMut(u32, VirtAddr)) {
        let bucket = self.buckets[pfn].acquire();
        for entry in bucket.entries.iter().flatten() {
            f(entry.pmap_id, entry.va);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_for_each_sees_entry() {
        let buckets = [Spinlock::new(Bucket::new())];
        let idx = ReverseIndex::new(&buckets);
        idx.insert(0, 7, VirtAddr::new(0x2000)).unwrap();

        let mut seen = 0;
        idx.for_each(0, |pmap_id, va| {
            assert_eq!(pmap_id, 7);
            assert_eq!(va, VirtAddr::new(0x2000));
            seen += 1;
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn remove_clears_entry() {
        let buckets = [Spinlock::new(Bucket::new())];
        let idx = ReverseIndex::new(&buckets);
        idx.insert(0, 1, VirtAddr::new(0x1000)).unwrap();
        idx.remove(0, 1);

        let mut seen = 0;
        idx.for_each(0, |_, _| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn full_bucket_reports_resource_shortage() {
        let buckets = [Spinlock::new(Bucket::new())];
        let idx = ReverseIndex::new(&buckets);
        for i in 0..ENTRIES_PER_FRAME as u32 {
            idx.insert(0, i, VirtAddr::new(0x1000)).unwrap();
        }
        assert_eq!(
            idx.insert(0, 99, VirtAddr::new(0x1000)),
            Err(Error::ResourceShortage)
        );
    }
}
