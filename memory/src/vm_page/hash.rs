//! Object/offset hash table over every currently-allocated page.
//!
//! Ported from `vm_page_hash_table_t`/`VM_PAGE_HASH`/`vm_page_lookup`: one
//! bucket list per slot, each independently lockable, keyed by
//! `hash64_fnv1a_pair(object, offset) % num_buckets`.

use core::ptr::NonNull;

use super::{Onode, Page};
use crate::{primitives::List, sync::Spinlock, vm_object::VmObject};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// `hash64_fnv1a_pair`: fold two 64-bit words through FNV-1a as one byte
/// stream.
fn fnv1a_pair(a: u64, b: u64) -> u64 {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&a.to_ne_bytes());
    buf[8..].copy_from_slice(&b.to_ne_bytes());
    fnv1a(&buf)
}

/// The object/offset hash table. Backed by a caller-supplied, pre-sized
/// bucket array — the original carves this out of `pmap_steal_memory` at
/// `num_pages + num_pages / 2` buckets (spec §6), sized once and never
/// resized.
pub struct PageHashTable<'a> {
    buckets: &'a [Spinlock<List<Page, Onode>>],
}

impl<'a> PageHashTable<'a> {
    /// Wrap a pre-sized, zero-initialized bucket array.
    pub fn new(buckets: &'a [Spinlock<List<Page, Onode>>]) -> Self {
        Self { buckets }
    }

    fn bucket_for(&self, object: *const VmObject, offset: u64) -> usize {
        (fnv1a_pair(object as usize as u64, offset) % self.buckets.len() as u64) as usize
    }

    /// Link `page` into its bucket. `page.object()`/`page.offset()` must
    /// already be set.
    ///
    /// # Safety
    ///
    /// `page` must not already be linked into this table.
    pub unsafe fn insert(&self, page: NonNull<Page>) {
        let p = page.as_ref();
        let object = p.object().expect("page must have an object before hashing");
        let bucket = self.bucket_for(object.as_ptr(), p.offset());
        self.buckets[bucket].acquire().push_back(page);
    }

    /// Unlink `page` from its bucket.
    ///
    /// # Safety
    ///
    /// `page` must currently be linked into this table.
    pub unsafe fn remove(&self, page: NonNull<Page>) {
        let p = page.as_ref();
        let object = p.object().expect("page must have an object before unhashing");
        let bucket = self.bucket_for(object.as_ptr(), p.offset());
        self.buckets[bucket].acquire().remove(page);
    }

    /// Find the page resident at `offset` in `object`, if any.
    pub fn lookup(&self, object: &VmObject, offset: u64) -> Option<NonNull<Page>> {
        let bucket = self.bucket_for(object as *const VmObject, offset);
        let guard = self.buckets[bucket].acquire_read();
        guard.iter().find(|node| {
            let page = unsafe { node.as_ref() };
            page.offset() == offset
                && page.object().map(|o| o.as_ptr() as *const VmObject) == Some(object as *const VmObject)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_hash_is_order_sensitive() {
        assert_ne!(fnv1a_pair(1, 2), fnv1a_pair(2, 1));
    }

    #[test]
    fn pair_hash_is_deterministic() {
        assert_eq!(fnv1a_pair(0xdead, 0xbeef), fnv1a_pair(0xdead, 0xbeef));
    }
}
