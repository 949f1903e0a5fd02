//! Fixed-block slab allocator.
//!
//! A slab carves a caller-supplied buffer into equally sized blocks, linked
//! by a free list threaded through the blocks themselves — no bookkeeping
//! outside the buffer except a small header at its front. Multiple buffers
//! chain into one slab; `alloc` walks the chain from the head for the first
//! buffer with room, `free` returns a block to its owning buffer and
//! promotes that buffer to the head once its free count grows far enough
//! past the current head's, so the most-populated buffer is searched first.
//!
//! Ported from `slab_t`/`_slab_shuffle` (`original_source/kernel/slab.c`).

use core::ptr::NonNull;

use crate::{
    error::{Error, Result},
    sync::Spinlock,
};

/// A buffer is promoted to the search head once freeing a block leaves it
/// with more than 1/4 of its capacity above the current head's free count.
const SLAB_SHUFFLE_SHIFT: u32 = 2;

fn shuffle_threshold(head: &SlabBuf) -> usize {
    head.free_blocks_remaining + (head.capacity >> SLAB_SHUFFLE_SHIFT)
}

/// Header embedded at the start of every buffer handed to [`Slab::grow`];
/// the blocks themselves immediately follow it.
struct SlabBuf {
    next_slab: Option<NonNull<SlabBuf>>,
    next_free: Option<NonNull<u8>>,
    capacity: usize,
    free_blocks_remaining: usize,
}

impl SlabBuf {
    fn is_full(&self) -> bool {
        self.free_blocks_remaining == self.capacity
    }

    fn blocks_start(this: NonNull<SlabBuf>) -> *mut u8 {
        unsafe { (this.as_ptr() as *mut u8).add(core::mem::size_of::<SlabBuf>()) }
    }

    fn owns(&self, this: NonNull<SlabBuf>, block_size: usize, block: NonNull<u8>) -> bool {
        let base = Self::blocks_start(this);
        let offset = block.as_ptr() as isize - base as isize;
        offset >= 0 && (offset as usize) < self.capacity * block_size
    }
}

/// Read/write the next-free pointer chained through a free block, the same
/// way the original threads a `uintptr_t` through each block.
unsafe fn write_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
    let v = next.map_or(0usize, |p| p.as_ptr() as usize);
    (block.as_ptr() as *mut usize).write_unaligned(v);
}

unsafe fn read_next(block: NonNull<u8>) -> Option<NonNull<u8>> {
    let v = (block.as_ptr() as *const usize).read_unaligned();
    NonNull::new(v as *mut u8)
}

struct SlabInner {
    first: Option<NonNull<SlabBuf>>,
    block_size: usize,
}

// `SlabInner` only ever holds pointers into buffers the caller handed to
// `Slab::grow`; it carries no thread-local state.
unsafe impl Send for SlabInner {}

fn init_buf(buf: &mut [u8], block_size: usize) -> Result<NonNull<SlabBuf>> {
    let header = core::mem::size_of::<SlabBuf>();
    if block_size < core::mem::size_of::<usize>() || buf.len() <= header + block_size {
        return Err(Error::InvalidArgument);
    }

    let capacity = (buf.len() - header) / block_size;
    let this = NonNull::new(buf.as_mut_ptr() as *mut SlabBuf).ok_or(Error::InvalidArgument)?;
    let blocks_start = SlabBuf::blocks_start(this);

    for i in 0..capacity {
        let block = unsafe { NonNull::new_unchecked(blocks_start.add(i * block_size)) };
        let next = if i + 1 < capacity {
            Some(unsafe { NonNull::new_unchecked(blocks_start.add((i + 1) * block_size)) })
        } else {
            None
        };
        unsafe { write_next(block, next) };
    }

    unsafe {
        this.as_ptr().write(SlabBuf {
            next_slab: None,
            next_free: NonNull::new(blocks_start),
            capacity,
            free_blocks_remaining: capacity,
        });
    }

    Ok(this)
}

fn shuffle(first: &mut Option<NonNull<SlabBuf>>, this: NonNull<SlabBuf>, prev: NonNull<SlabBuf>) {
    unsafe {
        (*prev.as_ptr()).next_slab = (*this.as_ptr()).next_slab;
        (*this.as_ptr()).next_slab = *first;
    }
    *first = Some(this);
}

fn alloc_locked(inner: &mut SlabInner) -> Option<NonNull<u8>> {
    let mut prev = None;
    let mut cur = inner.first;
    while let Some(this) = cur {
        let this_ref = unsafe { &mut *this.as_ptr() };
        if this_ref.free_blocks_remaining > 0 {
            let block = this_ref
                .next_free
                .expect("nonzero free_blocks_remaining implies a nonempty free list");
            this_ref.next_free = unsafe { read_next(block) };
            this_ref.free_blocks_remaining -= 1;
            if let Some(prev) = prev {
                shuffle(&mut inner.first, this, prev);
            }
            return Some(block);
        }
        prev = cur;
        cur = this_ref.next_slab;
    }
    None
}

fn free_locked(inner: &mut SlabInner, block: NonNull<u8>) {
    let mut prev = None;
    let mut cur = inner.first;
    while let Some(this) = cur {
        let this_ref = unsafe { &mut *this.as_ptr() };
        if this_ref.owns(this, inner.block_size, block) {
            unsafe { write_next(block, this_ref.next_free) };
            this_ref.next_free = Some(block);
            this_ref.free_blocks_remaining += 1;

            if let Some(prev) = prev {
                let head = unsafe { inner.first.unwrap().as_ref() };
                if this_ref.free_blocks_remaining > shuffle_threshold(head) {
                    shuffle(&mut inner.first, this, prev);
                }
            }
            return;
        }
        prev = cur;
        cur = this_ref.next_slab;
    }
    panic!("freed block not owned by any buffer in this slab");
}

fn shrink_locked(inner: &mut SlabInner) -> Option<(NonNull<u8>, usize)> {
    let mut prev: Option<NonNull<SlabBuf>> = None;
    let mut cur = inner.first;
    while let Some(this) = cur {
        let this_ref = unsafe { this.as_ref() };
        if this_ref.is_full() {
            match prev {
                Some(p) => unsafe { (*p.as_ptr()).next_slab = this_ref.next_slab },
                None => inner.first = this_ref.next_slab,
            }
            let len = core::mem::size_of::<SlabBuf>() + this_ref.capacity * inner.block_size;
            return Some((this.cast::<u8>(), len));
        }
        prev = cur;
        cur = this_ref.next_slab;
    }
    None
}

/// A fixed-block allocator over one or more caller-supplied buffers.
pub struct Slab<'a> {
    inner: Spinlock<SlabInner>,
    _marker: core::marker::PhantomData<&'a mut [u8]>,
}

impl<'a> Slab<'a> {
    /// Create an empty slab for blocks of `block_size` bytes. Call
    /// [`grow`](Self::grow) at least once before allocating.
    pub const fn new(block_size: usize) -> Self {
        Self {
            inner: Spinlock::new(SlabInner { first: None, block_size }),
            _marker: core::marker::PhantomData,
        }
    }

    /// Size in bytes of a single block.
    pub fn block_size(&self) -> usize {
        self.inner.acquire_read().block_size
    }

    /// Link a new buffer in at the head of the search order.
    ///
    /// `buf` must be large enough for the embedded header plus at least one
    /// block; the caller is responsible for keeping it alive and mapped for
    /// as long as blocks may be allocated from it.
    pub fn grow(&self, buf: &'a mut [u8]) -> Result<()> {
        let mut inner = self.inner.acquire();
        let new = init_buf(buf, inner.block_size)?;
        unsafe { (*new.as_ptr()).next_slab = inner.first };
        inner.first = Some(new);
        Ok(())
    }

    /// Unlink and return the raw extent (pointer, length) of an empty
    /// buffer, if any is fully free. The caller owns the returned memory
    /// again and may unmap or reuse it.
    pub fn shrink(&self) -> Option<(NonNull<u8>, usize)> {
        shrink_locked(&mut self.inner.acquire())
    }

    /// Allocate one block.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        alloc_locked(&mut self.inner.acquire())
    }

    /// Allocate one block, zeroed.
    pub fn zalloc(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.acquire();
        let block = alloc_locked(&mut inner)?;
        unsafe { core::ptr::write_bytes(block.as_ptr(), 0, inner.block_size) };
        Some(block)
    }

    /// Return a block previously handed out by [`alloc`](Self::alloc) or
    /// [`zalloc`](Self::zalloc).
    ///
    /// # Safety
    ///
    /// `block` must currently be allocated from this slab.
    pub unsafe fn free(&self, block: NonNull<u8>) {
        free_locked(&mut self.inner.acquire(), block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_exhausts_then_frees() {
        let mut buf = [0u8; 256];
        let slab = Slab::new(32);
        slab.grow(&mut buf).unwrap();

        let mut blocks = [None; 7];
        for b in blocks.iter_mut() {
            *b = Some(slab.alloc().expect("capacity for 7 32-byte blocks in 256 bytes minus header"));
        }
        assert!(slab.alloc().is_none());

        unsafe { slab.free(blocks[3].take().unwrap()) };
        assert!(slab.alloc().is_some());
    }

    #[test]
    fn zalloc_returns_zeroed_block() {
        let mut buf = [0xffu8; 128];
        let slab = Slab::new(16);
        slab.grow(&mut buf).unwrap();

        let block = slab.zalloc().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(block.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn growing_a_second_buffer_keeps_allocating_past_the_first() {
        let mut buf_a = [0u8; 80];
        let mut buf_b = [0u8; 80];
        let slab = Slab::new(16);
        slab.grow(&mut buf_a).unwrap();

        // Drain the first buffer (80 - header) / 16 blocks.
        while slab.alloc().is_some() {}

        slab.grow(&mut buf_b).unwrap();
        assert!(slab.alloc().is_some());
    }

    #[test]
    fn shrink_only_reclaims_a_fully_free_buffer() {
        let mut buf_a = [0u8; 80];
        let mut buf_b = [0u8; 80];
        let slab = Slab::new(16);
        slab.grow(&mut buf_a).unwrap();
        slab.grow(&mut buf_b).unwrap();

        let held = slab.alloc().unwrap();
        assert!(slab.shrink().is_some(), "the other, fully-free buffer should be reclaimable");

        unsafe { slab.free(held) };
    }
}
