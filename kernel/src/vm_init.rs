//! Boot-time construction of the kernel's own address space.
//!
//! Ported from `original_source/kernel/vm/vm_init.c`'s `vm_init` (`pmap_bootstrap`
//! then `pmap_init`/`vm_map_init`/`vm_object_init`/`vm_page_init`/`vm_km_init`).
//! Nothing downstream of the kernel's own [`VmMap`] singleton is exercised yet
//! — kernel stacks and the other fixed-size structures in [`crate::task`]/
//! [`crate::thread`] come out of static [`memory::slab::Slab`]s, not out of
//! this map — so this module stops at `kernel_pmap`/`kernel_map`, the two
//! singletons `memory::vm_map` documents as boot sequencing's job to build.
//!
//! [`memory::pmap::bootstrap::bootstrap`] only ever populates page table
//! frames in memory; it does not touch `TTBR0_EL1`/`TTBR1_EL1` or
//! `SCTLR_EL1.M`, and nothing in `machine`'s boot path enables the MMU
//! either (`shared_setup_and_enter_pre` leaves it disabled and nothing turns
//! it back on). So the tables built here are real and walkable, but never
//! installed: `kernel_va_start` is chosen equal to `kernel_pa_start`, making
//! the kernel's linear map an identity map, which is what is actually in
//! effect with the MMU off. Installing the tables and flipping the MMU on is
//! future work, not attempted here.

use machine::mm::bump_allocator::BumpAllocator;
use memory::{
    addr::VirtAddr,
    pmap::{bootstrap, Pmap},
    vm_map::{
        mapping::{Mapping, MappingPool},
        VmMap,
    },
};

extern "C" {
    static __RAM_START: u64;
    static __RAM_END_EXCLUSIVE: u64;
}

/// Scratch memory handed to [`memory::pmap::bootstrap::bootstrap`] for page
/// table frames. Not part of the linker-script image; a plain static, the
/// same treatment every other fixed-size pool in this kernel gets.
const BOOT_HEAP_SIZE: usize = 128 * 1024;
static mut BOOT_HEAP: [u8; BOOT_HEAP_SIZE] = [0; BOOT_HEAP_SIZE];

const MAPPING_POOL_CAPACITY: usize = 256;
static mut MAPPING_POOL_STORAGE: Option<[Mapping; MAPPING_POOL_CAPACITY]> = None;
static mut MAPPING_POOL: Option<MappingPool<'static>> = None;
static mut KERNEL_PMAP: Option<Pmap> = None;
static mut KERNEL_MAP: Option<VmMap<'static>> = None;

/// `vm_init`: build the kernel pmap's page tables and the `VmMap` bookkeeping
/// over the kernel's own image range, and hand back a `'static` reference to
/// the map for [`crate::task::init`].
///
/// # Safety
///
/// Must run once, before [`crate::task::init`], with interrupts masked.
pub unsafe fn init() -> &'static VmMap<'static> {
    let granule = memory::pmap::detect_granule();

    let ram_start = &__RAM_START as *const u64 as u64;
    let ram_end = &__RAM_END_EXCLUSIVE as *const u64 as u64;

    let mut bump = BumpAllocator::new(
        BOOT_HEAP.as_ptr() as usize,
        BOOT_HEAP.as_ptr() as usize + BOOT_HEAP_SIZE,
    );

    let result = bootstrap::bootstrap(&mut bump, granule, ram_start, ram_start, ram_end - ram_start)
        .expect("boot heap holds enough page table frames for the kernel's own image");
    KERNEL_PMAP = Some(result.kernel_pmap);

    MAPPING_POOL_STORAGE = Some(core::array::from_fn(|_| Mapping::default()));
    MAPPING_POOL = Some(MappingPool::new(MAPPING_POOL_STORAGE.as_ref().unwrap()));

    KERNEL_MAP = Some(VmMap::new(
        KERNEL_PMAP.as_ref().unwrap(),
        MAPPING_POOL.as_ref().unwrap(),
        VirtAddr::new(ram_start as usize),
        VirtAddr::new(ram_end as usize),
    ));

    KERNEL_MAP.as_ref().unwrap()
}
