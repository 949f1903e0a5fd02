//! Physical map (pmap): the AArch64 stage-1 table walker.
//!
//! Ported from `examples/original_source/kernel/arch/pmap.c`. The table
//! index arithmetic (`width = PAGESHIFT - 3`, `lsb = PAGESHIFT + (3-level) *
//! width`) is granule-generic in the original and kept exactly that way
//! here, so [`Granule::Kb4`]/[`Granule::Kb16`]/[`Granule::Kb64`] all walk
//! through the same loop, differing only in `page_shift` and in 64 KiB's
//! skipped level 0 (`start_level`).

pub mod asid;
pub mod attrs;
pub mod bootstrap;
pub mod reverse_index;

use core::sync::atomic::{AtomicUsize, Ordering};

use attrs::{PmapFlags, Prot};
use reverse_index::ReverseIndex;

use crate::{
    addr::{PhysAddr, VirtAddr},
    error::{Error, Result},
    sync::Lock,
};

/// Translation granule, detected once at boot (spec §4.3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Granule {
    Kb4,
    Kb16,
    Kb64,
}

impl Granule {
    /// log2(granule size).
    pub const fn page_shift(self) -> u32 {
        match self {
            Granule::Kb4 => 12,
            Granule::Kb16 => 14,
            Granule::Kb64 => 16,
        }
    }

    /// Granule size in bytes.
    pub const fn page_size(self) -> usize {
        1 << self.page_shift()
    }

    /// First table level walked. 64 KiB granule starts at level 1 — its
    /// wider per-level index (13 bits) covers the same 48-bit VA space in
    /// one fewer level.
    const fn start_level(self) -> u32 {
        match self {
            Granule::Kb64 => 1,
            _ => 0,
        }
    }
}

/// Probe `ID_AA64MMFR0_EL1` for the best-supported granule, preferring 4 KiB.
pub fn detect_granule() -> Granule {
    use aarch64_cpu::registers::ID_AA64MMFR0_EL1;
    use tock_registers::interfaces::Readable;

    let mmfr = ID_AA64MMFR0_EL1.extract();
    if mmfr.matches_all(ID_AA64MMFR0_EL1::TGran4::Supported) {
        Granule::Kb4
    } else if mmfr.matches_all(ID_AA64MMFR0_EL1::TGran16::Supported) {
        Granule::Kb16
    } else {
        Granule::Kb64
    }
}

fn table_index(va: usize, level: u32, page_shift: u32) -> usize {
    let width = page_shift - 3;
    let mask = (1usize << width) - 1;
    let lsb = page_shift + (3 - level) * width;
    (va >> lsb) & mask
}

/// Allocates a zeroed, page-table-sized, page-aligned physical frame to
/// extend a pmap's table hierarchy. Decoupled from `pmap` the same way
/// [`crate::sync::SchedulerOps`] decouples `Lock` from the scheduler —
/// `slab`/`vm_km` register the real allocator once they exist; bootstrap
/// uses a plain bump allocator directly instead, matching the original's
/// `pmap_steal_memory`-backed bootstrap vs. `page_table_slab`-backed
/// steady state.
pub trait TableAllocator: Sync {
    /// Allocate one zeroed table-sized frame.
    fn alloc_table(&self) -> Option<PhysAddr>;
}

struct NullTableAllocator;
impl TableAllocator for NullTableAllocator {
    fn alloc_table(&self) -> Option<PhysAddr> {
        None
    }
}

static NULL_TABLE_ALLOCATOR: NullTableAllocator = NullTableAllocator;
static mut TABLE_ALLOCATOR: &'static dyn TableAllocator = &NULL_TABLE_ALLOCATOR;

/// Register the table allocator used by `enter()` after bootstrap.
///
/// # Safety
///
/// Must not race with itself or with `table_allocator()`.
pub unsafe fn register_table_allocator(alloc: &'static dyn TableAllocator) {
    TABLE_ALLOCATOR = alloc;
}

fn table_allocator() -> &'static dyn TableAllocator {
    unsafe { TABLE_ALLOCATOR }
}

/// Linear offset between a physical address and its kernel-virtual alias,
/// set once by `bootstrap()` (`kernel_virtual_start - kernel_physical_start`
/// in the original).
static PHYS_TO_VIRT_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Record the kernel's linear physical-to-virtual offset.
pub fn set_phys_to_virt_offset(offset: usize) {
    PHYS_TO_VIRT_OFFSET.store(offset, Ordering::Relaxed);
}

/// Translate a physical address to its kernel-linear-map virtual alias.
pub fn phys_to_virt(pa: PhysAddr) -> VirtAddr {
    VirtAddr::new(pa.as_raw() as usize + PHYS_TO_VIRT_OFFSET.load(Ordering::Relaxed))
}

static GRANULE: core::sync::atomic::AtomicU8 = core::sync::atomic::AtomicU8::new(0);

fn granule() -> Granule {
    match GRANULE.load(Ordering::Relaxed) {
        1 => Granule::Kb16,
        2 => Granule::Kb64,
        _ => Granule::Kb4,
    }
}

fn set_granule(g: Granule) {
    GRANULE.store(
        match g {
            Granule::Kb4 => 0,
            Granule::Kb16 => 1,
            Granule::Kb64 => 2,
        },
        Ordering::Relaxed,
    );
}

unsafe fn tlb_invalidate_va(va: usize, asid: u8) {
    let tagged = ((asid as u64) << 48) | ((va as u64) >> 12);
    core::arch::asm!("tlbi vae1is, {x}", x = in(reg) tagged);
    aarch64_cpu::asm::barrier::dsb(aarch64_cpu::asm::barrier::ISH);
    aarch64_cpu::asm::barrier::isb(aarch64_cpu::asm::barrier::SY);
}

/// Break-before-make PTE update (spec §4.3 mandatory sequence): clear an
/// already-valid entry and shoot down its TLB entry before installing the
/// new value, required whenever cacheability, output address, or memory
/// type changes underneath a live mapping.
unsafe fn update_pte(pte_ptr: *mut u64, va: usize, asid: u8, new_pte: u64) {
    let old = core::ptr::read_volatile(pte_ptr);
    if attrs::is_valid(old) {
        core::ptr::write_volatile(pte_ptr, 0);
        tlb_invalidate_va(va, asid);
    }
    core::ptr::write_volatile(pte_ptr, new_pte);
    aarch64_cpu::asm::barrier::dsb(aarch64_cpu::asm::barrier::ISH);
    aarch64_cpu::asm::barrier::isb(aarch64_cpu::asm::barrier::SY);
}

struct PmapInner {
    ttb: PhysAddr,
    resident: usize,
    wired: usize,
}

/// A physical map: one per task's address space, plus the `kernel_pmap`
/// singleton mapping TTBR1.
pub struct Pmap {
    inner: Lock<PmapInner>,
    asid: u8,
    id: u32,
    refcount: core::sync::atomic::AtomicU32,
}

impl Pmap {
    fn new(ttb: PhysAddr, asid: u8, id: u32) -> Self {
        Self {
            inner: Lock::new(PmapInner {
                ttb,
                resident: 0,
                wired: 0,
            }),
            asid,
            id,
            refcount: core::sync::atomic::AtomicU32::new(1),
        }
    }

    /// ASID assigned to this pmap.
    pub fn asid(&self) -> u8 {
        self.asid
    }

    /// Opaque id used as the reverse-index key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Increment the reference count (`pmap_reference`).
    pub fn reference(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Resident page count.
    pub fn resident_count(&self) -> usize {
        self.inner.acquire_shared().resident
    }

    /// Wired page count.
    pub fn wired_count(&self) -> usize {
        self.inner.acquire_shared().wired
    }

    fn walk(&self, va: VirtAddr, allocate: bool) -> Result<*mut u64> {
        let g = granule();
        let page_shift = g.page_shift();
        let mut level = g.start_level();
        let guard = self.inner.acquire_shared();
        let mut table_pa = guard.ttb;
        drop(guard);

        loop {
            let idx = table_index(va.as_raw(), level, page_shift);
            let table_ptr = phys_to_virt(table_pa).as_raw() as *mut u64;
            let pte = unsafe { core::ptr::read_volatile(table_ptr.add(idx)) };

            if level == 3 {
                return Ok(unsafe { table_ptr.add(idx) });
            }

            if attrs::is_table(pte) {
                table_pa = PhysAddr::new(attrs::pte_to_pa(pte));
            } else if allocate {
                let new_table = table_allocator()
                    .alloc_table()
                    .ok_or(Error::ResourceShortage)?;
                unsafe {
                    core::ptr::write_volatile(
                        table_ptr.add(idx),
                        attrs::table_descriptor(new_table.as_raw()),
                    );
                }
                table_pa = new_table;
            } else {
                return Err(Error::NotFound);
            }

            level += 1;
        }
    }

    /// `pmap_enter`: map `pa` at `va` with `prot`/`flags`, extending the
    /// table hierarchy as needed.
    pub fn enter(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        prot: Prot,
        flags: PmapFlags,
        reverse_idx: &ReverseIndex<'_>,
    ) -> Result<()> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }

        let leaf = self.walk(va, true)?;
        let global = self.asid == 0;
        let new_pte = attrs::page_descriptor(pa.as_raw(), prot, flags, global);

        let mut guard = self.inner.acquire_exclusive();
        let was_valid = attrs::is_valid(unsafe { core::ptr::read_volatile(leaf) });
        unsafe { update_pte(leaf, va.as_raw(), self.asid, new_pte) };
        if !was_valid {
            guard.resident += 1;
        }
        if flags.contains(PmapFlags::WIRED) {
            guard.wired += 1;
        }
        drop(guard);

        reverse_idx.insert(pa.page_index(), self.id, va)
    }

    /// `pmap_remove` for a single page: clear its leaf entry.
    pub fn remove(&self, va: VirtAddr, pa: PhysAddr, reverse_idx: &ReverseIndex<'_>) -> Result<()> {
        let leaf = self.walk(va, false)?;
        let mut guard = self.inner.acquire_exclusive();
        let pte = unsafe { core::ptr::read_volatile(leaf) };
        if !attrs::is_valid(pte) {
            return Err(Error::NotFound);
        }
        unsafe {
            core::ptr::write_volatile(leaf, 0);
            tlb_invalidate_va(va.as_raw(), self.asid);
        }
        guard.resident -= 1;
        drop(guard);

        reverse_idx.remove(pa.page_index(), self.id);
        Ok(())
    }

    /// `pmap_protect` for a single page: change protection bits in place
    /// via break-before-make, preserving the output address and memory
    /// type.
    pub fn protect(&self, va: VirtAddr, prot: Prot, _reverse_idx: &ReverseIndex<'_>) -> Result<()> {
        let leaf = self.walk(va, false)?;
        let pte = unsafe { core::ptr::read_volatile(leaf) };
        if !attrs::is_valid(pte) {
            return Err(Error::NotFound);
        }
        let pa = attrs::pte_to_pa(pte);
        let mair_idx = (pte >> 2) & 0x7;
        let flags = attrs::flags_from_mair_index(mair_idx);
        let global = self.asid == 0;
        let new_pte = attrs::page_descriptor(pa, prot, flags, global);
        unsafe { update_pte(leaf, va.as_raw(), self.asid, new_pte) };
        Ok(())
    }
}

/// `pmap_page_protect`: change protection for every pmap currently mapping
/// physical frame `pfn`, by consulting the reverse index.
pub fn page_protect(
    pfn: usize,
    prot: Prot,
    reverse_idx: &ReverseIndex<'_>,
    lookup: impl Fn(u32) -> Option<&'static Pmap>,
) {
    let mut targets: [Option<(u32, VirtAddr)>; reverse_index::ENTRIES_PER_FRAME] =
        [None; reverse_index::ENTRIES_PER_FRAME];
    let mut n = 0;
    reverse_idx.for_each(pfn, |pmap_id, va| {
        if n < targets.len() {
            targets[n] = Some((pmap_id, va));
            n += 1;
        }
    });

    for entry in targets.iter().flatten() {
        let (pmap_id, va) = *entry;
        if let Some(pmap) = lookup(pmap_id) {
            let _ = pmap.protect(va, prot, reverse_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_index_matches_4kb_level_layout() {
        // Level 3 (page index) uses bits [20:12] for a 4 KiB granule.
        let va = 0b1_0000_0000usize << 12;
        assert_eq!(table_index(va, 3, 12), 1);
    }

    #[test]
    fn granule_page_sizes() {
        assert_eq!(Granule::Kb4.page_size(), 4096);
        assert_eq!(Granule::Kb16.page_size(), 16384);
        assert_eq!(Granule::Kb64.page_size(), 65536);
    }

    #[test]
    fn kb64_starts_at_level_one() {
        assert_eq!(Granule::Kb64.start_level(), 1);
        assert_eq!(Granule::Kb4.start_level(), 0);
    }
}
