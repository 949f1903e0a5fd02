//! Early bootstrap: build the linear kernel map and a throwaway TTBR0
//! identity map, enable the MMU, and hand back the `kernel_pmap` singleton.
//!
//! Ported from `pmap_bootstrap`/`pmap_steal_memory`. The original walks the
//! table hierarchy twice — once per mapping for the permanent TTBR1 kernel
//! map, once for the disposable TTBR0 identity map used only until the
//! `arch_mmu_kernel_longjmp` — so both passes here share one helper,
//! [`map_identity_range`].

use machine::mm::bump_allocator::BumpAllocator;

use super::{attrs, table_index, Granule, Pmap};
use crate::addr::PhysAddr;

/// A bump allocator wrapper handing out zeroed, page-table-sized frames
/// during bootstrap, before `slab`/`vm_km` exist to register a real
/// [`super::TableAllocator`] (`page_table_slab` in the original).
pub struct BootstrapAllocator<'a> {
    bump: &'a mut BumpAllocator,
    page_size: usize,
}

impl<'a> BootstrapAllocator<'a> {
    /// Wrap `bump`, handing out `granule`-sized frames.
    pub fn new(bump: &'a mut BumpAllocator, granule: Granule) -> Self {
        Self {
            bump,
            page_size: granule.page_size(),
        }
    }

    fn alloc_zeroed_table(&mut self) -> Option<PhysAddr> {
        let pa = self.bump.alloc(self.page_size, self.page_size)?;
        unsafe {
            core::ptr::write_bytes(pa as *mut u8, 0, self.page_size);
        }
        Some(PhysAddr::new(pa as u64))
    }
}

/// Map `[pa_start, pa_start + size)` 1:1 at `pa_start` (no offset) into the
/// table rooted at `ttb`, allocating intermediate tables from `alloc` as
/// needed. Used both for the permanent linear kernel map (called with the
/// kernel's actual physical range, installed under TTBR1 at an offset
/// applied by the caller via `va_base`) and for the disposable TTBR0
/// identity map (`va_base == pa_start`).
pub fn map_identity_range(
    ttb: PhysAddr,
    va_base: u64,
    pa_start: u64,
    size: u64,
    granule: Granule,
    alloc: &mut BootstrapAllocator<'_>,
) -> Option<()> {
    let page_size = granule.page_size() as u64;
    let page_shift = granule.page_shift();
    let start_level = granule.start_level();

    let mut offset = 0u64;
    while offset < size {
        let va = va_base + offset;
        let pa = pa_start + offset;

        let mut table_pa = ttb;
        let mut level = start_level;
        loop {
            let table_ptr = super::phys_to_virt(table_pa).as_raw() as *mut u64;
            let idx = table_index(va as usize, level, page_shift);

            if level == 3 {
                let pte = attrs::page_descriptor(
                    pa,
                    attrs::Prot::ALL,
                    attrs::PmapFlags::empty(),
                    true,
                );
                unsafe { core::ptr::write_volatile(table_ptr.add(idx), pte) };
                break;
            }

            let existing = unsafe { core::ptr::read_volatile(table_ptr.add(idx)) };
            table_pa = if attrs::is_table(existing) {
                PhysAddr::new(attrs::pte_to_pa(existing))
            } else {
                let new_table = alloc.alloc_zeroed_table()?;
                unsafe {
                    core::ptr::write_volatile(
                        table_ptr.add(idx),
                        attrs::table_descriptor(new_table.as_raw()),
                    );
                }
                new_table
            };
            level += 1;
        }

        offset += page_size;
    }

    Some(())
}

/// Result of [`bootstrap`]: the kernel pmap plus the identity table's
/// physical base, which the caller installs in TTBR0 just long enough to
/// jump into the high kernel mapping and then discards.
pub struct BootstrapResult {
    pub kernel_pmap: Pmap,
    pub identity_ttb: PhysAddr,
}

/// Build the kernel's linear map over `[kernel_pa_start, kernel_pa_start +
/// kernel_size)` at `kernel_va_start`, plus a throwaway identity map of the
/// same range, using `bump` for every table frame involved. Returns the
/// populated `kernel_pmap` and the identity table base to load into TTBR0.
pub fn bootstrap(
    bump: &mut BumpAllocator,
    granule: Granule,
    kernel_pa_start: u64,
    kernel_va_start: u64,
    kernel_size: u64,
) -> Option<BootstrapResult> {
    super::set_phys_to_virt_offset((kernel_va_start - kernel_pa_start) as usize);

    let mut kernel_alloc = BootstrapAllocator::new(bump, granule);
    let kernel_ttb = kernel_alloc.alloc_zeroed_table()?;
    map_identity_range(
        kernel_ttb,
        kernel_va_start,
        kernel_pa_start,
        kernel_size,
        granule,
        &mut kernel_alloc,
    )?;

    let mut identity_alloc = BootstrapAllocator::new(bump, granule);
    let identity_ttb = identity_alloc.alloc_zeroed_table()?;
    map_identity_range(
        identity_ttb,
        kernel_pa_start,
        kernel_pa_start,
        kernel_size,
        granule,
        &mut identity_alloc,
    )?;

    let kernel_pmap = Pmap::new(kernel_ttb, 0, 0);
    kernel_pmap.reference();

    Some(BootstrapResult {
        kernel_pmap,
        identity_ttb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_a_single_page_to_itself() {
        let mut backing = [0u8; 8 * 4096];
        let base = backing.as_mut_ptr() as usize;
        let mut bump = BumpAllocator::new(base, base + backing.len());

        super::super::set_phys_to_virt_offset(0);

        let mut alloc = BootstrapAllocator::new(&mut bump, Granule::Kb4);
        let ttb = alloc.alloc_zeroed_table().unwrap();

        map_identity_range(
            ttb,
            base as u64,
            base as u64,
            4096,
            Granule::Kb4,
            &mut alloc,
        )
        .expect("single-page identity map must succeed");
    }
}
