//! PTE attribute bits and the MAIR_EL1 index layout, ported bit-exact from
//! the original's table/block/page descriptor attribute enums.

use bitflags::bitflags;

bitflags! {
    /// `vm_prot_t`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Prot: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

impl Prot {
    /// `VM_PROT_DEFAULT`.
    pub const DEFAULT: Prot = Prot::READ.union(Prot::WRITE);
    /// `VM_PROT_ALL`.
    pub const ALL: Prot = Prot::READ.union(Prot::WRITE).union(Prot::EXECUTE);
}

bitflags! {
    /// `pmap_flags_t`, minus the READ/WRITE/EXECUTE bits which are
    /// expressed through [`Prot`] instead.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PmapFlags: u32 {
        const WIRED = 0x8;
        const CANFAIL = 0x10;
        const NOCACHE = 0x20;
        const WRITE_COMBINE = 0x40;
        const WRITE_BACK = 0x80;
        const NOCACHE_OVR = 0x100;
    }
}

/// Indices into MAIR_EL1, fixed at boot by `pmap::bootstrap` to the eight
/// slots listed below (spec §6 page-table format).
pub mod mair_index {
    pub const DEVICE_NGNRNE: u64 = 0;
    pub const DEVICE_NGNRE: u64 = 1;
    pub const NORMAL_NC: u64 = 2;
    pub const NORMAL_INC: u64 = 3;
    pub const NORMAL_WBWARA: u64 = 4;
    pub const NORMAL_WTWARA: u64 = 5;
    pub const NORMAL_WTWNRA: u64 = 6;
    pub const NORMAL_WTWNRN: u64 = 7;
}

/// Pick the MAIR index for a mapping, following `WRITE_COMBINE`/`NOCACHE`
/// → `Normal-NC`/`Device-nGnRnE`/`Normal-WBWARA` (Open Question 2).
pub fn mair_index_for(flags: PmapFlags) -> u64 {
    if flags.contains(PmapFlags::NOCACHE) {
        mair_index::DEVICE_NGNRNE
    } else if flags.contains(PmapFlags::WRITE_COMBINE) {
        mair_index::NORMAL_NC
    } else {
        mair_index::NORMAL_WBWARA
    }
}

/// Inverse of [`mair_index_for`], used when re-deriving flags for a
/// protection change that must preserve the mapping's memory type.
pub fn flags_from_mair_index(idx: u64) -> PmapFlags {
    if idx == mair_index::DEVICE_NGNRNE {
        PmapFlags::NOCACHE
    } else if idx == mair_index::NORMAL_NC {
        PmapFlags::WRITE_COMBINE
    } else {
        PmapFlags::empty()
    }
}

// Descriptor bit positions (VMSAv8-64, stage 1, 4 KiB granule).
const VALID: u64 = 1 << 0;
const TABLE_OR_PAGE: u64 = 1 << 1;

const LOWER_ATTR_SHIFT: u64 = 2;
const AP_SHIFT: u64 = 6;
const SH_SHIFT: u64 = 8;
const AF: u64 = 1 << 10;
const NON_GLOBAL: u64 = 1 << 11;
const PXN: u64 = 1 << 53;
const UXN: u64 = 1 << 54;

const AP_RW_NO_EL0: u64 = 0b00;
const AP_RW_EL0: u64 = 0b01;
const AP_RO_NO_EL0: u64 = 0b10;
const AP_RO_EL0: u64 = 0b11;

const SH_INNER: u64 = 0b11;

const OUTPUT_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

/// Build a level-3 page descriptor (or level-1/2 block descriptor: same
/// attribute layout, different valid `TABLE_OR_PAGE` meaning) for `pa` with
/// the given protection, cacheability, and whether EL0 may use the TLB
/// entry without an ASID match (`global`).
pub fn page_descriptor(pa: u64, prot: Prot, flags: PmapFlags, global: bool) -> u64 {
    let ap = if prot.contains(Prot::WRITE) {
        if global { AP_RW_NO_EL0 } else { AP_RW_EL0 }
    } else if global {
        AP_RO_NO_EL0
    } else {
        AP_RO_EL0
    };

    let mut desc = VALID | TABLE_OR_PAGE;
    desc |= (pa & OUTPUT_ADDR_MASK) & OUTPUT_ADDR_MASK;
    desc |= mair_index_for(flags) << LOWER_ATTR_SHIFT;
    desc |= ap << AP_SHIFT;
    desc |= SH_INNER << SH_SHIFT;
    desc |= AF;
    if !global {
        desc |= NON_GLOBAL;
    }
    if !prot.contains(Prot::EXECUTE) {
        desc |= PXN | UXN;
    }
    desc
}

/// Build a table descriptor pointing at `next_level_pa`.
pub fn table_descriptor(next_level_pa: u64) -> u64 {
    VALID | TABLE_OR_PAGE | (next_level_pa & OUTPUT_ADDR_MASK)
}

/// True if `pte` is a valid table (levels 0-2) or page (level 3) descriptor.
pub fn is_valid(pte: u64) -> bool {
    pte & VALID != 0
}

/// True if `pte` is a table descriptor (only meaningful at levels 0-2).
pub fn is_table(pte: u64) -> bool {
    is_valid(pte) && (pte & TABLE_OR_PAGE != 0)
}

/// Extract the output/next-level-table physical address from `pte`.
pub fn pte_to_pa(pte: u64) -> u64 {
    pte & OUTPUT_ADDR_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_combine_selects_normal_nc() {
        assert_eq!(
            mair_index_for(PmapFlags::WRITE_COMBINE),
            mair_index::NORMAL_NC
        );
    }

    #[test]
    fn nocache_selects_device() {
        assert_eq!(
            mair_index_for(PmapFlags::NOCACHE),
            mair_index::DEVICE_NGNRNE
        );
    }

    #[test]
    fn default_selects_normal_wbwara() {
        assert_eq!(
            mair_index_for(PmapFlags::empty()),
            mair_index::NORMAL_WBWARA
        );
    }

    #[test]
    fn page_descriptor_round_trips_address() {
        let pte = page_descriptor(0x4020_0000, Prot::DEFAULT, PmapFlags::empty(), true);
        assert!(is_valid(pte));
        assert_eq!(pte_to_pa(pte), 0x4020_0000);
    }

    #[test]
    fn non_executable_sets_xn_bits() {
        let pte = page_descriptor(0x1000, Prot::READ, PmapFlags::empty(), true);
        assert_ne!(pte & PXN, 0);
        assert_ne!(pte & UXN, 0);
    }
}
