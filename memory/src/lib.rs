#![no_std]
#![allow(stable_features)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::enum_variant_names)]

//! Core memory management: physical page allocator, vm_object, vm_map, pmap,
//! and the kernel-virtual slab/vm_km allocator.

pub mod addr;
pub mod pmap;
pub mod primitives;
pub mod slab;
pub mod sync;
pub mod vm_km;
pub mod vm_map;
pub mod vm_object;
pub mod vm_page;

/// Errors surfaced by the core APIs (spec §7).
pub mod error {
    use snafu::Snafu;

    /// Common error kind shared by pmap/vm_page/vm_map/slab.
    #[derive(Debug, Snafu, Clone, Copy, Eq, PartialEq)]
    #[allow(missing_docs)]
    pub enum Error {
        #[snafu(display("no virtual-address hole or physical page large enough"))]
        NoSpace,
        #[snafu(display("not found"))]
        NotFound,
        #[snafu(display("invalid argument"))]
        InvalidArgument,
        #[snafu(display("resource shortage (slab exhausted)"))]
        ResourceShortage,
        #[snafu(display("operation not supported"))]
        OperationNotSupported,
        #[snafu(display("unimplemented"))]
        Unimplemented,
    }

    /// Crate-wide result alias.
    pub type Result<T> = core::result::Result<T, Error>;
}
