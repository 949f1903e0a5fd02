#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(crate::tests::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::enum_variant_names)]

#[cfg(not(target_arch = "aarch64"))]
use architecture_not_supported_sorry;

pub mod context_switch;
pub mod irq;
pub mod scheduler;
pub mod task;
pub mod thread;
pub mod vm_init;

#[cfg(test)]
mod tests;

// The binary target (`main.rs`) supplies the real panic handler; it links
// this crate in unconditionally, so defining one here too would collide.
// Only the `cargo test` build of this crate (which never links `main.rs`)
// needs its own.
#[cfg(test)]
#[panic_handler]
fn panicked(info: &core::panic::PanicInfo) -> ! {
    machine::panic::handler_for_tests(info)
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    /// Main for running `kernel`'s own unit tests under QEMU.
    #[no_mangle]
    pub unsafe fn main() -> ! {
        machine::exception::handling_init();
        machine::platform::qemu_bring_up_console();
        test_main();
        machine::qemu::semihosting::exit_success()
    }
}
