#![no_std]
#![no_main]

#[cfg(not(target_arch = "aarch64"))]
use architecture_not_supported_sorry;

use kernel::{scheduler, task, thread, vm_init};

#[panic_handler]
fn panicked(info: &core::panic::PanicInfo) -> ! {
    machine::panic::handler(info)
}

/// Kernel entry point, called by `machine`'s `reset()` once `.bss` is zeroed.
///
/// Ported from `original_source/kernel/main.c`'s `kmain`: `vm_init()` then
/// `proc_init()` then `proc_scheduler_init()`, interrupts staying masked
/// throughout so none of this boot-time setup races a handler. The original
/// goes on to start an init process; nothing plays that role yet, so the
/// bootstrap thread itself becomes the idle loop once interrupts are
/// unmasked.
fn kmain(dtb: u32) -> ! {
    machine::exception::handling_init();

    unsafe {
        // Brings up the GIC and PL011 UART and registers the console;
        // `platform::init`'s own doc comment names this its one call site.
        machine::platform::init();
    }

    machine::info!("booting, dtb at {:#x}", dtb);

    unsafe {
        let kernel_map = vm_init::init();
        task::init(kernel_map);
        thread::init(task::kernel_task());
        scheduler::init();
    }

    kernel::irq::enable_interrupts();

    machine::info!("idle");
    loop {
        scheduler::choose_next();
        // Wait for the next IRQ (a timer tick, a wake) before reconsidering
        // who should run; `machine::cpu::endless_sleep` can't be used here
        // since it never returns to give `choose_next` another look.
        aarch64_cpu::asm::wfe();
    }
}

machine::entry!(kmain);
