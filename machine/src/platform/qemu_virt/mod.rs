/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Platform support for QEMU's aarch64 `virt` machine.

pub mod gic;
pub mod memory_map;
pub mod pl011_uart;

use crate::{
    console, drivers,
    drivers::DeviceDriverDescriptor,
    exception::asynchronous::{self, IRQNumber},
};

/// Bring up the UART early enough that `println!` works, without touching the GIC (tests run
/// with IRQs masked throughout).
pub fn qemu_bring_up_console() {
    unsafe {
        pl011_uart::PL011_UART
            .init()
            .expect("UART init failed")
    };

    console::register_console(&pl011_uart::PL011_UART);
}

/// Register every platform driver with `machine::drivers` and run full three-phase init
/// (driver init -> post-init callback -> IRQ registration). Called once from `kmain`.
///
/// # Safety
///
/// - Drivers touch MMIO with system-wide effects.
pub unsafe fn init() {
    drivers::driver_manager().register_driver(DeviceDriverDescriptor::new(
        &gic::GIC,
        None,
        None,
    ));

    drivers::driver_manager().register_driver(DeviceDriverDescriptor::new(
        &pl011_uart::PL011_UART,
        Some(post_init_console),
        Some(IRQNumber::new(pl011_uart::IRQ_NUMBER)),
    ));

    drivers::driver_manager().init_drivers_and_irqs();
}

unsafe fn post_init_console() -> Result<(), &'static str> {
    console::register_console(&pl011_uart::PL011_UART);
    asynchronous::register_interrupt_controller(&gic::GIC);
    gic::GIC.enable(IRQNumber::new(pl011_uart::IRQ_NUMBER));
    Ok(())
}
