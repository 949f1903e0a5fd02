/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! MMIO layout of QEMU's `virt` machine, as emitted in its generated device tree.

/// PL011 UART0 base address.
pub const PL011_UART_BASE: usize = 0x0900_0000;

/// GICv2 distributor base address.
pub const GICD_BASE: usize = 0x0800_0000;

/// GICv2 CPU interface base address.
pub const GICC_BASE: usize = 0x0801_0000;

/// SPI for UART0, as wired by `virt`'s `-machine virt` device tree.
pub const UART0_IRQ: usize = 33;
