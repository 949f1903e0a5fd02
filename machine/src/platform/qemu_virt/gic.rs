/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! GICv2 distributor + CPU interface driver.

use {
    super::memory_map::{GICC_BASE, GICD_BASE},
    crate::{
        drivers,
        exception::asynchronous::{IRQContext, IRQController, IRQNumber},
        mmio_deref_wrapper::MMIODerefWrapper,
        synchronization::{interface::Mutex, IRQSafeNullLock},
    },
    tock_registers::{
        interfaces::{Readable, Writeable},
        register_bitfields, register_structs,
        registers::{ReadOnly, ReadWrite},
    },
};

const NUM_SPI: usize = 224; // SPIs 32..256, enough for `virt`'s device set.
const SPURIOUS_IRQ: usize = 1023;

register_bitfields! {
    u32,

    GICD_CTLR [
        ENABLE OFFSET(0) NUMBITS(1) [],
    ],

    GICC_CTLR [
        ENABLE OFFSET(0) NUMBITS(1) [],
    ],

    GICC_IAR [
        INTERRUPT_ID OFFSET(0) NUMBITS(10) [],
    ],

    GICC_EOIR [
        EOI_INTID OFFSET(0) NUMBITS(10) [],
    ],
}

register_structs! {
    #[allow(non_snake_case)]
    DistributorRegisterBlock {
        (0x000 => CTLR: ReadWrite<u32, GICD_CTLR::Register>),
        (0x004 => _reserved1),
        (0x100 => ISENABLER: [ReadWrite<u32>; 32]),
        (0x180 => _reserved2),
        (0x400 => IPRIORITYR: [ReadWrite<u32>; 256]),
        (0x800 => _reserved3),
        (0x800 => @END),
    }
}

register_structs! {
    #[allow(non_snake_case)]
    CpuInterfaceRegisterBlock {
        (0x00 => CTLR: ReadWrite<u32, GICC_CTLR::Register>),
        (0x04 => PMR: ReadWrite<u32>),
        (0x08 => _reserved1),
        (0x0c => IAR: ReadOnly<u32, GICC_IAR::Register>),
        (0x10 => EOIR: ReadWrite<u32, GICC_EOIR::Register>),
        (0x14 => @END),
    }
}

struct GicDistributorInner {
    registers: MMIODerefWrapper<DistributorRegisterBlock>,
}

impl GicDistributorInner {
    const unsafe fn new(mmio_start_addr: usize) -> Self {
        Self {
            registers: MMIODerefWrapper::new(mmio_start_addr),
        }
    }

    fn init(&mut self) {
        self.registers.CTLR.write(GICD_CTLR::ENABLE::SET);
    }

    fn enable(&mut self, irq: IRQNumber) {
        let number = irq.get();
        let reg = number / 32;
        let bit = number % 32;

        self.registers.ISENABLER[reg].set(1 << bit);
    }
}

struct GicCpuInterfaceInner {
    registers: MMIODerefWrapper<CpuInterfaceRegisterBlock>,
}

impl GicCpuInterfaceInner {
    const unsafe fn new(mmio_start_addr: usize) -> Self {
        Self {
            registers: MMIODerefWrapper::new(mmio_start_addr),
        }
    }

    fn init(&mut self) {
        self.registers.PMR.set(0xff);
        self.registers.CTLR.write(GICC_CTLR::ENABLE::SET);
    }

    fn pending_irq_number(&self) -> IRQNumber {
        IRQNumber::new(self.registers.IAR.read(GICC_IAR::INTERRUPT_ID) as usize)
    }

    fn end_irq(&mut self, irq: IRQNumber) {
        self.registers
            .EOIR
            .write(GICC_EOIR::EOI_INTID.val(irq.get() as u32));
    }
}

/// Combined GICv2 driver: distributor + CPU interface.
pub struct GICv2 {
    distributor: IRQSafeNullLock<GicDistributorInner>,
    cpu_interface: IRQSafeNullLock<GicCpuInterfaceInner>,
}

impl GICv2 {
    /// Create an instance.
    ///
    /// # Safety
    ///
    /// - `gicd_addr`/`gicc_addr` must be valid MMIO base addresses for a GICv2.
    pub const unsafe fn new(gicd_addr: usize, gicc_addr: usize) -> Self {
        Self {
            distributor: IRQSafeNullLock::new(GicDistributorInner::new(gicd_addr)),
            cpu_interface: IRQSafeNullLock::new(GicCpuInterfaceInner::new(gicc_addr)),
        }
    }

    /// Enable the given SPI/PPI at the distributor.
    pub fn enable(&self, irq: IRQNumber) {
        self.distributor.lock(|d| d.enable(irq));
    }
}

/// Global driver instance, bound to the `virt` machine's GICv2.
pub static GIC: GICv2 = unsafe { GICv2::new(GICD_BASE, GICC_BASE) };

impl IRQController for GICv2 {
    fn pending_irq_number<'irq_context>(&self, _ic: &IRQContext<'irq_context>) -> IRQNumber {
        self.cpu_interface.lock(|c| c.pending_irq_number())
    }

    fn end_irq(&self, irq_number: IRQNumber) {
        self.cpu_interface.lock(|c| c.end_irq(irq_number));
    }
}

impl drivers::interface::DeviceDriver for GICv2 {
    type IRQNumberType = IRQNumber;

    fn compatible(&self) -> &'static str {
        "GICv2"
    }

    unsafe fn init(&self) -> Result<(), &'static str> {
        self.distributor.lock(|d| d.init());
        self.cpu_interface.lock(|c| c.init());
        Ok(())
    }
}

/// GICv2's architectural "no interrupt pending" sentinel.
pub const SPURIOUS: usize = SPURIOUS_IRQ;

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn num_spi_covers_uart0() {
        assert!(NUM_SPI >= super::super::memory_map::UART0_IRQ - 32);
    }
}
