/*
 * SPDX-License-Identifier: BlueOak-1.0.0 AND MIT
 * Copyright (c) 2018-2022 Andre Richter <andre.o.richter@gmail.com>
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! PL011 UART driver.

use {
    super::memory_map::{PL011_UART_BASE, UART0_IRQ},
    crate::{
        devices::serial::SerialOps,
        drivers, exception,
        exception::asynchronous::{IRQHandlerDescriptor, IRQNumber},
        mmio_deref_wrapper::MMIODerefWrapper,
        synchronization::{interface::Mutex, IRQSafeNullLock},
    },
    tock_registers::{
        interfaces::{Readable, Writeable},
        register_bitfields, register_structs,
        registers::{ReadOnly, ReadWrite, WriteOnly},
    },
};

register_bitfields! {
    u32,

    FR [
        TXFE OFFSET(7) NUMBITS(1) [],
        RXFE OFFSET(4) NUMBITS(1) [],
        BUSY OFFSET(3) NUMBITS(1) [],
    ],

    CR [
        RXE OFFSET(9) NUMBITS(1) [],
        TXE OFFSET(8) NUMBITS(1) [],
        UARTEN OFFSET(0) NUMBITS(1) [],
    ],

    LCR_H [
        WLEN OFFSET(5) NUMBITS(2) [
            EightBit = 0b11
        ],
        FEN OFFSET(4) NUMBITS(1) [],
    ],

    IMSC [
        RXIM OFFSET(4) NUMBITS(1) [],
    ],

    ICR [
        ALL OFFSET(0) NUMBITS(11) [],
    ],
}

register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlock {
        (0x00 => DR: ReadWrite<u32>),
        (0x04 => @END),
    }
}

// Split into two blocks so the `@END` padding stays simple while still reaching the registers
// past the reserved range, matching the layout of the pack's other MMIO register blocks.
register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlockTail {
        (0x00 => _reserved1),
        (0x18 => FR: ReadOnly<u32, FR::Register>),
        (0x1c => _reserved2),
        (0x24 => IBRD: ReadWrite<u32>),
        (0x28 => FBRD: ReadWrite<u32>),
        (0x2c => LCR_H: ReadWrite<u32, LCR_H::Register>),
        (0x30 => CR: ReadWrite<u32, CR::Register>),
        (0x34 => _reserved3),
        (0x38 => IMSC: ReadWrite<u32, IMSC::Register>),
        (0x3c => _reserved4),
        (0x44 => ICR: WriteOnly<u32, ICR::Register>),
        (0x48 => @END),
    }
}

struct PL011UartInner {
    dr: MMIODerefWrapper<RegisterBlock>,
    tail: MMIODerefWrapper<RegisterBlockTail>,
}

impl PL011UartInner {
    const unsafe fn new(mmio_start_addr: usize) -> Self {
        Self {
            dr: MMIODerefWrapper::new(mmio_start_addr),
            tail: MMIODerefWrapper::new(mmio_start_addr),
        }
    }

    fn init(&mut self) {
        self.tail.CR.set(0);
        self.tail.ICR.write(ICR::ALL::CLEAR);

        // 115200 baud at the typical 24 MHz UARTCLK QEMU provides: divisor = 13.0208.
        self.tail.IBRD.set(13);
        self.tail.FBRD.set(1);

        self.tail.LCR_H.write(LCR_H::WLEN::EightBit + LCR_H::FEN::SET);
        self.tail.IMSC.write(IMSC::RXIM::SET);
        self.tail
            .CR
            .write(CR::UARTEN::SET + CR::TXE::SET + CR::RXE::SET);
    }

    fn write_byte(&self, byte: u8) {
        while self.tail.FR.is_set(FR::TXFE) == false && self.tail.FR.is_set(FR::BUSY) {}
        self.dr.DR.set(byte as u32);
    }

    fn read_byte(&self) -> u8 {
        while self.tail.FR.is_set(FR::RXFE) {}
        self.dr.DR.get() as u8
    }

    fn flush(&self) {
        while self.tail.FR.is_set(FR::BUSY) {}
    }

    fn clear_rx(&self) {
        while !self.tail.FR.is_set(FR::RXFE) {
            self.dr.DR.get();
        }
    }
}

/// Representation of the UART, suitable for global `static` placement.
pub struct PL011Uart {
    inner: IRQSafeNullLock<PL011UartInner>,
}

impl PL011Uart {
    /// Create an instance.
    ///
    /// # Safety
    ///
    /// - `mmio_start_addr` must be a valid MMIO base address for a PL011 UART.
    pub const unsafe fn new(mmio_start_addr: usize) -> Self {
        Self {
            inner: IRQSafeNullLock::new(PL011UartInner::new(mmio_start_addr)),
        }
    }
}

/// Global driver instance, bound to the `virt` machine's UART0.
pub static PL011_UART: PL011Uart = unsafe { PL011Uart::new(PL011_UART_BASE) };

impl SerialOps for PL011Uart {
    fn write_byte(&self, byte: u8) {
        self.inner.lock(|inner| inner.write_byte(byte))
    }

    fn read_byte(&self) -> u8 {
        self.inner.lock(|inner| inner.read_byte())
    }

    fn flush(&self) {
        self.inner.lock(|inner| inner.flush())
    }

    fn clear_rx(&self) {
        self.inner.lock(|inner| inner.clear_rx())
    }
}

impl crate::console::interface::ConsoleOps for PL011Uart {}

impl crate::console::interface::Write for PL011Uart {
    fn write_fmt(&self, args: core::fmt::Arguments) -> core::fmt::Result {
        use {crate::console::interface::ConsoleOps, core::fmt::Write};

        // Adapter so `core::fmt`'s machinery can drive `write_string`, which does the CR/LF
        // translation every console backend shares.
        struct Adapter<'a>(&'a PL011Uart);
        impl core::fmt::Write for Adapter<'_> {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                self.0.write_string(s);
                Ok(())
            }
        }

        Adapter(self).write_fmt(args)
    }
}

impl crate::console::interface::All for PL011Uart {}

impl exception::asynchronous::interface::IRQHandler for PL011Uart {
    fn handle(&self) -> Result<(), &'static str> {
        self.inner.lock(|inner| {
            let byte = inner.dr.DR.get() as u8;
            let _ = byte;
        });
        Ok(())
    }
}

impl drivers::interface::DeviceDriver for PL011Uart {
    type IRQNumberType = IRQNumber;

    fn compatible(&self) -> &'static str {
        "QEMU virt PL011 UART"
    }

    unsafe fn init(&self) -> Result<(), &'static str> {
        self.inner.lock(|inner| inner.init());
        Ok(())
    }

    fn register_and_enable_irq_handler(
        &'static self,
        irq_number: &Self::IRQNumberType,
    ) -> Result<(), &'static str> {
        exception::asynchronous::irq_manager().register_handler(IRQHandlerDescriptor::new(
            *irq_number,
            "PL011 UART RX",
            self,
        ))
    }
}

/// The SPI this driver wants registered with the interrupt controller.
pub const IRQ_NUMBER: usize = UART0_IRQ;
