//! IRQ-to-thread bridge.
//!
//! Ported from `original_source/kernel/interrupts.c`/`include/kernel/interrupts.h`'s
//! `enable_interrupts`/`disable_interrupts`/`interrupts_enabled`/`register_isr`
//! quartet. The original's `irq_type_t` enumerates a VIC's fixed interrupt
//! lines and `isr_t` is a bare function pointer; `qemu_virt` has no VIC (its
//! GICv2 driver already exposes [`machine::exception::asynchronous::IRQNumber`]
//! and a handler-table [`machine::exception::asynchronous::IRQManager`]), so
//! `register_isr` here hangs a [`thread::wake`] off an IRQ number instead of
//! a raw callback: whoever calls [`sleep_on`] for that IRQ is the thread the
//! original's ISR would have called back into.
//!
//! A driver that wants to manage its own hardware state on the interrupt
//! (the UART's RX FIFO read, say) still registers its own
//! [`interface::IRQHandler`] directly with `machine`, the way
//! `PL011Uart::register_and_enable_irq_handler` already does — `machine`
//! has no business knowing about [`crate::thread`]. `register_isr` is for
//! the IRQ numbers nothing in `machine` has claimed for itself yet.

use machine::exception::asynchronous::{interface, irq_manager, IRQHandlerDescriptor, IRQNumber};

use crate::thread;

/// Same bound the handler table in `machine::exception::asynchronous` uses;
/// kept in lockstep by hand since that constant isn't exported.
const NUM_IRQS: usize = 256;

/// Wakes every thread sleeping on `self.0.get()` as an event. Registered as
/// the `machine`-side handler for IRQ numbers `register_isr` claims.
#[derive(Clone, Copy)]
struct EventWaker(IRQNumber);

impl interface::IRQHandler for EventWaker {
    fn handle(&self) -> Result<(), &'static str> {
        thread::wake(self.0.get());
        Ok(())
    }
}

const fn make_wakers() -> [EventWaker; NUM_IRQS] {
    let mut wakers = [EventWaker(IRQNumber::new(0)); NUM_IRQS];
    let mut i = 0;
    while i < NUM_IRQS {
        wakers[i] = EventWaker(IRQNumber::new(i));
        i += 1;
    }
    wakers
}

static WAKERS: [EventWaker; NUM_IRQS] = make_wakers();

/// `register_isr`: claim `irq`, waking any thread parked in [`sleep_on`]
/// for it whenever it fires. Fails the same way
/// `IRQManager::register_handler` does — out-of-range number, or something
/// (a driver's own handler, or an earlier `register_isr`) already holds it.
pub fn register_isr(irq: IRQNumber, name: &'static str) -> Result<(), &'static str> {
    let number = irq.get();
    if number >= NUM_IRQS {
        return Err("IRQ number out of range");
    }
    irq_manager().register_handler(IRQHandlerDescriptor::new(irq, name, &WAKERS[number]))
}

/// Block the calling thread until `irq` next fires. Pairs with a prior
/// [`register_isr`] for the same number.
pub fn sleep_on(irq: IRQNumber, unlock: &mut dyn FnMut()) {
    thread::sleep(irq.get(), unlock, true);
}

/// `enable_interrupts`.
pub fn enable_interrupts() {
    machine::exception::asynchronous::local_irq_unmask();
}

/// `disable_interrupts`.
pub fn disable_interrupts() {
    machine::exception::asynchronous::local_irq_mask();
}

/// `interrupts_enabled`.
pub fn interrupts_enabled() -> bool {
    !machine::exception::asynchronous::is_local_irq_masked()
}
