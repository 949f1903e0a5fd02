// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2020-2022 Andre Richter <andre.o.richter@gmail.com>

//! Asynchronous exception handling.

use core::{cell::UnsafeCell, fmt, marker::PhantomData};

#[cfg(target_arch = "aarch64")]
use aarch64_cpu::registers::DAIF;
use tock_registers::interfaces::Readable;

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Interrupt number used to index the handler table. The platform's interrupt controller
/// decides how many of these exist and what the spurious/timer IDs are.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct IRQNumber(usize);

impl IRQNumber {
    /// Create an instance.
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    /// Return the raw index.
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for IRQNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-sized type that proves IRQs are masked for the lifetime of the borrow. Obtaining one is
/// `unsafe` because the caller must guarantee it really is running with IRQs off (e.g. because
/// execution is inside the top half of the vector table).
pub struct IRQContext<'irq_context> {
    _0: PhantomData<&'irq_context ()>,
}

impl<'irq_context> IRQContext<'irq_context> {
    /// Create an instance.
    ///
    /// # Safety
    ///
    /// - The caller must guarantee that IRQs are actually masked.
    #[allow(clippy::new_without_default)]
    pub unsafe fn new() -> Self {
        Self { _0: PhantomData }
    }
}

/// Interface for an IRQ handler.
pub mod interface {
    /// Implemented by anything that wants to act as an IRQ handler.
    pub trait IRQHandler {
        /// Called when the interrupt it was registered for fires.
        fn handle(&self) -> Result<(), &'static str>;
    }
}

/// Declares an IRQ number and a name, used when registering a handler.
#[derive(Copy, Clone)]
pub struct IRQHandlerDescriptor<T> {
    number: T,
    name: &'static str,
    handler: &'static (dyn interface::IRQHandler + Sync),
}

impl<T: Copy> IRQHandlerDescriptor<T> {
    /// Create an instance.
    pub const fn new(
        number: T,
        name: &'static str,
        handler: &'static (dyn interface::IRQHandler + Sync),
    ) -> Self {
        Self {
            number,
            name,
            handler,
        }
    }

    /// Return the number.
    pub const fn number(&self) -> T {
        self.number
    }

    /// Return the name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Return the handler trait object.
    pub const fn handler(&self) -> &'static (dyn interface::IRQHandler + Sync) {
        self.handler
    }
}

const NUM_IRQS: usize = 256;

struct IRQHandlerManagerInner {
    descriptors: [Option<IRQHandlerDescriptor<IRQNumber>>; NUM_IRQS],
}

/// Holds the table of registered IRQ handlers. A single core kernel during init, so a raw
/// `UnsafeCell` is adequate (mirrors `InitStateLock`'s reasoning).
struct IRQHandlerManager {
    inner: UnsafeCell<IRQHandlerManagerInner>,
}

unsafe impl Sync for IRQHandlerManager {}

static IRQ_MANAGER: IRQHandlerManager = IRQHandlerManager::new();

impl IRQHandlerManagerInner {
    const fn new() -> Self {
        Self {
            descriptors: [None; NUM_IRQS],
        }
    }
}

impl IRQHandlerManager {
    const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(IRQHandlerManagerInner::new()),
        }
    }

    fn register_handler(&self, descriptor: IRQHandlerDescriptor<IRQNumber>) -> Result<(), &'static str> {
        let inner = unsafe { &mut *self.inner.get() };
        let number = descriptor.number().get();

        if number >= NUM_IRQS {
            return Err("IRQ number out of range");
        }

        if inner.descriptors[number].is_some() {
            return Err("IRQ handler already registered");
        }

        inner.descriptors[number] = Some(descriptor);

        Ok(())
    }

    fn handle_pending_irqs<'irq_context>(&self, irq_number: IRQNumber, _ic: &IRQContext<'irq_context>) {
        let inner = unsafe { &*self.inner.get() };
        let number = irq_number.get();

        match inner.descriptors.get(number).and_then(|d| d.as_ref()) {
            None => {
                crate::println!("Spurious/unregistered IRQ {}", number);
            }
            Some(descriptor) => {
                if let Err(e) = descriptor.handler().handle() {
                    crate::println!("Error handling IRQ {} ({}): {}", number, descriptor.name(), e);
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

/// Return a reference to the global IRQ manager.
pub fn irq_manager() -> &'static impl IRQManager {
    &IRQ_MANAGER
}

/// Interface implemented by the IRQ manager, kept generic so platform code and `kernel` can both
/// hold a reference without naming the concrete singleton type.
pub trait IRQManager {
    /// Register a handler for the given IRQ.
    fn register_handler(&self, descriptor: IRQHandlerDescriptor<IRQNumber>) -> Result<(), &'static str>;

    /// Dispatch the currently pending IRQ to its registered handler.
    fn handle_pending_irqs<'irq_context>(&self, irq_number: IRQNumber, ic: &IRQContext<'irq_context>);
}

impl IRQManager for IRQHandlerManager {
    fn register_handler(&self, descriptor: IRQHandlerDescriptor<IRQNumber>) -> Result<(), &'static str> {
        IRQHandlerManager::register_handler(self, descriptor)
    }

    fn handle_pending_irqs<'irq_context>(&self, irq_number: IRQNumber, ic: &IRQContext<'irq_context>) {
        IRQHandlerManager::handle_pending_irqs(self, irq_number, ic)
    }
}

/// Mask IRQs on the local core.
#[inline(always)]
pub fn local_irq_mask() {
    DAIF.modify(DAIF::I::Masked);
}

/// Unmask IRQs on the local core.
#[inline(always)]
pub fn local_irq_unmask() {
    DAIF.modify(DAIF::I::Unmasked);
}

/// Mask IRQs on the local core and return the previous DAIF value so it can be restored later.
#[inline(always)]
pub fn local_irq_mask_save() -> u64 {
    let saved = DAIF.get();
    local_irq_mask();
    saved
}

/// Restore the DAIF value saved by `local_irq_mask_save`.
#[inline(always)]
pub fn local_irq_restore(saved: u64) {
    DAIF.set(saved);
}

/// Return whether IRQs are currently masked on the local core.
#[inline(always)]
pub fn is_local_irq_masked() -> bool {
    !DAIF.matches_all(DAIF::I::Unmasked)
}

/// Execute the given closure with local IRQs masked, then restore the previous mask state.
pub fn exec_with_irq_masked<T>(f: impl FnOnce() -> T) -> T {
    let saved = local_irq_mask_save();
    let ret = f();
    local_irq_restore(saved);
    ret
}

//--------------------------------------------------------------------------------------------------
// Interrupt controller registration
//--------------------------------------------------------------------------------------------------

/// Implemented by the platform's interrupt controller (e.g. the GICv2 CPU interface) so the
/// vector table's `current_elx_irq` stub can ask "which IRQ fired" without `machine` naming the
/// concrete controller type. Mirrors `console::register_console`/`console()`.
pub trait IRQController {
    /// Acknowledge the highest-priority pending IRQ and return its number.
    fn pending_irq_number<'irq_context>(&self, ic: &IRQContext<'irq_context>) -> IRQNumber;

    /// Signal end-of-interrupt for the given IRQ.
    fn end_irq(&self, irq_number: IRQNumber);
}

struct NullIRQController;

impl IRQController for NullIRQController {
    fn pending_irq_number<'irq_context>(&self, _ic: &IRQContext<'irq_context>) -> IRQNumber {
        IRQNumber::new(1023) // GICv2 spurious ID
    }

    fn end_irq(&self, _irq_number: IRQNumber) {}
}

static NULL_IRQ_CONTROLLER: NullIRQController = NullIRQController;

struct IRQControllerRegistry {
    inner: UnsafeCell<&'static (dyn IRQController + Sync)>,
}

unsafe impl Sync for IRQControllerRegistry {}

static INTERRUPT_CONTROLLER: IRQControllerRegistry = IRQControllerRegistry {
    inner: UnsafeCell::new(&NULL_IRQ_CONTROLLER),
};

/// Register the platform's interrupt controller. Called once during `kmain`'s init sequence.
pub fn register_interrupt_controller(controller: &'static (dyn IRQController + Sync)) {
    exec_with_irq_masked(|| unsafe { *INTERRUPT_CONTROLLER.inner.get() = controller });
}

/// Return the registered interrupt controller.
pub fn interrupt_controller() -> &'static dyn IRQController {
    unsafe { *INTERRUPT_CONTROLLER.inner.get() }
}

/// Acknowledge and dispatch the currently pending IRQ; called from the vector table's IRQ stub.
pub fn handle_pending_irq<'irq_context>(ic: &IRQContext<'irq_context>) {
    let number = interrupt_controller().pending_irq_number(ic);
    irq_manager().handle_pending_irqs(number, ic);
    interrupt_controller().end_irq(number);
}
