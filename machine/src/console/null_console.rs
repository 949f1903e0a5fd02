/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! The console used before any real UART has been registered.

use {
    super::interface,
    crate::devices::serial::SerialOps,
    core::fmt,
};

/// A console that discards writes and returns nothing from reads. Placeholder registered at
/// `CONSOLE`'s static initialization, replaced once the platform UART driver runs its init.
pub struct NullConsole;

/// The single instance, referenced by `console::mod`'s static.
pub static NULL_CONSOLE: NullConsole = NullConsole;

impl SerialOps for NullConsole {
    fn write_byte(&self, _byte: u8) {}

    fn read_byte(&self) -> u8 {
        0
    }

    fn flush(&self) {}

    fn clear_rx(&self) {}
}

impl interface::ConsoleOps for NullConsole {}

impl interface::Write for NullConsole {
    fn write_fmt(&self, _args: fmt::Arguments) -> fmt::Result {
        Ok(())
    }
}

impl interface::All for NullConsole {}
