/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Serial device interface, implemented by any byte-oriented UART driver that wants to back
//! the global console.

/// Byte-level operations every serial device must provide.
pub trait SerialOps {
    /// Send a byte.
    fn write_byte(&self, byte: u8);

    /// Receive a byte, blocking until one is available.
    fn read_byte(&self) -> u8;

    /// Block until the output FIFO has drained.
    fn flush(&self);

    /// Discard any buffered input.
    fn clear_rx(&self);
}
