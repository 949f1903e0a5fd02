/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Timekeeping.

use core::time::Duration;

#[cfg(target_arch = "aarch64")]
use crate::arch::aarch64::time as arch_time;

/// Timer interfaces.
pub mod interface {
    use super::Duration;

    /// Functions every architecture's timer driver must provide.
    pub trait TimeManager {
        /// The timer's resolution.
        fn resolution(&self) -> Duration;

        /// The uptime since boot.
        fn uptime(&self) -> Duration;

        /// Spin for the given duration.
        fn spin_for(&self, duration: Duration);
    }
}

/// Return a reference to the architectural time manager.
pub fn time_manager() -> &'static impl interface::TimeManager {
    arch_time::time_manager()
}
