/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Architectural timer (AArch64 generic timer, `CNTPCT_EL0`/`CNTFRQ_EL0`).

use {
    crate::time::interface,
    aarch64_cpu::{
        asm::barrier,
        registers::{CNTFRQ_EL0, CNTPCT_EL0, CNTP_CTL_EL0, CNTP_TVAL_EL0},
    },
    core::time::Duration,
    tock_registers::interfaces::{Readable, Writeable},
};

const NS_PER_S: u64 = 1_000_000_000;

struct GenericTimer;

static TIME_MANAGER: GenericTimer = GenericTimer;

/// Return a reference to the architectural time manager.
pub fn time_manager() -> &'static impl interface::TimeManager {
    &TIME_MANAGER
}

impl GenericTimer {
    #[inline(always)]
    fn frequency(&self) -> u64 {
        CNTFRQ_EL0.get()
    }

    #[inline(always)]
    fn ticks(&self) -> u64 {
        barrier::isb(barrier::SY);
        CNTPCT_EL0.get()
    }

    fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let freq = self.frequency();

        if freq == 0 {
            return Duration::ZERO;
        }

        let secs = ticks / freq;
        let sub_ticks = ticks % freq;
        let nanos = (sub_ticks * NS_PER_S) / freq;

        Duration::new(secs, nanos as u32)
    }

    fn duration_to_ticks(&self, duration: Duration) -> u64 {
        let freq = self.frequency();

        let whole = duration.as_secs() * freq;
        let frac = (u128::from(duration.subsec_nanos()) * u128::from(freq)) / u128::from(NS_PER_S);

        whole + frac as u64
    }

    /// Arm the EL1 physical timer to fire once after `interval`.
    pub fn start_msecs(&self, interval: Duration) {
        let ticks = self.duration_to_ticks(interval);

        CNTP_TVAL_EL0.set(ticks);
        CNTP_CTL_EL0.write(CNTP_CTL_EL0::ENABLE::SET + CNTP_CTL_EL0::IMASK::CLEAR);
    }
}

impl interface::TimeManager for GenericTimer {
    fn resolution(&self) -> Duration {
        self.ticks_to_duration(1)
    }

    fn uptime(&self) -> Duration {
        self.ticks_to_duration(self.ticks())
    }

    fn spin_for(&self, duration: Duration) {
        let target = self.ticks() + self.duration_to_ticks(duration);

        while self.ticks() < target {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn time_resolution_is_nonzero() {
        assert!(time_manager().resolution().as_nanos() > 0 || CNTFRQ_EL0.get() == 0);
    }
}
