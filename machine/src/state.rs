/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Global kernel lifecycle state.
//!
//! The boot sequence runs single-core with IRQs masked; `InitStateLock` relies on this to allow
//! unsynchronized writes during that phase only. `StateManager` tracks the transition so that
//! assumption can be checked rather than merely assumed.

use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
enum State {
    Init = 0,
    SingleCoreMain = 1,
    MultiCoreMain = 2,
}

/// Tracks which phase of the boot/run lifecycle the kernel is in.
pub struct StateManager(AtomicU8);

static STATE_MANAGER: StateManager = StateManager::new();

impl StateManager {
    const fn new() -> Self {
        Self(AtomicU8::new(State::Init as u8))
    }

    /// True while still in the single-core, pre-scheduler init phase.
    pub fn is_init(&self) -> bool {
        self.0.load(Ordering::Relaxed) == State::Init as u8
    }

    /// Leave the init phase; further `InitStateLock::write` calls will panic.
    pub fn transition_to_single_core_main(&self) {
        self.0
            .store(State::SingleCoreMain as u8, Ordering::Relaxed);
    }

    /// Record that secondary cores have come up.
    pub fn transition_to_multi_core_main(&self) {
        self.0.store(State::MultiCoreMain as u8, Ordering::Relaxed);
    }
}

/// Return a reference to the global state manager.
pub fn state_manager() -> &'static StateManager {
    &STATE_MANAGER
}
