/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Generic device interfaces. Concrete drivers live under `platform`.

pub mod serial;

pub use serial::SerialOps;
