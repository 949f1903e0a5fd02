/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Custom `no_std` test harness.

use crate::{print, println, qemu};

/// Auto-implemented for any closure-shaped test case so `#[test_case]` fns just work.
pub trait TestFn {
    fn run(&self);
}

impl<T> TestFn for T
where
    T: Fn(),
{
    fn run(&self) {
        print!("{}...\t", core::any::type_name::<T>());
        self();
        println!("[ok]");
    }
}

/// Entry point registered via `#![test_runner(crate::tests::test_runner)]`.
pub fn test_runner(tests: &[&dyn TestFn]) {
    println!("Running {} tests", tests.len());

    for test in tests {
        test.run();
    }

    qemu::semihosting::exit_success()
}
