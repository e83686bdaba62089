// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The architecture / port surface.
//!
//! Everything the kernel needs from the machine goes through the handful of
//! functions re-exported here: interrupt masking, the idle sleep
//! instruction, stack frame construction and checking, and the actual
//! context switch. The kernel core contains no assembly and no
//! target-specific register knowledge; a port supplies all of it.
//!
//! Two implementations exist:
//!
//! - `hosted` (tests and the `std` feature): a recording fake. Interrupt
//!   masking is a nesting counter, context switches are journaled instead
//!   of taken, and stacks are plain address ranges. This is what lets the
//!   whole kernel run as an ordinary state machine in host tests.
//! - `port` (everything else): thin wrappers around `extern "Rust"`
//!   symbols that a target port must define, typically in assembly or with
//!   architecture intrinsics.

use cfg_if::cfg_if;

/// Opaque token returned by [`interrupt_lock`] and consumed by
/// [`interrupt_restore`]. On real hardware this is the saved interrupt
/// state; the pairing discipline is what matters to the kernel.
#[must_use]
pub struct IrqToken(pub(crate) u32);

cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        #[path = "arch/hosted.rs"]
        mod imp;
    } else {
        #[path = "arch/port.rs"]
        mod imp;
    }
}

pub use imp::*;
