// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording arch fake for hosted builds.
//!
//! Interrupt masking becomes a nesting counter, context switches are
//! journaled rather than performed, and stack initialization just computes
//! an aligned top-of-stack value. Tests inspect the journal through the
//! accessors at the bottom.

use super::IrqToken;
use std::cell::Cell;

thread_local! {
    static IRQ_NEST: Cell<u32> = const { Cell::new(0) };
    static SWITCH_COUNT: Cell<u32> = const { Cell::new(0) };
    static LAST_SWITCH: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
    static STARTED_SP: Cell<Option<usize>> = const { Cell::new(None) };
}

pub fn interrupt_lock() -> IrqToken {
    let prev = IRQ_NEST.with(|n| {
        let v = n.get();
        n.set(v + 1);
        v
    });
    IrqToken(prev)
}

pub fn interrupt_restore(token: IrqToken) {
    IRQ_NEST.with(|n| n.set(token.0));
}

pub fn idle_sleep() {}

/// Builds the initial stack frame for a new thread and returns the initial
/// stack pointer. The hosted version performs no writes; it only computes
/// the aligned top of the region.
pub fn stack_init(
    base: usize,
    size: usize,
    _entry: fn(usize),
    _arg: usize,
    _exit: fn(),
) -> usize {
    (base + size) & !(core::mem::size_of::<usize>() - 1)
}

/// Checks that a saved stack pointer still lies within its stack region.
pub fn stack_check(sp: usize, base: usize, size: usize) -> bool {
    sp > base && sp <= base + size
}

/// "Switches" context by recording the saved stack pointer cells involved.
/// The hosted kernel keeps executing the caller; tests observe the journal.
pub fn context_switch(from_sp: &mut usize, to_sp: &mut usize) {
    SWITCH_COUNT.with(|c| c.set(c.get() + 1));
    LAST_SWITCH.with(|c| c.set(Some((*from_sp, *to_sp))));
}

/// Records the first dispatch. On hardware this never returns; the hosted
/// version returns so tests can continue driving the kernel.
pub fn scheduler_startup(to_sp: &mut usize) {
    STARTED_SP.with(|c| c.set(Some(*to_sp)));
}

/// Number of context switches recorded so far on this test thread.
pub fn switch_count() -> u32 {
    SWITCH_COUNT.with(|c| c.get())
}

/// The `(from_sp, to_sp)` pair of the most recent recorded switch.
pub fn last_switch() -> Option<(usize, usize)> {
    LAST_SWITCH.with(|c| c.get())
}

/// Stack pointer handed to `scheduler_startup`, if it has run.
pub fn started_sp() -> Option<usize> {
    STARTED_SP.with(|c| c.get())
}

/// Current interrupt-mask nesting depth; tests use this to prove that every
/// lock was paired with a restore.
pub fn irq_depth() -> u32 {
    IRQ_NEST.with(|n| n.get())
}
