// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bare-metal port surface.
//!
//! A target port defines these symbols, usually in assembly: the kernel
//! calls them and otherwise knows nothing about the machine. See the
//! hosted sibling module for the exact semantics each must provide.

use super::IrqToken;

extern "Rust" {
    fn __kern_interrupt_lock() -> u32;
    fn __kern_interrupt_restore(state: u32);
    fn __kern_idle_sleep();
    fn __kern_stack_init(
        base: usize,
        size: usize,
        entry: fn(usize),
        arg: usize,
        exit: fn(),
    ) -> usize;
    fn __kern_stack_check(sp: usize, base: usize, size: usize) -> bool;
    fn __kern_context_switch(from_sp: *mut usize, to_sp: *mut usize);
    fn __kern_scheduler_startup(to_sp: *mut usize);
}

pub fn interrupt_lock() -> IrqToken {
    // Safety: the port contract requires this symbol to mask interrupts and
    // return the previous state; it has no preconditions.
    IrqToken(unsafe { __kern_interrupt_lock() })
}

pub fn interrupt_restore(token: IrqToken) {
    // Safety: token pairing is enforced by IrqToken being `must_use` and
    // unforgeable outside this module.
    unsafe { __kern_interrupt_restore(token.0) }
}

pub fn idle_sleep() {
    // Safety: no preconditions; typically a WFI-class instruction.
    unsafe { __kern_idle_sleep() }
}

pub fn stack_init(
    base: usize,
    size: usize,
    entry: fn(usize),
    arg: usize,
    exit: fn(),
) -> usize {
    // Safety: the caller guarantees `base..base+size` is a valid, unused
    // stack region owned by the new thread.
    unsafe { __kern_stack_init(base, size, entry, arg, exit) }
}

pub fn stack_check(sp: usize, base: usize, size: usize) -> bool {
    // Safety: read-only sanity check over plain integers.
    unsafe { __kern_stack_check(sp, base, size) }
}

pub fn context_switch(from_sp: &mut usize, to_sp: &mut usize) {
    // Safety: both references point at the saved-SP slots of live thread
    // records; the port saves the outgoing context through `from_sp` and
    // resumes the one described by `to_sp`.
    unsafe { __kern_context_switch(from_sp, to_sp) }
}

pub fn scheduler_startup(to_sp: &mut usize) {
    // Safety: called exactly once, from the startup path, with the saved-SP
    // slot of the first thread to run. Does not return.
    unsafe { __kern_scheduler_startup(to_sp) }
}
