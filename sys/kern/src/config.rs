// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time sizing of the kernel's fixed tables.
//!
//! Every table in the kernel is statically sized so that the whole system
//! takes a single shape at compile time; nothing here is consulted at
//! runtime except as an array bound. Applications that need different
//! limits change these constants and rebuild.

/// Capacity of the thread table, including the idle thread.
pub const THREADS_MAX: usize = 32;

/// Capacity of the timer table. Every thread consumes one slot for its
/// private timeout timer, so this must be at least `THREADS_MAX` plus the
/// number of standalone timers the application creates.
pub const TIMERS_MAX: usize = 64;

/// Capacity of the object registry. Every thread, timer, and IPC object
/// holds exactly one slot while it is alive.
pub const OBJECTS_MAX: usize = 128;

/// Capacity of the wait-queue table. Each IPC object claims one queue
/// (message queues claim two).
pub const WAITQUEUES_MAX: usize = 64;

/// Number of levels in the timer skip list. More levels reduce insertion
/// scan length for large timer populations at the cost of a little RAM per
/// timer.
pub const TIMER_SKIPLIST_LEVELS: usize = 3;

/// Level-promotion ratio for the timer skip list, as a power of two: a
/// node is promoted one level with probability 1 in
/// `1 << TIMER_SKIPLIST_SHIFT`.
pub const TIMER_SKIPLIST_SHIFT: u32 = 2;

/// Maximum stored length of an object name. Longer names are truncated on
/// registration.
pub const OBJECT_NAME_LEN: usize = 15;

/// Upper bound on the number of message slots a single message queue can
/// manage, regardless of how large a buffer it is given.
pub const MSGQUEUE_SLOTS_MAX: usize = 32;

/// Upper bound on the number of blocks a single memory pool can manage.
pub const MEMPOOL_BLOCKS_MAX: usize = 32;

/// Time-slice length, in ticks, of the idle thread.
pub const IDLE_SLICE_TICKS: u32 = 32;

/// Alignment applied to message-queue and memory-pool payload sizes.
pub const PAYLOAD_ALIGN: usize = core::mem::size_of::<usize>();

/// Rounds `n` up to [`PAYLOAD_ALIGN`].
pub const fn align_payload(n: usize) -> usize {
    (n + PAYLOAD_ALIGN - 1) & !(PAYLOAD_ALIGN - 1)
}
