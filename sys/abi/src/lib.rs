// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application code.
//!
//! Everything in here is deliberately small and dependency-light: these are
//! the types that cross the boundary between the kernel crate and the code
//! that drives it (thread entry points, idle hooks, ports). Nothing in this
//! crate does any work; it only names things.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Result alias used by every fallible kernel operation.
pub type KernResult<T> = Result<T, KernError>;

/// The error taxonomy for recoverable conditions.
///
/// All kernel operations report failure synchronously through this type;
/// invariant violations do not appear here, they panic. Callers of blocking
/// operations must always inspect the result, because the same call can
/// succeed, time out, or report that the object it waited on was torn down.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KernError {
    /// A bad parameter or parameter combination, such as conflicting
    /// event-wait mode flags or a timer duration beyond the representable
    /// range.
    InvalidArgument,
    /// A `Timeout::Poll` operation could not complete immediately. This is
    /// deliberately distinct from `Timeout`: no timer ever fired.
    WouldBlock,
    /// A finite timeout elapsed before the operation completed.
    Timeout,
    /// The caller is not allowed to do this -- releasing a mutex it does not
    /// own, waiting on a condition without holding its mutex, or driving a
    /// thread through an illegal state transition.
    PermissionDenied,
    /// The object still has work in flight (queued waiters, live readers)
    /// and cannot be torn down yet. Retry after draining.
    Busy,
    /// A counter left its legal range: a semaphore release beyond `max`, or
    /// a mutex nesting level that would overflow.
    OutOfRange,
    /// The allocator (or a fixed kernel table) is exhausted. Only the
    /// `create` family and slot-claiming paths report this.
    NoMemory,
    /// The operation needs a current thread and there is none -- typically a
    /// blocking call from pure interrupt or pre-startup context.
    Fault,
    /// Written into a waiter's error slot when the object it was suspended
    /// on was destroyed out from under it.
    Destroyed,
}

#[cfg(feature = "defmt")]
impl defmt::Format for KernError {
    fn format(&self, fmt: defmt::Formatter) {
        let name = match self {
            KernError::InvalidArgument => "InvalidArgument",
            KernError::WouldBlock => "WouldBlock",
            KernError::Timeout => "Timeout",
            KernError::PermissionDenied => "PermissionDenied",
            KernError::Busy => "Busy",
            KernError::OutOfRange => "OutOfRange",
            KernError::NoMemory => "NoMemory",
            KernError::Fault => "Fault",
            KernError::Destroyed => "Destroyed",
        };
        defmt::write!(fmt, "{}", name);
    }
}

/// Kernel time, measured in ticks of the system clock interrupt.
///
/// The counter is 32 bits and wraps; all comparisons must therefore be made
/// through the wraparound-aware helpers rather than `<`/`>`. Two instants
/// can only be ordered meaningfully when they are less than
/// [`Tick::MAX_SPAN`] apart, which is also the longest duration a timer may
/// be armed for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Tick(pub u32);

impl Tick {
    /// Longest meaningful distance between two ticks: half the counter
    /// range. Timer durations must be strictly below this.
    pub const MAX_SPAN: u32 = u32::MAX / 2;

    /// Advances the counter, wrapping.
    #[must_use]
    pub fn advanced_by(self, n: u32) -> Tick {
        Tick(self.0.wrapping_add(n))
    }

    /// Distance from `earlier` to `self`, assuming `self` is not more than
    /// one full wrap ahead.
    #[must_use]
    pub fn since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Whether a deadline of `self` has been reached at time `now`, in the
    /// wraparound-aware sense: the distance from `self` to `now` is small.
    ///
    /// A deadline more than `MAX_SPAN` "ahead" of `now` is simply not due
    /// yet, even if its raw value is numerically smaller.
    #[must_use]
    pub fn is_reached_by(self, now: Tick) -> bool {
        now.0.wrapping_sub(self.0) < Tick::MAX_SPAN
    }
}

/// How long a blocking operation is willing to wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Timeout {
    /// Never block: if the fast path fails, return `WouldBlock` immediately.
    Poll,
    /// Block for at most this many ticks; a fired timer produces `Timeout`.
    /// Durations of `Tick::MAX_SPAN` or more are rejected as
    /// `InvalidArgument`.
    Ticks(u32),
    /// Block until explicitly woken. The thread's private timer is not
    /// armed at all.
    Forever,
}

impl Timeout {
    /// Whether this timeout forbids blocking.
    pub fn is_poll(&self) -> bool {
        matches!(self, Timeout::Poll)
    }
}

/// Indicates the priority of a thread.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned, Default,
    Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

/// Number of distinct priority levels the ready table supports. The bitmap
/// accelerating highest-priority lookup is a `u32`, so this cannot exceed
/// 32.
pub const NUM_PRIORITIES: usize = 32;

impl Priority {
    /// The least important level, reserved for the idle thread.
    pub const IDLE: Self = Priority(NUM_PRIORITIES as u8 - 1);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Priority {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Priority({})", self.0);
    }
}

/// Type used to track generation numbers of arena slots.
///
/// A slot's generation is bumped every time the slot is retired, so a
/// handle minted for an earlier occupant can be detected as stale instead
/// of silently denoting whatever lives there now.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        const MASK: u8 = ((1u16 << (16 - ThreadId::INDEX_BITS)) - 1) as u8;
        Generation(self.0.wrapping_add(1) & MASK)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Names a particular incarnation of a thread.
///
/// A `ThreadId` combines two fields, a slot index in the kernel's thread
/// table and a generation number. The generation number is incremented when
/// a slot is reaped and reused, so a handle to a dead thread does not
/// accidentally address its successor.
///
/// The index is in the lower `ThreadId::INDEX_BITS` bits, the generation in
/// the remaining top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ThreadId(pub u16);

impl ThreadId {
    /// Number of bits used for the slot index. Bounds the thread table at
    /// 2^10 entries, far above any configuration this kernel ships with.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `ThreadId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ThreadId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.raw() as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation::from((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Names a particular incarnation of a timer, with the same index +
/// generation structure as [`ThreadId`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TimerId(pub u16);

impl TimerId {
    pub const INDEX_BITS: u32 = 10;
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        TimerId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.raw() as u16) << Self::INDEX_BITS,
        )
    }

    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    pub fn generation(&self) -> Generation {
        Generation::from((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// State used to make status and scheduling decisions for a thread.
///
/// The yield flag is *not* part of this enum: a thread can be Ready or
/// Running with or without having yielded, and folding the flag in here
/// would double the legal-transition table for no benefit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ThreadState {
    /// Initialized but never started; ignored by the scheduler.
    Inactive,
    /// Eligible for selection, linked in its priority's ready list.
    Ready,
    /// Currently on the CPU. At most one thread is Running.
    Running,
    /// Blocked on an IPC primitive or a timed delay; linked in at most one
    /// wait queue, with its private timer armed unless waiting forever.
    Suspended,
    /// Entry function returned or the thread was forcibly destroyed. The
    /// thread sits on the defunct list until the idle sweep reclaims it.
    /// This state is irreversible.
    Terminated,
}

impl Default for ThreadState {
    fn default() -> Self {
        ThreadState::Inactive
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ThreadState {
    fn format(&self, fmt: defmt::Formatter) {
        let name = match self {
            ThreadState::Inactive => "Inactive",
            ThreadState::Ready => "Ready",
            ThreadState::Running => "Running",
            ThreadState::Suspended => "Suspended",
            ThreadState::Terminated => "Terminated",
        };
        defmt::write!(fmt, "{}", name);
    }
}

bitflags::bitflags! {
    /// Mode flags for event-flag-group waits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct EventOptions: u8 {
        /// Succeed when *any* bit of the requested mask is set.
        const OR = 1 << 0;
        /// Succeed only when *all* bits of the requested mask are set.
        const AND = 1 << 1;
        /// Leave the matched bits set in the group instead of consuming
        /// them.
        const NO_CLEAR = 1 << 3;
    }
}

impl EventOptions {
    /// Checks that exactly one of `OR`/`AND` is present. Requesting both,
    /// or neither, is a caller bug surfaced as `InvalidArgument`.
    pub fn validate(self) -> KernResult<()> {
        let mode = self & (EventOptions::OR | EventOptions::AND);
        if mode == EventOptions::OR || mode == EventOptions::AND {
            Ok(())
        } else {
            Err(KernError::InvalidArgument)
        }
    }
}

/// Type tag carried by every registered kernel object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ObjectType {
    Thread,
    Timer,
    Semaphore,
    Mutex,
    Event,
    MsgQueue,
    MemPool,
    RwLock,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_ordering_survives_wraparound() {
        let just_before_wrap = Tick(u32::MAX - 10);
        let deadline = just_before_wrap.advanced_by(20); // lands past zero
        assert_eq!(deadline, Tick(9));

        // Not due yet: the deadline is "ahead" of now even though its raw
        // value is numerically smaller.
        assert!(!deadline.is_reached_by(just_before_wrap));

        // Due once the counter passes it.
        assert!(deadline.is_reached_by(Tick(9)));
        assert!(deadline.is_reached_by(Tick(100)));

        assert_eq!(deadline.since(just_before_wrap), 20);
    }

    #[test]
    fn thread_id_round_trips_index_and_generation() {
        let gen = Generation::ZERO.next().next();
        let id = ThreadId::for_index_and_gen(7, gen);
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), gen);
    }

    #[test]
    fn priority_importance_is_numerically_inverted() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(1).is_more_important_than(Priority(1)));
        assert!(!Priority::IDLE.is_more_important_than(Priority(0)));
    }

    #[test]
    fn event_options_must_pick_exactly_one_mode() {
        assert!(EventOptions::OR.validate().is_ok());
        assert!((EventOptions::AND | EventOptions::NO_CLEAR)
            .validate()
            .is_ok());
        assert_eq!(
            (EventOptions::AND | EventOptions::OR).validate(),
            Err(KernError::InvalidArgument)
        );
        assert_eq!(
            EventOptions::NO_CLEAR.validate(),
            Err(KernError::InvalidArgument)
        );
    }
}
