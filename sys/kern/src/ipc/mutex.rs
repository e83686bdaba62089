// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recursive mutex with priority inheritance.
//!
//! Ownership is a sum type: either nobody holds the lock, or a specific
//! thread holds it with a non-zero nesting count and the priority to
//! restore when it lets go. "Owner implies nest > 0" is therefore a
//! structural fact, not a runtime assumption.
//!
//! When a more important thread blocks on a held mutex, the owner is
//! boosted to the waiter's priority before the waiter suspends, bounding
//! the inversion to the owner's remaining critical section. The final
//! release restores the owner's pre-boost priority and hands ownership
//! directly to the head waiter, skipping the unlock/re-lock race
//! entirely.

use core::num::NonZeroU16;

use abi::{KernError, KernResult, ObjectType, Priority, ThreadId, Timeout};

use crate::arch;
use crate::kernel::Kernel;
use crate::registry::ObjectId;
use crate::waitq::{QueueId, WaitOrder};

#[cfg(any(feature = "alloc", test))]
use alloc::boxed::Box;

const NEST_ONE: NonZeroU16 = match NonZeroU16::new(1) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum MutexState {
    Unlocked,
    LockedBy {
        owner: ThreadId,
        nest: NonZeroU16,
        /// The owner's priority at acquisition time, before any
        /// inheritance boost.
        restore: Priority,
    },
}

#[derive(Debug)]
pub struct Mutex {
    object: ObjectId,
    queue: QueueId,
    state: MutexState,
}

impl Mutex {
    pub fn init(kernel: &mut Kernel, name: &str) -> KernResult<Mutex> {
        Self::setup(kernel, name, false)
    }

    #[cfg(any(feature = "alloc", test))]
    pub fn create(kernel: &mut Kernel, name: &str) -> KernResult<Box<Mutex>> {
        Ok(Box::new(Self::setup(kernel, name, true)?))
    }

    fn setup(
        kernel: &mut Kernel,
        name: &str,
        created: bool,
    ) -> KernResult<Mutex> {
        let object =
            kernel.registry.register(ObjectType::Mutex, name, created)?;
        let queue = match kernel.queues.claim() {
            Ok(q) => q,
            Err(e) => {
                kernel.registry.release(object);
                return Err(e);
            }
        };
        Ok(Mutex { object, queue, state: MutexState::Unlocked })
    }

    /// Tears the mutex down; pending waiters wake with `Destroyed`.
    pub fn deinit(self, kernel: &mut Kernel) {
        kernel.waitq_drain(self.queue);
        kernel.queues.release(self.queue);
        kernel.registry.release(self.object);
    }

    pub fn acquire(
        &mut self,
        kernel: &mut Kernel,
        timeout: Timeout,
    ) -> KernResult<()> {
        let cur = kernel.current_thread().ok_or(KernError::Fault)?;
        let token = arch::interrupt_lock();
        match self.state {
            MutexState::LockedBy { owner, nest, restore } if owner == cur => {
                let r = match nest.checked_add(1) {
                    Some(nest) => {
                        self.state =
                            MutexState::LockedBy { owner, nest, restore };
                        Ok(())
                    }
                    None => Err(KernError::OutOfRange),
                };
                arch::interrupt_restore(token);
                r
            }
            MutexState::Unlocked => {
                let restore = kernel.threads.get(cur).unwrap().priority;
                self.state = MutexState::LockedBy {
                    owner: cur,
                    nest: NEST_ONE,
                    restore,
                };
                arch::interrupt_restore(token);
                Ok(())
            }
            MutexState::LockedBy { .. } if timeout.is_poll() => {
                arch::interrupt_restore(token);
                Err(KernError::WouldBlock)
            }
            MutexState::LockedBy { owner, .. } => {
                // Bound the inversion: lift the owner to our priority
                // before going to sleep behind it.
                let mine = kernel.threads.get(cur).unwrap().priority;
                let owners = kernel.threads.get(owner).unwrap().priority;
                if mine.is_more_important_than(owners) {
                    kernel.thread_set_priority(owner, mine)?;
                }
                let r = kernel.waitq_suspend(
                    self.queue,
                    timeout,
                    WaitOrder::Priority,
                );
                arch::interrupt_restore(token);
                r?;
                kernel.reschedule();
                kernel.current_err()
            }
        }
    }

    pub fn release(&mut self, kernel: &mut Kernel) -> KernResult<()> {
        let cur = kernel.current_thread().ok_or(KernError::Fault)?;
        let token = arch::interrupt_lock();

        let MutexState::LockedBy { owner, nest, restore } = self.state else {
            arch::interrupt_restore(token);
            return Err(KernError::PermissionDenied);
        };
        if owner != cur {
            arch::interrupt_restore(token);
            return Err(KernError::PermissionDenied);
        }

        if let Some(nest) = NonZeroU16::new(nest.get() - 1) {
            self.state = MutexState::LockedBy { owner, nest, restore };
            arch::interrupt_restore(token);
            return Ok(());
        }

        // Final release: revert any inheritance boost first.
        if kernel.threads.get(cur).unwrap().priority != restore {
            kernel.thread_set_priority(cur, restore)?;
        }

        if let Some(head) = self.head_waiter(kernel) {
            // Hand ownership straight to the head waiter.
            let restore = kernel.threads.get(head).unwrap().priority;
            self.state = MutexState::LockedBy {
                owner: head,
                nest: NEST_ONE,
                restore,
            };
            kernel.waitq_resume_one(self.queue);
            arch::interrupt_restore(token);
            kernel.reschedule();
        } else {
            self.state = MutexState::Unlocked;
            arch::interrupt_restore(token);
        }
        Ok(())
    }

    /// The thread currently holding the mutex, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        match self.state {
            MutexState::Unlocked => None,
            MutexState::LockedBy { owner, .. } => Some(owner),
        }
    }

    fn head_waiter(&self, kernel: &Kernel) -> Option<ThreadId> {
        kernel
            .queues
            .list(self.queue)
            .head()
            .map(|i| kernel.threads.id_for(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ready_thread, run_as, started_kernel};
    use abi::ThreadState;

    #[test]
    fn recursive_acquire_and_release_track_nesting() {
        // Created unlocked; acquire twice (no blocking, we own it),
        // release twice; unlocked again with no owner.
        let (mut k, a) = started_kernel(5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        assert_eq!(m.owner(), None);

        m.acquire(&mut k, Timeout::Forever).unwrap();
        assert_eq!(m.owner(), Some(a));
        m.acquire(&mut k, Timeout::Forever).unwrap();
        assert_eq!(m.owner(), Some(a));

        m.release(&mut k).unwrap();
        // Still owned: one nesting level remains.
        assert_eq!(m.owner(), Some(a));
        m.release(&mut k).unwrap();
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn release_by_non_owner_is_denied() {
        let (mut k, _a) = started_kernel(5);
        let b = ready_thread(&mut k, "b", 5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        m.acquire(&mut k, Timeout::Forever).unwrap();

        run_as(&mut k, b, |k| {
            assert_eq!(m.release(k), Err(KernError::PermissionDenied));
        });
        // Releasing an unlocked mutex is denied too.
        let mut m2 = Mutex::init(&mut k, "m2").unwrap();
        assert_eq!(m2.release(&mut k), Err(KernError::PermissionDenied));
    }

    #[test]
    fn priority_inheritance_boosts_and_restores_exactly() {
        // L (low) holds the mutex; H (high) blocks on it. While H waits,
        // L runs at H's priority; on release L reverts to its pre-boost
        // value.
        let (mut k, low) = started_kernel(8);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        m.acquire(&mut k, Timeout::Forever).unwrap();

        let high = ready_thread(&mut k, "high", 2);
        run_as(&mut k, high, |k| {
            m.acquire(k, Timeout::Forever).unwrap();
        });
        assert_eq!(k.thread_state(high).unwrap(), ThreadState::Suspended);

        // The owner inherited the waiter's priority.
        assert_eq!(k.thread_priority(low).unwrap(), Priority(2));

        m.release(&mut k).unwrap();
        // Boost reverted, ownership handed directly to the waiter, which
        // outranks us and takes the CPU.
        assert_eq!(k.thread_priority(low).unwrap(), Priority(8));
        assert_eq!(m.owner(), Some(high));
        assert_eq!(k.current_thread(), Some(high));
        assert_eq!(k.thread_err(high), Ok(()));
        assert_eq!(k.thread_state(low).unwrap(), ThreadState::Ready);
    }

    #[test]
    fn a_less_important_waiter_does_not_boost_the_owner() {
        let (mut k, owner) = started_kernel(3);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        m.acquire(&mut k, Timeout::Forever).unwrap();

        let meek = ready_thread(&mut k, "meek", 9);
        run_as(&mut k, meek, |k| {
            m.acquire(k, Timeout::Forever).unwrap();
        });
        assert_eq!(k.thread_priority(owner).unwrap(), Priority(3));
    }

    #[test]
    fn handoff_skips_the_unlocked_state() {
        let (mut k, _a) = started_kernel(5);
        let b = ready_thread(&mut k, "b", 5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        m.acquire(&mut k, Timeout::Forever).unwrap();

        run_as(&mut k, b, |k| {
            m.acquire(k, Timeout::Forever).unwrap();
        });
        m.release(&mut k).unwrap();
        // Never observed unlocked: b owns it the instant we let go.
        assert_eq!(m.owner(), Some(b));
    }

    #[test]
    fn poll_acquire_of_a_held_mutex_would_block() {
        let (mut k, _a) = started_kernel(5);
        let b = ready_thread(&mut k, "b", 5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        m.acquire(&mut k, Timeout::Forever).unwrap();
        run_as(&mut k, b, |k| {
            assert_eq!(
                m.acquire(k, Timeout::Poll),
                Err(KernError::WouldBlock)
            );
        });
    }

    #[test]
    fn timed_acquire_times_out_and_owner_keeps_the_lock() {
        let (mut k, a) = started_kernel(5);
        let b = ready_thread(&mut k, "b", 5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        m.acquire(&mut k, Timeout::Forever).unwrap();

        run_as(&mut k, b, |k| {
            m.acquire(k, Timeout::Ticks(4)).unwrap();
        });
        k.clock_inc_tick(4);
        assert_eq!(k.thread_err(b), Err(KernError::Timeout));
        assert_eq!(m.owner(), Some(a));
    }
}
