// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphore.
//!
//! The counter stays in `[0, max]`. Release hands the unit directly to
//! the head waiter when one is queued -- the visible counter is not
//! incremented in that case, so there is no window where a latecomer can
//! steal the unit from the thread being woken.

use abi::{KernError, KernResult, ObjectType, Timeout};

use crate::arch;
use crate::kernel::Kernel;
use crate::registry::ObjectId;
use crate::waitq::{QueueId, WaitOrder};

#[cfg(any(feature = "alloc", test))]
use alloc::boxed::Box;

#[derive(Debug)]
pub struct Semaphore {
    object: ObjectId,
    queue: QueueId,
    value: usize,
    max: usize,
}

impl Semaphore {
    /// Sets up a semaphore in caller-owned storage.
    pub fn init(
        kernel: &mut Kernel,
        name: &str,
        init: usize,
        max: usize,
    ) -> KernResult<Semaphore> {
        Self::setup(kernel, name, init, max, false)
    }

    /// As [`Semaphore::init`] with kernel-owned storage.
    #[cfg(any(feature = "alloc", test))]
    pub fn create(
        kernel: &mut Kernel,
        name: &str,
        init: usize,
        max: usize,
    ) -> KernResult<Box<Semaphore>> {
        Ok(Box::new(Self::setup(kernel, name, init, max, true)?))
    }

    pub(crate) fn setup(
        kernel: &mut Kernel,
        name: &str,
        init: usize,
        max: usize,
        created: bool,
    ) -> KernResult<Semaphore> {
        if max == 0 || init > max {
            return Err(KernError::InvalidArgument);
        }
        let object =
            kernel.registry.register(ObjectType::Semaphore, name, created)?;
        let queue = match kernel.queues.claim() {
            Ok(q) => q,
            Err(e) => {
                kernel.registry.release(object);
                return Err(e);
            }
        };
        Ok(Semaphore { object, queue, value: init, max })
    }

    /// Tears the semaphore down. Pending waiters are woken with
    /// `Destroyed` in their error slot.
    pub fn deinit(self, kernel: &mut Kernel) {
        kernel.waitq_drain(self.queue);
        kernel.queues.release(self.queue);
        kernel.registry.release(self.object);
    }

    /// Takes one unit, suspending in priority order when none is
    /// available.
    pub fn acquire(
        &mut self,
        kernel: &mut Kernel,
        timeout: Timeout,
    ) -> KernResult<()> {
        let token = arch::interrupt_lock();
        if self.value > 0 {
            self.value -= 1;
            arch::interrupt_restore(token);
            return Ok(());
        }
        if timeout.is_poll() {
            arch::interrupt_restore(token);
            return Err(KernError::WouldBlock);
        }
        // Release hands units directly to woken waiters, so a successful
        // wake *is* the acquisition; there is nothing to re-check here.
        let r = kernel.waitq_suspend(self.queue, timeout, WaitOrder::Priority);
        arch::interrupt_restore(token);
        r?;
        kernel.reschedule();
        kernel.current_err()
    }

    /// Returns one unit: to the head waiter if any, else to the counter.
    /// Release beyond `max` is an error, not a silent clamp.
    pub fn release(&mut self, kernel: &mut Kernel) -> KernResult<()> {
        let token = arch::interrupt_lock();
        if !kernel.queues.is_empty(self.queue) {
            kernel.waitq_resume_one(self.queue);
            arch::interrupt_restore(token);
            kernel.reschedule();
            Ok(())
        } else if self.value < self.max {
            self.value += 1;
            arch::interrupt_restore(token);
            Ok(())
        } else {
            arch::interrupt_restore(token);
            Err(KernError::OutOfRange)
        }
    }

    /// Current `(value, max)` pair.
    pub fn value(&self) -> (usize, usize) {
        (self.value, self.max)
    }

    pub(crate) fn queue(&self) -> QueueId {
        self.queue
    }

    pub(crate) fn count(&self) -> usize {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ready_thread, started_kernel};
    use abi::ThreadState;

    #[test]
    fn poll_acquire_then_release_then_acquire() {
        // Semaphore(init=0, max=1): a poll acquire fails immediately with
        // WouldBlock, a release makes one unit available, and the retry
        // takes it back to zero.
        let (mut k, _t) = started_kernel(5);
        let mut sem = Semaphore::init(&mut k, "sem", 0, 1).unwrap();

        assert_eq!(
            sem.acquire(&mut k, Timeout::Poll),
            Err(KernError::WouldBlock)
        );
        sem.release(&mut k).unwrap();
        assert_eq!(sem.value(), (1, 1));
        sem.acquire(&mut k, Timeout::Poll).unwrap();
        assert_eq!(sem.value(), (0, 1));
    }

    #[test]
    fn release_beyond_max_is_out_of_range() {
        let (mut k, _t) = started_kernel(5);
        let mut sem = Semaphore::init(&mut k, "sem", 1, 1).unwrap();
        assert_eq!(sem.release(&mut k), Err(KernError::OutOfRange));
        assert_eq!(sem.value(), (1, 1));
    }

    #[test]
    fn release_hands_the_unit_to_a_waiter_without_counting_it() {
        let (mut k, t) = started_kernel(5);
        let mut sem = Semaphore::init(&mut k, "sem", 0, 4).unwrap();

        // The current thread blocks on the empty semaphore; idle takes
        // over.
        sem.acquire(&mut k, Timeout::Forever).unwrap();
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);
        assert_eq!(k.current_thread(), k.idle_thread());

        // A release must wake the waiter (which preempts idle) and leave
        // the counter at zero: the unit went straight to the woken
        // thread.
        sem.release(&mut k).unwrap();
        assert_eq!(k.current_thread(), Some(t));
        assert_eq!(k.thread_err(t), Ok(()));
        assert_eq!(sem.value(), (0, 4));
    }

    #[test]
    fn waiters_are_woken_in_priority_order() {
        let (mut k, _main) = started_kernel(0);
        let mut sem = Semaphore::init(&mut k, "sem", 0, 1).unwrap();

        let lo = ready_thread(&mut k, "lo", 8);
        let hi = ready_thread(&mut k, "hi", 2);
        // Park both on the semaphore, arrival order lo then hi.
        k.block_thread_on(lo, sem.queue(), WaitOrder::Priority);
        k.block_thread_on(hi, sem.queue(), WaitOrder::Priority);

        sem.release(&mut k).unwrap();
        assert_eq!(k.thread_state(hi).unwrap(), ThreadState::Ready);
        assert_eq!(k.thread_state(lo).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn timed_acquire_times_out_and_reports_timeout() {
        let (mut k, t) = started_kernel(5);
        let mut sem = Semaphore::init(&mut k, "sem", 0, 1).unwrap();

        sem.acquire(&mut k, Timeout::Ticks(3)).unwrap();
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);

        k.clock_inc_tick(3);
        // Woken by the timer (preempting idle), with Timeout recorded.
        assert_eq!(k.current_thread(), Some(t));
        assert_eq!(k.thread_err(t), Err(KernError::Timeout));
        // The failed wait left no unit behind.
        assert_eq!(sem.value(), (0, 1));
    }

    #[test]
    fn deinit_wakes_waiters_with_destroyed() {
        let (mut k, t) = started_kernel(5);
        let mut sem = Semaphore::init(&mut k, "sem", 0, 1).unwrap();
        sem.acquire(&mut k, Timeout::Forever).unwrap();
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);

        sem.deinit(&mut k);
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Ready);
        assert_eq!(k.thread_err(t), Err(KernError::Destroyed));
        assert_eq!(k.object_count(ObjectType::Semaphore), 0);
    }

    #[test]
    fn bad_bounds_are_rejected() {
        let (mut k, _t) = started_kernel(5);
        assert!(Semaphore::init(&mut k, "s", 0, 0).is_err());
        assert!(Semaphore::init(&mut k, "s", 2, 1).is_err());
    }
}
