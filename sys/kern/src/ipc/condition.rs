// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Condition variable, layered on the semaphore.
//!
//! A condition is an unbounded semaphore starting at zero, re-purposed:
//! `wait` requires holding a caller-supplied mutex, releases it around
//! the suspend, and reacquires it before returning regardless of the
//! wake reason. Waiters queue FIFO.

use abi::{KernError, KernResult, ThreadState, Timeout};

use crate::arch;
use crate::kernel::Kernel;
use crate::waitq::{QueueId, WaitOrder};

use super::{Mutex, Semaphore};

#[cfg(any(feature = "alloc", test))]
use alloc::boxed::Box;

#[derive(Debug)]
pub struct Condition {
    sem: Semaphore,
}

impl Condition {
    pub fn init(kernel: &mut Kernel, name: &str) -> KernResult<Condition> {
        Ok(Condition {
            sem: Semaphore::setup(kernel, name, 0, usize::MAX, false)?,
        })
    }

    #[cfg(any(feature = "alloc", test))]
    pub fn create(
        kernel: &mut Kernel,
        name: &str,
    ) -> KernResult<Box<Condition>> {
        Ok(Box::new(Condition {
            sem: Semaphore::setup(kernel, name, 0, usize::MAX, true)?,
        }))
    }

    /// Tears the condition down. Refused with `Busy` while waiters are
    /// queued; the condition is handed back so the caller can drain and
    /// retry.
    pub fn deinit(
        self,
        kernel: &mut Kernel,
    ) -> Result<(), (Condition, KernError)> {
        if !kernel.queues.is_empty(self.sem.queue()) {
            return Err((self, KernError::Busy));
        }
        self.sem.deinit(kernel);
        Ok(())
    }

    /// Waits for a signal. The caller must hold `mutex`; it is released
    /// for the duration of the wait and reacquired (waiting forever)
    /// before this returns, whether the wake was a signal, a timeout, or
    /// a teardown.
    pub fn wait(
        &mut self,
        kernel: &mut Kernel,
        mutex: &mut Mutex,
        timeout: Timeout,
    ) -> KernResult<()> {
        let cur = kernel.current_thread().ok_or(KernError::Fault)?;
        if mutex.owner() != Some(cur) {
            return Err(KernError::PermissionDenied);
        }

        let token = arch::interrupt_lock();
        if self.sem.count() > 0 {
            // A signal arrived before we got here; consume it without
            // dropping the mutex at all.
            let r = self.sem.acquire(kernel, Timeout::Poll);
            arch::interrupt_restore(token);
            return r;
        }
        if timeout.is_poll() {
            arch::interrupt_restore(token);
            return Err(KernError::WouldBlock);
        }

        let r = kernel.waitq_suspend(self.sem.queue(), timeout, WaitOrder::Fifo);
        arch::interrupt_restore(token);
        r?;
        mutex.release(kernel)?;
        kernel.reschedule();

        if kernel.thread_state(cur)? == ThreadState::Suspended {
            // The recording arch did not actually take the switch; the
            // harness drives the wakeup from here.
            return Ok(());
        }
        let outcome = kernel.thread_err(cur);
        mutex.acquire(kernel, Timeout::Forever)?;
        outcome
    }

    /// Wakes one waiter. A signal with nobody waiting is forgotten, not
    /// counted: conditions are not semaphores for latecomers.
    pub fn signal(&mut self, kernel: &mut Kernel) -> KernResult<()> {
        if kernel.queues.is_empty(self.sem.queue()) {
            Ok(())
        } else {
            self.sem.release(kernel)
        }
    }

    /// Wakes every currently queued waiter, leaving no residual count
    /// behind for threads that wait later.
    pub fn broadcast(&mut self, kernel: &mut Kernel) -> KernResult<()> {
        while !kernel.queues.is_empty(self.sem.queue()) {
            self.sem.release(kernel)?;
        }
        Ok(())
    }

    pub(crate) fn queue(&self) -> QueueId {
        self.sem.queue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ready_thread, run_as, started_kernel};

    #[test]
    fn wait_requires_holding_the_mutex() {
        let (mut k, _t) = started_kernel(5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        let mut c = Condition::init(&mut k, "c").unwrap();
        assert_eq!(
            c.wait(&mut k, &mut m, Timeout::Forever),
            Err(KernError::PermissionDenied)
        );
    }

    #[test]
    fn wait_releases_the_mutex_while_suspended() {
        let (mut k, t) = started_kernel(5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        let mut c = Condition::init(&mut k, "c").unwrap();

        m.acquire(&mut k, Timeout::Forever).unwrap();
        c.wait(&mut k, &mut m, Timeout::Forever).unwrap();

        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);
        // The mutex was dropped on the way into the wait, so another
        // thread can take it.
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn signal_wakes_exactly_one_waiter_in_fifo_order() {
        let (mut k, _main) = started_kernel(5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        let mut c = Condition::init(&mut k, "c").unwrap();

        let first = ready_thread(&mut k, "w0", 6);
        let second = ready_thread(&mut k, "w1", 2);
        for t in [first, second] {
            run_as(&mut k, t, |k| {
                m.acquire(k, Timeout::Forever).unwrap();
                c.wait(k, &mut m, Timeout::Forever).unwrap();
            });
        }

        // FIFO: despite `second` being more important, `first` arrived
        // first and is signaled first.
        c.signal(&mut k).unwrap();
        assert_ne!(k.thread_state(first).unwrap(), ThreadState::Suspended);
        assert_eq!(k.thread_state(second).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn signal_without_waiters_leaves_no_residue() {
        let (mut k, t) = started_kernel(5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        let mut c = Condition::init(&mut k, "c").unwrap();

        // Nobody is waiting; these signals must evaporate.
        c.signal(&mut k).unwrap();
        c.signal(&mut k).unwrap();

        m.acquire(&mut k, Timeout::Forever).unwrap();
        c.wait(&mut k, &mut m, Timeout::Forever).unwrap();
        // The earlier signals were forgotten: the wait really suspended.
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn broadcast_wakes_all_current_waiters_only() {
        let (mut k, _main) = started_kernel(5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        let mut c = Condition::init(&mut k, "c").unwrap();

        let waiters: Vec<_> =
            (0..3).map(|i| ready_thread(&mut k, &format!("w{i}"), 6)).collect();
        for t in &waiters {
            run_as(&mut k, *t, |k| {
                m.acquire(k, Timeout::Forever).unwrap();
                c.wait(k, &mut m, Timeout::Forever).unwrap();
            });
        }

        c.broadcast(&mut k).unwrap();
        for t in &waiters {
            assert_ne!(k.thread_state(*t).unwrap(), ThreadState::Suspended);
        }

        // And a thread that waits *after* the broadcast suspends: no
        // count was left behind.
        let late = ready_thread(&mut k, "late", 6);
        run_as(&mut k, late, |k| {
            m.acquire(k, Timeout::Forever).unwrap();
            c.wait(k, &mut m, Timeout::Forever).unwrap();
        });
        assert_eq!(k.thread_state(late).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn deinit_refuses_while_waiters_remain() {
        let (mut k, _main) = started_kernel(5);
        let mut m = Mutex::init(&mut k, "m").unwrap();
        let mut c = Condition::init(&mut k, "c").unwrap();

        let w = ready_thread(&mut k, "w", 6);
        run_as(&mut k, w, |k| {
            m.acquire(k, Timeout::Forever).unwrap();
            c.wait(k, &mut m, Timeout::Forever).unwrap();
        });

        let (mut c, e) = c.deinit(&mut k).unwrap_err();
        assert_eq!(e, KernError::Busy);

        // Drain, then teardown succeeds.
        c.broadcast(&mut k).unwrap();
        c.deinit(&mut k).unwrap();
    }
}
