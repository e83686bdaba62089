// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The wait-queue protocol shared by every blocking primitive.
//!
//! A wait queue is an ordered list of Suspended threads. It does not own
//! them -- threads stay owned by the thread table, and each thread records
//! which queue it is linked in so that the timeout path can unlink it
//! without help from the queue's owner.
//!
//! The protocol is three operations: `suspend` (block the current thread
//! on a queue, FIFO or priority-ordered, arming its private timer),
//! `resume_one` (pop the head and wake it with success), and `drain`
//! (wake everyone with `Destroyed`; only used while tearing the owning
//! object down).

use abi::{KernError, KernResult, ThreadId, Timeout};

use crate::config::WAITQUEUES_MAX;
use crate::kernel::Kernel;
use crate::list::List;
use crate::thread::wake;

/// Handle to a wait queue slot, held by the owning IPC object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct QueueId(pub u16);

/// Insertion discipline for a queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WaitOrder {
    /// Arrival order.
    Fifo,
    /// Before the first waiter of strictly lower importance; equal
    /// priorities keep arrival order.
    Priority,
}

pub(crate) struct WaitQueues {
    slots: [Option<List>; WAITQUEUES_MAX],
}

impl WaitQueues {
    pub fn new() -> Self {
        WaitQueues { slots: [None; WAITQUEUES_MAX] }
    }

    pub fn claim(&mut self) -> KernResult<QueueId> {
        let index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernError::NoMemory)?;
        self.slots[index] = Some(List::EMPTY);
        Ok(QueueId(index as u16))
    }

    /// Releases a queue slot; it must have been drained first.
    pub fn release(&mut self, id: QueueId) {
        let slot = &mut self.slots[usize::from(id.0)];
        assert!(slot.map(|l| l.is_empty()).unwrap_or(false));
        *slot = None;
    }

    pub fn list_mut(&mut self, id: u16) -> &mut List {
        self.slots[usize::from(id)].as_mut().unwrap()
    }

    pub fn list(&self, id: QueueId) -> &List {
        self.slots[usize::from(id.0)].as_ref().unwrap()
    }

    pub fn is_empty(&self, id: QueueId) -> bool {
        self.list(id).is_empty()
    }
}

impl Kernel {
    /// Suspends the current thread on `queue` and arms its private timer
    /// for finite timeouts. The caller releases its own interrupt token
    /// and then reschedules; on hardware the suspended thread resumes
    /// inside that reschedule once woken.
    ///
    /// `Timeout::Poll` never reaches this function; fast-path failures
    /// are reported as `WouldBlock` by the primitives themselves.
    pub(crate) fn waitq_suspend(
        &mut self,
        queue: QueueId,
        timeout: Timeout,
        order: WaitOrder,
    ) -> KernResult<()> {
        debug_assert!(!timeout.is_poll());
        let cur = self.suspend_current()?;
        let index = cur.index() as u16;
        let prio = self.threads.get(cur).unwrap().priority;

        // Find the insertion point: FIFO appends; priority order inserts
        // before the first strictly-less-important waiter.
        let before = match order {
            WaitOrder::Fifo => None,
            WaitOrder::Priority => {
                let mut cursor = self.queues.list(queue).head();
                let mut found = None;
                while let Some(i) = cursor {
                    if prio
                        .is_more_important_than(self.threads.get_at(i).priority)
                    {
                        found = Some(i);
                        break;
                    }
                    cursor = List::next_of(self.threads.links(), i);
                }
                found
            }
        };
        let list = self.queues.list_mut(queue.0);
        match before {
            Some(at) => list.insert_before(self.threads.links_mut(), at, index),
            None => list.push_back(self.threads.links_mut(), index),
        }
        self.threads.get_mut(cur).unwrap().waiting_on = Some(queue.0);

        if let Timeout::Ticks(n) = timeout {
            let timer = self.threads.get(cur).unwrap().timer;
            let now = self.tick;
            self.timers.start_at(timer, now, n, 0)?;
        }
        Ok(())
    }

    /// Pops the head waiter and wakes it with success. Returns the thread
    /// so the caller can decide whether a reschedule is warranted.
    pub(crate) fn waitq_resume_one(
        &mut self,
        queue: QueueId,
    ) -> Option<ThreadId> {
        let head = self.queues.list(queue).head()?;
        let tid = self.threads.id_for(head);
        // The wake unlinks the thread from this queue itself.
        let woken = wake(self, tid, Ok(()));
        debug_assert!(woken);
        Some(tid)
    }

    /// Wakes every waiter with `Destroyed`. Only teardown paths call
    /// this, after their own invariants prove draining is safe.
    pub(crate) fn waitq_drain(&mut self, queue: QueueId) {
        while let Some(head) = self.queues.list(queue).head() {
            let tid = self.threads.id_for(head);
            let woken = wake(self, tid, Err(KernError::Destroyed));
            debug_assert!(woken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ready_thread, run_as, started_kernel};
    use abi::{ThreadState, Timeout};

    // A started kernel (important main thread, so wakeups never preempt
    // the test flow), a claimed queue, and Ready waiter threads at the
    // given priorities.
    fn queue_fixture(prios: &[u8]) -> (Kernel, QueueId, Vec<ThreadId>) {
        let (mut k, _main) = started_kernel(1);
        let q = k.queues.claim().unwrap();
        let ts = prios
            .iter()
            .enumerate()
            .map(|(i, p)| ready_thread(&mut k, &format!("w{i}"), *p))
            .collect();
        (k, q, ts)
    }

    fn park(
        k: &mut Kernel,
        queue: QueueId,
        tid: ThreadId,
        timeout: Timeout,
        order: WaitOrder,
    ) {
        run_as(k, tid, |k| {
            k.waitq_suspend(queue, timeout, order).unwrap();
        });
    }

    fn queue_order(k: &Kernel, q: QueueId) -> Vec<u16> {
        let mut out = Vec::new();
        let mut cur = k.queues.list(q).head();
        while let Some(i) = cur {
            out.push(i);
            cur = List::next_of(k.threads.links(), i);
        }
        out
    }

    fn indices(ts: &[ThreadId]) -> Vec<u16> {
        ts.iter().map(|t| t.index() as u16).collect()
    }

    #[test]
    fn fifo_order_is_arrival_order() {
        let (mut k, q, ts) = queue_fixture(&[5, 3, 7]);
        for t in &ts {
            park(&mut k, q, *t, Timeout::Forever, WaitOrder::Fifo);
        }
        assert_eq!(queue_order(&k, q), indices(&ts));
    }

    #[test]
    fn priority_order_puts_important_waiters_first() {
        let (mut k, q, ts) = queue_fixture(&[5, 3, 7, 3]);
        for t in &ts {
            park(&mut k, q, *t, Timeout::Forever, WaitOrder::Priority);
        }
        // Expected: the two prio-3 waiters in arrival order, then 5,
        // then 7.
        assert_eq!(
            queue_order(&k, q),
            indices(&[ts[1], ts[3], ts[0], ts[2]])
        );
    }

    #[test]
    fn resume_one_pops_the_head_and_makes_it_ready() {
        let (mut k, q, ts) = queue_fixture(&[4, 6]);
        for t in &ts {
            park(&mut k, q, *t, Timeout::Forever, WaitOrder::Priority);
        }
        let woken = k.waitq_resume_one(q).unwrap();
        assert_eq!(woken, ts[0]);
        assert_eq!(k.thread_state(woken).unwrap(), ThreadState::Ready);
        assert_eq!(k.thread_err(woken), Ok(()));
        // The other is still parked.
        assert_eq!(k.thread_state(ts[1]).unwrap(), ThreadState::Suspended);
        assert_eq!(queue_order(&k, q), indices(&[ts[1]]));
    }

    #[test]
    fn drain_wakes_everyone_with_destroyed() {
        let (mut k, q, ts) = queue_fixture(&[4, 6, 2]);
        for t in &ts {
            park(&mut k, q, *t, Timeout::Forever, WaitOrder::Priority);
        }
        k.waitq_drain(q);
        assert!(k.queues.is_empty(q));
        for t in &ts {
            assert_eq!(k.thread_state(*t).unwrap(), ThreadState::Ready);
            assert_eq!(k.thread_err(*t), Err(KernError::Destroyed));
        }
    }

    #[test]
    fn timeout_and_waker_race_produces_exactly_one_outcome() {
        let (mut k, q, ts) = queue_fixture(&[4]);
        let t = ts[0];
        park(&mut k, q, t, Timeout::Ticks(5), WaitOrder::Priority);

        // The timer fires first: the thread leaves the queue with
        // `Timeout` recorded...
        k.clock_inc_tick(5);
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Ready);
        assert_eq!(k.thread_err(t), Err(KernError::Timeout));
        assert!(k.queues.is_empty(q));

        // ...and the late waker finds nobody to wake; the outcome
        // stands.
        assert_eq!(k.waitq_resume_one(q), None);
        assert_eq!(k.thread_err(t), Err(KernError::Timeout));
    }

    #[test]
    fn waker_first_then_timeout_is_equally_single_outcome() {
        let (mut k, q, ts) = queue_fixture(&[4]);
        let t = ts[0];
        park(&mut k, q, t, Timeout::Ticks(5), WaitOrder::Priority);

        // Explicit wake wins; the private timer is disarmed by the
        // wake.
        assert_eq!(k.waitq_resume_one(q), Some(t));
        assert_eq!(k.thread_err(t), Ok(()));

        // A later tick storm must not overwrite the recorded outcome.
        k.clock_inc_tick(100);
        assert_eq!(k.thread_err(t), Ok(()));
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Ready);
    }

    #[test]
    fn wait_queue_and_ready_list_membership_are_mutually_exclusive() {
        let (mut k, q, ts) = queue_fixture(&[4]);
        let t = ts[0];
        // Ready: linked in the ready table, not the queue.
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Ready);
        assert!(k.queues.is_empty(q));

        park(&mut k, q, t, Timeout::Forever, WaitOrder::Fifo);
        // Suspended: linked in the queue; waking moves it back.
        assert_eq!(queue_order(&k, q), indices(&[t]));
        k.thread_resume(t).unwrap();
        assert!(k.queues.is_empty(q));
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Ready);
    }
}
