// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event flag group.
//!
//! A single mask register. Waiters declare a mask and a mode (AND = all
//! bits, OR = any bit) and suspend in priority order until the register
//! satisfies them. `set` re-evaluates waiters in arrival order and wakes
//! the first satisfied one, consuming that waiter's matched bits unless
//! it asked `NO_CLEAR`. `clear` only removes bits; it never wakes
//! anyone.

use abi::{EventOptions, KernError, KernResult, ObjectType, Timeout};

use crate::arch;
use crate::kernel::Kernel;
use crate::list::List;
use crate::registry::ObjectId;
use crate::waitq::{QueueId, WaitOrder};

#[cfg(any(feature = "alloc", test))]
use alloc::boxed::Box;

pub struct Event {
    object: ObjectId,
    queue: QueueId,
    value: u32,
}

impl Event {
    pub fn init(kernel: &mut Kernel, name: &str) -> KernResult<Event> {
        Self::setup(kernel, name, false)
    }

    #[cfg(any(feature = "alloc", test))]
    pub fn create(kernel: &mut Kernel, name: &str) -> KernResult<Box<Event>> {
        Ok(Box::new(Self::setup(kernel, name, true)?))
    }

    fn setup(
        kernel: &mut Kernel,
        name: &str,
        created: bool,
    ) -> KernResult<Event> {
        let object =
            kernel.registry.register(ObjectType::Event, name, created)?;
        let queue = match kernel.queues.claim() {
            Ok(q) => q,
            Err(e) => {
                kernel.registry.release(object);
                return Err(e);
            }
        };
        Ok(Event { object, queue, value: 0 })
    }

    /// Tears the group down; pending waiters wake with `Destroyed`.
    pub fn deinit(self, kernel: &mut Kernel) {
        kernel.waitq_drain(self.queue);
        kernel.queues.release(self.queue);
        kernel.registry.release(self.object);
    }

    /// Waits until the register satisfies `mask` under `opts`, returning
    /// the matched bits. Satisfied bits are consumed unless `NO_CLEAR`
    /// was requested.
    pub fn wait(
        &mut self,
        kernel: &mut Kernel,
        mask: u32,
        opts: EventOptions,
        timeout: Timeout,
    ) -> KernResult<u32> {
        opts.validate()?;
        if mask == 0 {
            return Err(KernError::InvalidArgument);
        }

        let token = arch::interrupt_lock();
        if Self::satisfies(self.value, mask, opts) {
            let got = self.value & mask;
            if !opts.contains(EventOptions::NO_CLEAR) {
                self.value &= !mask;
            }
            if let Some(cur) = kernel.current_thread() {
                let t = kernel.threads.get_mut(cur).unwrap();
                t.event_mask = got;
                t.event_opts = opts;
            }
            arch::interrupt_restore(token);
            return Ok(got);
        }
        if timeout.is_poll() {
            arch::interrupt_restore(token);
            return Err(KernError::WouldBlock);
        }

        let Some(cur) = kernel.current_thread() else {
            arch::interrupt_restore(token);
            return Err(KernError::Fault);
        };
        {
            let t = kernel.threads.get_mut(cur).unwrap();
            t.event_mask = mask;
            t.event_opts = opts;
        }
        let r = kernel.waitq_suspend(self.queue, timeout, WaitOrder::Priority);
        arch::interrupt_restore(token);
        r?;
        kernel.reschedule();

        kernel.thread_err(cur)?;
        // The satisfied bits were recorded in the thread's event mask by
        // the `set` that woke us.
        Ok(kernel.threads.get(cur).unwrap().event_mask)
    }

    /// ORs bits into the register, then scans waiters in arrival order
    /// and wakes the first whose condition is now satisfied.
    pub fn set(&mut self, kernel: &mut Kernel, mask: u32) -> KernResult<()> {
        let token = arch::interrupt_lock();
        self.value |= mask;

        // Find the first satisfied waiter.
        let mut hit = None;
        let mut cursor = kernel.queues.list(self.queue).head();
        while let Some(i) = cursor {
            let t = kernel.threads.get_at(i);
            if Self::satisfies(self.value, t.event_mask, t.event_opts) {
                hit = Some(i);
                break;
            }
            cursor = List::next_of(kernel.threads.links(), i);
        }

        if let Some(i) = hit {
            let tid = kernel.threads.id_for(i);
            let (wmask, wopts) = {
                let t = kernel.threads.get_at(i);
                (t.event_mask, t.event_opts)
            };
            let matched = if wopts.contains(EventOptions::AND) {
                wmask
            } else {
                wmask & self.value
            };
            if !wopts.contains(EventOptions::NO_CLEAR) {
                self.value &= !matched;
            }
            kernel.threads.get_mut(tid).unwrap().event_mask = matched;
            let woken = crate::thread::wake(kernel, tid, Ok(()));
            debug_assert!(woken);
            arch::interrupt_restore(token);
            kernel.reschedule();
        } else {
            arch::interrupt_restore(token);
        }
        Ok(())
    }

    /// ANDs bits off the register. Never wakes anyone.
    pub fn clear(&mut self, mask: u32) {
        let token = arch::interrupt_lock();
        self.value &= !mask;
        arch::interrupt_restore(token);
    }

    /// Current register value.
    pub fn value(&self) -> u32 {
        self.value
    }

    fn satisfies(value: u32, mask: u32, opts: EventOptions) -> bool {
        if opts.contains(EventOptions::AND) {
            value & mask == mask
        } else {
            value & mask != 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ready_thread, run_as, started_kernel};
    use abi::ThreadState;

    const BIT0: u32 = 1 << 0;
    const BIT1: u32 = 1 << 1;

    #[test]
    fn and_wait_needs_every_bit() {
        let (mut k, _main) = started_kernel(5);
        let mut ev = Event::init(&mut k, "ev").unwrap();

        let t = ready_thread(&mut k, "w", 6);
        run_as(&mut k, t, |k| {
            ev.wait(k, BIT0 | BIT1, EventOptions::AND, Timeout::Forever)
                .unwrap();
        });
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);

        // One bit is a partial match: no wake.
        ev.set(&mut k, BIT0).unwrap();
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);

        // The second bit completes the conjunction.
        ev.set(&mut k, BIT1).unwrap();
        assert_ne!(k.thread_state(t).unwrap(), ThreadState::Suspended);
        assert_eq!(k.threads.get(t).unwrap().event_mask, BIT0 | BIT1);
        // Matched bits were consumed.
        assert_eq!(ev.value(), 0);
    }

    #[test]
    fn or_wait_succeeds_on_the_first_matching_bit() {
        let (mut k, _main) = started_kernel(5);
        let mut ev = Event::init(&mut k, "ev").unwrap();

        let t = ready_thread(&mut k, "w", 6);
        run_as(&mut k, t, |k| {
            ev.wait(k, BIT0 | BIT1, EventOptions::OR, Timeout::Forever)
                .unwrap();
        });
        ev.set(&mut k, BIT1).unwrap();
        assert_ne!(k.thread_state(t).unwrap(), ThreadState::Suspended);
        assert_eq!(k.threads.get(t).unwrap().event_mask, BIT1);
    }

    #[test]
    fn immediate_success_when_bits_are_already_set() {
        let (mut k, _t) = started_kernel(5);
        let mut ev = Event::init(&mut k, "ev").unwrap();
        ev.set(&mut k, BIT0 | BIT1).unwrap();

        let got = ev
            .wait(&mut k, BIT0, EventOptions::OR, Timeout::Poll)
            .unwrap();
        assert_eq!(got, BIT0);
        // BIT0 consumed, BIT1 untouched.
        assert_eq!(ev.value(), BIT1);
    }

    #[test]
    fn no_clear_leaves_the_register_intact() {
        let (mut k, _t) = started_kernel(5);
        let mut ev = Event::init(&mut k, "ev").unwrap();
        ev.set(&mut k, BIT0).unwrap();

        let got = ev
            .wait(
                &mut k,
                BIT0,
                EventOptions::OR | EventOptions::NO_CLEAR,
                Timeout::Poll,
            )
            .unwrap();
        assert_eq!(got, BIT0);
        assert_eq!(ev.value(), BIT0);
    }

    #[test]
    fn set_wakes_only_the_first_satisfied_waiter() {
        let (mut k, _main) = started_kernel(5);
        let mut ev = Event::init(&mut k, "ev").unwrap();

        // Both waiters want BIT0; arrival order a then b (equal
        // priority, so the queue keeps arrival order).
        let a = ready_thread(&mut k, "a", 6);
        let b = ready_thread(&mut k, "b", 6);
        for t in [a, b] {
            run_as(&mut k, t, |k| {
                ev.wait(k, BIT0, EventOptions::OR, Timeout::Forever).unwrap();
            });
        }

        ev.set(&mut k, BIT0).unwrap();
        assert_ne!(k.thread_state(a).unwrap(), ThreadState::Suspended);
        // The bit was consumed by `a`; `b` keeps waiting.
        assert_eq!(k.thread_state(b).unwrap(), ThreadState::Suspended);
        assert_eq!(ev.value(), 0);
    }

    #[test]
    fn unsatisfied_waiter_is_skipped_for_a_later_match() {
        let (mut k, _main) = started_kernel(5);
        let mut ev = Event::init(&mut k, "ev").unwrap();

        // First in line wants both bits; second wants only BIT0.
        let fussy = ready_thread(&mut k, "fussy", 6);
        let easy = ready_thread(&mut k, "easy", 6);
        run_as(&mut k, fussy, |k| {
            ev.wait(k, BIT0 | BIT1, EventOptions::AND, Timeout::Forever)
                .unwrap();
        });
        run_as(&mut k, easy, |k| {
            ev.wait(k, BIT0, EventOptions::OR, Timeout::Forever).unwrap();
        });

        ev.set(&mut k, BIT0).unwrap();
        assert_eq!(k.thread_state(fussy).unwrap(), ThreadState::Suspended);
        assert_ne!(k.thread_state(easy).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn clear_never_wakes() {
        let (mut k, _main) = started_kernel(5);
        let mut ev = Event::init(&mut k, "ev").unwrap();
        let t = ready_thread(&mut k, "w", 6);
        run_as(&mut k, t, |k| {
            ev.wait(k, BIT0, EventOptions::OR, Timeout::Forever).unwrap();
        });
        ev.clear(!0);
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn conflicting_or_missing_modes_are_invalid() {
        let (mut k, _t) = started_kernel(5);
        let mut ev = Event::init(&mut k, "ev").unwrap();
        assert_eq!(
            ev.wait(
                &mut k,
                BIT0,
                EventOptions::AND | EventOptions::OR,
                Timeout::Poll
            ),
            Err(KernError::InvalidArgument)
        );
        assert_eq!(
            ev.wait(&mut k, 0, EventOptions::OR, Timeout::Poll),
            Err(KernError::InvalidArgument)
        );
    }
}
