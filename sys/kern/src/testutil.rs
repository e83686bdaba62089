// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the in-crate tests.
//!
//! The hosted arch records context switches instead of taking them, so a
//! test drives the kernel as a plain state machine: it impersonates one
//! thread at a time through [`run_as`] and repairs the current-thread
//! bookkeeping afterwards, the way the real switch path would have.

use abi::{Priority, ThreadId, ThreadState, Timeout};

use crate::kernel::Kernel;
use crate::waitq::{QueueId, WaitOrder};

pub(crate) fn noop_entry(_arg: usize) {}

fn leaked_stack(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

/// A kernel with its idle thread set up.
pub(crate) fn make_kernel() -> Kernel {
    let mut k = Kernel::new();
    k.init(leaked_stack(256)).unwrap();
    k
}

/// Initializes (but does not start) a thread with an 8-tick slice.
pub(crate) fn spawn(k: &mut Kernel, name: &str, prio: u8) -> ThreadId {
    k.thread_init(name, noop_entry, 0, leaked_stack(256), Priority(prio), 8)
        .unwrap()
}

/// Spawns and readies a thread without disturbing whoever is on the CPU,
/// even if the newcomer outranks it.
pub(crate) fn ready_thread(k: &mut Kernel, name: &str, prio: u8) -> ThreadId {
    let keep = k.current_thread();
    let t = spawn(k, name, prio);
    k.thread_startup(t).unwrap();
    restore_current(k, keep);
    t
}

/// A kernel dispatched with one running thread at `prio` (slice 8).
pub(crate) fn started_kernel(prio: u8) -> (Kernel, ThreadId) {
    let mut k = make_kernel();
    let t = spawn(&mut k, "main", prio);
    k.thread_startup(t).unwrap();
    k.startup();
    assert_eq!(k.current_thread(), Some(t));
    (k, t)
}

/// Runs `f` with `tid` impersonating the current thread, then puts the
/// previous current thread back on the CPU. Any thread the intermediate
/// reschedules left marked Running is returned to the ready table.
pub(crate) fn run_as<R>(
    k: &mut Kernel,
    tid: ThreadId,
    f: impl FnOnce(&mut Kernel) -> R,
) -> R {
    let saved = k.current_thread();

    let (state, prio) = {
        let t = k.threads.get(tid).unwrap();
        (t.state, t.priority)
    };
    assert_eq!(state, ThreadState::Ready, "impersonated thread must be Ready");
    k.sched.remove(k.threads.links_mut(), tid.index() as u16, prio);
    k.threads.get_mut(tid).unwrap().state = ThreadState::Running;
    k.current = Some(tid);

    let r = f(k);
    restore_current(k, saved);
    r
}

/// Puts `want` back on the CPU, re-queueing every other thread the
/// recorded switches left in the Running state.
pub(crate) fn restore_current(k: &mut Kernel, want: Option<ThreadId>) {
    let stray: Vec<(u16, Priority)> = k
        .threads
        .iter_live()
        .filter(|&i| {
            let t = k.threads.get_at(i);
            t.state == ThreadState::Running
                && Some(k.threads.id_for(i)) != want
        })
        .map(|i| (i, k.threads.get_at(i).priority))
        .collect();
    for (idx, prio) in stray {
        k.sched.insert(k.threads.links_mut(), idx, prio, false);
        let id = k.threads.id_for(idx);
        k.threads.get_mut(id).unwrap().state = ThreadState::Ready;
    }

    if let Some(c) = want {
        let (state, prio) = {
            let t = k.threads.get(c).unwrap();
            (t.state, t.priority)
        };
        if state == ThreadState::Ready {
            k.sched.remove(k.threads.links_mut(), c.index() as u16, prio);
        }
        k.threads.get_mut(c).unwrap().state = ThreadState::Running;
    }
    k.current = want;
}

impl Kernel {
    /// Parks `tid` on `queue` (waiting forever), as if it had blocked
    /// there itself.
    pub(crate) fn block_thread_on(
        &mut self,
        tid: ThreadId,
        queue: QueueId,
        order: WaitOrder,
    ) {
        run_as(self, tid, |k| {
            k.waitq_suspend(queue, Timeout::Forever, order).unwrap();
        });
    }
}
