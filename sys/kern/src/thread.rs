// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread records and the thread lifecycle state machine.
//!
//! Threads live in a fixed arena addressed by generation-checked
//! [`ThreadId`]s. Legal transitions:
//!
//! ```text
//! Inactive --startup--> Ready <--scheduler--> Running
//! Ready/Running --suspend/block--> Suspended --wake--> Ready
//! Running --exit/destroy--> Terminated (irreversible, queued for reaping)
//! ```
//!
//! A terminated thread parks on the defunct list until
//! [`Kernel::idle_sweep`] reclaims its registry slot and stack from idle
//! context -- a thread never frees the stack it is still executing on.
//!
//! The timeout/wake race is resolved in exactly one place: [`wake`] is a
//! compare-and-transition guarded on `Suspended`. Whichever of the
//! explicit waker and the timeout fires second finds the thread no longer
//! Suspended and becomes a no-op, so a waiter observes exactly one
//! outcome.

use abi::{
    EventOptions, Generation, KernError, KernResult, ObjectType, Priority,
    ThreadId, ThreadState, Timeout, TimerId, NUM_PRIORITIES,
};

use crate::arch;
use crate::config::THREADS_MAX;
use crate::kernel::Kernel;
use crate::klog::ktrace;
use crate::list::Link;
use crate::registry::ObjectId;
use crate::timer::TimerAction;

#[cfg(any(feature = "alloc", test))]
use alloc::{boxed::Box, vec};

/// Backing storage for kernel-created thread stacks, dropped by the
/// reaper. In builds without an allocator this collapses to nothing.
#[cfg(any(feature = "alloc", test))]
type OwnedStack = Option<Box<[u8]>>;
#[cfg(not(any(feature = "alloc", test)))]
type OwnedStack = ();

/// A thread record.
pub(crate) struct Thread {
    pub object: ObjectId,
    pub entry: fn(usize),
    pub arg: usize,
    pub stack_base: usize,
    pub stack_size: usize,
    /// Held only so the reaper frees it with the record.
    pub _stack_owned: OwnedStack,
    pub stack_ptr: usize,
    pub init_priority: Priority,
    pub priority: Priority,
    pub state: ThreadState,
    /// Set by yield/slice exhaustion; consumed by the next reschedule.
    pub yielded: bool,
    pub slice_reload: u32,
    pub slice_left: u32,
    /// Private timer, armed only for wait timeouts and delays.
    pub timer: TimerId,
    /// Wake-reason slot: the waker (or timeout, or drain) writes the
    /// outcome the suspended thread observes when it resumes.
    pub err: KernResult<()>,
    /// The wait queue this thread is linked in while Suspended, if any.
    pub waiting_on: Option<u16>,
    pub event_mask: u32,
    pub event_opts: EventOptions,
}

pub(crate) struct ThreadTable {
    slots: [Option<Thread>; THREADS_MAX],
    gens: [Generation; THREADS_MAX],
    links: [Link; THREADS_MAX],
}

impl ThreadTable {
    pub fn new() -> Self {
        ThreadTable {
            slots: core::array::from_fn(|_| None),
            gens: [Generation::ZERO; THREADS_MAX],
            links: [Link::default(); THREADS_MAX],
        }
    }

    pub fn claim(&mut self) -> KernResult<usize> {
        self.slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernError::NoMemory)
    }

    pub fn id_for(&self, index: u16) -> ThreadId {
        ThreadId::for_index_and_gen(
            usize::from(index),
            self.gens[usize::from(index)],
        )
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        let index = id.index();
        if index >= THREADS_MAX || self.gens[index] != id.generation() {
            return None;
        }
        self.slots[index].as_ref()
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        let index = id.index();
        if index >= THREADS_MAX || self.gens[index] != id.generation() {
            return None;
        }
        self.slots[index].as_mut()
    }

    /// Access by raw index; the slot must be live.
    pub fn get_at(&self, index: u16) -> &Thread {
        self.slots[usize::from(index)].as_ref().unwrap()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut [Link] {
        &mut self.links
    }

    /// Indices of all live slots.
    pub fn iter_live(&self) -> impl Iterator<Item = u16> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as u16)
    }

    /// Disjoint mutable access to two live slots, for the context switch.
    pub fn pair_mut(
        &mut self,
        a: usize,
        b: usize,
    ) -> (&mut Thread, &mut Thread) {
        assert!(a != b);
        if a < b {
            let (lo, hi) = self.slots.split_at_mut(b);
            (lo[a].as_mut().unwrap(), hi[0].as_mut().unwrap())
        } else {
            let (lo, hi) = self.slots.split_at_mut(a);
            (hi[0].as_mut().unwrap(), lo[b].as_mut().unwrap())
        }
    }

    pub fn install(&mut self, index: usize, thread: Thread) {
        assert!(self.slots[index].is_none());
        self.slots[index] = Some(thread);
    }

    /// Drops the slot (releasing any owned stack) and bumps its
    /// generation so stale handles are detectable.
    pub fn retire(&mut self, index: usize) {
        assert!(self.slots[index].is_some());
        self.slots[index] = None;
        self.gens[index] = self.gens[index].next();
    }
}

/// Wakes a suspended thread with the given outcome. This is the single
/// transition both explicit wakers and the timeout path go through; if the
/// thread is not Suspended (the other party won the race, or the handle is
/// stale) nothing happens and `false` is returned.
pub(crate) fn wake(
    kernel: &mut Kernel,
    tid: ThreadId,
    outcome: KernResult<()>,
) -> bool {
    let token = arch::interrupt_lock();
    let eligible = matches!(
        kernel.threads.get(tid),
        Some(t) if t.state == ThreadState::Suspended
    );
    if eligible {
        let index = tid.index() as u16;
        let (timer, queue, prio) = {
            let t = kernel.threads.get_mut(tid).unwrap();
            t.err = outcome;
            t.state = ThreadState::Ready;
            (t.timer, t.waiting_on.take(), t.priority)
        };
        if let Some(q) = queue {
            kernel
                .queues
                .list_mut(q)
                .remove(kernel.threads.links_mut(), index);
        }
        kernel.timers.stop(timer);
        kernel
            .sched
            .insert(kernel.threads.links_mut(), index, prio, false);
        ktrace!("thread {} woken", tid.0);
    }
    arch::interrupt_restore(token);
    eligible
}

/// Trap handed to the port as the address a thread "returns" to if its
/// entry function falls off the end without the port trampoline routing it
/// into [`Kernel::thread_exit`]. Reaching it is a port bug.
pub fn exit_trap() {
    panic!("thread returned past exit");
}

impl Kernel {
    /// Initializes a thread over a caller-supplied stack. The thread
    /// starts Inactive; nothing is allocated.
    pub fn thread_init(
        &mut self,
        name: &str,
        entry: fn(usize),
        arg: usize,
        stack: &'static mut [u8],
        priority: Priority,
        slice_ticks: u32,
    ) -> KernResult<ThreadId> {
        let base = stack.as_ptr() as usize;
        let size = stack.len();
        self.thread_setup(
            name,
            entry,
            arg,
            base,
            size,
            priority,
            slice_ticks,
            false,
            OwnedStack::default(),
        )
    }

    /// As [`Kernel::thread_init`], but the kernel allocates the stack and
    /// frees it when the thread is reaped.
    #[cfg(any(feature = "alloc", test))]
    pub fn thread_create(
        &mut self,
        name: &str,
        entry: fn(usize),
        arg: usize,
        stack_size: usize,
        priority: Priority,
        slice_ticks: u32,
    ) -> KernResult<ThreadId> {
        let stack = vec![0u8; stack_size].into_boxed_slice();
        let base = stack.as_ptr() as usize;
        self.thread_setup(
            name,
            entry,
            arg,
            base,
            stack_size,
            priority,
            slice_ticks,
            true,
            Some(stack),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn thread_setup(
        &mut self,
        name: &str,
        entry: fn(usize),
        arg: usize,
        stack_base: usize,
        stack_size: usize,
        priority: Priority,
        slice_ticks: u32,
        created: bool,
        stack_owned: OwnedStack,
    ) -> KernResult<ThreadId> {
        if usize::from(priority.0) >= NUM_PRIORITIES
            || slice_ticks == 0
            || stack_size == 0
        {
            return Err(KernError::InvalidArgument);
        }

        let object =
            self.registry.register(ObjectType::Thread, name, created)?;
        let index = match self.threads.claim() {
            Ok(i) => i,
            Err(e) => {
                self.registry.release(object);
                return Err(e);
            }
        };
        let id = self.threads.id_for(index as u16);

        // The thread's private timeout timer carries the thread's name.
        let timer = match self
            .registry
            .register(ObjectType::Timer, name, created)
            .and_then(|tobj| {
                self.timers
                    .claim(tobj, TimerAction::WakeThread(id))
                    .map_err(|e| {
                        self.registry.release(tobj);
                        e
                    })
            }) {
            Ok(t) => t,
            Err(e) => {
                self.registry.release(object);
                return Err(e);
            }
        };

        let stack_ptr =
            arch::stack_init(stack_base, stack_size, entry, arg, exit_trap);

        self.threads.install(
            index,
            Thread {
                object,
                entry,
                arg,
                stack_base,
                stack_size,
                _stack_owned: stack_owned,
                stack_ptr,
                init_priority: priority,
                priority,
                state: ThreadState::Inactive,
                yielded: false,
                slice_reload: slice_ticks,
                slice_left: slice_ticks,
                timer,
                err: Ok(()),
                waiting_on: None,
                event_mask: 0,
                event_opts: EventOptions::empty(),
            },
        );
        ktrace!("thread {} init", id.0);
        Ok(id)
    }

    /// Makes an Inactive thread Ready.
    pub fn thread_startup(&mut self, id: ThreadId) -> KernResult<()> {
        let token = arch::interrupt_lock();
        let r = (|| {
            let t = self.threads.get(id).ok_or(KernError::InvalidArgument)?;
            if t.state != ThreadState::Inactive {
                return Err(KernError::PermissionDenied);
            }
            let (timer, prio) = (t.timer, t.priority);
            self.timers.stop(timer);
            self.sched.insert(
                self.threads.links_mut(),
                id.index() as u16,
                prio,
                false,
            );
            self.threads.get_mut(id).unwrap().state = ThreadState::Ready;
            Ok(())
        })();
        arch::interrupt_restore(token);

        if r.is_ok() && self.current.is_some() {
            self.reschedule();
        }
        r
    }

    /// Explicitly resumes a Suspended thread. Its wait (if any) completes
    /// with success; a thread in any other state is untouched.
    pub fn thread_resume(&mut self, id: ThreadId) -> KernResult<()> {
        if wake(self, id, Ok(())) {
            Ok(())
        } else {
            Err(KernError::PermissionDenied)
        }
    }

    /// Forcibly suspends a Ready or Running thread. The caller decides
    /// when to reschedule.
    pub fn thread_suspend(&mut self, id: ThreadId) -> KernResult<()> {
        let token = arch::interrupt_lock();
        let r = self.suspend_inner(id);
        arch::interrupt_restore(token);
        r
    }

    fn suspend_inner(&mut self, id: ThreadId) -> KernResult<()> {
        let t = self.threads.get(id).ok_or(KernError::InvalidArgument)?;
        match t.state {
            ThreadState::Ready => {
                let prio = t.priority;
                let timer = t.timer;
                self.timers.stop(timer);
                self.sched.remove(
                    self.threads.links_mut(),
                    id.index() as u16,
                    prio,
                );
            }
            ThreadState::Running => {
                let timer = t.timer;
                self.timers.stop(timer);
            }
            _ => return Err(KernError::PermissionDenied),
        }
        let t = self.threads.get_mut(id).unwrap();
        t.err = Ok(());
        t.state = ThreadState::Suspended;
        t.waiting_on = None;
        ktrace!("thread {} suspended", id.0);
        Ok(())
    }

    /// Suspends the current thread; the backbone of every blocking
    /// operation.
    pub(crate) fn suspend_current(&mut self) -> KernResult<ThreadId> {
        let cur = self.current.ok_or(KernError::Fault)?;
        self.thread_suspend(cur)?;
        Ok(cur)
    }

    /// Changes a thread's current priority, requeueing it if Ready.
    pub fn thread_set_priority(
        &mut self,
        id: ThreadId,
        priority: Priority,
    ) -> KernResult<()> {
        if usize::from(priority.0) >= NUM_PRIORITIES {
            return Err(KernError::InvalidArgument);
        }
        let token = arch::interrupt_lock();
        let r = (|| {
            let t = self.threads.get(id).ok_or(KernError::InvalidArgument)?;
            if t.state == ThreadState::Ready {
                let (old, yielded) = (t.priority, t.yielded);
                self.sched.remove(
                    self.threads.links_mut(),
                    id.index() as u16,
                    old,
                );
                self.threads.get_mut(id).unwrap().priority = priority;
                self.sched.insert(
                    self.threads.links_mut(),
                    id.index() as u16,
                    priority,
                    yielded,
                );
            } else {
                self.threads.get_mut(id).unwrap().priority = priority;
            }
            Ok(())
        })();
        arch::interrupt_restore(token);
        r
    }

    /// Restores a thread's initial priority (e.g. after a priority
    /// inheritance boost).
    pub fn thread_reset_priority(&mut self, id: ThreadId) -> KernResult<()> {
        let init = self
            .threads
            .get(id)
            .ok_or(KernError::InvalidArgument)?
            .init_priority;
        self.thread_set_priority(id, init)
    }

    pub fn thread_state(&self, id: ThreadId) -> KernResult<ThreadState> {
        self.threads
            .get(id)
            .map(|t| t.state)
            .ok_or(KernError::InvalidArgument)
    }

    pub fn thread_priority(&self, id: ThreadId) -> KernResult<Priority> {
        self.threads
            .get(id)
            .map(|t| t.priority)
            .ok_or(KernError::InvalidArgument)
    }

    /// The entry point and argument a thread was set up with, mostly for
    /// diagnostics.
    pub fn thread_entry(&self, id: ThreadId) -> KernResult<(fn(usize), usize)> {
        self.threads
            .get(id)
            .map(|t| (t.entry, t.arg))
            .ok_or(KernError::InvalidArgument)
    }

    /// The thread's wake-reason slot, as written by the last waker.
    pub fn thread_err(&self, id: ThreadId) -> KernResult<()> {
        self.threads.get(id).ok_or(KernError::InvalidArgument)?.err
    }

    /// Blocks the current thread for a while.
    ///
    /// `Poll` is a plain yield; `Ticks(n)` suspends with the private timer
    /// armed; `Forever` suspends until somebody calls
    /// [`Kernel::thread_resume`]. The timer firing is the *expected*
    /// outcome of a delay, so it reports success, not `Timeout`.
    pub fn delay(&mut self, timeout: Timeout) -> KernResult<()> {
        let cur = self.current.ok_or(KernError::Fault)?;
        let token = arch::interrupt_lock();
        let r = (|| match timeout {
            Timeout::Poll => {
                let t = self.threads.get_mut(cur).unwrap();
                t.slice_left = t.slice_reload;
                t.yielded = true;
                Ok(())
            }
            Timeout::Ticks(n) => {
                self.suspend_inner(cur)?;
                let timer = self.threads.get(cur).unwrap().timer;
                let now = self.tick;
                self.timers.start_at(timer, now, n, 0)
            }
            Timeout::Forever => self.suspend_inner(cur),
        })();
        arch::interrupt_restore(token);
        r?;

        self.reschedule();

        let t = self.threads.get_mut(cur).unwrap();
        if t.err == Err(KernError::Timeout) {
            t.err = Ok(());
        }
        t.err
    }

    /// Gives up the rest of the current time slice.
    pub fn yield_now(&mut self) -> KernResult<()> {
        let cur = self.current.ok_or(KernError::Fault)?;
        let token = arch::interrupt_lock();
        let t = self.threads.get_mut(cur).unwrap();
        t.slice_left = t.slice_reload;
        t.yielded = true;
        arch::interrupt_restore(token);
        self.reschedule();
        Ok(())
    }

    /// Terminates the current thread. Ports call this from the entry
    /// trampoline when the entry function returns.
    pub fn thread_exit(&mut self) -> KernResult<()> {
        let cur = self.current.ok_or(KernError::Fault)?;
        self.terminate(cur)?;
        self.reschedule();
        Ok(())
    }

    /// Tears down a thread initialized over caller storage.
    pub fn thread_deinit(&mut self, id: ThreadId) -> KernResult<()> {
        self.terminate(id)?;
        if self.current == Some(id) {
            self.reschedule();
        }
        Ok(())
    }

    /// Tears down a kernel-created thread; its stack is freed by the
    /// reaper.
    pub fn thread_destroy(&mut self, id: ThreadId) -> KernResult<()> {
        self.thread_deinit(id)
    }

    fn terminate(&mut self, id: ThreadId) -> KernResult<()> {
        let token = arch::interrupt_lock();
        let r = (|| {
            let t = self.threads.get(id).ok_or(KernError::InvalidArgument)?;
            if t.state == ThreadState::Terminated {
                return Err(KernError::Busy);
            }
            let (timer, prio, state, queue) =
                (t.timer, t.priority, t.state, t.waiting_on);

            // The private timer dies with the thread.
            let timer_object = self.timers.get(timer).unwrap().object;
            self.timers.stop(timer);
            self.timers.release(timer);
            self.registry.release(timer_object);

            let index = id.index() as u16;
            match state {
                ThreadState::Ready => {
                    self.sched.remove(self.threads.links_mut(), index, prio);
                }
                ThreadState::Suspended => {
                    if let Some(q) = queue {
                        self.queues
                            .list_mut(q)
                            .remove(self.threads.links_mut(), index);
                    }
                }
                _ => {}
            }

            let t = self.threads.get_mut(id).unwrap();
            t.state = ThreadState::Terminated;
            t.waiting_on = None;
            t.yielded = false;
            self.defunct.push_back(self.threads.links_mut(), index);
            ktrace!("thread {} terminated", id.0);
            Ok(())
        })();
        arch::interrupt_restore(token);
        r
    }

    /// Reclaims every defunct thread: registry slot released, owned stack
    /// freed, arena slot retired. Runs from idle context (or a test), not
    /// from an interrupt.
    pub fn idle_sweep(&mut self) {
        loop {
            let token = arch::interrupt_lock();
            let popped = self.defunct.pop_front(self.threads.links_mut());
            arch::interrupt_restore(token);
            let Some(index) = popped else { break };

            let id = self.threads.id_for(index);
            let object = self.threads.get(id).unwrap().object;
            self.registry.release(object);
            self.threads.retire(usize::from(index));
            ktrace!("thread {} reaped", id.0);
        }
    }
}
