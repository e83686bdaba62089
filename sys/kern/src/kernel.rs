// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel context: current-thread tracking, the scheduler lock, the
//! reschedule decision point, tick bookkeeping, and defunct-thread
//! reaping.
//!
//! All mutable kernel state lives in one [`Kernel`] value that single-core
//! code threads around as `&mut Kernel`. There are no global variables in
//! the portable core; an SMP port would shard this structure per logical
//! core, which is exactly the extension point the single ready-table set
//! leaves open.

use abi::{KernResult, ObjectType, Priority, ThreadId, ThreadState, Tick};

use crate::arch;
use crate::config::IDLE_SLICE_TICKS;
use crate::klog::ktrace;
use crate::list::List;
use crate::registry::{ObjectId, Registry};
use crate::sched::ReadyTable;
use crate::thread::ThreadTable;
use crate::timer::TimerSet;
use crate::waitq::WaitQueues;

/// The kernel. One of these exists per core; everything the scheduler,
/// timer engine, thread table, and IPC primitives touch hangs off it.
pub struct Kernel {
    pub(crate) threads: ThreadTable,
    pub(crate) timers: TimerSet,
    pub(crate) sched: ReadyTable,
    pub(crate) queues: WaitQueues,
    pub(crate) registry: Registry,
    pub(crate) tick: Tick,
    pub(crate) current: Option<ThreadId>,
    /// Scheduler-lock nesting count. While non-zero, the reschedule
    /// decision point is inert; the deferred reschedule runs when the
    /// count returns to zero.
    lock_nest: u32,
    pub(crate) defunct: List,
    idle: Option<ThreadId>,
}

impl Kernel {
    pub fn new() -> Self {
        Kernel {
            threads: ThreadTable::new(),
            timers: TimerSet::new(),
            sched: ReadyTable::new(),
            queues: WaitQueues::new(),
            registry: Registry::new(),
            tick: Tick(0),
            current: None,
            lock_nest: 0,
            defunct: List::EMPTY,
            idle: None,
        }
    }

    /// Registers and readies the idle thread. Must run once before
    /// [`Kernel::startup`].
    pub fn init(&mut self, idle_stack: &'static mut [u8]) -> KernResult<()> {
        let idle = self.thread_init(
            "idle",
            idle_entry,
            0,
            idle_stack,
            Priority::IDLE,
            IDLE_SLICE_TICKS,
        )?;
        self.idle = Some(idle);
        self.thread_startup(idle)?;
        Ok(())
    }

    /// Dispatches the most important ready thread for the first time. On
    /// hardware this hands the CPU over and does not return; the hosted
    /// arch records the dispatch instead.
    ///
    /// # Panics
    ///
    /// If nothing is ready -- the idle thread at minimum must have been
    /// set up via [`Kernel::init`].
    pub fn startup(&mut self) {
        let Some(first) = self.sched.peek_highest() else {
            panic!("no thread to startup");
        };
        let id = self.threads.id_for(first);
        let prio = self.threads.get(id).unwrap().priority;
        self.sched.remove(self.threads.links_mut(), first, prio);
        self.threads.get_mut(id).unwrap().state = ThreadState::Running;
        self.current = Some(id);
        ktrace!("startup with thread {}", id.0);
        let t = self.threads.get_mut(id).unwrap();
        arch::scheduler_startup(&mut t.stack_ptr);
    }

    /// The thread currently on the CPU, if the kernel has been started.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current
    }

    /// Current value of the kernel tick counter.
    pub fn tick_count(&self) -> Tick {
        self.tick
    }

    /// Enters a scheduler-locked section. Nestable and never blocking.
    pub fn sched_lock(&mut self) {
        let token = arch::interrupt_lock();
        self.lock_nest += 1;
        arch::interrupt_restore(token);
    }

    /// Leaves a scheduler-locked section; when the nesting count returns
    /// to zero the deferred reschedule runs. Underflow is clamped.
    pub fn sched_unlock(&mut self) {
        let token = arch::interrupt_lock();
        self.lock_nest = self.lock_nest.saturating_sub(1);
        let nest = self.lock_nest;
        arch::interrupt_restore(token);
        if nest == 0 {
            self.reschedule();
        }
    }

    /// Current scheduler-lock nesting depth.
    pub fn sched_lock_level(&self) -> u32 {
        self.lock_nest
    }

    /// The reschedule decision point.
    ///
    /// Runs only with the scheduler lock at zero and a current thread
    /// established. The running thread keeps the CPU if it is strictly
    /// more important than the best ready candidate, or equally important
    /// and not yielding; otherwise it is re-queued Ready and the winner is
    /// dequeued, marked Running, checked for stack sanity, and switched
    /// to.
    pub fn reschedule(&mut self) {
        let token = arch::interrupt_lock();
        if self.lock_nest != 0 {
            arch::interrupt_restore(token);
            return;
        }
        let Some(cur_id) = self.current else {
            arch::interrupt_restore(token);
            return;
        };

        let (cur_state, cur_prio, cur_yielded) = {
            let t = self.threads.get(cur_id).unwrap();
            (t.state, t.priority, t.yielded)
        };

        let target = self.sched.peek_highest();
        let running = cur_state == ThreadState::Running;

        let to_idx = match target {
            None if running => {
                // Nothing else is ready; keep going.
                self.threads.get_mut(cur_id).unwrap().yielded = false;
                arch::interrupt_restore(token);
                return;
            }
            None => panic!("no runnable thread"),
            Some(t) => t,
        };

        if running {
            let to_prio = self.threads.get_at(to_idx).priority;
            let keep = cur_prio.is_more_important_than(to_prio)
                || (cur_prio == to_prio && !cur_yielded);
            if keep {
                self.threads.get_mut(cur_id).unwrap().yielded = false;
                arch::interrupt_restore(token);
                return;
            }
            // The current thread loses the CPU but stays eligible. Its
            // yield flag still governs the insertion position, and is
            // consumed by the requeue.
            self.sched.insert(
                self.threads.links_mut(),
                cur_id.index() as u16,
                cur_prio,
                cur_yielded,
            );
            let t = self.threads.get_mut(cur_id).unwrap();
            t.state = ThreadState::Ready;
            t.yielded = false;
        }

        let to_id = self.threads.id_for(to_idx);
        let to_prio = self.threads.get_at(to_idx).priority;
        self.sched.remove(self.threads.links_mut(), to_idx, to_prio);
        self.threads.get_mut(to_id).unwrap().state = ThreadState::Running;

        {
            let t = self.threads.get_at(to_idx);
            if !arch::stack_check(t.stack_ptr, t.stack_base, t.stack_size) {
                panic!("thread {} stack has broken", to_id.0);
            }
        }

        ktrace!("switch to thread {} from {}", to_id.0, cur_id.0);
        self.current = Some(to_id);
        let (from, to) =
            self.threads.pair_mut(cur_id.index(), to_idx as usize);
        arch::context_switch(&mut from.stack_ptr, &mut to.stack_ptr);
        arch::interrupt_restore(token);
    }

    /// Advances kernel time by `ticks`. Called from the tick interrupt.
    ///
    /// Charges the running thread's time slice (slice exhaustion reloads
    /// the slice, sets the yield flag, and forces a reschedule) and then
    /// runs the timer engine.
    pub fn clock_inc_tick(&mut self, ticks: u32) {
        let token = arch::interrupt_lock();
        self.tick = self.tick.advanced_by(ticks);

        let mut slice_expired = false;
        if let Some(cur_id) = self.current {
            let t = self.threads.get_mut(cur_id).unwrap();
            if t.state == ThreadState::Running {
                t.slice_left = t.slice_left.saturating_sub(ticks);
                if t.slice_left == 0 {
                    t.slice_left = t.slice_reload;
                    t.yielded = true;
                    slice_expired = true;
                }
            }
        }
        arch::interrupt_restore(token);

        if slice_expired {
            self.reschedule();
        }
        self.timer_check();
    }

    /// How long the core could sleep right now: the distance to the
    /// earliest timer deadline when only the idle thread is runnable,
    /// zero otherwise. Used by tickless-idle ports.
    pub fn sleep_ticks(&self) -> u32 {
        let only_idle = match self.sched.peek_highest() {
            None => true,
            Some(idx) => Some(self.threads.id_for(idx)) == self.idle,
        };
        if !only_idle {
            return 0;
        }
        match self.timers.next_deadline() {
            Some(deadline) if !deadline.is_reached_by(self.tick) => {
                deadline.since(self.tick)
            }
            Some(_) => 0,
            None => 0,
        }
    }

    /// Credits ticks that elapsed while the core slept with the tick
    /// interrupt off, then lets the timer engine catch up.
    pub fn compensate_tick(&mut self, ticks: u32) {
        let token = arch::interrupt_lock();
        self.tick = self.tick.advanced_by(ticks);
        arch::interrupt_restore(token);
        self.timer_check();
    }

    /// The idle thread's id, once [`Kernel::init`] has run.
    pub fn idle_thread(&self) -> Option<ThreadId> {
        self.idle
    }

    /// Looks up a live object by type and exact name.
    pub fn object_find(
        &self,
        otype: ObjectType,
        name: &str,
    ) -> Option<ObjectId> {
        self.registry.find(otype, name)
    }

    /// Number of live objects of a type.
    pub fn object_count(&self, otype: ObjectType) -> usize {
        self.registry.count(otype)
    }

    /// Name of a live object.
    pub fn object_name(&self, id: ObjectId) -> Option<&str> {
        self.registry.name(id)
    }

    pub(crate) fn current_err(&self) -> KernResult<()> {
        match self.current {
            Some(id) => self.threads.get(id).map(|t| t.err).unwrap_or(Ok(())),
            None => Ok(()),
        }
    }

    pub(crate) fn current_suspended(&self) -> bool {
        self.current
            .and_then(|id| self.threads.get(id))
            .map(|t| t.state == ThreadState::Suspended)
            .unwrap_or(false)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point of the idle thread. Reclamation of defunct threads happens
/// in [`Kernel::idle_sweep`], which a port's idle hook calls with kernel
/// access; the entry itself only sleeps.
fn idle_entry(_arg: usize) {
    loop {
        arch::idle_sleep();
    }
}
