// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The tick-driven timer engine.
//!
//! Timers live in a fixed arena and are threaded onto a multi-level skip
//! list ordered by absolute deadline, giving amortized logarithmic insert
//! and O(1) next-deadline lookup. A node occupies the bottom `depth`
//! levels, `depth >= 1`, chosen by a deterministic pseudo-random promotion
//! so higher levels stay sparse.
//!
//! Deadline comparisons are wraparound-aware throughout: the tick counter
//! is 32 bits and wraps, so ordering is defined only within
//! [`Tick::MAX_SPAN`] and all distances are computed with wrapping
//! subtraction.
//!
//! Two kinds of owner arm timers here: every thread owns one for wait
//! timeouts (action: wake the thread), and standalone timers run a
//! callback. Callbacks are invoked with the interrupt mask *released*, so
//! a callback may block the thread that called `timer_check` but never an
//! interrupt context.

use abi::{Generation, KernError, KernResult, ObjectType, Tick, ThreadId, TimerId};

use crate::config::{TIMERS_MAX, TIMER_SKIPLIST_LEVELS, TIMER_SKIPLIST_SHIFT};
use crate::kernel::Kernel;
use crate::klog::ktrace;
use crate::list::{Link, List};
use crate::registry::ObjectId;
use crate::{arch, thread};

const LEVELS: usize = TIMER_SKIPLIST_LEVELS;

/// Callback type for standalone timers. Runs outside the interrupt lock;
/// it may start, stop, or even destroy the timer that fired.
pub type TimerHook = fn(&mut Kernel, TimerId, usize);

/// What to do when a timer expires.
#[derive(Copy, Clone, Debug)]
pub(crate) enum TimerAction {
    /// Wake a thread that armed this timer as a wait timeout. The wake is
    /// a guarded transition: if the thread is no longer Suspended the
    /// expiry is a no-op.
    WakeThread(ThreadId),
    /// Run a callback with its argument word.
    Callback { hook: TimerHook, arg: usize },
}

pub(crate) struct Timer {
    pub object: ObjectId,
    /// Number of skip-list levels this node currently occupies (the bottom
    /// `depth` levels). Zero means detached.
    depth: u8,
    pub start: Tick,
    pub limit: Tick,
    /// Re-arm interval in ticks; zero marks a one-shot timer.
    pub period: u32,
    pub active: bool,
    pub action: TimerAction,
}

pub(crate) struct TimerSet {
    slots: [Option<Timer>; TIMERS_MAX],
    gens: [Generation; TIMERS_MAX],
    links: [[Link; TIMERS_MAX]; LEVELS],
    heads: [List; LEVELS],
    /// State of the level-promotion generator; advanced on every insert.
    seed: u32,
}

impl TimerSet {
    pub fn new() -> Self {
        TimerSet {
            slots: core::array::from_fn(|_| None),
            gens: [Generation::ZERO; TIMERS_MAX],
            links: [[Link::default(); TIMERS_MAX]; LEVELS],
            heads: [List::EMPTY; LEVELS],
            seed: 0,
        }
    }

    pub fn claim(
        &mut self,
        object: ObjectId,
        action: TimerAction,
    ) -> KernResult<TimerId> {
        let index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernError::NoMemory)?;
        self.slots[index] = Some(Timer {
            object,
            depth: 0,
            start: Tick(0),
            limit: Tick(0),
            period: 0,
            active: false,
            action,
        });
        Ok(TimerId::for_index_and_gen(index, self.gens[index]))
    }

    /// Retires a slot. The timer must already be detached.
    pub fn release(&mut self, id: TimerId) {
        let index = id.index();
        if let Some(t) = self.get(id) {
            assert_eq!(t.depth, 0);
            self.slots[index] = None;
            self.gens[index] = self.gens[index].next();
        }
    }

    pub fn get(&self, id: TimerId) -> Option<&Timer> {
        let index = id.index();
        if index >= TIMERS_MAX || self.gens[index] != id.generation() {
            return None;
        }
        self.slots[index].as_ref()
    }

    fn limit_of(&self, index: u16) -> Tick {
        self.slots[usize::from(index)].as_ref().unwrap().limit
    }

    /// Per-level insertion points for a node with deadline `limit`: the
    /// node to insert *after*, or `None` for the level head. Ties go after
    /// existing entries, preserving arrival order among equal deadlines.
    fn find_insert_points(&self, limit: Tick) -> [Option<u16>; LEVELS] {
        let mut res = [None; LEVELS];
        let mut pos: Option<u16> = None;
        for level in 0..LEVELS {
            let mut cur = match pos {
                // A node present at some level is present at every level
                // below it, so the descent may continue from `pos`.
                Some(p) => List::next_of(&self.links[level], p),
                None => self.heads[level].head(),
            };
            while let Some(n) = cur {
                let diff = self.limit_of(n).since(limit);
                if diff != 0 && diff < Tick::MAX_SPAN {
                    break; // `n` is strictly later; insert before it
                }
                pos = Some(n);
                cur = List::next_of(&self.links[level], n);
            }
            res[level] = pos;
        }
        res
    }

    fn insert(&mut self, index: u16, now: Tick) {
        let limit = self.limit_of(index);
        let points = self.find_insert_points(limit);

        self.seed = self.seed.wrapping_add(now.0).wrapping_add(1);
        let mut r = self.seed;
        let mut depth = 1usize;
        while depth < LEVELS && (r & ((1 << TIMER_SKIPLIST_SHIFT) - 1)) == 0 {
            depth += 1;
            r >>= TIMER_SKIPLIST_SHIFT;
        }

        for level in (LEVELS - depth)..LEVELS {
            let links = &mut self.links[level];
            match points[level] {
                None => self.heads[level].push_front(links, index),
                Some(after) => match List::next_of(links, after) {
                    Some(next) => {
                        self.heads[level].insert_before(links, next, index)
                    }
                    None => self.heads[level].push_back(links, index),
                },
            }
        }
        self.slots[usize::from(index)].as_mut().unwrap().depth = depth as u8;
    }

    fn detach(&mut self, index: u16) {
        let depth =
            usize::from(self.slots[usize::from(index)].as_ref().unwrap().depth);
        for level in (LEVELS - depth)..LEVELS {
            self.heads[level].remove(&mut self.links[level], index);
        }
        self.slots[usize::from(index)].as_mut().unwrap().depth = 0;
    }

    /// Arms (or re-arms) a timer. A zero duration is equivalent to `stop`.
    /// Removing any existing linkage first makes this safe to call on a
    /// timer in any state.
    pub fn start_at(
        &mut self,
        id: TimerId,
        now: Tick,
        duration: u32,
        period: u32,
    ) -> KernResult<()> {
        if duration >= Tick::MAX_SPAN || period >= Tick::MAX_SPAN {
            return Err(KernError::InvalidArgument);
        }
        let index = id.index() as u16;
        let t = self.get(id).ok_or(KernError::InvalidArgument)?;
        if t.depth != 0 {
            self.detach(index);
        }
        let t = self.slots[id.index()].as_mut().unwrap();
        t.active = false;
        if duration == 0 {
            return Ok(());
        }
        t.start = now;
        t.limit = now.advanced_by(duration);
        t.period = period;
        t.active = true;
        self.insert(index, now);
        ktrace!("timer {} armed for {} ticks", id.0, duration);
        Ok(())
    }

    /// Disarms a timer. Always safe, including on inactive or stale
    /// timers.
    pub fn stop(&mut self, id: TimerId) {
        let Some(t) = self.get(id) else { return };
        if t.depth != 0 {
            self.detach(id.index() as u16);
        }
        self.slots[id.index()].as_mut().unwrap().active = false;
        ktrace!("timer {} stopped", id.0);
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.get(id).map(|t| t.active).unwrap_or(false)
    }

    /// Earliest armed deadline, for tickless-idle sleep hints.
    pub fn next_deadline(&self) -> Option<Tick> {
        self.heads[LEVELS - 1].head().map(|i| self.limit_of(i))
    }

    /// Detaches and returns the earliest timer whose deadline has passed.
    /// One-shot timers are marked inactive here; periodic timers stay
    /// active and are re-armed by [`TimerSet::rearm_if_periodic`] after
    /// their action has run.
    pub fn take_expired(&mut self, now: Tick) -> Option<(TimerId, TimerAction)> {
        let index = self.heads[LEVELS - 1].head()?;
        let t = self.slots[usize::from(index)].as_ref().unwrap();
        if !t.limit.is_reached_by(now) {
            return None;
        }
        let id = TimerId::for_index_and_gen(
            usize::from(index),
            self.gens[usize::from(index)],
        );
        let action = t.action;
        self.detach(index);
        let t = self.slots[usize::from(index)].as_mut().unwrap();
        if t.period == 0 {
            t.active = false;
        }
        Some((id, action))
    }

    /// Re-arms a periodic timer relative to its previous deadline, which
    /// keeps the period drift-free no matter how late the expiry was
    /// processed. Skipped if the action already restarted, stopped, or
    /// destroyed the timer.
    pub fn rearm_if_periodic(&mut self, id: TimerId, now: Tick) {
        let Some(t) = self.get(id) else { return };
        if !t.active || t.period == 0 || t.depth != 0 {
            return;
        }
        let t = self.slots[id.index()].as_mut().unwrap();
        t.start = t.limit;
        t.limit = t.start.advanced_by(t.period);
        self.insert(id.index() as u16, now);
    }
}

impl Kernel {
    /// Initializes a standalone timer with caller-supplied identity. The
    /// timer starts disarmed.
    pub fn timer_init(
        &mut self,
        name: &str,
        hook: TimerHook,
        arg: usize,
    ) -> KernResult<TimerId> {
        self.timer_setup(name, hook, arg, false)
    }

    /// As [`Kernel::timer_init`], but marks the object as kernel-created.
    pub fn timer_create(
        &mut self,
        name: &str,
        hook: TimerHook,
        arg: usize,
    ) -> KernResult<TimerId> {
        self.timer_setup(name, hook, arg, true)
    }

    fn timer_setup(
        &mut self,
        name: &str,
        hook: TimerHook,
        arg: usize,
        created: bool,
    ) -> KernResult<TimerId> {
        let object = self.registry.register(ObjectType::Timer, name, created)?;
        match self
            .timers
            .claim(object, TimerAction::Callback { hook, arg })
        {
            Ok(id) => Ok(id),
            Err(e) => {
                self.registry.release(object);
                Err(e)
            }
        }
    }

    /// Stops and retires a timer.
    pub fn timer_deinit(&mut self, id: TimerId) -> KernResult<()> {
        let object = self.timers.get(id).ok_or(KernError::InvalidArgument)?.object;
        self.timers.stop(id);
        self.timers.release(id);
        self.registry.release(object);
        Ok(())
    }

    /// Alias of [`Kernel::timer_deinit`] for kernel-created timers.
    pub fn timer_destroy(&mut self, id: TimerId) -> KernResult<()> {
        self.timer_deinit(id)
    }

    /// Arms `id` to fire `duration` ticks from now, then every `period`
    /// ticks if `period` is non-zero.
    pub fn timer_start(
        &mut self,
        id: TimerId,
        duration: u32,
        period: u32,
    ) -> KernResult<()> {
        let token = arch::interrupt_lock();
        let now = self.tick;
        let r = self.timers.start_at(id, now, duration, period);
        arch::interrupt_restore(token);
        r
    }

    /// Disarms `id`. Safe on inactive timers.
    pub fn timer_stop(&mut self, id: TimerId) {
        let token = arch::interrupt_lock();
        self.timers.stop(id);
        arch::interrupt_restore(token);
    }

    pub fn timer_is_active(&self, id: TimerId) -> bool {
        self.timers.is_active(id)
    }

    /// Earliest armed deadline across all timers.
    pub fn timer_next_deadline(&self) -> Option<Tick> {
        self.timers.next_deadline()
    }

    /// Pops every expired timer and runs its action.
    ///
    /// The arena walk happens under the interrupt lock, but each action
    /// runs with the lock released: a callback may therefore block the
    /// calling thread, and a wait-timeout wake may trigger a reschedule.
    pub fn timer_check(&mut self) {
        loop {
            let token = arch::interrupt_lock();
            let expired = self.timers.take_expired(self.tick);
            arch::interrupt_restore(token);

            let Some((id, action)) = expired else { break };
            ktrace!("timer {} fired", id.0);
            match action {
                TimerAction::WakeThread(tid) => {
                    if thread::wake(self, tid, Err(KernError::Timeout)) {
                        self.reschedule();
                    }
                }
                TimerAction::Callback { hook, arg } => hook(self, id, arg),
            }

            let token = arch::interrupt_lock();
            let now = self.tick;
            self.timers.rearm_if_periodic(id, now);
            arch::interrupt_restore(token);
        }
    }
}
