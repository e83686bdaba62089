// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded message queue.
//!
//! Fixed-size message slots carved from a caller buffer (`init`) or an
//! owned allocation (`create`), managed by a free list plus FIFO
//! head/tail chains of slot indices. Senders block when the free list is
//! empty, receivers when the FIFO is; each release of a slot wakes
//! exactly one waiter of the complementary queue. The urgent path pushes
//! to the FIFO head instead of the tail and never blocks.

use abi::{KernError, KernResult, ObjectType, Timeout};

use crate::arch;
use crate::config::{align_payload, MSGQUEUE_SLOTS_MAX};
use crate::kernel::Kernel;
use crate::registry::ObjectId;
use crate::waitq::{QueueId, WaitOrder};

use super::Storage;

#[cfg(any(feature = "alloc", test))]
use alloc::{boxed::Box, vec};

pub struct MsgQueue {
    object: ObjectId,
    recv_waiters: QueueId,
    send_waiters: QueueId,
    storage: Storage,
    /// Aligned per-slot payload capacity.
    msg_size: usize,
    slot_count: u16,
    next: [Option<u16>; MSGQUEUE_SLOTS_MAX],
    len_of: [u16; MSGQUEUE_SLOTS_MAX],
    free: Option<u16>,
    head: Option<u16>,
    tail: Option<u16>,
}

impl MsgQueue {
    /// Sets up a queue over a caller-owned buffer. The buffer is carved
    /// into as many `msg_size`-aligned slots as fit, capped at
    /// [`MSGQUEUE_SLOTS_MAX`].
    pub fn init(
        kernel: &mut Kernel,
        name: &str,
        buffer: &'static mut [u8],
        msg_size: usize,
    ) -> KernResult<MsgQueue> {
        Self::setup(kernel, name, Storage::Borrowed(buffer), msg_size, false)
    }

    /// Sets up a queue with kernel-allocated storage for `depth`
    /// messages.
    #[cfg(any(feature = "alloc", test))]
    pub fn create(
        kernel: &mut Kernel,
        name: &str,
        msg_size: usize,
        depth: usize,
    ) -> KernResult<Box<MsgQueue>> {
        if depth == 0 || depth > MSGQUEUE_SLOTS_MAX {
            return Err(KernError::InvalidArgument);
        }
        let buf = vec![0u8; align_payload(msg_size) * depth].into_boxed_slice();
        Ok(Box::new(Self::setup(
            kernel,
            name,
            Storage::Owned(buf),
            msg_size,
            true,
        )?))
    }

    fn setup(
        kernel: &mut Kernel,
        name: &str,
        storage: Storage,
        msg_size: usize,
        created: bool,
    ) -> KernResult<MsgQueue> {
        if msg_size == 0 || msg_size > usize::from(u16::MAX) {
            return Err(KernError::InvalidArgument);
        }
        let slot = align_payload(msg_size);
        let slot_count = (storage.as_slice().len() / slot)
            .min(MSGQUEUE_SLOTS_MAX);
        if slot_count == 0 {
            return Err(KernError::InvalidArgument);
        }

        let object =
            kernel.registry.register(ObjectType::MsgQueue, name, created)?;
        let recv_waiters = match kernel.queues.claim() {
            Ok(q) => q,
            Err(e) => {
                kernel.registry.release(object);
                return Err(e);
            }
        };
        let send_waiters = match kernel.queues.claim() {
            Ok(q) => q,
            Err(e) => {
                kernel.queues.release(recv_waiters);
                kernel.registry.release(object);
                return Err(e);
            }
        };

        let mut q = MsgQueue {
            object,
            recv_waiters,
            send_waiters,
            storage,
            msg_size: slot,
            slot_count: slot_count as u16,
            next: [None; MSGQUEUE_SLOTS_MAX],
            len_of: [0; MSGQUEUE_SLOTS_MAX],
            free: None,
            head: None,
            tail: None,
        };
        for i in (0..q.slot_count).rev() {
            q.next[usize::from(i)] = q.free;
            q.free = Some(i);
        }
        Ok(q)
    }

    /// Tears the queue down; waiting senders and receivers wake with
    /// `Destroyed`.
    pub fn deinit(self, kernel: &mut Kernel) {
        kernel.waitq_drain(self.recv_waiters);
        kernel.waitq_drain(self.send_waiters);
        kernel.queues.release(self.recv_waiters);
        kernel.queues.release(self.send_waiters);
        kernel.registry.release(self.object);
    }

    /// Sends a message, blocking FIFO-ordered while the queue is full.
    pub fn send(
        &mut self,
        kernel: &mut Kernel,
        msg: &[u8],
        timeout: Timeout,
    ) -> KernResult<()> {
        if msg.is_empty() || msg.len() > self.msg_size {
            return Err(KernError::InvalidArgument);
        }

        let started = kernel.tick_count();
        let mut remaining = timeout;
        let mut token = arch::interrupt_lock();
        let slot = loop {
            if let Some(i) = self.pop_free() {
                break i;
            }
            if remaining.is_poll() {
                arch::interrupt_restore(token);
                return Err(KernError::WouldBlock);
            }
            let r = kernel.waitq_suspend(
                self.send_waiters,
                remaining,
                WaitOrder::Fifo,
            );
            arch::interrupt_restore(token);
            r?;
            kernel.reschedule();
            if kernel.current_suspended() {
                // The recording arch left us parked; the harness drives
                // the wakeup. On hardware we only get here once woken.
                return Ok(());
            }
            kernel.current_err()?;
            // Another sender may have taken the freed slot between our
            // wake and our run; charge the elapsed time and retry.
            if let Timeout::Ticks(n) = remaining {
                let elapsed = kernel.tick_count().since(started);
                if elapsed >= n {
                    return Err(KernError::Timeout);
                }
                remaining = Timeout::Ticks(n - elapsed);
            }
            token = arch::interrupt_lock();
        };
        arch::interrupt_restore(token);

        // The slot is exclusively ours; copy the payload with interrupts
        // unmasked.
        self.copy_in(slot, msg);

        let token = arch::interrupt_lock();
        self.fifo_push_tail(slot);
        let wake = !kernel.queues.is_empty(self.recv_waiters);
        if wake {
            kernel.waitq_resume_one(self.recv_waiters);
        }
        arch::interrupt_restore(token);
        if wake {
            kernel.reschedule();
        }
        Ok(())
    }

    /// Sends a message to the *head* of the queue, ahead of everything
    /// already queued. Never blocks: a full queue is `WouldBlock`.
    pub fn urgent(&mut self, kernel: &mut Kernel, msg: &[u8]) -> KernResult<()> {
        if msg.is_empty() || msg.len() > self.msg_size {
            return Err(KernError::InvalidArgument);
        }
        let token = arch::interrupt_lock();
        let Some(slot) = self.pop_free() else {
            arch::interrupt_restore(token);
            return Err(KernError::WouldBlock);
        };
        arch::interrupt_restore(token);

        self.copy_in(slot, msg);

        let token = arch::interrupt_lock();
        self.fifo_push_head(slot);
        let wake = !kernel.queues.is_empty(self.recv_waiters);
        if wake {
            kernel.waitq_resume_one(self.recv_waiters);
        }
        arch::interrupt_restore(token);
        if wake {
            kernel.reschedule();
        }
        Ok(())
    }

    /// Receives the oldest message into `buf`, blocking FIFO-ordered
    /// while the queue is empty. Returns the number of bytes copied.
    pub fn recv(
        &mut self,
        kernel: &mut Kernel,
        buf: &mut [u8],
        timeout: Timeout,
    ) -> KernResult<usize> {
        let started = kernel.tick_count();
        let mut remaining = timeout;
        let mut token = arch::interrupt_lock();
        let slot = loop {
            if let Some(i) = self.fifo_pop_head() {
                break i;
            }
            if remaining.is_poll() {
                arch::interrupt_restore(token);
                return Err(KernError::WouldBlock);
            }
            let r = kernel.waitq_suspend(
                self.recv_waiters,
                remaining,
                WaitOrder::Fifo,
            );
            arch::interrupt_restore(token);
            r?;
            kernel.reschedule();
            if kernel.current_suspended() {
                return Ok(0);
            }
            kernel.current_err()?;
            if let Timeout::Ticks(n) = remaining {
                let elapsed = kernel.tick_count().since(started);
                if elapsed >= n {
                    return Err(KernError::Timeout);
                }
                remaining = Timeout::Ticks(n - elapsed);
            }
            token = arch::interrupt_lock();
        };
        arch::interrupt_restore(token);

        let len = usize::from(self.len_of[usize::from(slot)]).min(buf.len());
        let range = self.payload_range(slot);
        buf[..len].copy_from_slice(&self.storage.as_slice()[range][..len]);

        // Return the slot and hand the free space to one waiting sender.
        let token = arch::interrupt_lock();
        self.push_free(slot);
        let wake = !kernel.queues.is_empty(self.send_waiters);
        if wake {
            kernel.waitq_resume_one(self.send_waiters);
        }
        arch::interrupt_restore(token);
        if wake {
            kernel.reschedule();
        }
        Ok(len)
    }

    /// Per-slot payload capacity (after alignment).
    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Number of queued messages.
    pub fn count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(i) = cur {
            n += 1;
            cur = self.next[usize::from(i)];
        }
        n
    }

    /// Number of free slots.
    pub fn free_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free;
        while let Some(i) = cur {
            n += 1;
            cur = self.next[usize::from(i)];
        }
        n
    }

    fn payload_range(&self, slot: u16) -> core::ops::Range<usize> {
        let base = usize::from(slot) * self.msg_size;
        base..base + self.msg_size
    }

    fn copy_in(&mut self, slot: u16, msg: &[u8]) {
        self.len_of[usize::from(slot)] = msg.len() as u16;
        let range = self.payload_range(slot);
        self.storage.as_mut_slice()[range][..msg.len()].copy_from_slice(msg);
    }

    fn pop_free(&mut self) -> Option<u16> {
        let i = self.free?;
        self.free = self.next[usize::from(i)];
        self.next[usize::from(i)] = None;
        Some(i)
    }

    fn push_free(&mut self, slot: u16) {
        self.next[usize::from(slot)] = self.free;
        self.free = Some(slot);
    }

    fn fifo_push_tail(&mut self, slot: u16) {
        self.next[usize::from(slot)] = None;
        match self.tail {
            Some(t) => self.next[usize::from(t)] = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn fifo_push_head(&mut self, slot: u16) {
        self.next[usize::from(slot)] = self.head;
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn fifo_pop_head(&mut self) -> Option<u16> {
        let i = self.head?;
        self.head = self.next[usize::from(i)];
        if self.head.is_none() {
            self.tail = None;
        }
        self.next[usize::from(i)] = None;
        Some(i)
    }
}
