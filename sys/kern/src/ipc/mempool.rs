// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-block memory pool.
//!
//! The same freelist-plus-wait-queue discipline as the message queue,
//! minus any ordering concept: blocks are identical and anonymous.
//! `alloc` hands out a block handle, suspending FIFO-ordered while the
//! pool is empty; `free` returns the block and wakes exactly one waiter.

use abi::{KernError, KernResult, ObjectType, Timeout};

use crate::arch;
use crate::config::{align_payload, MEMPOOL_BLOCKS_MAX};
use crate::kernel::Kernel;
use crate::registry::ObjectId;
use crate::waitq::{QueueId, WaitOrder};

use super::Storage;

#[cfg(any(feature = "alloc", test))]
use alloc::{boxed::Box, vec};

/// Handle to an allocated block. Only the pool that produced it can
/// interpret it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockId(u16);

pub struct MemPool {
    object: ObjectId,
    waiters: QueueId,
    storage: Storage,
    /// Aligned block payload size.
    block_size: usize,
    block_count: u16,
    next: [Option<u16>; MEMPOOL_BLOCKS_MAX],
    free: Option<u16>,
}

impl MemPool {
    /// Sets up a pool over a caller-owned buffer, carved into as many
    /// `block_size`-aligned blocks as fit (capped at
    /// [`MEMPOOL_BLOCKS_MAX`]).
    pub fn init(
        kernel: &mut Kernel,
        name: &str,
        buffer: &'static mut [u8],
        block_size: usize,
    ) -> KernResult<MemPool> {
        Self::setup(kernel, name, Storage::Borrowed(buffer), block_size, false)
    }

    /// Sets up a pool with kernel-allocated storage for `count` blocks.
    #[cfg(any(feature = "alloc", test))]
    pub fn create(
        kernel: &mut Kernel,
        name: &str,
        block_size: usize,
        count: usize,
    ) -> KernResult<Box<MemPool>> {
        if count == 0 || count > MEMPOOL_BLOCKS_MAX {
            return Err(KernError::InvalidArgument);
        }
        let buf =
            vec![0u8; align_payload(block_size) * count].into_boxed_slice();
        Ok(Box::new(Self::setup(
            kernel,
            name,
            Storage::Owned(buf),
            block_size,
            true,
        )?))
    }

    fn setup(
        kernel: &mut Kernel,
        name: &str,
        storage: Storage,
        block_size: usize,
        created: bool,
    ) -> KernResult<MemPool> {
        if block_size == 0 {
            return Err(KernError::InvalidArgument);
        }
        let block = align_payload(block_size);
        let block_count =
            (storage.as_slice().len() / block).min(MEMPOOL_BLOCKS_MAX);
        if block_count == 0 {
            return Err(KernError::InvalidArgument);
        }

        let object =
            kernel.registry.register(ObjectType::MemPool, name, created)?;
        let waiters = match kernel.queues.claim() {
            Ok(q) => q,
            Err(e) => {
                kernel.registry.release(object);
                return Err(e);
            }
        };

        let mut pool = MemPool {
            object,
            waiters,
            storage,
            block_size: block,
            block_count: block_count as u16,
            next: [None; MEMPOOL_BLOCKS_MAX],
            free: None,
        };
        for i in (0..pool.block_count).rev() {
            pool.next[usize::from(i)] = pool.free;
            pool.free = Some(i);
        }
        Ok(pool)
    }

    /// Tears the pool down; pending allocators wake with `Destroyed`.
    pub fn deinit(self, kernel: &mut Kernel) {
        kernel.waitq_drain(self.waiters);
        kernel.queues.release(self.waiters);
        kernel.registry.release(self.object);
    }

    /// Takes a block, suspending FIFO-ordered while none is free.
    pub fn alloc(
        &mut self,
        kernel: &mut Kernel,
        timeout: Timeout,
    ) -> KernResult<BlockId> {
        let started = kernel.tick_count();
        let mut remaining = timeout;
        let mut token = arch::interrupt_lock();
        loop {
            if let Some(i) = self.pop_free() {
                arch::interrupt_restore(token);
                return Ok(BlockId(i));
            }
            if remaining.is_poll() {
                arch::interrupt_restore(token);
                return Err(KernError::WouldBlock);
            }
            let r =
                kernel.waitq_suspend(self.waiters, remaining, WaitOrder::Fifo);
            arch::interrupt_restore(token);
            r?;
            kernel.reschedule();
            if kernel.current_suspended() {
                // Parked by the recording arch; on hardware we resume
                // here only after a free (or the timeout) woke us.
                return Err(KernError::WouldBlock);
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
        }
    }

    /// Returns a block to the pool and wakes one waiting allocator.
    /// Freeing a block that is already free (or out of range) is a
    /// caller bug reported as `InvalidArgument`.
    pub fn free(
        &mut self,
        kernel: &mut Kernel,
        block: BlockId,
    ) -> KernResult<()> {
        if block.0 >= self.block_count || self.is_free(block.0) {
            return Err(KernError::InvalidArgument);
        }
        let token = arch::interrupt_lock();
        self.next[usize::from(block.0)] = self.free;
        self.free = Some(block.0);
        let wake = !kernel.queues.is_empty(self.waiters);
        if wake {
            kernel.waitq_resume_one(self.waiters);
        }
        arch::interrupt_restore(token);
        if wake {
            kernel.reschedule();
        }
        Ok(())
    }

    /// Read access to a block's bytes.
    pub fn block(&self, block: BlockId) -> &[u8] {
        let base = usize::from(block.0) * self.block_size;
        &self.storage.as_slice()[base..base + self.block_size]
    }

    /// Write access to a block's bytes.
    pub fn block_mut(&mut self, block: BlockId) -> &mut [u8] {
        let base = usize::from(block.0) * self.block_size;
        let size = self.block_size;
        &mut self.storage.as_mut_slice()[base..base + size]
    }

    /// Aligned block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of free blocks.
    pub fn free_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free;
        while let Some(i) = cur {
            n += 1;
            cur = self.next[usize::from(i)];
        }
        n
    }

    fn pop_free(&mut self) -> Option<u16> {
        let i = self.free?;
        self.free = self.next[usize::from(i)];
        self.next[usize::from(i)] = None;
        Some(i)
    }

    fn is_free(&self, index: u16) -> bool {
        let mut cur = self.free;
        while let Some(i) = cur {
            if i == index {
                return true;
            }
            cur = self.next[usize::from(i)];
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ready_thread, run_as, started_kernel};
    use abi::ThreadState;

    fn fresh_pool(k: &mut Kernel, blocks: usize) -> MemPool {
        let buf =
            Box::leak(vec![0u8; align_payload(16) * blocks].into_boxed_slice());
        MemPool::init(k, "pool", buf, 16).unwrap()
    }

    #[test]
    fn alloc_until_exhausted_then_would_block() {
        let (mut k, _t) = started_kernel(5);
        let mut pool = fresh_pool(&mut k, 2);
        assert_eq!(pool.free_count(), 2);

        let a = pool.alloc(&mut k, Timeout::Poll).unwrap();
        let b = pool.alloc(&mut k, Timeout::Poll).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(
            pool.alloc(&mut k, Timeout::Poll),
            Err(KernError::WouldBlock)
        );

        pool.free(&mut k, a).unwrap();
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn blocks_hold_their_contents() {
        let (mut k, _t) = started_kernel(5);
        let mut pool = fresh_pool(&mut k, 2);
        let a = pool.alloc(&mut k, Timeout::Poll).unwrap();
        pool.block_mut(a)[..4].copy_from_slice(b"data");
        assert_eq!(&pool.block(a)[..4], b"data");
    }

    #[test]
    fn free_wakes_exactly_one_waiter() {
        let (mut k, _main) = started_kernel(5);
        let mut pool = fresh_pool(&mut k, 1);
        let held = pool.alloc(&mut k, Timeout::Poll).unwrap();

        let w0 = ready_thread(&mut k, "w0", 6);
        let w1 = ready_thread(&mut k, "w1", 6);
        for t in [w0, w1] {
            run_as(&mut k, t, |k| {
                let _ = pool.alloc(k, Timeout::Forever);
            });
            assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);
        }

        pool.free(&mut k, held).unwrap();
        // First-come first-served: w0 wakes, w1 keeps waiting.
        assert_ne!(k.thread_state(w0).unwrap(), ThreadState::Suspended);
        assert_eq!(k.thread_state(w1).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn timed_alloc_times_out() {
        let (mut k, t) = started_kernel(5);
        let mut pool = fresh_pool(&mut k, 1);
        let _held = pool.alloc(&mut k, Timeout::Poll).unwrap();

        let _ = pool.alloc(&mut k, Timeout::Ticks(4));
        assert_eq!(k.thread_state(t).unwrap(), ThreadState::Suspended);
        k.clock_inc_tick(4);
        assert_eq!(k.thread_err(t), Err(KernError::Timeout));
    }

    #[test]
    fn double_free_is_rejected() {
        let (mut k, _t) = started_kernel(5);
        let mut pool = fresh_pool(&mut k, 2);
        let a = pool.alloc(&mut k, Timeout::Poll).unwrap();
        pool.free(&mut k, a).unwrap();
        assert_eq!(pool.free(&mut k, a), Err(KernError::InvalidArgument));
    }

    #[test]
    fn created_pool_reports_sizes() {
        let (mut k, _t) = started_kernel(5);
        let pool = MemPool::create(&mut k, "dyn", 24, 3).unwrap();
        assert_eq!(pool.block_size(), align_payload(24));
        assert_eq!(pool.free_count(), 3);
    }
}
