// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reader/writer lock, composed from a mutex and two condition
//! variables.
//!
//! `readers` counts active readers; -1 marks an active writer. Writers
//! are preferred on release: as long as one is queued, finishing readers
//! signal it and new readers wait.

use abi::{KernError, KernResult, ObjectType, Tick, Timeout};

use crate::kernel::Kernel;
use crate::registry::ObjectId;

use super::{Condition, Mutex};

#[cfg(any(feature = "alloc", test))]
use alloc::boxed::Box;

#[derive(Debug)]
pub struct RwLock {
    object: ObjectId,
    mutex: Mutex,
    read_ok: Condition,
    write_ok: Condition,
    /// Active readers, or -1 while a writer holds the lock.
    readers: i32,
}

impl RwLock {
    pub fn init(kernel: &mut Kernel, name: &str) -> KernResult<RwLock> {
        Self::setup(kernel, name, false)
    }

    #[cfg(any(feature = "alloc", test))]
    pub fn create(kernel: &mut Kernel, name: &str) -> KernResult<Box<RwLock>> {
        Ok(Box::new(Self::setup(kernel, name, true)?))
    }

    fn setup(
        kernel: &mut Kernel,
        name: &str,
        created: bool,
    ) -> KernResult<RwLock> {
        let object =
            kernel.registry.register(ObjectType::RwLock, name, created)?;
        let mutex = match Mutex::init(kernel, name) {
            Ok(m) => m,
            Err(e) => {
                kernel.registry.release(object);
                return Err(e);
            }
        };
        let read_ok = match Condition::init(kernel, name) {
            Ok(c) => c,
            Err(e) => {
                mutex.deinit(kernel);
                kernel.registry.release(object);
                return Err(e);
            }
        };
        let write_ok = match Condition::init(kernel, name) {
            Ok(c) => c,
            Err(e) => {
                // Draining an unused condition cannot be refused.
                let _ = read_ok.deinit(kernel);
                mutex.deinit(kernel);
                kernel.registry.release(object);
                return Err(e);
            }
        };
        Ok(RwLock { object, mutex, read_ok, write_ok, readers: 0 })
    }

    /// Tears the lock down. Refused with `Busy` while it is held or
    /// waiters are queued; handed back for a retry.
    pub fn deinit(self, kernel: &mut Kernel) -> Result<(), (RwLock, KernError)> {
        if self.readers != 0
            || !kernel.queues.is_empty(self.read_ok.queue())
            || !kernel.queues.is_empty(self.write_ok.queue())
        {
            return Err((self, KernError::Busy));
        }
        let RwLock { object, mutex, read_ok, write_ok, .. } = self;
        // Proven idle above, so neither condition can refuse.
        let drained =
            read_ok.deinit(kernel).is_ok() && write_ok.deinit(kernel).is_ok();
        debug_assert!(drained);
        mutex.deinit(kernel);
        kernel.registry.release(object);
        Ok(())
    }

    /// Acquires the lock shared. Blocks while a writer holds it or is
    /// queued.
    pub fn acquire_read(
        &mut self,
        kernel: &mut Kernel,
        timeout: Timeout,
    ) -> KernResult<()> {
        let started = kernel.tick_count();
        self.mutex.acquire(kernel, timeout)?;
        while self.readers < 0
            || !kernel.queues.is_empty(self.write_ok.queue())
        {
            let remaining = remaining_after(timeout, started, kernel.tick_count());
            let Some(remaining) = remaining else {
                self.mutex.release(kernel)?;
                return Err(KernError::Timeout);
            };
            let r = self.read_ok.wait(kernel, &mut self.mutex, remaining);
            if kernel.current_suspended() {
                // Parked by the recording arch; the harness drives the
                // wakeup and retry.
                return r;
            }
            if let Err(e) = r {
                self.mutex.release(kernel)?;
                return Err(e);
            }
        }
        self.readers += 1;
        self.mutex.release(kernel)
    }

    /// Acquires the lock exclusive. Blocks while any reader or writer
    /// holds it.
    pub fn acquire_write(
        &mut self,
        kernel: &mut Kernel,
        timeout: Timeout,
    ) -> KernResult<()> {
        let started = kernel.tick_count();
        self.mutex.acquire(kernel, timeout)?;
        while self.readers != 0 {
            let remaining = remaining_after(timeout, started, kernel.tick_count());
            let Some(remaining) = remaining else {
                self.mutex.release(kernel)?;
                return Err(KernError::Timeout);
            };
            let r = self.write_ok.wait(kernel, &mut self.mutex, remaining);
            if kernel.current_suspended() {
                return r;
            }
            if let Err(e) = r {
                self.mutex.release(kernel)?;
                return Err(e);
            }
        }
        self.readers = -1;
        self.mutex.release(kernel)
    }

    /// Releases one hold, reader or writer. Queued writers are served
    /// before queued readers.
    pub fn release(&mut self, kernel: &mut Kernel) -> KernResult<()> {
        self.mutex.acquire(kernel, Timeout::Forever)?;
        if self.readers > 0 {
            self.readers -= 1;
        } else if self.readers == -1 {
            self.readers = 0;
        }

        if !kernel.queues.is_empty(self.write_ok.queue()) {
            if self.readers == 0 {
                self.write_ok.signal(kernel)?;
            }
        } else if !kernel.queues.is_empty(self.read_ok.queue()) {
            self.read_ok.broadcast(kernel)?;
        }
        self.mutex.release(kernel)
    }

    /// Active reader count, with -1 denoting a writer.
    pub fn holders(&self) -> i32 {
        self.readers
    }
}

/// Time still allowed after `elapsed` ticks of a `timeout`, or `None`
/// when the budget is spent.
fn remaining_after(timeout: Timeout, started: Tick, now: Tick) -> Option<Timeout> {
    match timeout {
        Timeout::Forever => Some(Timeout::Forever),
        Timeout::Poll => Some(Timeout::Poll),
        Timeout::Ticks(n) => {
            let elapsed = now.since(started);
            if elapsed >= n {
                None
            } else {
                Some(Timeout::Ticks(n - elapsed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ready_thread, run_as, started_kernel};
    use abi::ThreadState;

    #[test]
    fn multiple_readers_share_the_lock() {
        let (mut k, _t) = started_kernel(5);
        let mut rw = RwLock::init(&mut k, "rw").unwrap();

        rw.acquire_read(&mut k, Timeout::Forever).unwrap();
        let r2 = ready_thread(&mut k, "r2", 6);
        run_as(&mut k, r2, |k| {
            rw.acquire_read(k, Timeout::Forever).unwrap();
        });
        assert_eq!(rw.holders(), 2);
        assert_ne!(k.thread_state(r2).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn writer_excludes_readers_and_vice_versa() {
        let (mut k, _t) = started_kernel(5);
        let mut rw = RwLock::init(&mut k, "rw").unwrap();

        rw.acquire_write(&mut k, Timeout::Forever).unwrap();
        assert_eq!(rw.holders(), -1);

        let reader = ready_thread(&mut k, "rd", 6);
        run_as(&mut k, reader, |k| {
            let _ = rw.acquire_read(k, Timeout::Forever);
        });
        assert_eq!(k.thread_state(reader).unwrap(), ThreadState::Suspended);

        // Releasing the writer lets the reader side drain.
        rw.release(&mut k).unwrap();
        assert_ne!(k.thread_state(reader).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let (mut k, _t) = started_kernel(5);
        let mut rw = RwLock::init(&mut k, "rw").unwrap();

        rw.acquire_read(&mut k, Timeout::Forever).unwrap();
        let writer = ready_thread(&mut k, "wr", 6);
        run_as(&mut k, writer, |k| {
            let _ = rw.acquire_write(k, Timeout::Forever);
        });
        assert_eq!(k.thread_state(writer).unwrap(), ThreadState::Suspended);

        // A new reader must queue behind the waiting writer.
        let late = ready_thread(&mut k, "late", 6);
        run_as(&mut k, late, |k| {
            let _ = rw.acquire_read(k, Timeout::Forever);
        });
        assert_eq!(k.thread_state(late).unwrap(), ThreadState::Suspended);
    }

    #[test]
    fn deinit_refuses_while_held() {
        let (mut k, _t) = started_kernel(5);
        let mut rw = RwLock::init(&mut k, "rw").unwrap();
        rw.acquire_read(&mut k, Timeout::Forever).unwrap();

        let (mut rw, e) = rw.deinit(&mut k).unwrap_err();
        assert_eq!(e, KernError::Busy);

        rw.release(&mut k).unwrap();
        rw.deinit(&mut k).unwrap();
    }
}
