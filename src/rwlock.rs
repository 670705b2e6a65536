//! A writer-preferring readers-writer lock.
//!
//! The lock is built from a mutex protecting a handful of counters and a single condition
//! variable on which both readers and writers park.
//!
//! # Fairness
//!
//! Readers are admitted only when no writer holds the lock *and* no writer is waiting for it. As
//! such, a writer arriving while readers are active will block new readers and acquire the lock as
//! soon as the active readers are gone, rather than being overtaken forever by fresh readers.
//!
//! # Re-entrancy
//!
//! The lock is not re-entrant. Acquiring it in any mode while already holding it on the same thread
//! may deadlock (a read lock can block on a writer which waits for the very same thread). Upgrading
//! goes through unlocking and relocking.

use std::cell::UnsafeCell;
use std::ops;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use error::Error;

/// The bookkeeping of the lock.
#[derive(Default)]
struct State {
    /// The number of readers holding the lock.
    readers: usize,
    /// Is the lock held by a writer?
    writer: bool,
    /// The number of readers blocked in acquisition.
    waiting_readers: usize,
    /// The number of writers blocked in acquisition.
    waiting_writers: usize,
}

impl State {
    /// Can a reader enter now?
    fn can_read(&self) -> bool {
        !self.writer && self.waiting_writers == 0
    }

    /// Can a writer enter now?
    fn can_write(&self) -> bool {
        !self.writer && self.readers == 0
    }

    /// The number of blocked threads.
    fn waiters(&self) -> usize {
        self.waiting_readers + self.waiting_writers
    }
}

/// A readers-writer lock.
///
/// This allows either any number of readers or a single writer to access the inner data. Unlike
/// `std::sync::RwLock`, the acquisition policy is fixed: waiting writers take precedence over new
/// readers. Acquisition can be bounded by a timeout.
pub struct RwLock<T> {
    /// The counters.
    state: Mutex<State>,
    /// The condition variable on which blocked readers and writers park.
    cond: Condvar,
    /// The protected data.
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Create a new unlocked lock.
    pub fn new(data: T) -> RwLock<T> {
        RwLock {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock in shared mode.
    ///
    /// This blocks while a writer holds or waits for the lock.
    pub fn read(&self) -> ReadGuard<T> {
        let mut state = self.state.lock();

        if !state.can_read() {
            state.waiting_readers += 1;
            while !state.can_read() {
                self.cond.wait(&mut state);
            }
            state.waiting_readers -= 1;
        }

        state.readers += 1;
        ReadGuard { lock: self }
    }

    /// Acquire the lock in shared mode, giving up after `timeout`.
    pub fn read_timeout(&self, timeout: Duration) -> Result<ReadGuard<T>, Error> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.read_until(deadline),
            // A deadline this far out is no deadline.
            None => Ok(self.read()),
        }
    }

    /// Acquire the lock in shared mode, giving up at `deadline`.
    pub fn read_until(&self, deadline: Instant) -> Result<ReadGuard<T>, Error> {
        let mut state = self.state.lock();

        if !state.can_read() {
            state.waiting_readers += 1;
            let acquired = self.park_until(&mut state, deadline, |state| !state.can_read());
            state.waiting_readers -= 1;

            if !acquired {
                return Err(Error::Timeout);
            }
        }

        state.readers += 1;
        Ok(ReadGuard { lock: self })
    }

    /// Acquire the lock in exclusive mode.
    ///
    /// This blocks while any reader or writer holds the lock.
    pub fn write(&self) -> WriteGuard<T> {
        let mut state = self.state.lock();

        if !state.can_write() {
            state.waiting_writers += 1;
            while !state.can_write() {
                self.cond.wait(&mut state);
            }
            state.waiting_writers -= 1;
        }

        state.writer = true;
        WriteGuard { lock: self }
    }

    /// Acquire the lock in exclusive mode, giving up after `timeout`.
    pub fn write_timeout(&self, timeout: Duration) -> Result<WriteGuard<T>, Error> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.write_until(deadline),
            None => Ok(self.write()),
        }
    }

    /// Acquire the lock in exclusive mode, giving up at `deadline`.
    pub fn write_until(&self, deadline: Instant) -> Result<WriteGuard<T>, Error> {
        let mut state = self.state.lock();

        if !state.can_write() {
            state.waiting_writers += 1;
            let acquired = self.park_until(&mut state, deadline, |state| !state.can_write());
            state.waiting_writers -= 1;

            if !acquired {
                // Readers might be queued up behind us, and we were the last thing keeping them
                // out.
                if state.waiting_readers > 0 && state.can_read() {
                    self.cond.notify_all();
                }

                return Err(Error::Timeout);
            }
        }

        state.writer = true;
        Ok(WriteGuard { lock: self })
    }

    /// The number of threads currently blocked on this lock.
    ///
    /// This counts both readers and writers, and is mainly useful for diagnostics and tests.
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters()
    }

    /// Get the inner data through an exclusive reference.
    ///
    /// No locking is needed, since the borrow checker guarantees there are no guards alive.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Unwrap the inner data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Park on the condition variable until `blocked` no longer holds.
    ///
    /// Returns `false` if `deadline` passed while still blocked.
    fn park_until<F>(&self, state: &mut MutexGuard<State>, deadline: Instant, blocked: F) -> bool
        where F: Fn(&State) -> bool {
        while blocked(&**state) {
            if self.cond.wait_until(state, deadline).timed_out() {
                return !blocked(&**state);
            }
        }

        true
    }

    /// Deregister a reader.
    fn unlock_shared(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;

        // Only writers can be waiting on readers, but every parked thread shares the condition
        // variable, so we must wake them all for the writer to be among them.
        if state.readers == 0 && state.waiters() > 0 {
            self.cond.notify_all();
        }
    }

    /// Deregister the writer.
    fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        state.writer = false;

        if state.waiters() > 0 {
            self.cond.notify_all();
        }
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> RwLock<T> {
        RwLock::new(T::default())
    }
}

/// A shared lock on a `RwLock`.
///
/// The lock is released when this guard is dropped.
#[must_use]
pub struct ReadGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
}

impl<'a, T> ops::Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

/// An exclusive lock on a `RwLock`.
///
/// The lock is released when this guard is dropped.
#[must_use]
pub struct WriteGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
}

impl<'a, T> ops::Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> ops::DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
    }
}
