//! Reader/writer lock with a priority writer class.
//!
//! Three roles share one lock:
//!
//! - **readers** run concurrently, but a new reader waits while any writer
//!   is queued so writers are not starved by a steady stream of reads
//! - **writers** are exclusive and wait while a priority writer is queued
//! - **priority writers** are exclusive and overtake queued writers
//!
//! Admission state lives behind a short-lived `parking_lot::Mutex`; waiters
//! park on a `tokio::sync::Notify` and re-check on every release. Guards
//! release on drop, so every exit path (including a cancelled future) gives
//! the role back.

#![allow(unsafe_code)]

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
    waiting_priority: usize,
}

pub struct PriorityRwLock<T> {
    state: Mutex<LockState>,
    changed: Notify,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is mediated by `state`: shared references are
// only handed out while `readers > 0 && !writer`, the unique reference only
// while `writer && readers == 0`.
unsafe impl<T: Send> Send for PriorityRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for PriorityRwLock<T> {}

impl<T> PriorityRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            changed: Notify::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the shared reader role.
    pub async fn read(&self) -> ReadGuard<'_, T> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state.lock();
                if !st.writer && st.waiting_writers == 0 && st.waiting_priority == 0 {
                    st.readers += 1;
                    return ReadGuard { lock: self };
                }
            }

            notified.await;
        }
    }

    /// Acquire the ordinary exclusive writer role.
    pub async fn write(&self) -> WriteGuard<'_, T> {
        self.acquire_write(false).await
    }

    /// Acquire the exclusive writer role ahead of queued ordinary writers.
    pub async fn priority_write(&self) -> WriteGuard<'_, T> {
        self.acquire_write(true).await
    }

    async fn acquire_write(&self, priority: bool) -> WriteGuard<'_, T> {
        let mut ticket = WaitTicket::issue(self, priority);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state.lock();
                let blocked =
                    st.writer || st.readers > 0 || (!priority && st.waiting_priority > 0);
                if !blocked {
                    ticket.redeem(&mut st);
                    st.writer = true;
                    return WriteGuard { lock: self };
                }
            }

            notified.await;
        }
    }
}

/// A queued writer. Dropping an unredeemed ticket (the acquiring future was
/// cancelled) withdraws it and wakes anyone it was holding back.
struct WaitTicket<'a, T> {
    lock: &'a PriorityRwLock<T>,
    priority: bool,
    redeemed: bool,
}

impl<'a, T> WaitTicket<'a, T> {
    fn issue(lock: &'a PriorityRwLock<T>, priority: bool) -> Self {
        {
            let mut st = lock.state.lock();
            if priority {
                st.waiting_priority += 1;
            } else {
                st.waiting_writers += 1;
            }
        }
        Self {
            lock,
            priority,
            redeemed: false,
        }
    }

    fn redeem(&mut self, st: &mut LockState) {
        withdraw(st, self.priority);
        self.redeemed = true;
    }
}

impl<T> Drop for WaitTicket<'_, T> {
    fn drop(&mut self) {
        if !self.redeemed {
            withdraw(&mut self.lock.state.lock(), self.priority);
            self.lock.changed.notify_waiters();
        }
    }
}

fn withdraw(st: &mut LockState, priority: bool) {
    if priority {
        st.waiting_priority -= 1;
    } else {
        st.waiting_writers -= 1;
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a PriorityRwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard holds the reader role.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        let last = {
            let mut st = self.lock.state.lock();
            st.readers -= 1;
            st.readers == 0
        };
        if last {
            self.lock.changed.notify_waiters();
        }
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a PriorityRwLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard holds the exclusive writer role.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard holds the exclusive writer role.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.lock().writer = false;
        self.lock.changed.notify_waiters();
    }
}
