//! # Ticket Lock
//!
//! A user-level mutual-exclusion lock with two counters: `ticket`, the next
//! ticket to hand out, and `turn`, the ticket allowed in. Waiters are
//! served strictly in the order they took their tickets.
//!
//! Waiting is pure spinning; the lock never enters the kernel. It is not
//! reentrant: locking it twice from the same holder spins forever.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// FIFO spinlock
pub struct TicketLock<T> {
    ticket: AtomicU32,
    turn: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes every access to `data`.
unsafe impl<T: Send> Send for TicketLock<T> {}
unsafe impl<T: Send> Sync for TicketLock<T> {}

impl<T> fmt::Debug for TicketLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketLock")
            .field("ticket", &self.ticket.load(Ordering::Relaxed))
            .field("turn", &self.turn.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> TicketLock<T> {
    /// Unlocked lock around `value`
    pub const fn new(value: T) -> Self {
        Self {
            ticket: AtomicU32::new(0),
            turn: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Take a ticket and spin until it is served
    pub fn lock(&self) -> TicketGuard<'_, T> {
        let ticket = self.ticket.fetch_add(1, Ordering::Relaxed);
        while self.turn.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        TicketGuard { lock: self, ticket }
    }

    /// Tickets handed out so far
    pub fn tickets_issued(&self) -> u32 {
        self.ticket.load(Ordering::Relaxed)
    }

    /// The ticket currently allowed in; equal to `tickets_issued` when
    /// nobody holds or waits for the lock
    pub fn now_serving(&self) -> u32 {
        self.turn.load(Ordering::Relaxed)
    }

    /// Consume the lock and return the data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for TicketLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Holder of a [`TicketLock`]; releases it on drop
pub struct TicketGuard<'a, T> {
    lock: &'a TicketLock<T>,
    ticket: u32,
}

impl<T> TicketGuard<'_, T> {
    /// Ticket this holder was served with
    pub fn ticket(&self) -> u32 {
        self.ticket
    }
}

impl<T> Deref for TicketGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TicketGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for TicketGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.turn.fetch_add(1, Ordering::Release);
    }
}

impl<T: fmt::Debug> fmt::Debug for TicketGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketGuard")
            .field("ticket", &self.ticket)
            .field("data", &**self)
            .finish()
    }
}
