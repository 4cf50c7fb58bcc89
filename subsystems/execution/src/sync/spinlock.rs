//! # Ticket Spinlock
//!
//! Waiters are served in the order they took a ticket. The lock records the
//! core holding it so that re-acquisition on the same core and release from
//! the wrong core are caught as fatal errors instead of deadlocks.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spindle_hal::Machine;

use crate::cpu::Cpus;

const NO_OWNER: usize = usize::MAX;

/// A ticket-based spinlock that disables interrupts while held
pub struct SpinLock<T> {
    name: &'static str,
    /// The next ticket to be dispensed
    next_ticket: AtomicU32,
    /// The ticket currently allowed in
    now_serving: AtomicU32,
    /// Core holding the lock, or `NO_OWNER`
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes every access to `data`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

static_assertions::assert_impl_all!(SpinLock<u64>: Send, Sync);

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> SpinLock<T> {
    /// Creates a new, unlocked spinlock
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            owner: AtomicUsize::new(NO_OWNER),
            data: UnsafeCell::new(value),
        }
    }

    /// Name given at creation
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock, disabling interrupts on this core until release
    ///
    /// Acquiring a lock this core already holds is fatal.
    pub fn lock<'a, M: Machine>(&'a self, cpus: &'a Cpus<M>) -> SpinLockGuard<'a, T, M> {
        cpus.push_off();
        let cpu = cpus.id();
        if self.owner.load(Ordering::Relaxed) == cpu {
            fatal!(cpus, "acquire {}: already held by cpu{}", self.name, cpu);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            cpus.machine().pause();
        }
        self.owner.store(cpu, Ordering::Relaxed);

        SpinLockGuard {
            lock: self,
            cpus,
            _not_send: PhantomData,
        }
    }

    /// Does the running core hold this lock
    pub fn holding<M: Machine>(&self, cpus: &Cpus<M>) -> bool {
        cpus.push_off();
        let held = self.owner.load(Ordering::Relaxed) == cpus.id();
        cpus.pop_off();
        held
    }

    fn release<M: Machine>(&self, cpus: &Cpus<M>) {
        if !self.holding(cpus) {
            fatal!(cpus, "release {}: not held", self.name);
        }
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.now_serving.fetch_add(1, Ordering::Release);
        cpus.pop_off();
    }

    /// Release the lock held through `guard`, giving back the lock itself
    pub fn unlock<'a, M: Machine>(guard: SpinLockGuard<'a, T, M>) -> &'a SpinLock<T> {
        let lock = guard.lock;
        let cpus = guard.cpus;
        core::mem::forget(guard);
        lock.release(cpus);
        lock
    }

    /// Release a lock whose guard lives on another stack
    ///
    /// # Safety
    /// The running core must hold the lock and the guard that acquired it
    /// must never be dropped.
    pub unsafe fn force_unlock<M: Machine>(&self, cpus: &Cpus<M>) {
        self.release(cpus);
    }

    /// Read the data without taking the lock
    ///
    /// # Safety
    /// Another core may be writing concurrently; the caller accepts a torn
    /// view and must not keep the reference.
    pub unsafe fn peek(&self) -> &T {
        // SAFETY: upheld by the caller.
        unsafe { &*self.data.get() }
    }
}

/// RAII guard of a [`SpinLock`]
pub struct SpinLockGuard<'a, T, M: Machine> {
    lock: &'a SpinLock<T>,
    cpus: &'a Cpus<M>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T, M: Machine> SpinLockGuard<'a, T, M> {
    /// The per-core records the lock was acquired with
    pub fn cpus(&self) -> &'a Cpus<M> {
        self.cpus
    }
}

impl<T: fmt::Debug, M: Machine> fmt::Debug for SpinLockGuard<'_, T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLockGuard")
            .field("lock", &self.lock.name)
            .field("data", &**self)
            .finish()
    }
}

impl<T, M: Machine> Deref for SpinLockGuard<'_, T, M> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, M: Machine> DerefMut for SpinLockGuard<'_, T, M> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, M: Machine> Drop for SpinLockGuard<'_, T, M> {
    fn drop(&mut self) {
        self.lock.release(self.cpus);
    }
}
