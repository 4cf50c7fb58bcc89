//! # Kernel Synchronization
//!
//! [`SpinLock`] is the only kernel lock. Acquiring one disables interrupts
//! on the current core until the matching release, so an interrupt handler
//! never spins on a lock its own core holds.
//!
//! ## Lock order
//!
//! 1. ticks lock
//! 2. table lock
//! 3. locks internal to collaborators (address-space manager)
//!
//! A lock is never acquired while holding one that comes after it. The
//! table lock is the only lock that may be held across a context switch.

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
