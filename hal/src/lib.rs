//! # Spindle HAL - Hardware Abstraction Layer
//!
//! This crate defines the traits the kernel uses to talk to a machine:
//! per-core interrupt state, kernel context switching and interrupt
//! delivery. The execution subsystem is generic over [`Machine`] and never
//! touches hardware directly.
//!
//! ## Back-ends
//!
//! - **hosted** (feature `hosted`): cores and kernel contexts are host
//!   threads handing a baton to each other. Used by the test-suite and for
//!   running user programs on a development machine.
//!
//! A bare-metal back-end implements the same traits with a register-saving
//! `switch` and real interrupt flags.

#![cfg_attr(not(any(test, feature = "hosted")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod context;
pub mod cpu;
pub mod interrupts;

#[cfg(feature = "hosted")]
pub mod hosted;

pub use context::{ContextEntry, ContextSwitch, TrapFrame, WORD_SIZE};
pub use cpu::{CoreEntry, CpuAbstraction, CpuId};
pub use interrupts::{InterruptController, InterruptHandler, InterruptVector, TIMER_VECTOR};

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// Memory (or a host thread) for a new context could not be obtained
    OutOfMemory,
    /// The machine has been halted or powered off
    Halted,
}

/// A complete machine the kernel can run on
///
/// Aggregates every sub-trait needed by the execution subsystem.
pub trait Machine: CpuAbstraction + ContextSwitch + InterruptController + 'static {}

impl<T> Machine for T where T: CpuAbstraction + ContextSwitch + InterruptController + 'static {}

/// Virtual address type (architecture-independent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// The null address
    pub const NULL: Self = Self(0);

    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Get the address as a `usize` offset
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Add an offset, returning `None` on overflow
    #[inline]
    pub const fn checked_add(self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Subtract an offset, returning `None` on underflow
    #[inline]
    pub const fn checked_sub(self, offset: u64) -> Option<Self> {
        match self.0.checked_sub(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl core::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
