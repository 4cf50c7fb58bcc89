//! # Spindle Execution Subsystem
//!
//! The process and thread lifecycle of the kernel:
//! - a fixed-capacity table of schedulable units
//! - a per-core cooperative round-robin scheduler
//! - sleep/wakeup on opaque channels
//! - fork/exit/wait for full processes
//! - clone/join for threads sharing one address space
//!
//! ## Locking
//!
//! One spinlock, the table lock, protects the state of every unit. It is
//! held across every context switch: whoever switches to a unit or to a
//! core's scheduler hands the lock over and the resumed side releases it.
//! See [`sync`] for the lock order.
//!
//! ## Collaborators
//!
//! The subsystem is generic over a [`Machine`](spindle_hal::Machine) and
//! talks to address spaces, open files and user mode only through the
//! [`AddressSpaceManager`](spindle_memory::AddressSpaceManager),
//! [`ResourceManager`] and [`UserMode`] traits.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

/// Stop the machine with a formatted reason
macro_rules! fatal {
    ($cpus:expr, $($arg:tt)+) => {
        $cpus.fatal(format_args!($($arg)+))
    };
}

pub mod clock;
pub mod config;
pub mod context;
pub mod cpu;
pub mod kernel;
pub mod lifecycle;
pub mod process;
pub mod resources;
pub mod scheduler;
pub mod sleep;
pub mod stack;
pub mod sync;
pub mod thread;

pub use config::KernelConfig;
pub use context::{SwitchReason, ThreadArgs, ThreadFrame, RETURN_SENTINEL};
pub use kernel::{Collaborators, Kernel, UserMode};
pub use process::{UnitFlags, UnitSnapshot, UnitState};
pub use resources::{CwdHandle, FileHandle, ResourceManager};
pub use scheduler::metrics::{SchedulerMetrics, SchedulerStats};
pub use sleep::Channel;
pub use sync::{SpinLock, SpinLockGuard};

use spindle_memory::MemError;

/// Identifier of a schedulable unit (process or thread)
///
/// Assigned from a monotonically increasing counter and never handed out
/// twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u64);

impl Pid {
    /// Build an identifier from its raw value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution result type
pub type ExecResult<T> = Result<T, ExecError>;

/// Execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// No free table slot, kernel stack, context or memory
    OutOfResources,
    /// Invalid argument
    InvalidArgument,
    /// The joined thread's stack handle could not be written back
    CopyOutFailed,
    /// The caller has no children of the requested kind, or was killed
    NoChildren,
    /// No live unit has the requested identifier
    UnitNotFound,
    /// A timed sleep was cut short by the kill flag
    Killed,
    /// Invalid state
    InvalidState,
}

impl ExecError {
    /// The negative value a system call returns for this error
    ///
    /// Join's copy-out failure is kept distinct from every other failure.
    pub const fn code(self) -> i64 {
        match self {
            ExecError::CopyOutFailed => -2,
            _ => -1,
        }
    }
}

impl core::fmt::Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            ExecError::OutOfResources => "out of resources",
            ExecError::InvalidArgument => "invalid argument",
            ExecError::CopyOutFailed => "copy-out failed",
            ExecError::NoChildren => "no children",
            ExecError::UnitNotFound => "no such unit",
            ExecError::Killed => "killed",
            ExecError::InvalidState => "invalid state",
        };
        f.write_str(text)
    }
}

impl From<MemError> for ExecError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::OutOfMemory => ExecError::OutOfResources,
            MemError::InvalidAddress | MemError::InvalidSize | MemError::NotMapped => {
                ExecError::InvalidArgument
            }
        }
    }
}
