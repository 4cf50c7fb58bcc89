//! # Spindle Userspace
//!
//! The user side of the kernel:
//! - a ticket lock for user programs
//! - the system-call layer, entered through the saved trap frame
//! - a thread library built on clone/join
//! - on the hosted machine, a user mode that runs registered Rust
//!   functions as user programs
//!
//! Hosted user programs are plain functions. A program's "text address" is
//! the address of its function; the kernel resumes a unit by looking up the
//! instruction pointer of its trap frame in the [`HostedUserMode`] registry.

#![cfg_attr(not(any(test, feature = "hosted")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod ticket_lock;

#[cfg(feature = "hosted")]
pub mod init;
#[cfg(feature = "hosted")]
pub mod runtime;
#[cfg(feature = "hosted")]
pub mod syscalls;
#[cfg(feature = "hosted")]
pub mod thread;


pub use ticket_lock::{TicketGuard, TicketLock};

#[cfg(feature = "hosted")]
pub use init::reap_forever;
#[cfg(feature = "hosted")]
pub use runtime::{HostedUserMode, Program, ResumeFn, ThreadFn};
#[cfg(feature = "hosted")]
pub use syscalls::{Sys, Syscall, SyscallStats};
#[cfg(feature = "hosted")]
pub use thread::ThreadLib;

/// Userspace result type
pub type UserResult<T> = Result<T, UserError>;

/// What a failed system call reports to a user program
///
/// The system-call ABI only distinguishes join's copy-out failure from
/// every other failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserError {
    /// The call returned -1
    Failed,
    /// Join could not write the stack handle back (-2)
    CopyOutFailed,
}

impl UserError {
    /// Decode a raw system-call return value
    pub fn check(ret: i64) -> UserResult<u64> {
        match ret {
            -2 => Err(UserError::CopyOutFailed),
            ret if ret < 0 => Err(UserError::Failed),
            ret => Ok(ret as u64),
        }
    }
}

impl core::fmt::Display for UserError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UserError::Failed => f.write_str("system call failed"),
            UserError::CopyOutFailed => f.write_str("copy-out failed"),
        }
    }
}
