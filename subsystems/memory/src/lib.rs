//! # Spindle Memory Subsystem
//!
//! The execution subsystem never manipulates page tables itself. It holds
//! opaque [`AddressSpaceId`] handles and asks an [`AddressSpaceManager`] to
//! create, copy, resize, switch to and destroy them.
//!
//! ## Implementations
//!
//! - [`FlatMemory`]: each address space is a contiguous byte array starting
//!   at virtual address 0. Enough to run user programs on the hosted
//!   machine and to observe teardown in tests.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod address_space;
pub mod flat;

pub use address_space::{AddressSpaceId, AddressSpaceManager};
pub use flat::{FlatMemory, FlatStats};

/// Size of a user page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Round `size` up to a whole number of pages
pub const fn page_round_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Out of memory
    OutOfMemory,
    /// Invalid address
    InvalidAddress,
    /// Invalid size
    InvalidSize,
    /// No such address space
    NotMapped,
}

impl core::fmt::Display for MemError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            MemError::OutOfMemory => "out of memory",
            MemError::InvalidAddress => "invalid address",
            MemError::InvalidSize => "invalid size",
            MemError::NotMapped => "address space not mapped",
        };
        f.write_str(text)
    }
}
