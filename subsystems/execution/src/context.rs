//! # Context Switch Bookkeeping and Thread Frames
//!
//! A new thread starts with a synthetic call frame at the top of its stack
//! region, laid out from high to low addresses as:
//!
//! ```text
//! end - 8   return address (RETURN_SENTINEL)
//! end - 16  arg2
//! end - 24  arg1          <- initial stack pointer
//! ```
//!
//! Returning from the entry function jumps to the sentinel, which faults.

use spindle_hal::{VirtAddr, WORD_SIZE};
use spindle_memory::{AddressSpaceId, AddressSpaceManager, MemResult};

use crate::{ExecError, ExecResult};

/// Return address planted under a thread's entry function
pub const RETURN_SENTINEL: u64 = 0xffff_ffff_ffff_ffff;

/// Why a unit handed its core back to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// Voluntary yield
    Yield,
    /// Waiting on a channel
    Sleep,
    /// Unit exited
    Exit,
}

/// Arguments decoded from a thread's initial frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadArgs {
    /// First argument
    pub arg1: u64,
    /// Second argument
    pub arg2: u64,
    /// Address the entry function returns to
    pub return_address: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<ThreadArgs>() as u64, 3 * WORD_SIZE);

/// Initial user stack of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadFrame {
    region: VirtAddr,
    end: VirtAddr,
    arg1: u64,
    arg2: u64,
}

impl ThreadFrame {
    const WORDS: u64 = 3;

    /// Frame for a stack region of `size` bytes starting at `region`
    ///
    /// Fails if the region wraps around the address space or cannot hold
    /// the frame.
    pub fn new(region: VirtAddr, size: usize, arg1: u64, arg2: u64) -> ExecResult<Self> {
        let size = size as u64;
        if size < Self::WORDS * WORD_SIZE {
            return Err(ExecError::InvalidArgument);
        }
        let end = region.checked_add(size).ok_or(ExecError::InvalidArgument)?;
        Ok(Self {
            region,
            end,
            arg1,
            arg2,
        })
    }

    /// One past the highest address of the stack region
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Size of the stack region
    pub fn size(&self) -> usize {
        (self.end.as_u64() - self.region.as_u64()) as usize
    }

    /// Initial stack pointer: the address of `arg1`
    pub fn stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.end.as_u64() - Self::WORDS * WORD_SIZE)
    }

    fn encode(&self) -> [u8; 24] {
        let mut bytes = [0u8; 24];
        bytes[0..8].copy_from_slice(&self.arg1.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.arg2.to_le_bytes());
        bytes[16..24].copy_from_slice(&RETURN_SENTINEL.to_le_bytes());
        bytes
    }

    /// Write the frame into `space`
    pub fn write(&self, memory: &dyn AddressSpaceManager, space: AddressSpaceId) -> MemResult<()> {
        memory.copy_out(space, self.stack_pointer(), &self.encode())
    }

    /// Decode the frame a thread finds at `sp` when it first runs
    pub fn read(memory: &dyn AddressSpaceManager, space: AddressSpaceId, sp: VirtAddr) -> MemResult<ThreadArgs> {
        let mut bytes = [0u8; 24];
        memory.copy_in(space, sp, &mut bytes)?;
        let word = |index: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[index * 8..index * 8 + 8]);
            u64::from_le_bytes(raw)
        };
        Ok(ThreadArgs {
            arg1: word(0),
            arg2: word(1),
            return_address: word(2),
        })
    }
}
