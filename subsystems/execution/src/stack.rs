//! # Kernel Stacks
//!
//! Every unit gets one kernel stack from a bounded pool. Dropping the stack
//! returns it to the pool.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spindle_hal::VirtAddr;

use crate::{ExecError, ExecResult};

/// Kernel stack
#[derive(Debug)]
pub struct KernelStack {
    memory: Box<[u8]>,
    in_use: Arc<AtomicUsize>,
}

impl KernelStack {
    /// Get stack top (highest address)
    pub fn top(&self) -> VirtAddr {
        VirtAddr::new(self.base().as_u64() + self.memory.len() as u64)
    }

    /// Get stack base (lowest address)
    pub fn base(&self) -> VirtAddr {
        VirtAddr::new(self.memory.as_ptr() as u64)
    }

    /// Get stack size
    pub fn size(&self) -> usize {
        self.memory.len()
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded source of kernel stacks
#[derive(Debug)]
pub struct StackPool {
    stack_size: usize,
    limit: usize,
    in_use: Arc<AtomicUsize>,
}

impl StackPool {
    /// Pool handing out at most `limit` stacks of `stack_size` bytes
    pub fn new(stack_size: usize, limit: usize) -> Self {
        Self {
            stack_size,
            limit,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a stack, failing with `OutOfResources` when the pool is empty
    pub fn allocate(&self) -> ExecResult<KernelStack> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .map_err(|_| ExecError::OutOfResources)?;

        let mut memory = Vec::new();
        if memory.try_reserve_exact(self.stack_size).is_err() {
            self.in_use.fetch_sub(1, Ordering::AcqRel);
            return Err(ExecError::OutOfResources);
        }
        memory.resize(self.stack_size, 0u8);

        Ok(KernelStack {
            memory: memory.into_boxed_slice(),
            in_use: Arc::clone(&self.in_use),
        })
    }

    /// Stacks currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}
