//! # Kernel Configuration

use spindle_memory::{page_round_up, PAGE_SIZE};

use crate::{ExecError, ExecResult};

/// Sizing of the execution subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Capacity of the unit table
    pub max_units: usize,
    /// Open-file slots per unit
    pub open_files_per_unit: usize,
    /// Size of each kernel stack in bytes
    pub kernel_stack_size: usize,
    /// Kernel stacks that may exist at once
    pub max_kernel_stacks: usize,
    /// Size of the first process image in bytes
    pub init_memory: usize,
    /// Size of a thread's stack region in bytes
    pub thread_stack_size: usize,
}

impl KernelConfig {
    /// Default table capacity
    pub const DEFAULT_MAX_UNITS: usize = 64;
    /// Default open files per unit
    pub const DEFAULT_OPEN_FILES: usize = 16;
    /// Default kernel stack size: one page
    pub const DEFAULT_KERNEL_STACK: usize = PAGE_SIZE;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            max_units: Self::DEFAULT_MAX_UNITS,
            open_files_per_unit: Self::DEFAULT_OPEN_FILES,
            kernel_stack_size: Self::DEFAULT_KERNEL_STACK,
            max_kernel_stacks: Self::DEFAULT_MAX_UNITS,
            init_memory: PAGE_SIZE,
            thread_stack_size: PAGE_SIZE,
        }
    }

    /// Create a small configuration, handy for exhausting the table
    pub fn small() -> Self {
        Self {
            max_units: 8,
            max_kernel_stacks: 8,
            open_files_per_unit: 4,
            ..Self::new()
        }
    }

    /// Set the table capacity (and the kernel stack budget with it)
    pub fn with_max_units(mut self, max_units: usize) -> Self {
        self.max_units = max_units;
        self.max_kernel_stacks = max_units;
        self
    }

    /// Set the kernel stack budget
    pub fn with_max_kernel_stacks(mut self, stacks: usize) -> Self {
        self.max_kernel_stacks = stacks;
        self
    }

    /// Set the open files per unit
    pub fn with_open_files(mut self, files: usize) -> Self {
        self.open_files_per_unit = files;
        self
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> ExecResult<()> {
        let page_multiple = |size: usize| size != 0 && page_round_up(size) == size;
        if self.max_units == 0
            || self.max_kernel_stacks == 0
            || self.kernel_stack_size == 0
            || !page_multiple(self.init_memory)
            || !page_multiple(self.thread_stack_size)
        {
            return Err(ExecError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
