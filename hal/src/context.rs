//! # Execution Contexts
//!
//! Two kinds of saved state exist:
//!
//! - the *kernel context* of a schedulable unit or of a core's scheduler,
//!   opaque to the kernel and switched by [`ContextSwitch::switch`];
//! - the [`TrapFrame`], the user-visible registers saved on kernel entry and
//!   restored on the way back to user mode.

use alloc::boxed::Box;

use crate::{HalResult, VirtAddr};

/// Size in bytes of a machine word on the user stack
pub const WORD_SIZE: u64 = 8;

/// Code a fresh kernel context runs on its first resumption
pub type ContextEntry = Box<dyn FnOnce() + Send + 'static>;

/// Kernel context switching
pub trait ContextSwitch: Send + Sync {
    /// Saved kernel context
    type Context: Send + Sync;

    /// A context that holds nothing yet
    ///
    /// Used for per-core scheduler contexts, which are filled in by the
    /// first switch away from the core's boot flow.
    fn blank_context(&self) -> Self::Context;

    /// A context that runs `entry` on `stack_top` the first time it is
    /// switched to, with interrupts disabled
    fn new_context(&self, stack_top: VirtAddr, entry: ContextEntry) -> HalResult<Self::Context>;

    /// Save the running context into `from` and resume `to`
    ///
    /// Returns when some other context switches back to `from`, possibly on
    /// a different core.
    ///
    /// # Safety
    /// Both pointers must be valid for the whole switch, `to` must not be
    /// running anywhere and interrupts must be disabled.
    unsafe fn switch(&self, from: *mut Self::Context, to: *const Self::Context);
}

/// Saved user registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    ip: u64,
    sp: u64,
    ret: u64,
    args: [u64; 6],
}

impl TrapFrame {
    /// Frame that enters user mode at `entry` with stack pointer `stack`
    pub const fn new_user(entry: VirtAddr, stack: VirtAddr) -> Self {
        Self {
            ip: entry.as_u64(),
            sp: stack.as_u64(),
            ret: 0,
            args: [0; 6],
        }
    }

    /// Get the instruction pointer
    pub const fn instruction_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.ip)
    }

    /// Set the instruction pointer
    pub fn set_instruction_pointer(&mut self, ip: VirtAddr) {
        self.ip = ip.as_u64();
    }

    /// Get the stack pointer
    pub const fn stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.sp)
    }

    /// Set the stack pointer
    pub fn set_stack_pointer(&mut self, sp: VirtAddr) {
        self.sp = sp.as_u64();
    }

    /// Get the primary return register
    pub const fn return_value(&self) -> u64 {
        self.ret
    }

    /// Set the primary return register
    pub fn set_return_value(&mut self, value: u64) {
        self.ret = value;
    }

    /// Get syscall argument by index (0-5)
    pub fn syscall_arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    /// Set syscall argument by index (0-5)
    pub fn set_syscall_arg(&mut self, index: usize, value: u64) {
        if let Some(slot) = self.args.get_mut(index) {
            *slot = value;
        }
    }
}
