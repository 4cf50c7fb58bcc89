//! # CPU Abstraction
//!
//! Per-core operations the kernel needs: identifying the running core,
//! masking interrupts, idling, bringing the cores up and stopping the
//! machine on an unrecoverable error.

use alloc::sync::Arc;
use core::fmt;

/// Index of a core, dense in `0..cpu_count()`
pub type CpuId = usize;

/// Code run by every core once it is started
pub type CoreEntry = Arc<dyn Fn(CpuId) + Send + Sync>;

/// CPU abstraction trait
///
/// Provides architecture-independent access to CPU features and state.
pub trait CpuAbstraction: Send + Sync {
    /// Get the number of CPUs available
    fn cpu_count(&self) -> usize;

    /// Get the current CPU ID
    ///
    /// Only meaningful with interrupts disabled: otherwise the caller may be
    /// moved to another core right after reading it.
    fn current_cpu(&self) -> CpuId;

    /// Check if interrupts are enabled on the current CPU
    fn interrupts_enabled(&self) -> bool;

    /// Enable interrupts
    ///
    /// # Safety
    /// Enabling interrupts when the system is not ready can cause undefined behavior.
    unsafe fn enable_interrupts(&self);

    /// Disable interrupts
    ///
    /// # Safety
    /// Disabling interrupts for too long can cause system hangs.
    unsafe fn disable_interrupts(&self);

    /// Pause the CPU (for spinlocks)
    fn pause(&self);

    /// Idle until an interrupt may have arrived
    fn wait_for_interrupt(&self);

    /// Start every core, each running `entry` with its own id
    ///
    /// Cores start with interrupts disabled.
    fn start_cores(&self, entry: CoreEntry);

    /// Stop the whole machine after an unrecoverable kernel error
    fn halt(&self, reason: fmt::Arguments<'_>) -> !;
}
