//! # Interrupt Controller Abstraction
//!
//! The kernel registers a single handler; the machine calls it with the
//! vector of every interrupt it delivers while interrupts are enabled.

use alloc::sync::Arc;

/// Interrupt vector number
pub type InterruptVector = u8;

/// Vector of the periodic timer interrupt
pub const TIMER_VECTOR: InterruptVector = 32;

/// Interrupt handler function type
pub type InterruptHandler = Arc<dyn Fn(InterruptVector) + Send + Sync>;

/// Interrupt controller abstraction
pub trait InterruptController: Send + Sync {
    /// Install the handler for every delivered interrupt, replacing any
    /// previous one
    fn set_handler(&self, handler: InterruptHandler);
}
