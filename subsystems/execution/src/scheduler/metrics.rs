//! # Scheduler Metrics
//!
//! Counters updated on every dispatch and every return to the scheduler.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::context::SwitchReason;

/// Scheduler metrics
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Units handed a core by a scheduler loop
    dispatches: AtomicU64,
    /// Timer ticks
    ticks: AtomicU64,
    /// Voluntary yields
    yields: AtomicU64,
    /// Switches into sleep
    sleeps: AtomicU64,
    /// Final switches of exiting units
    exits: AtomicU64,
    /// Scheduler passes that found nothing to run
    idle_passes: AtomicU64,
}

/// Point-in-time copy of [`SchedulerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Units handed a core by a scheduler loop
    pub dispatches: u64,
    /// Timer ticks
    pub ticks: u64,
    /// Voluntary yields
    pub yields: u64,
    /// Switches into sleep
    pub sleeps: u64,
    /// Final switches of exiting units
    pub exits: u64,
    /// Scheduler passes that found nothing to run
    pub idle_passes: u64,
}

impl SchedulerMetrics {
    /// Create new metrics
    pub const fn new() -> Self {
        Self {
            dispatches: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
            exits: AtomicU64::new(0),
            idle_passes: AtomicU64::new(0),
        }
    }

    /// Record a dispatch
    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timer tick
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a switch back to the scheduler
    pub fn record_switch(&self, reason: SwitchReason) {
        let counter = match reason {
            SwitchReason::Yield => &self.yields,
            SwitchReason::Sleep => &self.sleeps,
            SwitchReason::Exit => &self.exits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an idle scheduler pass
    pub fn record_idle_pass(&self) {
        self.idle_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the counters
    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            exits: self.exits.load(Ordering::Relaxed),
            idle_passes: self.idle_passes.load(Ordering::Relaxed),
        }
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
