//! # Clock
//!
//! A tick counter advanced by the timer interrupt on core 0.

use spindle_hal::Machine;

use crate::kernel::Kernel;
use crate::sleep::Channel;
use crate::{ExecError, ExecResult};

impl<M: Machine> Kernel<M> {
    /// Timer interrupt handler
    pub(crate) fn clock_tick(&self) {
        let mut ticks = self.acquire(&self.ticks);
        *ticks += 1;
        self.metrics.record_tick();
        self.wakeup(Channel::Ticks);
    }

    /// Sleep for `n` ticks
    ///
    /// Returns early with `Killed` once a kill is requested.
    pub fn sleep_ticks(&self, n: u64) -> ExecResult<()> {
        let mut ticks = self.acquire(&self.ticks);
        let start = *ticks;
        while *ticks - start < n {
            if self.is_killed() {
                return Err(ExecError::Killed);
            }
            ticks = self.sleep(Channel::Ticks, ticks);
        }
        Ok(())
    }

    /// Ticks since the kernel started
    pub fn uptime(&self) -> u64 {
        *self.acquire(&self.ticks)
    }
}
