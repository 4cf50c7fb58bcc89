//! # Scheduler
//!
//! Each core runs [`Kernel::scheduler`] forever, scanning the table in slot
//! order and running every Runnable unit it finds until that unit hands the
//! core back through `sched`.
//!
//! The table lock is held across every switch. The scheduler acquires it
//! before switching to a unit, and the unit releases it (in `fork_ret` the
//! first time, otherwise on the way out of whatever called `sched`). A unit
//! going back to the scheduler acquires it first, and the scheduler
//! releases it after the scan. So the state a switch depends on never
//! becomes visible to another core half-done.

pub mod metrics;

use spindle_hal::Machine;

use crate::context::SwitchReason;
use crate::cpu::Current;
use crate::kernel::{Kernel, TableGuard};
use crate::process::UnitState;

impl<M: Machine> Kernel<M> {
    /// Per-core scheduler loop; started on every core by [`Kernel::start`]
    pub fn scheduler(&self) -> ! {
        let machine = self.machine();
        self.cpus.set_current(None);

        loop {
            // SAFETY: no lock is held here, so an interrupt can be taken.
            unsafe { machine.enable_interrupts() };

            let mut dispatched = false;
            let mut table = self.lock_table();
            for slot in 0..table.units.len() {
                let unit = &table.units[slot];
                if unit.state != UnitState::Runnable {
                    continue;
                }
                let Some(pid) = unit.pid else {
                    continue;
                };
                let space = unit.space;

                let cpu = self.cpus.id();
                self.cpus.set_current(Some(Current { slot, pid }));
                self.memory.activate(cpu, space);
                table.units[slot].set_state(UnitState::Running);
                self.metrics.record_dispatch();
                log::trace!("cpu{} runs pid {}", cpu, pid);

                // SAFETY: a Runnable unit is not running anywhere and its
                // context cannot be freed while the table lock is held.
                let to = match unsafe { self.data(slot) }.context.as_ref() {
                    Some(context) => context as *const M::Context,
                    None => fatal!(self.cpus, "scheduler: pid {} has no context", pid),
                };
                // SAFETY: interrupts are off (table lock held) and `to` is idle.
                unsafe { machine.switch(self.cpus.scheduler_context(), to) };

                // The unit is done for now and handed the table lock back.
                self.memory.activate(self.cpus.id(), None);
                self.cpus.set_current(None);
                dispatched = true;
            }
            drop(table);

            if !dispatched {
                self.metrics.record_idle_pass();
                machine.wait_for_interrupt();
            }
        }
    }

    /// Switch from the running unit back to this core's scheduler
    ///
    /// The caller holds the table lock and nothing else, has already moved
    /// its unit out of Running, and gets control back (possibly on another
    /// core) with the table lock held again.
    pub(crate) fn sched(&self, table: &mut TableGuard<'_, M>, reason: SwitchReason) {
        let machine = self.machine();
        if !self.table.holding(&self.cpus) {
            fatal!(self.cpus, "sched: table lock not held");
        }
        if machine.interrupts_enabled() {
            fatal!(self.cpus, "sched: interruptible");
        }
        let depth = self.cpus.ncli();
        if depth != 1 {
            fatal!(self.cpus, "sched: {} locks held", depth);
        }
        let current = self.current_unit();
        if table.units[current.slot].state == UnitState::Running {
            fatal!(self.cpus, "sched: pid {} still running", current.pid);
        }

        // Whether interrupts come back on belongs to this kernel thread, not
        // to the core it happens to resume on.
        let intena = self.cpus.intena();
        self.metrics.record_switch(reason);

        // SAFETY: the running unit owns its private data.
        let from = match unsafe { self.data(current.slot) }.context.as_mut() {
            Some(context) => context as *mut M::Context,
            None => fatal!(self.cpus, "sched: pid {} has no context", current.pid),
        };
        // SAFETY: interrupts are off and the scheduler context is idle while
        // one of its units runs.
        unsafe { machine.switch(from, self.cpus.scheduler_context()) };

        self.cpus.set_intena(intena);
    }

    /// Give up the core for one scheduling round
    pub fn yield_now(&self) {
        let current = self.current_unit();
        let mut table = self.lock_table();
        table.units[current.slot].set_state(UnitState::Runnable);
        self.sched(&mut table, SwitchReason::Yield);
    }

    /// First code every new unit runs, on its own kernel context
    pub(crate) fn fork_ret(&'static self) -> ! {
        // SAFETY: the scheduler that switched here holds the table lock and
        // keeps its guard on its own stack until the unit switches back.
        unsafe { self.table.force_unlock(&self.cpus) };

        let current = self.current_unit();
        // SAFETY: the running unit owns its private data.
        let frame = unsafe { self.data(current.slot) }.trapframe;
        log::trace!("pid {} enters user mode at {}", current.pid, frame.instruction_pointer());
        self.user.enter(self, frame)
    }
}
