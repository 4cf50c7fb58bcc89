//! # Per-Core State
//!
//! Every core owns a [`Cpu`] record: the unit it is running, the context of
//! its scheduler loop, and the interrupt-disable nesting used by spinlocks.
//! A record is only touched by code running on its own core with
//! interrupts disabled, so no lock protects it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;

use spindle_hal::{CpuId, Machine};

use crate::Pid;

/// The unit a core is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Current {
    /// Table slot of the unit
    pub slot: usize,
    /// Its identifier
    pub pid: Pid,
}

struct Cpu<M: Machine> {
    current: Option<Current>,
    scheduler: M::Context,
    /// Depth of `push_off` nesting
    ncli: usize,
    /// Were interrupts enabled before the outermost `push_off`
    intena: bool,
}

/// Per-core records of every core of the machine
pub struct Cpus<M: Machine> {
    machine: Arc<M>,
    cpus: Box<[UnsafeCell<Cpu<M>>]>,
}

// SAFETY: each record is only accessed from its own core with interrupts
// disabled.
unsafe impl<M: Machine> Sync for Cpus<M> {}
unsafe impl<M: Machine> Send for Cpus<M> {}

impl<M: Machine> fmt::Debug for Cpus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpus").field("count", &self.cpus.len()).finish_non_exhaustive()
    }
}

impl<M: Machine> Cpus<M> {
    /// Records for every core of `machine`
    pub fn new(machine: Arc<M>) -> Self {
        let cpus: Vec<_> = (0..machine.cpu_count())
            .map(|_| {
                UnsafeCell::new(Cpu {
                    current: None,
                    scheduler: machine.blank_context(),
                    ncli: 0,
                    intena: false,
                })
            })
            .collect();
        Self {
            machine,
            cpus: cpus.into_boxed_slice(),
        }
    }

    /// The underlying machine
    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// Number of cores
    pub fn count(&self) -> usize {
        self.cpus.len()
    }

    /// Id of the running core; interrupts must be disabled
    pub fn id(&self) -> CpuId {
        if self.machine.interrupts_enabled() {
            fatal!(self, "cpu id read with interrupts enabled");
        }
        let id = self.machine.current_cpu();
        if id >= self.cpus.len() {
            fatal!(self, "unknown cpu {}", id);
        }
        id
    }

    fn with_cpu<R>(&self, f: impl FnOnce(&mut Cpu<M>) -> R) -> R {
        let id = self.id();
        // SAFETY: interrupts are off and only this core touches its record.
        f(unsafe { &mut *self.cpus[id].get() })
    }

    /// Disable interrupts, remembering whether they were on at the
    /// outermost level
    ///
    /// Matched `push_off`/`pop_off` pairs nest: interrupts come back only
    /// when the last level is popped, and only if they were on before the
    /// first push.
    pub fn push_off(&self) {
        let enabled = self.machine.interrupts_enabled();
        // SAFETY: masking interrupts is always allowed in kernel code.
        unsafe { self.machine.disable_interrupts() };
        self.with_cpu(|cpu| {
            if cpu.ncli == 0 {
                cpu.intena = enabled;
            }
            cpu.ncli += 1;
        });
    }

    /// Undo one `push_off`
    pub fn pop_off(&self) {
        if self.machine.interrupts_enabled() {
            fatal!(self, "pop_off: interruptible");
        }
        let enable = self.with_cpu(|cpu| {
            if cpu.ncli == 0 {
                return Err(());
            }
            cpu.ncli -= 1;
            Ok(cpu.ncli == 0 && cpu.intena)
        });
        match enable {
            Err(()) => fatal!(self, "pop_off: unbalanced"),
            // SAFETY: restoring the state saved by the outermost push_off.
            Ok(true) => unsafe { self.machine.enable_interrupts() },
            Ok(false) => {}
        }
    }

    /// The unit running on this core, if any
    pub fn current(&self) -> Option<Current> {
        self.push_off();
        let current = self.with_cpu(|cpu| cpu.current);
        self.pop_off();
        current
    }

    pub(crate) fn set_current(&self, current: Option<Current>) {
        self.with_cpu(|cpu| cpu.current = current);
    }

    pub(crate) fn ncli(&self) -> usize {
        self.with_cpu(|cpu| cpu.ncli)
    }

    pub(crate) fn intena(&self) -> bool {
        self.with_cpu(|cpu| cpu.intena)
    }

    pub(crate) fn set_intena(&self, intena: bool) {
        self.with_cpu(|cpu| cpu.intena = intena);
    }

    /// Address of this core's scheduler context
    pub(crate) fn scheduler_context(&self) -> *mut M::Context {
        let id = self.id();
        // SAFETY: only the address is taken; no reference escapes.
        unsafe { core::ptr::addr_of_mut!((*self.cpus[id].get()).scheduler) }
    }

    /// Log `reason` and stop the machine
    pub fn fatal(&self, reason: fmt::Arguments<'_>) -> ! {
        log::error!("kernel panic: {}", reason);
        self.machine.halt(reason)
    }
}
