//! # Kernel Instance
//!
//! A [`Kernel`] lives for the rest of the machine's life: [`Kernel::boot`]
//! leaks it so contexts, interrupt handlers and cores can all hold a
//! `&'static` reference.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spindle_hal::{Machine, TrapFrame, VirtAddr, TIMER_VECTOR};
use spindle_memory::{AddressSpaceManager, MemResult};

use crate::config::KernelConfig;
use crate::cpu::{Cpus, Current};
use crate::process::{ProcTable, UnitCell};
use crate::resources::ResourceManager;
use crate::scheduler::metrics::SchedulerMetrics;
use crate::stack::StackPool;
use crate::sync::{SpinLock, SpinLockGuard};
use crate::{ExecError, ExecResult, Pid};

/// Guard of the table lock
pub(crate) type TableGuard<'a, M> = SpinLockGuard<'a, ProcTable, M>;

/// Return path from the kernel to user mode
pub trait UserMode<M: Machine>: Send + Sync {
    /// Resume user execution with the registers in `frame`
    ///
    /// Runs on the current unit's kernel context and never comes back:
    /// user code re-enters the kernel only through system calls, and a unit
    /// leaves for good through [`Kernel::terminate`].
    fn enter(&self, kernel: &'static Kernel<M>, frame: TrapFrame) -> !;
}

/// Everything outside the execution subsystem the kernel depends on
pub struct Collaborators<M: Machine> {
    /// Address-space manager
    pub memory: Arc<dyn AddressSpaceManager>,
    /// File-system reference counting
    pub resources: Arc<dyn ResourceManager>,
    /// Trap-return path
    pub user: Box<dyn UserMode<M>>,
}

impl<M: Machine> fmt::Debug for Collaborators<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// The process and thread lifecycle of one machine
pub struct Kernel<M: Machine> {
    pub(crate) config: KernelConfig,
    pub(crate) cpus: Cpus<M>,
    /// The table lock and the state it protects
    pub(crate) table: SpinLock<ProcTable>,
    /// Owner-private data of every slot
    pub(crate) units: Box<[UnitCell<M>]>,
    pub(crate) memory: Arc<dyn AddressSpaceManager>,
    pub(crate) resources: Arc<dyn ResourceManager>,
    pub(crate) user: Box<dyn UserMode<M>>,
    pub(crate) stacks: StackPool,
    pub(crate) ticks: SpinLock<u64>,
    pub(crate) metrics: SchedulerMetrics,
    pub(crate) init: spin::Once<Pid>,
    started: AtomicBool,
}

impl<M: Machine> fmt::Debug for Kernel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("cpus", &self.cpus)
            .field("init", &self.init.get())
            .finish_non_exhaustive()
    }
}

impl<M: Machine> Kernel<M> {
    /// Build a kernel for `machine`
    ///
    /// Nothing runs until [`Kernel::start`].
    pub fn boot(config: KernelConfig, machine: Arc<M>, parts: Collaborators<M>) -> ExecResult<&'static Self> {
        config.validate()?;
        let units: Vec<_> = (0..config.max_units)
            .map(|_| UnitCell::new(config.open_files_per_unit))
            .collect();
        let kernel = Self {
            cpus: Cpus::new(machine),
            table: SpinLock::new("table", ProcTable::new(config.max_units)),
            units: units.into_boxed_slice(),
            memory: parts.memory,
            resources: parts.resources,
            user: parts.user,
            stacks: StackPool::new(config.kernel_stack_size, config.max_kernel_stacks),
            ticks: SpinLock::new("ticks", 0),
            metrics: SchedulerMetrics::new(),
            init: spin::Once::new(),
            started: AtomicBool::new(false),
            config,
        };
        log::info!(
            "spindle: booted with {} slots on {} cpus",
            kernel.config.max_units,
            kernel.cpus.count()
        );
        Ok(Box::leak(Box::new(kernel)))
    }

    /// Install the timer handler and start every core
    ///
    /// Core 0 creates the first process, running `init_entry`, before it
    /// enters its scheduler loop.
    pub fn start(&'static self, init_entry: VirtAddr) -> ExecResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ExecError::InvalidState);
        }
        self.machine().set_handler(Arc::new(move |vector| {
            if vector == TIMER_VECTOR {
                self.clock_tick();
            }
        }));
        self.machine().start_cores(Arc::new(move |cpu| {
            if cpu == 0 {
                if let Err(err) = self.user_init(init_entry) {
                    fatal!(self.cpus, "user_init: {}", err);
                }
            }
            log::info!("cpu{} entering scheduler", cpu);
            self.scheduler()
        }));
        Ok(())
    }

    /// Sizing the kernel was booted with
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The machine
    pub fn machine(&self) -> &M {
        self.cpus.machine()
    }

    /// Per-core records
    pub fn cpus(&self) -> &Cpus<M> {
        &self.cpus
    }

    /// The address-space manager
    pub fn memory(&self) -> &dyn AddressSpaceManager {
        &*self.memory
    }

    /// Scheduler counters
    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Kernel stacks currently owned by units
    pub fn kernel_stacks_in_use(&self) -> usize {
        self.stacks.in_use()
    }

    /// Identifier of the first process, once created
    pub fn init_pid(&self) -> Option<Pid> {
        self.init.get().copied()
    }

    /// Acquire a kernel spinlock on the running core
    pub fn acquire<'a, T>(&'a self, lock: &'a SpinLock<T>) -> SpinLockGuard<'a, T, M> {
        lock.lock(&self.cpus)
    }

    pub(crate) fn lock_table(&self) -> TableGuard<'_, M> {
        self.table.lock(&self.cpus)
    }

    /// The unit running on this core; fatal outside a unit
    #[track_caller]
    pub(crate) fn current_unit(&self) -> Current {
        match self.cpus.current() {
            Some(current) => current,
            None => fatal!(self.cpus, "no current unit at {}", core::panic::Location::caller()),
        }
    }

    /// Identifier of the unit running on this core
    pub fn current_id(&self) -> Option<Pid> {
        self.cpus.current().map(|current| current.pid)
    }

    /// Apply `f` to the saved user registers of the running unit
    ///
    /// This is the trap layer's view of the unit: changes take effect the
    /// next time the unit enters user mode from this frame.
    pub fn with_trapframe<R>(&self, f: impl FnOnce(&mut TrapFrame) -> R) -> R {
        let current = self.current_unit();
        // SAFETY: a running unit owns its private data.
        f(&mut unsafe { self.data(current.slot) }.trapframe)
    }

    /// Copy `bytes` into the running unit's address space
    pub fn copy_to_user(&self, addr: VirtAddr, bytes: &[u8]) -> ExecResult<()> {
        self.with_current_space(|space| self.memory.copy_out(space, addr, bytes))
    }

    /// Copy from the running unit's address space into `buf`
    pub fn copy_from_user(&self, addr: VirtAddr, buf: &mut [u8]) -> ExecResult<()> {
        self.with_current_space(|space| self.memory.copy_in(space, addr, buf))
    }

    pub(crate) fn with_current_space<R>(
        &self,
        f: impl FnOnce(spindle_memory::AddressSpaceId) -> MemResult<R>,
    ) -> ExecResult<R> {
        let current = self.current_unit();
        let space = self.lock_table().units[current.slot].space;
        let space = space.ok_or(ExecError::InvalidState)?;
        f(space).map_err(ExecError::from)
    }
}
