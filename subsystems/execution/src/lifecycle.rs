//! # Process Lifecycle
//!
//! Fork, exit and wait for full processes, plus the per-unit operations a
//! process performs on itself: kill requests, heap growth and descriptor
//! management.

use spindle_hal::Machine;

use crate::context::SwitchReason;
use crate::kernel::Kernel;
use crate::process::{UnitFlags, UnitState};
use crate::resources::FileHandle;
use crate::sleep::Channel;
use crate::{ExecError, ExecResult, Pid};

impl<M: Machine> Kernel<M> {
    /// Create a copy of the running process; returns the child's id
    ///
    /// The child gets a private copy of the address space, the same saved
    /// registers with a zero return value, and its own references to every
    /// open file and the working directory.
    pub fn duplicate(&'static self) -> ExecResult<Pid> {
        let parent = self.current_unit();
        let (space, size, name) = {
            let table = self.lock_table();
            let unit = &table.units[parent.slot];
            (unit.space, unit.size, unit.name.clone())
        };
        let space = space.ok_or(ExecError::InvalidState)?;

        let (slot, pid) = self.allocate()?;
        let child_space = match self.memory.duplicate(space, size) {
            Ok(child_space) => child_space,
            Err(err) => {
                log::debug!("fork: cannot copy {} for pid {}: {}", space, pid, err);
                self.abandon(slot);
                return Err(ExecError::OutOfResources);
            }
        };

        // SAFETY: the parent is running this call and owns its data.
        let parent_data = unsafe { self.data(parent.slot) };
        let mut trapframe = parent_data.trapframe;
        trapframe.set_return_value(0);
        let files = parent_data.files.duplicate(&*self.resources);
        let cwd = parent_data.cwd.map(|cwd| self.resources.duplicate_cwd(cwd));

        // SAFETY: the child is an Embryo owned by this call.
        let child = unsafe { self.data(slot) };
        child.trapframe = trapframe;
        child.files = files;
        child.cwd = cwd;

        let mut table = self.lock_table();
        let unit = &mut table.units[slot];
        unit.space = Some(child_space);
        unit.size = size;
        unit.parent = Some(parent.pid);
        unit.name = name;
        unit.set_state(UnitState::Runnable);
        log::debug!("fork: pid {} -> pid {}", parent.pid, pid);
        Ok(pid)
    }

    /// Exit the running unit
    ///
    /// The unit stays a Zombie until its parent (or init, once orphaned)
    /// reaps it. Exiting init stops the machine.
    pub fn terminate(&self) -> ! {
        let current = self.current_unit();
        let init = self.init_pid();
        if init == Some(current.pid) {
            fatal!(self.cpus, "init exiting");
        }

        // SAFETY: the running unit owns its data.
        let data = unsafe { self.data(current.slot) };
        data.files.close_all(&*self.resources);
        if let Some(cwd) = data.cwd.take() {
            self.resources.release_cwd(cwd);
        }

        let mut table = self.lock_table();
        // The parent might be sleeping in wait or join.
        if let Some(parent) = table.units[current.slot].parent {
            table.wake(Channel::Unit(parent));
        }
        if let Some(init) = init {
            let mut orphaned_zombie = false;
            for unit in table
                .units
                .iter_mut()
                .filter(|unit| unit.state != UnitState::Unused && unit.parent == Some(current.pid))
            {
                unit.parent = Some(init);
                orphaned_zombie |= unit.state == UnitState::Zombie;
            }
            if orphaned_zombie {
                table.wake(Channel::Unit(init));
            }
        }

        table.units[current.slot].set_state(UnitState::Zombie);
        log::debug!("pid {} exits", current.pid);
        self.sched(&mut table, SwitchReason::Exit);
        fatal!(self.cpus, "zombie pid {} resumed", current.pid)
    }

    /// Wait for a child process to exit; returns its id
    ///
    /// Thread children are ignored. Fails with `NoChildren` when the caller
    /// has no child processes or has been killed.
    pub fn collect(&self) -> ExecResult<Pid> {
        let current = self.current_unit();
        let mut table = self.lock_table();
        loop {
            let (have_children, zombie) = table.scan_children(current.pid, |unit| !unit.is_thread());
            if let Some(slot) = zombie {
                let pid = self.reap(&mut table, slot);
                log::debug!("pid {} reaped child {}", current.pid, pid);
                return Ok(pid);
            }
            if !have_children || table.units[current.slot].is_killed() {
                return Err(ExecError::NoChildren);
            }
            table = self.sleep_locked(Channel::Unit(current.pid), table);
        }
    }

    /// Wait for a child of either kind to exit and reap it; returns its id
    ///
    /// This is init's reaper: orphans of both kinds end up as its children,
    /// and a thread's stack region is of no use to it. Fails with
    /// `NoChildren` when the caller has no children or has been killed.
    pub fn reap_any(&self) -> ExecResult<Pid> {
        let current = self.current_unit();
        let mut table = self.lock_table();
        loop {
            let (have_children, zombie) = table.scan_children(current.pid, |_| true);
            if let Some(slot) = zombie {
                let thread = table.units[slot].is_thread();
                let pid = self.reap(&mut table, slot);
                log::debug!("pid {} reaped {} {}", current.pid, if thread { "thread" } else { "child" }, pid);
                return Ok(pid);
            }
            if !have_children || table.units[current.slot].is_killed() {
                return Err(ExecError::NoChildren);
            }
            table = self.sleep_locked(Channel::Unit(current.pid), table);
        }
    }

    /// Ask the unit `pid` to exit at its next safe point
    ///
    /// A sleeping target is made Runnable so it notices promptly.
    pub fn request_kill(&self, pid: Pid) -> ExecResult<()> {
        let mut table = self.lock_table();
        let slot = table.find(pid).ok_or(ExecError::UnitNotFound)?;
        let unit = &mut table.units[slot];
        unit.flags.insert(UnitFlags::KILLED);
        if unit.state == UnitState::Sleeping {
            unit.set_state(UnitState::Runnable);
        }
        log::debug!("kill requested for pid {}", pid);
        Ok(())
    }

    /// Has a kill been requested for the running unit
    pub fn is_killed(&self) -> bool {
        let current = self.current_unit();
        self.lock_table().units[current.slot].is_killed()
    }

    /// Grow (or shrink, for a negative `delta`) the running process's
    /// memory; returns the previous size
    ///
    /// Threads share their creator's address space and cannot resize it.
    pub fn grow(&self, delta: isize) -> ExecResult<usize> {
        let current = self.current_unit();
        let mut table = self.lock_table();
        let unit = &mut table.units[current.slot];
        if unit.is_thread() {
            return Err(ExecError::InvalidArgument);
        }
        let space = unit.space.ok_or(ExecError::InvalidState)?;
        let old = unit.size;
        let requested = old.checked_add_signed(delta).ok_or(ExecError::InvalidArgument)?;
        unit.size = self.memory.resize(space, old, requested)?;
        self.memory.activate(self.cpus.id(), Some(space));
        Ok(old)
    }

    /// Give the running unit a descriptor for `file`
    ///
    /// The reference passes to the unit; it is dropped again by
    /// [`Kernel::close_file`] or on exit.
    pub fn install_file(&self, file: FileHandle) -> ExecResult<usize> {
        let current = self.current_unit();
        // SAFETY: the running unit owns its data.
        unsafe { self.data(current.slot) }.files.install(file)
    }

    /// Close descriptor `fd` of the running unit
    pub fn close_file(&self, fd: usize) -> ExecResult<()> {
        let current = self.current_unit();
        // SAFETY: the running unit owns its data.
        let file = unsafe { self.data(current.slot) }.files.take(fd)?;
        self.resources.close_file(file);
        Ok(())
    }

    /// Number of descriptors the running unit has open
    pub fn open_files(&self) -> usize {
        let current = self.current_unit();
        // SAFETY: the running unit owns its data.
        unsafe { self.data(current.slot) }.files.open_count()
    }
}
