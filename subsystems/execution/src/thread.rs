//! # Threads
//!
//! A thread is a unit that shares its creator's address space instead of
//! copying it. It starts at a caller-chosen entry with two arguments on a
//! caller-provided stack region (see [`ThreadFrame`]) and is reaped by its
//! parent through [`Kernel::await_thread`], which hands the stack region
//! back so the caller can reuse it.
//!
//! The shared space is torn down by whichever reap leaves no unreaped unit
//! holding it, whether that is a join or a wait.

use spindle_hal::{Machine, VirtAddr};

use crate::context::{ThreadArgs, ThreadFrame};
use crate::kernel::Kernel;
use crate::process::{UnitFlags, UnitInner, UnitState};
use crate::sleep::Channel;
use crate::{ExecError, ExecResult, Pid};

impl<M: Machine> Kernel<M> {
    /// Start a thread at `entry` on the stack region starting at `stack`
    ///
    /// The region is `thread_stack_size` bytes and must lie inside the
    /// caller's memory; it is checked before anything is allocated.
    pub fn spawn_thread(&'static self, entry: VirtAddr, arg1: u64, arg2: u64, stack: VirtAddr) -> ExecResult<Pid> {
        let parent = self.current_unit();
        let (space, size, name) = {
            let table = self.lock_table();
            let unit = &table.units[parent.slot];
            (unit.space, unit.size, unit.name.clone())
        };
        let space = space.ok_or(ExecError::InvalidState)?;

        let frame = ThreadFrame::new(stack, self.config.thread_stack_size, arg1, arg2)?;
        if frame.end().as_u64() > size as u64 || !self.memory.validate_region(space, stack, frame.size()) {
            log::debug!("clone: bad stack {} for pid {}", stack, parent.pid);
            return Err(ExecError::InvalidArgument);
        }

        let (slot, pid) = self.allocate()?;
        if let Err(err) = frame.write(&*self.memory, space) {
            log::debug!("clone: cannot write frame for pid {}: {}", pid, err);
            self.abandon(slot);
            return Err(ExecError::InvalidArgument);
        }

        // SAFETY: the parent is running this call and owns its data.
        let parent_data = unsafe { self.data(parent.slot) };
        let mut trapframe = parent_data.trapframe;
        trapframe.set_instruction_pointer(entry);
        trapframe.set_stack_pointer(frame.stack_pointer());
        trapframe.set_return_value(0);
        let files = parent_data.files.duplicate(&*self.resources);
        let cwd = parent_data.cwd.map(|cwd| self.resources.duplicate_cwd(cwd));

        // SAFETY: the thread is an Embryo owned by this call.
        let child = unsafe { self.data(slot) };
        child.trapframe = trapframe;
        child.files = files;
        child.cwd = cwd;

        let mut table = self.lock_table();
        let unit = &mut table.units[slot];
        unit.space = Some(space);
        unit.size = size;
        unit.parent = Some(parent.pid);
        unit.flags.insert(UnitFlags::THREAD);
        unit.user_stack = Some(stack);
        unit.name = name;
        unit.set_state(UnitState::Runnable);
        log::debug!("clone: pid {} -> thread {} at {}", parent.pid, pid, entry);
        Ok(pid)
    }

    /// Decode the frame a new thread finds at `sp` in the running unit's
    /// memory
    pub fn thread_args(&self, sp: VirtAddr) -> ExecResult<ThreadArgs> {
        self.with_current_space(|space| ThreadFrame::read(&*self.memory, space, sp))
    }

    /// Wait for a thread child to exit; returns its id
    ///
    /// The exited thread's stack region is written to `out` in the caller's
    /// memory as a little-endian word. If that write fails the call returns
    /// `CopyOutFailed` and the thread stays unreaped.
    pub fn await_thread(&self, out: VirtAddr) -> ExecResult<Pid> {
        let current = self.current_unit();
        let mut table = self.lock_table();
        loop {
            let (have_threads, zombie) = table.scan_children(current.pid, UnitInner::is_thread);
            if let Some(slot) = zombie {
                let stack = table.units[slot].user_stack.unwrap_or(VirtAddr::NULL);
                let space = table.units[current.slot].space.ok_or(ExecError::InvalidState)?;
                if let Err(err) = self.memory.copy_out(space, out, &stack.as_u64().to_le_bytes()) {
                    log::debug!("join: cannot write stack to {}: {}", out, err);
                    return Err(ExecError::CopyOutFailed);
                }
                let pid = self.reap(&mut table, slot);
                log::debug!("pid {} joined thread {}", current.pid, pid);
                return Ok(pid);
            }
            if !have_threads || table.units[current.slot].is_killed() {
                return Err(ExecError::NoChildren);
            }
            table = self.sleep_locked(Channel::Unit(current.pid), table);
        }
    }
}
