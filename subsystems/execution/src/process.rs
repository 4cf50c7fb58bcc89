//! # Process Table
//!
//! A fixed number of slots, each holding at most one schedulable unit. The
//! state of a unit is split in two:
//!
//! - [`UnitInner`] lives in the [`ProcTable`] behind the table lock and is
//!   what other units and the scheduler look at: state, identity, parent,
//!   channel, address-space handle.
//! - `UnitData` is private to whoever owns the slot: the allocator while
//!   the unit is an Embryo, the unit itself while it runs, the reaper once it
//!   is a Zombie. It holds the kernel stack, the saved contexts and the
//!   open-file references.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;
use core::panic::Location;

use bitflags::bitflags;
use spindle_hal::{ContextEntry, Machine, TrapFrame, VirtAddr};
use spindle_memory::AddressSpaceId;

use crate::kernel::Kernel;
use crate::resources::{CwdHandle, FileTable};
use crate::sleep::Channel;
use crate::stack::KernelStack;
use crate::{ExecError, ExecResult, Pid};

/// Longest unit name, in bytes
pub const NAME_LEN: usize = 16;

/// Unit name storage
pub type UnitName = heapless::String<NAME_LEN>;

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UnitState {
    /// Slot is free
    #[default]
    Unused = 0,
    /// Being built by its creator
    Embryo = 1,
    /// Waiting on a channel
    Sleeping = 2,
    /// Ready to be picked by a scheduler
    Runnable = 3,
    /// Running on exactly one core
    Running = 4,
    /// Exited, waiting to be reaped
    Zombie = 5,
}

impl UnitState {
    /// Short label used by the dump
    pub fn label(self) -> &'static str {
        match self {
            UnitState::Unused => "unused",
            UnitState::Embryo => "embryo",
            UnitState::Sleeping => "sleep ",
            UnitState::Runnable => "runble",
            UnitState::Running => "run   ",
            UnitState::Zombie => "zombie",
        }
    }

    /// Valid transitions from this state
    pub fn valid_transitions(self) -> &'static [UnitState] {
        match self {
            UnitState::Unused => &[UnitState::Embryo],
            UnitState::Embryo => &[UnitState::Runnable, UnitState::Unused],
            UnitState::Runnable => &[UnitState::Running],
            UnitState::Running => &[UnitState::Runnable, UnitState::Sleeping, UnitState::Zombie],
            UnitState::Sleeping => &[UnitState::Runnable],
            UnitState::Zombie => &[UnitState::Unused],
        }
    }
}

bitflags! {
    /// Unit flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnitFlags: u32 {
        /// Shares its creator's address space
        const THREAD = 1 << 0;
        /// Kill requested; acted upon at the next safe point
        const KILLED = 1 << 1;
    }
}

/// Table-lock protected part of a unit
#[derive(Debug, Clone, Default)]
pub struct UnitInner {
    pub(crate) state: UnitState,
    pub(crate) pid: Option<Pid>,
    pub(crate) parent: Option<Pid>,
    pub(crate) flags: UnitFlags,
    /// Set only while Sleeping
    pub(crate) channel: Option<Channel>,
    pub(crate) sleep_site: Option<&'static Location<'static>>,
    pub(crate) space: Option<AddressSpaceId>,
    pub(crate) size: usize,
    /// Stack region a thread was cloned with
    pub(crate) user_stack: Option<VirtAddr>,
    pub(crate) name: UnitName,
}

impl UnitInner {
    /// Move to `next`, which must be reachable from the current state
    pub(crate) fn set_state(&mut self, next: UnitState) {
        debug_assert!(
            self.state.valid_transitions().contains(&next),
            "pid {:?}: {:?} -> {:?}",
            self.pid,
            self.state,
            next
        );
        self.state = next;
    }

    /// Copy `name`, truncating to the last whole character that fits
    pub(crate) fn set_name(&mut self, name: &str) {
        self.name.clear();
        for c in name.chars() {
            if self.name.push(c).is_err() {
                break;
            }
        }
    }

    pub(crate) fn is_thread(&self) -> bool {
        self.flags.contains(UnitFlags::THREAD)
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.flags.contains(UnitFlags::KILLED)
    }
}

/// The slots behind the table lock
#[derive(Debug)]
pub struct ProcTable {
    pub(crate) units: Vec<UnitInner>,
    next_pid: u64,
}

impl ProcTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            units: (0..capacity).map(|_| UnitInner::default()).collect(),
            next_pid: 1,
        }
    }

    pub(crate) fn next_pid(&mut self) -> Pid {
        let pid = Pid::from_raw(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Slot of the live unit with identifier `pid`
    pub(crate) fn find(&self, pid: Pid) -> Option<usize> {
        self.units
            .iter()
            .position(|unit| unit.state != UnitState::Unused && unit.pid == Some(pid))
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.units.iter().filter(|unit| unit.state == UnitState::Unused).count()
    }

    /// Look over the children of `parent` that `kind` accepts; returns
    /// whether there are any and the slot of the first Zombie among them
    pub(crate) fn scan_children(&self, parent: Pid, kind: impl Fn(&UnitInner) -> bool) -> (bool, Option<usize>) {
        let mut have_children = false;
        for (slot, unit) in self.units.iter().enumerate() {
            if unit.state == UnitState::Unused || unit.parent != Some(parent) || !kind(unit) {
                continue;
            }
            have_children = true;
            if unit.state == UnitState::Zombie {
                return (true, Some(slot));
            }
        }
        (have_children, None)
    }

    /// Does any unreaped unit still hold `space`
    pub(crate) fn space_in_use(&self, space: AddressSpaceId) -> bool {
        self.units
            .iter()
            .any(|unit| unit.state != UnitState::Unused && unit.space == Some(space))
    }
}

/// Owner-private part of a unit
pub(crate) struct UnitData<M: Machine> {
    pub(crate) kstack: Option<KernelStack>,
    pub(crate) context: Option<M::Context>,
    pub(crate) trapframe: TrapFrame,
    pub(crate) files: FileTable,
    pub(crate) cwd: Option<CwdHandle>,
}

pub(crate) struct UnitCell<M: Machine>(UnsafeCell<UnitData<M>>);

// SAFETY: a slot's data has exactly one owner at a time (see module docs).
unsafe impl<M: Machine> Sync for UnitCell<M> {}
unsafe impl<M: Machine> Send for UnitCell<M> {}

impl<M: Machine> UnitCell<M> {
    pub(crate) fn new(open_files: usize) -> Self {
        Self(UnsafeCell::new(UnitData {
            kstack: None,
            context: None,
            trapframe: TrapFrame::default(),
            files: FileTable::new(open_files),
            cwd: None,
        }))
    }
}

/// One line of the debug dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSnapshot {
    /// Identifier
    pub pid: Pid,
    /// State when read
    pub state: UnitState,
    /// Name
    pub name: UnitName,
    /// Parent identifier
    pub parent: Option<Pid>,
    /// Flags
    pub flags: UnitFlags,
    /// Address space handle
    pub space: Option<AddressSpaceId>,
    /// Channel, if sleeping
    pub channel: Option<Channel>,
    /// Where the unit went to sleep
    pub sleep_site: Option<&'static Location<'static>>,
}

impl fmt::Display for UnitSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.flags.contains(UnitFlags::THREAD) { "thread" } else { "proc" };
        write!(f, "{} {} {} {}", self.pid, self.state.label(), kind, self.name)?;
        if let Some(site) = self.sleep_site {
            write!(f, " @ {}", site)?;
        }
        Ok(())
    }
}

impl<M: Machine> Kernel<M> {
    /// Owner-private data of `slot`
    ///
    /// # Safety
    /// The caller must own the slot: be its allocator while Embryo, the unit
    /// itself while it runs, or its reaper under the table lock once it is a
    /// Zombie.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data(&self, slot: usize) -> &mut UnitData<M> {
        // SAFETY: exclusive ownership is guaranteed by the caller.
        unsafe { &mut *self.units[slot].0.get() }
    }

    /// Claim a free slot and give it a kernel stack and a context that
    /// starts in `fork_ret`
    ///
    /// The unit is left as an Embryo: invisible to schedulers until its
    /// creator marks it Runnable.
    pub(crate) fn allocate(&'static self) -> ExecResult<(usize, Pid)> {
        let (slot, pid) = {
            let mut table = self.lock_table();
            let Some(slot) = table.units.iter().position(|unit| unit.state == UnitState::Unused) else {
                log::debug!("allocate: table full");
                return Err(ExecError::OutOfResources);
            };
            let pid = table.next_pid();
            let unit = &mut table.units[slot];
            *unit = UnitInner::default();
            unit.set_state(UnitState::Embryo);
            unit.pid = Some(pid);
            (slot, pid)
        };

        let stack = match self.stacks.allocate() {
            Ok(stack) => stack,
            Err(err) => {
                log::debug!("allocate: no kernel stack for pid {}", pid);
                self.abandon(slot);
                return Err(err);
            }
        };
        let entry: ContextEntry = Box::new(move || self.fork_ret());
        let context = match self.machine().new_context(stack.top(), entry) {
            Ok(context) => context,
            Err(err) => {
                log::warn!("allocate: no context for pid {}: {:?}", pid, err);
                drop(stack);
                self.abandon(slot);
                return Err(ExecError::OutOfResources);
            }
        };

        // SAFETY: the slot is an Embryo owned by this call.
        let data = unsafe { self.data(slot) };
        data.kstack = Some(stack);
        data.context = Some(context);
        data.trapframe = TrapFrame::default();
        data.cwd = None;

        log::debug!("allocated pid {} in slot {}", pid, slot);
        Ok((slot, pid))
    }

    /// Return a partially built Embryo to the free pool
    pub(crate) fn abandon(&self, slot: usize) {
        // SAFETY: the slot is still an Embryo owned by the caller.
        let data = unsafe { self.data(slot) };
        data.files.close_all(&*self.resources);
        if let Some(cwd) = data.cwd.take() {
            self.resources.release_cwd(cwd);
        }
        data.kstack = None;
        data.context = None;

        let mut table = self.lock_table();
        table.units[slot] = UnitInner::default();
    }

    /// Release everything a Zombie still holds and free its slot
    ///
    /// The address space is torn down only when no other unreaped unit
    /// holds the same handle.
    pub(crate) fn reap(&self, table: &mut ProcTable, slot: usize) -> Pid {
        // SAFETY: the slot is a Zombie and the caller holds the table lock.
        let data = unsafe { self.data(slot) };
        data.kstack = None;
        data.context = None;
        data.trapframe = TrapFrame::default();

        let unit = &mut table.units[slot];
        let pid = unit.pid.unwrap_or(Pid::from_raw(0));
        let space = unit.space.take();
        *unit = UnitInner::default();

        if let Some(space) = space {
            if table.space_in_use(space) {
                log::debug!("reap pid {}: {} still shared", pid, space);
            } else {
                log::debug!("reap pid {}: tearing down {}", pid, space);
                self.memory.destroy(space);
            }
        }
        pid
    }

    /// Create the first process
    ///
    /// It gets a fresh address space of `init_memory` bytes, starts at
    /// `entry` with its stack pointer at the top of that space, and owns
    /// the root directory.
    pub fn user_init(&'static self, entry: VirtAddr) -> ExecResult<Pid> {
        if self.init.get().is_some() {
            return Err(ExecError::InvalidState);
        }
        let (slot, pid) = self.allocate()?;
        let size = self.config.init_memory;
        let space = match self.memory.create(size) {
            Ok(space) => space,
            Err(err) => {
                self.abandon(slot);
                return Err(err.into());
            }
        };

        // SAFETY: the slot is an Embryo owned by this call.
        let data = unsafe { self.data(slot) };
        data.trapframe = TrapFrame::new_user(entry, VirtAddr::new(size as u64));
        data.cwd = Some(self.resources.root_cwd());
        self.init.call_once(|| pid);

        let mut table = self.lock_table();
        let unit = &mut table.units[slot];
        unit.space = Some(space);
        unit.size = size;
        unit.set_name("init");
        unit.set_state(UnitState::Runnable);
        log::info!("init is pid {} at {}", pid, entry);
        Ok(pid)
    }

    /// Number of free slots in the table
    pub fn free_slots(&self) -> usize {
        self.lock_table().free_slots()
    }

    /// List every non-Unused unit without taking the table lock
    ///
    /// Meant for a console key or a debugger: it must work even when the
    /// table lock is wedged, so entries may be mid-update.
    pub fn dump(&self) -> Vec<UnitSnapshot> {
        // SAFETY: diagnostics only; a torn view is acceptable and the
        // reference does not outlive this call.
        let table = unsafe { self.table.peek() };
        let snapshots: Vec<_> = table
            .units
            .iter()
            .filter(|unit| unit.state != UnitState::Unused)
            .filter_map(|unit| {
                Some(UnitSnapshot {
                    pid: unit.pid?,
                    state: unit.state,
                    name: unit.name.clone(),
                    parent: unit.parent,
                    flags: unit.flags,
                    space: unit.space,
                    channel: unit.channel,
                    sleep_site: unit.sleep_site,
                })
            })
            .collect();
        for snapshot in &snapshots {
            log::info!("{}", snapshot);
        }
        snapshots
    }
}
