//! # Sleep and Wakeup
//!
//! A unit waiting for a condition sleeps on a [`Channel`]; whoever changes
//! the condition wakes every unit sleeping on it. Wakeups are broadcast and
//! carry no payload, so sleepers re-check their condition in a loop.
//!
//! No wakeup is lost: `sleep` takes the table lock before it lets go of the
//! lock protecting the condition, and `wakeup` needs the table lock to mark
//! anyone Runnable.

use core::panic::Location;

use spindle_hal::Machine;

use crate::context::SwitchReason;
use crate::kernel::{Kernel, TableGuard};
use crate::process::{ProcTable, UnitState};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::Pid;

/// Opaque token a unit sleeps on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Events concerning a unit: its children exiting
    Unit(Pid),
    /// The clock advancing
    Ticks,
    /// Any other condition, usually the address of the data it concerns
    Token(usize),
}

impl Channel {
    /// Channel named after the address of `value`
    pub fn of<T>(value: &T) -> Self {
        Channel::Token(value as *const T as usize)
    }
}

impl ProcTable {
    /// Make every unit sleeping on `channel` Runnable; returns how many
    pub(crate) fn wake(&mut self, channel: Channel) -> usize {
        let mut woken = 0;
        for unit in self
            .units
            .iter_mut()
            .filter(|unit| unit.state == UnitState::Sleeping && unit.channel == Some(channel))
        {
            unit.set_state(UnitState::Runnable);
            woken += 1;
        }
        woken
    }
}

impl<M: Machine> Kernel<M> {
    /// Atomically release `guard` and sleep on `channel`; reacquire the
    /// same lock before returning
    #[track_caller]
    pub fn sleep<'a, T>(&self, channel: Channel, guard: SpinLockGuard<'a, T, M>) -> SpinLockGuard<'a, T, M> {
        let site = Location::caller();
        let cpus = guard.cpus();
        let table = self.lock_table();
        let lock = SpinLock::unlock(guard);
        drop(self.sleep_on(channel, table, site));
        lock.lock(cpus)
    }

    /// Sleep on `channel` while already holding the table lock
    #[track_caller]
    pub(crate) fn sleep_locked<'a>(&self, channel: Channel, table: TableGuard<'a, M>) -> TableGuard<'a, M> {
        self.sleep_on(channel, table, Location::caller())
    }

    fn sleep_on<'a>(
        &self,
        channel: Channel,
        mut table: TableGuard<'a, M>,
        site: &'static Location<'static>,
    ) -> TableGuard<'a, M> {
        let current = self.current_unit();
        let unit = &mut table.units[current.slot];
        unit.channel = Some(channel);
        unit.sleep_site = Some(site);
        unit.set_state(UnitState::Sleeping);
        log::trace!("pid {} sleeps on {:?}", current.pid, channel);

        self.sched(&mut table, SwitchReason::Sleep);

        let unit = &mut table.units[current.slot];
        unit.channel = None;
        unit.sleep_site = None;
        table
    }

    /// Wake every unit sleeping on `channel`; returns how many were woken
    pub fn wakeup(&self, channel: Channel) -> usize {
        let woken = self.lock_table().wake(channel);
        if woken > 0 {
            log::trace!("woke {} on {:?}", woken, channel);
        }
        woken
    }
}
