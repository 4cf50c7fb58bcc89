//! Fork, exit, wait, kill and the clock, end to end.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::vec::Vec;

use spindle_execution::{Channel, ExecError, FileHandle, KernelConfig, Pid, UnitSnapshot, UnitState};
use spindle_hal::VirtAddr;
use spindle_memory::{FlatMemory, PAGE_SIZE};

use super::{finish, get, set, wait_for, wait_until, Harness};
use crate::init::reap_forever;
use crate::syscalls::{Sys, Syscall};
use crate::UserError;

// =========================================================================
// Fork / wait
// =========================================================================

mod fork_wait {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static FORKED_MATCH_REAPED: AtomicBool = AtomicBool::new(false);
    pub(super) static DISTINCT: AtomicU64 = AtomicU64::new(0);
    pub(super) static FREE_BEFORE: AtomicU64 = AtomicU64::new(0);
    pub(super) static FREE_AFTER: AtomicU64 = AtomicU64::new(0);
    pub(super) static EXTRA_WAIT_FAILED: AtomicBool = AtomicBool::new(false);

    fn child(sys: &Sys<'_>, ret: u64) {
        assert_eq!(ret, 0);
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        set(&FREE_BEFORE, sys.kernel().free_slots() as u64);

        let forked: Vec<Pid> = (0..5).map(|_| sys.fork(child).expect("fork")).collect();
        let mut reaped: Vec<Pid> = (0..5).map(|_| sys.wait().expect("wait")).collect();
        reaped.sort();

        let mut sorted = forked.clone();
        sorted.sort();
        FORKED_MATCH_REAPED.store(sorted == reaped, Ordering::SeqCst);
        set(&DISTINCT, forked.iter().collect::<BTreeSet<_>>().len() as u64);
        set(&FREE_AFTER, sys.kernel().free_slots() as u64);
        EXTRA_WAIT_FAILED.store(sys.wait() == Err(UserError::Failed), Ordering::SeqCst);
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_fork_wait_reaps_every_child_and_restores_slots() {
    use fork_wait::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    assert!(FORKED_MATCH_REAPED.load(Ordering::SeqCst));
    assert_eq!(get(&DISTINCT), 5);
    assert_eq!(get(&FREE_AFTER), get(&FREE_BEFORE));
    assert_eq!(get(&FREE_BEFORE), KernelConfig::DEFAULT_MAX_UNITS as u64 - 1);
    assert!(EXTRA_WAIT_FAILED.load(Ordering::SeqCst));

    let stats = harness.memory.stats();
    assert_eq!(stats.live_spaces, 1);
    assert_eq!(stats.destroyed, 5);
    assert_eq!(stats.invalid_destroys, 0);
    assert_eq!(harness.kernel.kernel_stacks_in_use(), 1);
}

// =========================================================================
// Identifiers
// =========================================================================

mod pids {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static INIT_PID: AtomicU64 = AtomicU64::new(0);
    pub(super) static INCREASING: AtomicBool = AtomicBool::new(false);
    pub(super) static CHILD_SAW: AtomicU64 = AtomicU64::new(0);
    pub(super) static LAST_CHILD: AtomicU64 = AtomicU64::new(0);

    fn child(sys: &Sys<'_>, _ret: u64) {
        set(&CHILD_SAW, sys.getpid().as_u64());
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        set(&INIT_PID, sys.getpid().as_u64());
        let mut previous = sys.getpid();
        let mut increasing = true;
        for _ in 0..4 {
            let pid = sys.fork(child).expect("fork");
            increasing &= pid > previous;
            previous = pid;
            assert_eq!(sys.wait(), Ok(pid));
        }
        // Slot reuse never recycles an identifier.
        set(&LAST_CHILD, previous.as_u64());
        INCREASING.store(increasing, Ordering::SeqCst);
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_pids_are_unique_and_never_reused() {
    use pids::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    assert_eq!(get(&INIT_PID), 1);
    assert_eq!(harness.kernel.init_pid(), Some(Pid::from_raw(1)));
    assert!(INCREASING.load(Ordering::SeqCst));
    assert_eq!(get(&LAST_CHILD), 5);
    assert_eq!(get(&CHILD_SAW), 5);
}

mod concurrent_forks {
    use super::*;

    pub(super) const PER_FORKER: usize = 20;

    const UNSET: AtomicU64 = AtomicU64::new(0);
    pub(super) static PIDS: [AtomicU64; 2 * PER_FORKER] = [UNSET; 2 * PER_FORKER];
    pub(super) static STARTED: AtomicU64 = AtomicU64::new(0);
    pub(super) static DONE: AtomicBool = AtomicBool::new(false);

    fn leaf(sys: &Sys<'_>, _ret: u64) {
        sys.exit();
    }

    fn fork_many(sys: &Sys<'_>, base: usize) -> ! {
        STARTED.fetch_add(1, Ordering::SeqCst);
        while get(&STARTED) < 2 {
            sys.yield_now();
        }
        for pid in &PIDS[base..base + PER_FORKER] {
            set(pid, sys.fork(leaf).expect("fork").as_u64());
        }
        for _ in 0..PER_FORKER {
            sys.wait().expect("wait");
        }
        sys.exit()
    }

    fn first(sys: &Sys<'_>, _ret: u64) {
        fork_many(sys, 0)
    }

    fn second(sys: &Sys<'_>, _ret: u64) {
        fork_many(sys, PER_FORKER)
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        sys.fork(first).expect("fork");
        sys.fork(second).expect("fork");
        sys.wait().expect("wait");
        sys.wait().expect("wait");
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_concurrent_forks_never_share_a_pid() {
    use concurrent_forks::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    let pids: BTreeSet<u64> = PIDS.iter().map(get).collect();
    assert_eq!(pids.len(), 2 * PER_FORKER);
    // init is 1 and the forkers are 2 and 3.
    assert!(pids.iter().all(|pid| *pid > 3));
    assert_eq!(harness.memory.stats().destroyed, 2 * PER_FORKER as u64 + 2);
    assert_eq!(harness.kernel.kernel_stacks_in_use(), 1);
}

// =========================================================================
// Exit ordering
// =========================================================================

mod early_exit {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static CHILD: AtomicU64 = AtomicU64::new(0);
    pub(super) static REAPED: AtomicU64 = AtomicU64::new(0);

    fn child(sys: &Sys<'_>, _ret: u64) {
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let pid = sys.fork(child).expect("fork");
        set(&CHILD, pid.as_u64());
        // Let the child become a zombie before anyone waits for it.
        sys.sleep(5).expect("sleep");
        set(&REAPED, sys.wait().expect("wait").as_u64());
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_child_exiting_before_wait_is_still_reaped() {
    use early_exit::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    assert_ne!(get(&CHILD), 0);
    assert_eq!(get(&REAPED), get(&CHILD));
    assert_eq!(harness.memory.stats().live_spaces, 1);
}

mod copy_semantics {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static CHILD_READ: AtomicU64 = AtomicU64::new(0);
    pub(super) static CHILD_RET: AtomicU64 = AtomicU64::new(u64::MAX);
    pub(super) static PARENT_READ: AtomicU64 = AtomicU64::new(0);

    fn child(sys: &Sys<'_>, ret: u64) {
        set(&CHILD_RET, ret);
        let word = sys.local_word();
        set(&CHILD_READ, sys.read_word(word).expect("read"));
        sys.write_word(word, 0x9999).expect("write");
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let word = sys.local_word();
        sys.write_word(word, 0x1234).expect("write");
        sys.fork(child).expect("fork");
        sys.wait().expect("wait");
        set(&PARENT_READ, sys.read_word(word).expect("read"));
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_fork_copies_memory_and_zeroes_child_return() {
    use copy_semantics::*;
    let _harness = Harness::boot(init);
    wait_for(&DONE);

    assert_eq!(get(&CHILD_RET), 0);
    assert_eq!(get(&CHILD_READ), 0x1234);
    assert_eq!(get(&PARENT_READ), 0x1234);
}

mod orphans {
    use super::*;

    pub(super) static PARENT_REAPED: AtomicBool = AtomicBool::new(false);
    pub(super) static GRANDCHILD_RAN: AtomicBool = AtomicBool::new(false);

    fn grandchild(sys: &Sys<'_>, _ret: u64) {
        sys.sleep(10).expect("sleep");
        GRANDCHILD_RAN.store(true, Ordering::SeqCst);
        sys.exit();
    }

    fn parent(sys: &Sys<'_>, _ret: u64) {
        sys.fork(grandchild).expect("fork");
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        sys.fork(parent).expect("fork");
        sys.wait().expect("wait");
        PARENT_REAPED.store(true, Ordering::SeqCst);
        reap_forever(sys)
    }
}

#[test]
fn test_orphans_are_adopted_and_reaped_by_init() {
    use orphans::*;
    let harness = Harness::boot(init);
    wait_for(&PARENT_REAPED);
    wait_for(&GRANDCHILD_RAN);

    wait_until("grandchild to be reaped", || harness.memory.stats().live_spaces == 1);
    wait_until("kernel stacks to be released", || harness.kernel.kernel_stacks_in_use() == 1);
    assert_eq!(harness.memory.stats().destroyed, 2);
}

// =========================================================================
// Table capacity
// =========================================================================

mod exhaustion {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static FORKED: AtomicU64 = AtomicU64::new(0);
    pub(super) static FULL_FAILED: AtomicBool = AtomicBool::new(false);
    pub(super) static FREE_WHEN_FULL: AtomicU64 = AtomicU64::new(u64::MAX);
    pub(super) static FREE_AFTER: AtomicU64 = AtomicU64::new(0);
    pub(super) static REFORK_OK: AtomicBool = AtomicBool::new(false);

    fn sleeper(sys: &Sys<'_>, _ret: u64) {
        loop {
            let _ = sys.sleep(1_000);
        }
    }

    fn quick(sys: &Sys<'_>, _ret: u64) {
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let mut children = Vec::new();
        let failure = loop {
            match sys.fork(sleeper) {
                Ok(pid) => children.push(pid),
                Err(err) => break err,
            }
        };
        set(&FORKED, children.len() as u64);
        FULL_FAILED.store(failure == UserError::Failed, Ordering::SeqCst);
        set(&FREE_WHEN_FULL, sys.kernel().free_slots() as u64);

        for pid in &children {
            sys.kill(*pid).expect("kill");
        }
        for _ in &children {
            sys.wait().expect("wait");
        }
        set(&FREE_AFTER, sys.kernel().free_slots() as u64);

        let pid = sys.fork(quick);
        REFORK_OK.store(pid.is_ok() && sys.wait() == pid, Ordering::SeqCst);
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_full_table_fails_fork_without_leaking_slots() {
    use exhaustion::*;
    let harness = Harness::boot_with(KernelConfig::small(), init);
    wait_for(&DONE);

    assert_eq!(get(&FORKED), 7);
    assert!(FULL_FAILED.load(Ordering::SeqCst));
    assert_eq!(get(&FREE_WHEN_FULL), 0);
    assert_eq!(get(&FREE_AFTER), 7);
    assert!(REFORK_OK.load(Ordering::SeqCst));
    assert_eq!(harness.kernel.kernel_stacks_in_use(), 1);
    assert_eq!(harness.memory.stats().live_spaces, 1);
}

mod stack_exhaustion {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static FORK_FAILED: AtomicBool = AtomicBool::new(false);
    pub(super) static OUT_OF_RESOURCES: AtomicBool = AtomicBool::new(false);
    pub(super) static FREE_BEFORE: AtomicU64 = AtomicU64::new(0);
    pub(super) static FREE_AFTER: AtomicU64 = AtomicU64::new(u64::MAX);

    fn sleeper(sys: &Sys<'_>, _ret: u64) {
        loop {
            let _ = sys.sleep(1_000_000);
        }
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        // Takes the last kernel stack.
        let pid = sys.fork(sleeper).expect("fork");
        set(&FREE_BEFORE, sys.kernel().free_slots() as u64);

        FORK_FAILED.store(sys.fork(sleeper) == Err(UserError::Failed), Ordering::SeqCst);
        OUT_OF_RESOURCES.store(
            sys.kernel().duplicate() == Err(ExecError::OutOfResources),
            Ordering::SeqCst,
        );
        set(&FREE_AFTER, sys.kernel().free_slots() as u64);

        sys.kill(pid).expect("kill");
        sys.wait().expect("wait");
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_kernel_stack_exhaustion_fails_fork_without_leaking_slots() {
    use stack_exhaustion::*;
    let harness = Harness::boot_with(KernelConfig::new().with_max_kernel_stacks(2), init);
    wait_for(&DONE);

    assert!(FORK_FAILED.load(Ordering::SeqCst));
    assert!(OUT_OF_RESOURCES.load(Ordering::SeqCst));
    assert_eq!(get(&FREE_AFTER), get(&FREE_BEFORE));
    assert_eq!(get(&FREE_BEFORE), KernelConfig::DEFAULT_MAX_UNITS as u64 - 2);
    assert_eq!(harness.kernel.kernel_stacks_in_use(), 1);
    assert_eq!(harness.memory.stats().live_spaces, 1);
}

mod copy_failure {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static FORK_FAILED: AtomicBool = AtomicBool::new(false);
    pub(super) static OUT_OF_RESOURCES: AtomicBool = AtomicBool::new(false);
    pub(super) static FREE_BEFORE: AtomicU64 = AtomicU64::new(0);
    pub(super) static FREE_AFTER: AtomicU64 = AtomicU64::new(u64::MAX);

    fn never_runs(_sys: &Sys<'_>, _ret: u64) {
        unreachable!("child of a failed fork ran");
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        set(&FREE_BEFORE, sys.kernel().free_slots() as u64);
        FORK_FAILED.store(sys.fork(never_runs) == Err(UserError::Failed), Ordering::SeqCst);
        OUT_OF_RESOURCES.store(
            sys.kernel().duplicate() == Err(ExecError::OutOfResources),
            Ordering::SeqCst,
        );
        set(&FREE_AFTER, sys.kernel().free_slots() as u64);
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_failed_address_space_copy_releases_the_child() {
    use copy_failure::*;
    // Room for init's page and nothing more.
    let memory = FlatMemory::with_limit(PAGE_SIZE);
    let harness = Harness::boot_with_memory(KernelConfig::new(), memory, init);
    wait_for(&DONE);

    assert!(FORK_FAILED.load(Ordering::SeqCst));
    assert!(OUT_OF_RESOURCES.load(Ordering::SeqCst));
    assert_eq!(get(&FREE_AFTER), get(&FREE_BEFORE));
    assert_eq!(harness.kernel.kernel_stacks_in_use(), 1);
    assert_eq!(harness.resources.cwd_refs(), 1);
    assert_eq!(harness.memory.stats().live_spaces, 1);
}

// =========================================================================
// Kill
// =========================================================================

mod kill_sleeper {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static CHILD: AtomicU64 = AtomicU64::new(0);
    pub(super) static REAPED: AtomicU64 = AtomicU64::new(0);
    pub(super) static KILL_MISSING_FAILED: AtomicBool = AtomicBool::new(false);

    fn child(sys: &Sys<'_>, _ret: u64) {
        loop {
            let _ = sys.sleep(1_000_000);
        }
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let pid = sys.fork(child).expect("fork");
        set(&CHILD, pid.as_u64());
        sys.sleep(2).expect("sleep");
        sys.kill(pid).expect("kill");
        set(&REAPED, sys.wait().expect("wait").as_u64());
        KILL_MISSING_FAILED.store(sys.kill(pid).is_err(), Ordering::SeqCst);
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_kill_wakes_a_sleeping_child() {
    use kill_sleeper::*;
    let _harness = Harness::boot(init);
    wait_for(&DONE);

    assert_eq!(get(&REAPED), get(&CHILD));
    assert!(KILL_MISSING_FAILED.load(Ordering::SeqCst));
}

mod kill_waiter {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static WAITER: AtomicU64 = AtomicU64::new(0);
    pub(super) static FIRST_REAPED: AtomicU64 = AtomicU64::new(0);
    pub(super) static SECOND_REAPED: AtomicU64 = AtomicU64::new(0);
    pub(super) static SLEEPER: AtomicU64 = AtomicU64::new(0);

    fn sleeper(sys: &Sys<'_>, _ret: u64) {
        loop {
            let _ = sys.sleep(1_000_000);
        }
    }

    fn waiter(sys: &Sys<'_>, _ret: u64) {
        let pid = sys.fork(sleeper).expect("fork");
        set(&SLEEPER, pid.as_u64());
        // Blocks until killed; the kill turns the wait into a failure and
        // the system-call return path exits.
        let _ = sys.wait();
        unreachable!("killed unit returned to user code");
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let pid = sys.fork(waiter).expect("fork");
        set(&WAITER, pid.as_u64());
        while get(&SLEEPER) == 0 {
            sys.sleep(1).expect("sleep");
        }
        sys.sleep(2).expect("sleep");

        sys.kill(pid).expect("kill");
        set(&FIRST_REAPED, sys.wait().expect("wait").as_u64());

        // The sleeper is init's child now.
        sys.kill(Pid::from_raw(get(&SLEEPER))).expect("kill");
        set(&SECOND_REAPED, sys.wait().expect("wait").as_u64());
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_kill_interrupts_wait_and_orphans_are_adopted() {
    use kill_waiter::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    assert_eq!(get(&FIRST_REAPED), get(&WAITER));
    assert_eq!(get(&SECOND_REAPED), get(&SLEEPER));
    assert_eq!(harness.memory.stats().live_spaces, 1);
}

// =========================================================================
// Debug dump
// =========================================================================

mod dump {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static GRANDCHILD: AtomicU64 = AtomicU64::new(0);
    pub(super) static LISTED: AtomicU64 = AtomicU64::new(0);
    pub(super) static CHILD_WAITING: AtomicBool = AtomicBool::new(false);
    pub(super) static SITE_IN_WAIT: AtomicBool = AtomicBool::new(false);
    pub(super) static INIT_RUNNING: AtomicBool = AtomicBool::new(false);

    fn grandchild(sys: &Sys<'_>, _ret: u64) {
        loop {
            let _ = sys.sleep(1_000_000);
        }
    }

    fn child(sys: &Sys<'_>, _ret: u64) {
        set(&GRANDCHILD, sys.fork(grandchild).expect("fork").as_u64());
        // Parked on its own channel, which no tick touches.
        let _ = sys.wait();
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let pid = sys.fork(child).expect("fork");
        while get(&GRANDCHILD) == 0 {
            sys.sleep(1).expect("sleep");
        }

        let waiting = |units: &[UnitSnapshot]| {
            units
                .iter()
                .find(|unit| unit.pid == pid && unit.state == UnitState::Sleeping)
                .cloned()
        };
        let mut units = sys.kernel().dump();
        for _ in 0..100 {
            if waiting(&units).is_some() {
                break;
            }
            sys.sleep(1).expect("sleep");
            units = sys.kernel().dump();
        }

        set(&LISTED, units.len() as u64);
        if let Some(unit) = waiting(&units) {
            CHILD_WAITING.store(unit.channel == Some(Channel::Unit(pid)), Ordering::SeqCst);
            let in_wait = unit.sleep_site.is_some_and(|site| site.file().ends_with("lifecycle.rs"));
            SITE_IN_WAIT.store(in_wait, Ordering::SeqCst);
        }
        let running = units
            .iter()
            .any(|unit| unit.pid == sys.getpid() && unit.state == UnitState::Running && unit.name.as_str() == "init");
        INIT_RUNNING.store(running, Ordering::SeqCst);

        sys.kill(pid).expect("kill");
        sys.wait().expect("wait");
        // The grandchild is init's now.
        sys.kill(Pid::from_raw(get(&GRANDCHILD))).expect("kill");
        sys.wait().expect("wait");
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_dump_lists_live_units() {
    use dump::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    assert_eq!(get(&LISTED), 3);
    assert!(CHILD_WAITING.load(Ordering::SeqCst));
    assert!(SITE_IN_WAIT.load(Ordering::SeqCst));
    assert!(INIT_RUNNING.load(Ordering::SeqCst));
    assert_eq!(harness.memory.stats().live_spaces, 1);
}

// =========================================================================
// Init
// =========================================================================

fn exiting_init(sys: &Sys<'_>, _ret: u64) {
    sys.exit();
}

#[test]
fn test_init_exit_halts_the_machine() {
    let harness = Harness::boot(exiting_init);
    wait_until("machine to halt", || harness.machine.halt_reason().is_some());

    assert!(harness.machine.is_stopped());
    let reason = harness.machine.halt_reason().unwrap_or_default();
    assert!(reason.contains("init exiting"), "{reason}");
}

// =========================================================================
// Files and working directory
// =========================================================================

mod files {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static CHILD_OPEN: AtomicU64 = AtomicU64::new(0);
    pub(super) static CLOSE_BAD_FAILED: AtomicBool = AtomicBool::new(false);

    fn child(sys: &Sys<'_>, _ret: u64) {
        set(&CHILD_OPEN, sys.kernel().open_files() as u64);
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let first = sys.install_file(FileHandle(10)).expect("install");
        let second = sys.install_file(FileHandle(11)).expect("install");
        assert_eq!((first, second), (0, 1));

        sys.fork(child).expect("fork");
        sys.wait().expect("wait");

        sys.close(first).expect("close");
        CLOSE_BAD_FAILED.store(sys.close(first).is_err(), Ordering::SeqCst);
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_fork_duplicates_and_exit_closes_references() {
    use files::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    assert_eq!(get(&CHILD_OPEN), 2);
    assert!(CLOSE_BAD_FAILED.load(Ordering::SeqCst));
    // Two duplicates for the child, two closes at its exit, one explicit.
    assert_eq!(harness.resources.file_duplicates(), 2);
    assert_eq!(harness.resources.file_closes(), 3);
    // Only init still holds a working directory.
    assert_eq!(harness.resources.cwd_refs(), 1);
}

// =========================================================================
// Clock and memory growth
// =========================================================================

mod clock {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static BEFORE: AtomicU64 = AtomicU64::new(0);
    pub(super) static AFTER: AtomicU64 = AtomicU64::new(0);

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        set(&BEFORE, sys.uptime());
        sys.sleep(3).expect("sleep");
        set(&AFTER, sys.uptime());
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_sleep_waits_for_ticks() {
    use clock::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    assert!(get(&AFTER) >= get(&BEFORE) + 3);
    let stats = harness.kernel.metrics().snapshot();
    assert!(stats.ticks >= 3);
    assert!(stats.sleeps >= 1);
}

mod grow {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static OLD_BREAK: AtomicU64 = AtomicU64::new(0);
    pub(super) static GROWN_READ: AtomicU64 = AtomicU64::new(0);
    pub(super) static OUTSIDE_FAILED: AtomicBool = AtomicBool::new(false);
    pub(super) static SBRK_CALLS: AtomicU64 = AtomicU64::new(0);

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let old = sys.sbrk(PAGE_SIZE as isize).expect("sbrk");
        set(&OLD_BREAK, old.as_u64());

        let inside = VirtAddr::new(old.as_u64() + 8);
        sys.write_word(inside, 77).expect("write");
        set(&GROWN_READ, sys.read_word(inside).expect("read"));

        let beyond = VirtAddr::new(2 * PAGE_SIZE as u64);
        OUTSIDE_FAILED.store(sys.read_word(beyond).is_err(), Ordering::SeqCst);
        set(&SBRK_CALLS, sys.stats().count(Syscall::Sbrk));
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_sbrk_extends_the_address_space() {
    use grow::*;
    let _harness = Harness::boot(init);
    wait_for(&DONE);

    assert_eq!(get(&OLD_BREAK), PAGE_SIZE as u64);
    assert_eq!(get(&GROWN_READ), 77);
    assert!(OUTSIDE_FAILED.load(Ordering::SeqCst));
    assert_eq!(get(&SBRK_CALLS), 1);
}
