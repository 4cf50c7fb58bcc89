//! Clone, join and the shared address space.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spindle_execution::{Pid, UnitState};
use spindle_hal::VirtAddr;
use spindle_memory::PAGE_SIZE;

use super::{finish, get, set, wait_for, wait_until, Harness};
use crate::init::reap_forever;
use crate::syscalls::{Sys, Syscall};
use crate::thread::ThreadLib;
use crate::ticket_lock::TicketLock;
use crate::UserError;

// =========================================================================
// Mutual exclusion across threads
// =========================================================================

mod counter {
    use super::*;

    pub(super) const ROUNDS: u64 = 100_000;

    pub(super) static LIB: ThreadLib = ThreadLib::new();
    pub(super) static COUNTER: TicketLock<u64> = TicketLock::new(0);
    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static TOTAL: AtomicU64 = AtomicU64::new(0);
    pub(super) static JOINED: AtomicU64 = AtomicU64::new(0);

    fn worker(_sys: &Sys<'_>, rounds: u64, _unused: u64) {
        for _ in 0..rounds {
            *COUNTER.lock() += 1;
        }
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        LIB.create(sys, worker, ROUNDS, 0).expect("create");
        LIB.create(sys, worker, ROUNDS, 0).expect("create");
        let mut joined = 0;
        while LIB.join(sys).is_ok() {
            joined += 1;
        }
        set(&JOINED, joined);
        set(&TOTAL, *COUNTER.lock());
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_threads_share_a_ticket_locked_counter() {
    use counter::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    assert_eq!(get(&JOINED), 2);
    assert_eq!(get(&TOTAL), 200_000);
    assert_eq!(COUNTER.now_serving(), COUNTER.tickets_issued());
    assert_eq!(LIB.free_stacks(), 2);
    assert_eq!(harness.kernel.kernel_stacks_in_use(), 1);
    // Joining threads never tears down the space they shared with init.
    assert_eq!(harness.memory.stats().live_spaces, 1);
    assert_eq!(harness.memory.stats().destroyed, 0);
}

// =========================================================================
// Arguments, shared memory and stack reuse
// =========================================================================

mod shared_memory {
    use super::*;

    pub(super) const MAILBOX: u64 = 128;

    pub(super) static LIB: ThreadLib = ThreadLib::new();
    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static SEEN: AtomicU64 = AtomicU64::new(0);
    pub(super) static SECOND_SEEN: AtomicU64 = AtomicU64::new(0);
    pub(super) static THREAD_PID: AtomicU64 = AtomicU64::new(0);
    pub(super) static SECOND_THREAD_PID: AtomicU64 = AtomicU64::new(0);
    pub(super) static CREATED: AtomicU64 = AtomicU64::new(0);
    pub(super) static SECOND_CREATED: AtomicU64 = AtomicU64::new(0);
    pub(super) static JOINED: AtomicU64 = AtomicU64::new(0);
    pub(super) static SBRK_CALLS: AtomicU64 = AtomicU64::new(0);

    fn writer(sys: &Sys<'_>, value: u64, mailbox: u64) {
        let pid = sys.getpid().as_u64();
        if THREAD_PID.compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            set(&SECOND_THREAD_PID, pid);
        }
        sys.write_word(VirtAddr::new(mailbox), value + 1).expect("write");
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let mailbox = VirtAddr::new(MAILBOX);

        let pid = LIB.create(sys, writer, 41, MAILBOX).expect("create");
        set(&CREATED, pid.as_u64());
        set(&JOINED, LIB.join(sys).expect("join").as_u64());
        set(&SEEN, sys.read_word(mailbox).expect("read"));

        // The second thread runs on the recycled stack.
        let pid = LIB.create(sys, writer, 99, MAILBOX).expect("create");
        set(&SECOND_CREATED, pid.as_u64());
        LIB.join(sys).expect("join");
        set(&SECOND_SEEN, sys.read_word(mailbox).expect("read"));
        set(&SBRK_CALLS, sys.stats().count(Syscall::Sbrk));
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_thread_gets_its_arguments_and_shares_memory() {
    use shared_memory::*;
    let _harness = Harness::boot(init);
    wait_for(&DONE);

    assert_eq!(get(&SEEN), 42);
    assert_eq!(get(&SECOND_SEEN), 100);
    assert_eq!(get(&JOINED), get(&CREATED));
    assert_eq!(get(&THREAD_PID), get(&CREATED));
    assert_eq!(get(&SECOND_THREAD_PID), get(&SECOND_CREATED));
    assert_ne!(get(&SECOND_CREATED), get(&CREATED));
    assert_eq!(get(&SBRK_CALLS), 1);
    assert_eq!(LIB.free_stacks(), 1);
}

// =========================================================================
// Stack validation
// =========================================================================

mod bad_stacks {
    use super::*;

    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static BEYOND_FAILED: AtomicBool = AtomicBool::new(false);
    pub(super) static WRAP_FAILED: AtomicBool = AtomicBool::new(false);
    pub(super) static FREE_BEFORE: AtomicU64 = AtomicU64::new(0);
    pub(super) static FREE_AFTER: AtomicU64 = AtomicU64::new(u64::MAX);

    fn never_runs(_sys: &Sys<'_>, _a: u64, _b: u64) {
        unreachable!("thread started on a rejected stack");
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        set(&FREE_BEFORE, sys.kernel().free_slots() as u64);

        // init owns exactly one page, so a region starting at its end is
        // outside its memory.
        let beyond = VirtAddr::new(PAGE_SIZE as u64);
        BEYOND_FAILED.store(sys.clone(never_runs, 0, 0, beyond).is_err(), Ordering::SeqCst);

        let wrapping = VirtAddr::new(u64::MAX - 8);
        WRAP_FAILED.store(sys.clone(never_runs, 0, 0, wrapping).is_err(), Ordering::SeqCst);

        set(&FREE_AFTER, sys.kernel().free_slots() as u64);
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_clone_rejects_stacks_outside_the_caller() {
    use bad_stacks::*;
    let harness = Harness::boot(init);
    wait_for(&DONE);

    assert!(BEYOND_FAILED.load(Ordering::SeqCst));
    assert!(WRAP_FAILED.load(Ordering::SeqCst));
    assert_eq!(get(&FREE_AFTER), get(&FREE_BEFORE));
    assert_eq!(harness.kernel.kernel_stacks_in_use(), 1);
}

// =========================================================================
// Teardown of a shared space
// =========================================================================

mod abandoned_threads {
    use super::*;

    pub(super) static LIB: ThreadLib = ThreadLib::new();
    pub(super) static PARENT_REAPED: AtomicBool = AtomicBool::new(false);
    pub(super) static THREADS_FINISHED: AtomicU64 = AtomicU64::new(0);

    fn lingering(sys: &Sys<'_>, ticks: u64, _unused: u64) {
        sys.sleep(ticks).expect("sleep");
        THREADS_FINISHED.fetch_add(1, Ordering::SeqCst);
    }

    fn parent(sys: &Sys<'_>, _ret: u64) {
        LIB.create(sys, lingering, 200, 0).expect("create");
        LIB.create(sys, lingering, 400, 0).expect("create");
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
fn test_last_reap_of_a_shared_space_destroys_it() {
    use abandoned_threads::*;
    let harness = Harness::boot(init);
    wait_for(&PARENT_REAPED);

    // The threads still hold the parent's space.
    assert_eq!(harness.memory.stats().live_spaces, 2);
    assert_eq!(harness.memory.stats().destroyed, 0);
    wait_until("threads to finish", || THREADS_FINISHED.load(Ordering::SeqCst) == 2);
    wait_until("adopted threads to be joined", || harness.memory.stats().live_spaces == 1);
    wait_until("kernel stacks to be released", || harness.kernel.kernel_stacks_in_use() == 1);

    let stats = harness.memory.stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.invalid_destroys, 0);
}

mod adopted_thread {
    use super::*;

    pub(super) static LIB: ThreadLib = ThreadLib::new();
    pub(super) static SLEEPER: AtomicU64 = AtomicU64::new(0);
    pub(super) static THREAD_RAN: AtomicBool = AtomicBool::new(false);

    fn sleeper(sys: &Sys<'_>, _ret: u64) {
        loop {
            let _ = sys.sleep(1_000_000);
        }
    }

    fn short_lived(_sys: &Sys<'_>, _a: u64, _b: u64) {
        THREAD_RAN.store(true, Ordering::SeqCst);
    }

    fn parent(sys: &Sys<'_>, _ret: u64) {
        LIB.create(sys, short_lived, 0, 0).expect("create");
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        // A live process child keeps init's reaper blocked the whole time.
        set(&SLEEPER, sys.fork(sleeper).expect("fork").as_u64());
        sys.fork(parent).expect("fork");
        reap_forever(sys)
    }
}

#[test]
fn test_init_reaps_an_adopted_thread_while_a_child_lives() {
    use adopted_thread::*;
    let harness = Harness::boot(init);
    wait_for(&THREAD_RAN);

    // init and the sleeper remain; the parent and its thread are gone.
    wait_until("adopted thread to be reaped", || harness.memory.stats().live_spaces == 2);
    wait_until("kernel stacks to be released", || harness.kernel.kernel_stacks_in_use() == 2);
    let units = harness.kernel.dump();
    assert_eq!(units.len(), 2);
    assert!(units.iter().all(|unit| unit.state != UnitState::Zombie));
    assert!(units.iter().any(|unit| unit.pid.as_u64() == get(&SLEEPER)));

    let stats = harness.memory.stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.invalid_destroys, 0);
}

// =========================================================================
// Join and wait
// =========================================================================

mod join_copy_out {
    use super::*;

    pub(super) static LIB: ThreadLib = ThreadLib::new();
    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static BAD_OUT: AtomicBool = AtomicBool::new(false);
    pub(super) static CREATED: AtomicU64 = AtomicU64::new(0);
    pub(super) static JOINED: AtomicU64 = AtomicU64::new(0);

    fn quick(_sys: &Sys<'_>, _a: u64, _b: u64) {}

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let pid = LIB.create(sys, quick, 0, 0).expect("create");
        set(&CREATED, pid.as_u64());

        // The thread stays a zombie when its stack cannot be handed back.
        let unwritable = VirtAddr::new(u64::MAX - 3);
        BAD_OUT.store(sys.join(unwritable) == Err(UserError::CopyOutFailed), Ordering::SeqCst);
        set(&JOINED, LIB.join(sys).expect("join").as_u64());
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_failed_copy_out_leaves_the_thread_joinable() {
    use join_copy_out::*;
    let _harness = Harness::boot(init);
    wait_for(&DONE);

    assert!(BAD_OUT.load(Ordering::SeqCst));
    assert_eq!(get(&JOINED), get(&CREATED));
    assert_eq!(LIB.free_stacks(), 1);
}

mod wait_skips_threads {
    use super::*;

    pub(super) static LIB: ThreadLib = ThreadLib::new();
    pub(super) static DONE: AtomicBool = AtomicBool::new(false);
    pub(super) static WAIT_FAILED: AtomicBool = AtomicBool::new(false);
    pub(super) static JOIN_FAILED_FOR_CHILD: AtomicBool = AtomicBool::new(false);
    pub(super) static THREAD: AtomicU64 = AtomicU64::new(0);
    pub(super) static JOINED: AtomicU64 = AtomicU64::new(0);
    pub(super) static CHILD: AtomicU64 = AtomicU64::new(0);
    pub(super) static WAITED: AtomicU64 = AtomicU64::new(0);

    fn napping(sys: &Sys<'_>, ticks: u64, _unused: u64) {
        sys.sleep(ticks).expect("sleep");
    }

    fn child(sys: &Sys<'_>, _ret: u64) {
        sys.exit();
    }

    pub(super) fn init(sys: &Sys<'_>, _ret: u64) {
        let thread = LIB.create(sys, napping, 5, 0).expect("create");
        set(&THREAD, thread.as_u64());
        WAIT_FAILED.store(sys.wait() == Err(UserError::Failed), Ordering::SeqCst);
        set(&JOINED, LIB.join(sys).expect("join").as_u64());

        let pid = sys.fork(child).expect("fork");
        set(&CHILD, pid.as_u64());
        JOIN_FAILED_FOR_CHILD.store(LIB.join(sys) == Err(UserError::Failed), Ordering::SeqCst);
        set(&WAITED, sys.wait().map_or(0, Pid::as_u64));
        finish(&DONE);
        reap_forever(sys)
    }
}

#[test]
fn test_wait_and_join_each_see_only_their_kind() {
    use wait_skips_threads::*;
    let _harness = Harness::boot(init);
    wait_for(&DONE);

    assert!(WAIT_FAILED.load(Ordering::SeqCst));
    assert_eq!(get(&JOINED), get(&THREAD));
    assert!(JOIN_FAILED_FOR_CHILD.load(Ordering::SeqCst));
    assert_eq!(get(&WAITED), get(&CHILD));
}
