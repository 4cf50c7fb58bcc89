//! # Hosted User Mode
//!
//! On the hosted machine a user program is a Rust function and its text
//! address is the function's address. [`HostedUserMode`] keeps the registry
//! of known programs and implements the kernel's return-to-user path: it
//! looks up the trap frame's instruction pointer and calls the program
//! found there on the unit's own host thread.
//!
//! A program returning, or a unit resuming at an unknown address, is a
//! fault and the unit is terminated.

use alloc::collections::BTreeMap;
use core::fmt;

use spindle_execution::{Kernel, Pid, UserMode};
use spindle_hal::hosted::HostedMachine;
use spindle_hal::{TrapFrame, VirtAddr};

use crate::syscalls::{Sys, SyscallStats};

/// A process entry or a fork continuation; gets the return register
pub type ResumeFn = fn(&Sys<'_>, u64);

/// A thread entry; gets the two arguments from its initial stack frame
pub type ThreadFn = fn(&Sys<'_>, u64, u64);

/// User program
#[derive(Clone, Copy)]
pub enum Program {
    /// Resumes with the return register as argument
    Resume(ResumeFn),
    /// Starts a thread
    Thread(ThreadFn),
}

impl Program {
    /// Text address of the program
    pub fn address(self) -> VirtAddr {
        let raw = match self {
            Program::Resume(program) => program as usize,
            Program::Thread(entry) => entry as usize,
        };
        VirtAddr::new(raw as u64)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Program::Resume(_) => "Resume",
            Program::Thread(_) => "Thread",
        };
        write!(f, "{}({})", kind, self.address())
    }
}

/// Return-to-user path of the hosted machine
#[derive(Debug, Default)]
pub struct HostedUserMode {
    programs: spin::RwLock<BTreeMap<u64, Program>>,
    stats: SyscallStats,
}

impl HostedUserMode {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `program` reachable; returns its text address
    pub fn register(&self, program: Program) -> VirtAddr {
        let address = program.address();
        self.programs.write().insert(address.as_u64(), program);
        address
    }

    /// Program at `ip`, if registered
    pub fn lookup(&self, ip: VirtAddr) -> Option<Program> {
        self.programs.read().get(&ip.as_u64()).copied()
    }

    /// System-call counters
    pub fn stats(&self) -> &SyscallStats {
        &self.stats
    }
}

impl UserMode<HostedMachine> for HostedUserMode {
    fn enter(&self, kernel: &'static Kernel<HostedMachine>, frame: TrapFrame) -> ! {
        let sys = Sys::new(kernel, self);
        let pid = kernel.current_id().unwrap_or(Pid::from_raw(0));
        if kernel.is_killed() {
            log::debug!("pid {} killed before entering user mode", pid);
            kernel.terminate();
        }

        let ip = frame.instruction_pointer();
        match self.lookup(ip) {
            Some(Program::Resume(program)) => {
                program(&sys, frame.return_value());
                log::warn!("pid {}: program at {} returned", pid, ip);
            }
            Some(Program::Thread(entry)) => match kernel.thread_args(frame.stack_pointer()) {
                Ok(args) => {
                    entry(&sys, args.arg1, args.arg2);
                    log::warn!("pid {}: thread returned to {:#x}", pid, args.return_address);
                }
                Err(err) => log::warn!("pid {}: bad thread frame at {}: {}", pid, frame.stack_pointer(), err),
            },
            None => log::warn!("pid {}: no program at {}", pid, ip),
        }
        kernel.terminate()
    }
}
