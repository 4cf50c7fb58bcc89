//! # System Calls
//!
//! ## Calling convention
//! - System call number: return register on entry
//! - Arguments: `args[0..6]` of the trap frame
//! - Result: return register (negative = error, -2 only for join's
//!   copy-out failure)
//!
//! [`Sys`] is the user-side wrapper: it fills the running unit's trap frame,
//! traps into [`dispatch`] and decodes the result. Every call returns
//! through the kill check, so a killed unit exits at its next system call.

use core::sync::atomic::{AtomicU64, Ordering};

use spindle_execution::{ExecResult, FileHandle, Kernel, Pid};
use spindle_hal::hosted::HostedMachine;
use spindle_hal::{TrapFrame, VirtAddr, WORD_SIZE};

use crate::runtime::{HostedUserMode, Program, ResumeFn, ThreadFn};
use crate::{UserError, UserResult};

/// System call numbers
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    /// Duplicate the calling process
    Fork = 1,
    /// Exit
    Exit = 2,
    /// Wait for a child process
    Wait = 3,
    /// Request another unit's exit
    Kill = 6,
    /// Get the caller's id
    Getpid = 11,
    /// Grow or shrink memory
    Sbrk = 12,
    /// Sleep for a number of ticks
    Sleep = 13,
    /// Ticks since boot
    Uptime = 14,
    /// Close a descriptor
    Close = 21,
    /// Start a thread
    Clone = 22,
    /// Wait for a thread
    Join = 23,
    /// Give up the core
    Yield = 24,
    /// Reap a child of either kind
    Reap = 25,
}

impl Syscall {
    /// Highest system call number plus one
    pub const LIMIT: usize = 26;

    /// Convert from number
    pub fn from_num(num: u64) -> Option<Self> {
        match num {
            1 => Some(Syscall::Fork),
            2 => Some(Syscall::Exit),
            3 => Some(Syscall::Wait),
            6 => Some(Syscall::Kill),
            11 => Some(Syscall::Getpid),
            12 => Some(Syscall::Sbrk),
            13 => Some(Syscall::Sleep),
            14 => Some(Syscall::Uptime),
            21 => Some(Syscall::Close),
            22 => Some(Syscall::Clone),
            23 => Some(Syscall::Join),
            24 => Some(Syscall::Yield),
            25 => Some(Syscall::Reap),
            _ => None,
        }
    }
}

/// Syscall arguments
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    /// Arg 1
    pub arg1: u64,
    /// Arg 2
    pub arg2: u64,
    /// Arg 3
    pub arg3: u64,
    /// Arg 4
    pub arg4: u64,
}

impl SyscallArgs {
    /// Read the arguments saved in `frame`
    pub fn from_frame(frame: &TrapFrame) -> Self {
        Self {
            arg1: frame.syscall_arg(0),
            arg2: frame.syscall_arg(1),
            arg3: frame.syscall_arg(2),
            arg4: frame.syscall_arg(3),
        }
    }
}

/// Per-number call counters
#[derive(Debug)]
pub struct SyscallStats {
    calls: [AtomicU64; Syscall::LIMIT],
    unknown: AtomicU64,
}

impl SyscallStats {
    /// Zeroed counters
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            calls: [ZERO; Syscall::LIMIT],
            unknown: AtomicU64::new(0),
        }
    }

    fn record(&self, call: Syscall) {
        self.calls[call as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Times `call` was made
    pub fn count(&self, call: Syscall) -> u64 {
        self.calls[call as usize].load(Ordering::Relaxed)
    }

    /// Calls with a number no handler knows
    pub fn unknown(&self) -> u64 {
        self.unknown.load(Ordering::Relaxed)
    }
}

impl Default for SyscallStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle the system call described by the running unit's trap frame
pub fn dispatch(kernel: &'static Kernel<HostedMachine>, stats: &SyscallStats) {
    let (number, args) = kernel.with_trapframe(|frame| (frame.return_value(), SyscallArgs::from_frame(frame)));
    let ret = match Syscall::from_num(number) {
        Some(call) => {
            stats.record(call);
            match invoke(kernel, call, args) {
                Ok(value) => value as i64,
                Err(err) => err.code(),
            }
        }
        None => {
            stats.unknown.fetch_add(1, Ordering::Relaxed);
            log::warn!("unknown system call {}", number);
            -1
        }
    };
    kernel.with_trapframe(|frame| frame.set_return_value(ret as u64));
}

fn invoke(kernel: &'static Kernel<HostedMachine>, call: Syscall, args: SyscallArgs) -> ExecResult<u64> {
    match call {
        Syscall::Fork => kernel.duplicate().map(Pid::as_u64),
        Syscall::Exit => kernel.terminate(),
        Syscall::Wait => kernel.collect().map(Pid::as_u64),
        Syscall::Kill => kernel.request_kill(Pid::from_raw(args.arg1)).map(|()| 0),
        Syscall::Getpid => Ok(kernel.current_id().map_or(0, Pid::as_u64)),
        Syscall::Sbrk => kernel.grow(args.arg1 as i64 as isize).map(|old| old as u64),
        Syscall::Sleep => kernel.sleep_ticks(args.arg1).map(|()| 0),
        Syscall::Uptime => Ok(kernel.uptime()),
        Syscall::Close => kernel.close_file(args.arg1 as usize).map(|()| 0),
        Syscall::Clone => kernel
            .spawn_thread(VirtAddr::new(args.arg1), args.arg2, args.arg3, VirtAddr::new(args.arg4))
            .map(Pid::as_u64),
        Syscall::Join => kernel.await_thread(VirtAddr::new(args.arg1)).map(Pid::as_u64),
        Syscall::Yield => {
            kernel.yield_now();
            Ok(0)
        }
        Syscall::Reap => kernel.reap_any().map(Pid::as_u64),
    }
}

/// A user program's view of the kernel
#[derive(Debug)]
pub struct Sys<'a> {
    kernel: &'static Kernel<HostedMachine>,
    user: &'a HostedUserMode,
}

impl<'a> Sys<'a> {
    pub(crate) fn new(kernel: &'static Kernel<HostedMachine>, user: &'a HostedUserMode) -> Self {
        Self { kernel, user }
    }

    /// The kernel, for inspection
    pub fn kernel(&self) -> &'static Kernel<HostedMachine> {
        self.kernel
    }

    /// System-call counters of this machine
    pub fn stats(&self) -> &SyscallStats {
        self.user.stats()
    }

    fn syscall(&self, call: Syscall, args: &[u64]) -> i64 {
        self.kernel.with_trapframe(|frame| {
            frame.set_return_value(call as u64);
            for (index, arg) in args.iter().enumerate() {
                frame.set_syscall_arg(index, *arg);
            }
        });
        dispatch(self.kernel, self.user.stats());
        let ret = self.kernel.with_trapframe(|frame| frame.return_value()) as i64;

        if self.kernel.is_killed() {
            log::debug!("{:?} returned to a killed unit", call);
            self.kernel.terminate();
        }
        ret
    }

    /// Id of the caller
    pub fn getpid(&self) -> Pid {
        Pid::from_raw(self.syscall(Syscall::Getpid, &[]) as u64)
    }

    /// Fork; the child starts in `child` with 0, the parent gets the
    /// child's id
    pub fn fork(&self, child: ResumeFn) -> UserResult<Pid> {
        let ip = self.user.register(Program::Resume(child));
        self.kernel.with_trapframe(|frame| frame.set_instruction_pointer(ip));
        UserError::check(self.syscall(Syscall::Fork, &[])).map(Pid::from_raw)
    }

    /// Exit
    pub fn exit(&self) -> ! {
        self.syscall(Syscall::Exit, &[]);
        self.kernel.cpus().fatal(format_args!("exit returned"))
    }

    /// Wait for a child process
    pub fn wait(&self) -> UserResult<Pid> {
        UserError::check(self.syscall(Syscall::Wait, &[])).map(Pid::from_raw)
    }

    /// Ask `pid` to exit
    pub fn kill(&self, pid: Pid) -> UserResult<()> {
        UserError::check(self.syscall(Syscall::Kill, &[pid.as_u64()])).map(drop)
    }

    /// Grow memory by `delta` bytes; returns the old break
    pub fn sbrk(&self, delta: isize) -> UserResult<VirtAddr> {
        UserError::check(self.syscall(Syscall::Sbrk, &[delta as i64 as u64])).map(VirtAddr::new)
    }

    /// Sleep for `ticks` clock ticks
    pub fn sleep(&self, ticks: u64) -> UserResult<()> {
        UserError::check(self.syscall(Syscall::Sleep, &[ticks])).map(drop)
    }

    /// Ticks since boot
    pub fn uptime(&self) -> u64 {
        self.syscall(Syscall::Uptime, &[]) as u64
    }

    /// Give up the core for a round
    pub fn yield_now(&self) {
        self.syscall(Syscall::Yield, &[]);
    }

    /// Start a thread running `entry(arg1, arg2)` on the stack region at
    /// `stack`
    pub fn clone(&self, entry: ThreadFn, arg1: u64, arg2: u64, stack: VirtAddr) -> UserResult<Pid> {
        let ip = self.user.register(Program::Thread(entry));
        UserError::check(self.syscall(Syscall::Clone, &[ip.as_u64(), arg1, arg2, stack.as_u64()])).map(Pid::from_raw)
    }

    /// Wait for a thread; its stack region is stored at `out`
    pub fn join(&self, out: VirtAddr) -> UserResult<Pid> {
        UserError::check(self.syscall(Syscall::Join, &[out.as_u64()])).map(Pid::from_raw)
    }

    /// Reap an exited child, process or thread
    pub fn reap(&self) -> UserResult<Pid> {
        UserError::check(self.syscall(Syscall::Reap, &[])).map(Pid::from_raw)
    }

    /// Take a descriptor for `file`
    ///
    /// Stands in for `open`, which belongs to the file system.
    pub fn install_file(&self, file: FileHandle) -> UserResult<usize> {
        self.kernel.install_file(file).map_err(|_| UserError::Failed)
    }

    /// Close descriptor `fd`
    pub fn close(&self, fd: usize) -> UserResult<()> {
        UserError::check(self.syscall(Syscall::Close, &[fd as u64])).map(drop)
    }

    /// Load a word from the caller's memory
    pub fn read_word(&self, addr: VirtAddr) -> UserResult<u64> {
        let mut bytes = [0u8; 8];
        self.kernel
            .copy_from_user(addr, &mut bytes)
            .map_err(|_| UserError::Failed)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Store a word into the caller's memory
    pub fn write_word(&self, addr: VirtAddr, value: u64) -> UserResult<()> {
        self.kernel
            .copy_to_user(addr, &value.to_le_bytes())
            .map_err(|_| UserError::Failed)
    }

    /// Address of a scratch word just below the caller's stack pointer
    pub fn local_word(&self) -> VirtAddr {
        let sp = self.kernel.with_trapframe(|frame| frame.stack_pointer());
        VirtAddr::new(sp.as_u64() - WORD_SIZE)
    }
}
