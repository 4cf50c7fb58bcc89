//! # Thread Library
//!
//! `clone`/`join` wrapped the way user programs want them: stacks come from
//! a free list, or from `sbrk` when the list is empty, and go back onto the
//! list when the thread is joined.

use alloc::vec::Vec;

use spindle_execution::Pid;
use spindle_hal::VirtAddr;

use crate::runtime::ThreadFn;
use crate::syscalls::Sys;
use crate::UserResult;

/// Stack allocator and clone/join wrapper
///
/// Keep one per process, usually in a `static`.
#[derive(Debug)]
pub struct ThreadLib {
    free: spin::Mutex<Vec<VirtAddr>>,
}

impl ThreadLib {
    /// Library with no stacks yet
    pub const fn new() -> Self {
        Self {
            free: spin::Mutex::new(Vec::new()),
        }
    }

    /// Start a thread running `entry(arg1, arg2)` on a fresh stack
    pub fn create(&self, sys: &Sys<'_>, entry: ThreadFn, arg1: u64, arg2: u64) -> UserResult<Pid> {
        let recycled = self.free.lock().pop();
        let stack = match recycled {
            Some(stack) => stack,
            None => {
                let size = sys.kernel().config().thread_stack_size;
                sys.sbrk(size as isize)?
            }
        };

        match sys.clone(entry, arg1, arg2, stack) {
            Ok(pid) => Ok(pid),
            Err(err) => {
                log::warn!("thread_create: clone failed: {}", err);
                self.free.lock().push(stack);
                Err(err)
            }
        }
    }

    /// Join any thread of the caller and keep its stack for reuse
    pub fn join(&self, sys: &Sys<'_>) -> UserResult<Pid> {
        let out = sys.local_word();
        let pid = sys.join(out)?;
        match sys.read_word(out)? {
            0 => log::warn!("thread_join: null stack on joining thread {}", pid),
            stack => self.free.lock().push(VirtAddr::new(stack)),
        }
        Ok(pid)
    }

    /// Stacks waiting to be reused
    pub fn free_stacks(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for ThreadLib {
    fn default() -> Self {
        Self::new()
    }
}
