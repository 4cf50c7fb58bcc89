//! # Init
//!
//! The first process outlives everything else and adopts orphans, so once
//! its own work is done it spends the rest of its life reaping.

use crate::syscalls::Sys;

/// Reap orphaned processes and threads forever
///
/// Reaping blocks while init has live children and wakes for an exit of
/// either kind, so an adopted zombie thread is not held up by a live
/// process child.
pub fn reap_forever(sys: &Sys<'_>) -> ! {
    loop {
        while let Ok(pid) = sys.reap() {
            log::debug!("init: reaped {}", pid);
        }
        if sys.sleep(1).is_err() {
            sys.yield_now();
        }
    }
}
