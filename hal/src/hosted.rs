//! # Hosted Machine
//!
//! Runs the kernel on a development host. Every core and every kernel
//! context is a host thread; a context only runs while it holds its core's
//! baton, so at most one context per core makes progress at a time and
//! [`ContextSwitch::switch`] behaves like a real register swap.
//!
//! Interrupt state is emulated per host thread. The timer fires on core 0
//! whenever interrupts are enabled there and a tick period has elapsed.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::cell::Cell;
use std::string::{String, ToString};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::{ContextEntry, ContextSwitch};
use crate::cpu::{CoreEntry, CpuAbstraction, CpuId};
use crate::interrupts::{InterruptController, InterruptHandler, TIMER_VECTOR};
use crate::{HalError, HalResult, VirtAddr};

thread_local! {
    static CURRENT_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
    static INTERRUPTS: Cell<bool> = const { Cell::new(false) };
}

/// Hosted machine configuration
#[derive(Debug, Clone)]
pub struct HostedConfig {
    /// Number of emulated cores
    pub cpus: usize,
    /// Interval between timer interrupts
    pub tick_period: Duration,
}

impl HostedConfig {
    /// Default timer period
    pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

    /// Configuration with `cpus` cores and the default tick
    pub const fn new(cpus: usize) -> Self {
        Self {
            cpus,
            tick_period: Self::DEFAULT_TICK,
        }
    }

    /// Replace the timer period
    pub const fn with_tick_period(mut self, tick_period: Duration) -> Self {
        self.tick_period = tick_period;
        self
    }
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Parked,
    Resume(CpuId),
    Retired,
}

/// Hand-off point of one context
#[derive(Debug)]
struct Baton {
    signal: Mutex<Signal>,
    wake: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            signal: Mutex::new(Signal::Parked),
            wake: Condvar::new(),
        }
    }

    fn resume(&self, cpu: CpuId) {
        let mut signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        if *signal != Signal::Retired {
            *signal = Signal::Resume(cpu);
        }
        self.wake.notify_one();
    }

    fn retire(&self) {
        *self.signal.lock().unwrap_or_else(PoisonError::into_inner) = Signal::Retired;
        self.wake.notify_one();
    }

    /// Block until resumed; `None` once the context has been dropped
    fn park(&self) -> Option<CpuId> {
        let mut signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match *signal {
                Signal::Resume(cpu) => {
                    *signal = Signal::Parked;
                    return Some(cpu);
                }
                Signal::Retired => return None,
                Signal::Parked => {
                    signal = self.wake.wait(signal).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Kernel context on the hosted machine
///
/// Dropping a context that never ran lets its host thread exit.
#[derive(Debug)]
pub struct HostedContext {
    baton: Arc<Baton>,
}

impl Drop for HostedContext {
    fn drop(&mut self) {
        self.baton.retire();
    }
}

/// Machine whose cores and contexts are host threads
pub struct HostedMachine {
    config: HostedConfig,
    handler: spin::RwLock<Option<InterruptHandler>>,
    last_tick: spin::Mutex<Instant>,
    stopped: AtomicBool,
    halt_reason: spin::Mutex<Option<String>>,
}

impl fmt::Debug for HostedMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedMachine")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl HostedMachine {
    /// Create a machine; nothing runs until [`CpuAbstraction::start_cores`]
    pub fn new(config: HostedConfig) -> Self {
        Self {
            config,
            handler: spin::RwLock::new(None),
            last_tick: spin::Mutex::new(Instant::now()),
            stopped: AtomicBool::new(false),
            halt_reason: spin::Mutex::new(None),
        }
    }

    /// Stop every core at its next interrupt-state change or idle point
    pub fn power_off(&self) {
        log::info!("hosted machine powering off");
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Has the machine been halted or powered off
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Reason passed to the first [`CpuAbstraction::halt`], if any
    pub fn halt_reason(&self) -> Option<String> {
        self.halt_reason.lock().clone()
    }

    fn stop_if_requested(&self) {
        if self.is_stopped() {
            park_forever();
        }
    }

    fn deliver_pending(&self) {
        if CURRENT_CPU.with(Cell::get) != Some(0) {
            return;
        }
        let due = {
            let mut last = self.last_tick.lock();
            if last.elapsed() >= self.config.tick_period {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            INTERRUPTS.with(|flag| flag.set(false));
            handler(TIMER_VECTOR);
            INTERRUPTS.with(|flag| flag.set(true));
        }
    }
}

fn enter_core(cpu: CpuId) {
    CURRENT_CPU.with(|current| current.set(Some(cpu)));
    INTERRUPTS.with(|flag| flag.set(false));
}

fn park_forever() -> ! {
    loop {
        thread::park();
    }
}

impl CpuAbstraction for HostedMachine {
    fn cpu_count(&self) -> usize {
        self.config.cpus
    }

    fn current_cpu(&self) -> CpuId {
        CURRENT_CPU
            .with(Cell::get)
            .expect("current_cpu called from a thread that is not a core")
    }

    fn interrupts_enabled(&self) -> bool {
        INTERRUPTS.with(Cell::get)
    }

    unsafe fn enable_interrupts(&self) {
        self.stop_if_requested();
        INTERRUPTS.with(|flag| flag.set(true));
        self.deliver_pending();
    }

    unsafe fn disable_interrupts(&self) {
        INTERRUPTS.with(|flag| flag.set(false));
    }

    fn pause(&self) {
        self.stop_if_requested();
        core::hint::spin_loop();
    }

    fn wait_for_interrupt(&self) {
        self.stop_if_requested();
        thread::sleep(Duration::from_micros(100));
    }

    fn start_cores(&self, entry: CoreEntry) {
        log::info!("hosted machine starting {} cores", self.config.cpus);
        for cpu in 0..self.config.cpus {
            let entry = Arc::clone(&entry);
            let spawned = thread::Builder::new()
                .name(std::format!("spindle-cpu{cpu}"))
                .spawn(move || {
                    enter_core(cpu);
                    entry(cpu);
                    park_forever()
                });
            if let Err(err) = spawned {
                self.halt(format_args!("cannot start cpu{cpu}: {err}"));
            }
        }
    }

    fn halt(&self, reason: fmt::Arguments<'_>) -> ! {
        let reason = reason.to_string();
        log::error!("machine halted: {reason}");
        {
            let mut slot = self.halt_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
        if CURRENT_CPU.with(Cell::get).is_some() {
            park_forever();
        }
        panic!("machine halted: {reason}");
    }
}

impl ContextSwitch for HostedMachine {
    type Context = HostedContext;

    fn blank_context(&self) -> HostedContext {
        HostedContext {
            baton: Arc::new(Baton::new()),
        }
    }

    /// The host thread brings its own stack; `stack_top` is not used.
    fn new_context(&self, _stack_top: VirtAddr, entry: ContextEntry) -> HalResult<HostedContext> {
        if self.is_stopped() {
            return Err(HalError::Halted);
        }
        let baton = Arc::new(Baton::new());
        let parked = Arc::clone(&baton);
        thread::Builder::new()
            .name("spindle-unit".into())
            .spawn(move || {
                let Some(cpu) = parked.park() else {
                    return;
                };
                enter_core(cpu);
                entry();
                park_forever()
            })
            .map_err(|_| HalError::OutOfMemory)?;
        Ok(HostedContext { baton })
    }

    unsafe fn switch(&self, from: *mut HostedContext, to: *const HostedContext) {
        // SAFETY: the caller keeps both contexts alive across the switch.
        let (from, to) = unsafe { (Arc::clone(&(*from).baton), Arc::clone(&(*to).baton)) };
        let cpu = self.current_cpu();
        to.resume(cpu);
        match from.park() {
            Some(cpu) => enter_core(cpu),
            None => park_forever(),
        }
    }
}

impl InterruptController for HostedMachine {
    fn set_handler(&self, handler: InterruptHandler) {
        *self.handler.write() = Some(handler);
    }
}
