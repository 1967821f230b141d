//! The process-wide shared system block (SPEC_FULL.md §5 "Shared-resource policy").
//!
//! Grounded on the teacher's `Emulator { cpu, ram }` composition, which shares its `RamPtr` across the
//! (single) CPU via `Rc::clone`; generalized here to `Arc`-shared state safe for many CPU and device
//! threads, with the lock-ordering discipline spelled out in SPEC_FULL.md §5.

use crate::channel::ChannelSubsystem;
use crate::clock::TodClock;
use crate::config::SystemConfig;
use crate::storage::MainStorage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// Interrupt-related pending state, guarded by `intlock`. Any contributing source setting one of
/// these flags must notify `intlock_cv` so a waiting CPU thread wakes up (SPEC_FULL.md §4.3).
#[derive(Default)]
pub struct InterruptState {
    pub restart_pending: Vec<bool>,
    pub external_call_pending: Vec<bool>,
    pub broadcast_pending: bool,
    pub broadcast_acks_remaining: u32,
}

/// The operator-visible handle for one CPU engine (SPEC_FULL.md §4.11): `stopped` mirrors the
/// engine's run/stop state so the panel can flip it without owning the `Cpu` itself, and
/// `load_psw_request` is how `ipl`/`store-status`-style commands hand a freshly loaded PSW to the
/// engine thread, which picks it up at its next dispatch boundary (the same "operator posts,
/// engine observes" pattern `post_restart` already uses for restart interrupts).
pub struct CpuControl {
    pub stopped: AtomicBool,
    pub load_psw_request: Mutex<Option<[u8; 8]>>,
}

impl CpuControl {
    fn new() -> Self {
        CpuControl { stopped: AtomicBool::new(true), load_psw_request: Mutex::new(None) }
    }
}

pub struct Sysblk {
    pub config: SystemConfig,
    pub storage: MainStorage,
    pub channel: ChannelSubsystem,
    pub tod: TodClock,
    pub intlock: Mutex<InterruptState>,
    pub intlock_cv: Condvar,
    pub mainlock: Mutex<()>,
    pub cpu_controls: Vec<CpuControl>,
    pub shutdown: std::sync::atomic::AtomicBool,
}

impl Sysblk {
    pub fn new(config: SystemConfig) -> Self {
        let storage = MainStorage::new(config.main_size_mb);
        let channel = ChannelSubsystem::new();
        let tod = TodClock::new(config.sys_epoch, config.tz_offset_minutes);
        let num_cpus = config.num_cpus as usize;
        Sysblk {
            config,
            storage,
            channel,
            tod,
            intlock: Mutex::new(InterruptState {
                restart_pending: vec![false; num_cpus],
                external_call_pending: vec![false; num_cpus],
                broadcast_pending: false,
                broadcast_acks_remaining: 0,
            }),
            intlock_cv: Condvar::new(),
            mainlock: Mutex::new(()),
            cpu_controls: (0..num_cpus).map(|_| CpuControl::new()).collect(),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        self.intlock_cv.notify_all();
    }

    /// Post a restart interrupt to `cpu_index` and wake it if waiting (SPEC_FULL.md §4.3).
    pub fn post_restart(&self, cpu_index: usize) {
        let mut state = self.intlock.lock().unwrap();
        if let Some(slot) = state.restart_pending.get_mut(cpu_index) {
            *slot = true;
        }
        self.intlock_cv.notify_all();
    }

    /// Post an external interrupt (e.g. the panel's "interrupt key") to `cpu_index` and wake it if
    /// waiting (SPEC_FULL.md §4.3, §4.11 `ext`).
    pub fn post_external_call(&self, cpu_index: usize) {
        let mut state = self.intlock.lock().unwrap();
        if let Some(slot) = state.external_call_pending.get_mut(cpu_index) {
            *slot = true;
        }
        self.intlock_cv.notify_all();
    }

    /// Begin a cross-CPU broadcast-purge rendezvous: sets `broadcast_pending`, records how many
    /// other CPUs must acknowledge, and wakes everyone so they can synchronize at their next
    /// instruction boundary (SPEC_FULL.md §4.2 "Purge disciplines", §9 "Threads + shared memory").
    pub fn begin_broadcast(&self, other_cpus: u32) {
        let mut state = self.intlock.lock().unwrap();
        state.broadcast_pending = true;
        state.broadcast_acks_remaining = other_cpus;
        self.intlock_cv.notify_all();
    }

    pub fn ack_broadcast(&self) {
        let mut state = self.intlock.lock().unwrap();
        if state.broadcast_acks_remaining > 0 {
            state.broadcast_acks_remaining -= 1;
        }
        if state.broadcast_acks_remaining == 0 {
            state.broadcast_pending = false;
        }
        self.intlock_cv.notify_all();
    }

    /// Mark `cpu_index` running and wake its engine thread (SPEC_FULL.md §4.11 `start`/`g`).
    pub fn start_cpu(&self, cpu_index: usize) {
        if let Some(ctl) = self.cpu_controls.get(cpu_index) {
            ctl.stopped.store(false, Ordering::Relaxed);
        }
        self.intlock_cv.notify_all();
    }

    /// Mark every configured CPU running (SPEC_FULL.md §4.11 `start`/`g` with no CPU argument).
    pub fn start_all_cpus(&self) {
        for ctl in &self.cpu_controls {
            ctl.stopped.store(false, Ordering::Relaxed);
        }
        self.intlock_cv.notify_all();
    }

    /// Request `cpu_index` stop at its next instruction boundary (SPEC_FULL.md §4.11 `stop`, §9
    /// "no mid-instruction cancellation").
    pub fn stop_all_cpus(&self) {
        for ctl in &self.cpu_controls {
            ctl.stopped.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_cpu_stopped(&self, cpu_index: usize) -> bool {
        self.cpu_controls.get(cpu_index).map(|ctl| ctl.stopped.load(Ordering::Relaxed)).unwrap_or(true)
    }

    /// Hand `cpu_index` a PSW to load at its next dispatch boundary and mark it running
    /// (SPEC_FULL.md §4.11 `ipl`, scenario 1: IPL both loads the new PSW and starts the CPU).
    pub fn request_load_psw(&self, cpu_index: usize, psw_bytes: [u8; 8]) {
        if let Some(ctl) = self.cpu_controls.get(cpu_index) {
            *ctl.load_psw_request.lock().unwrap() = Some(psw_bytes);
            ctl.stopped.store(false, Ordering::Relaxed);
        }
        self.intlock_cv.notify_all();
    }
}
