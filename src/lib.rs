//! Library root: wires the architected components together into one running system
//! (SPEC_FULL.md §5 "Shared-resource policy", §9 "Threads + shared memory").
//!
//! Grounded on the teacher's `Emulator { cpu, ram }` (old `lib.rs`), which owned one `CPU` and shared
//! its `RamPtr` with nothing else; generalized here to an `Arc<Sysblk>` shared by many CPU engine
//! threads, one worker thread per attached device, and a console/panel thread, instead of a single
//! `run()` loop driving one CPU inline.

pub mod channel;
pub mod ckdstor;
pub mod clock;
pub mod config;
pub mod console;
pub mod cpu;
pub mod dat;
pub mod devices;
pub mod error;
pub mod psw;
pub mod sie;
pub mod storage;
pub mod sysblk;

use config::SystemConfig;
use cpu::Cpu;
use log::{error, info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;
use sysblk::Sysblk;

/// A fully assembled, not-yet-started system: a `Sysblk` plus the join handles of every thread that
/// will run against it once `System::start` is called.
pub struct System {
    pub sysblk: Arc<Sysblk>,
    device_threads: Vec<JoinHandle<()>>,
    cpu_threads: Vec<JoinHandle<()>>,
}

impl System {
    /// Build the shared system block, attach every configured device, and spawn its worker thread.
    /// CPU engine threads are not started yet; IPL/start is an operator action (SPEC_FULL.md §4.11),
    /// so `build` alone leaves every CPU stopped.
    pub fn build(config: SystemConfig) -> Self {
        let num_cpus = config.num_cpus;
        let device_configs = config.devices.clone();
        let sysblk = Arc::new(Sysblk::new(config));

        let mut device_threads = Vec::with_capacity(device_configs.len());
        for dev_cfg in &device_configs {
            match devices::factory::build(dev_cfg) {
                Ok(device) => {
                    sysblk.channel.attach(dev_cfg.device_number, device);
                    let sysblk = Arc::clone(&sysblk);
                    let device_number = dev_cfg.device_number;
                    device_threads.push(std::thread::spawn(move || {
                        channel::run_device_worker(sysblk, device_number);
                    }));
                }
                Err(e) => {
                    error!("device {:04X} ({}) failed to initialize: {e}", dev_cfg.device_number, dev_cfg.device_type);
                }
            }
        }

        let mut cpu_threads = Vec::with_capacity(num_cpus as usize);
        for id in 0..num_cpus as u16 {
            let sysblk = Arc::clone(&sysblk);
            cpu_threads.push(std::thread::spawn(move || run_cpu_engine(id, sysblk)));
        }

        info!("system built: {} CPU(s), {} device(s) attached", num_cpus, device_threads.len());
        System { sysblk, device_threads, cpu_threads }
    }

    /// Block until every engine and device thread has exited, which only happens after
    /// `Sysblk::request_shutdown` (SPEC_FULL.md §4.11 `quit`).
    pub fn join(self) {
        for handle in self.cpu_threads {
            let _ = handle.join();
        }
        for handle in self.device_threads {
            let _ = handle.join();
        }
    }
}

/// One CPU engine thread's body: step the dispatch loop while running, block on the shared interrupt
/// condvar while stopped or waiting, exit on shutdown (SPEC_FULL.md §4.4, §9).
fn run_cpu_engine(id: u16, sysblk: Arc<Sysblk>) {
    let mut cpu = Cpu::new(id, Arc::clone(&sysblk));
    let mut last_tick = std::time::Instant::now();
    loop {
        if sysblk.is_shutdown() {
            return;
        }
        apply_cpu_control(&mut cpu, &sysblk, id);

        let now = std::time::Instant::now();
        let elapsed_us = now.duration_since(last_tick).as_micros() as i64;
        last_tick = now;
        cpu.tick_timers(elapsed_us);

        match cpu.step() {
            Ok(true) => continue,
            Ok(false) => {
                let guard = sysblk.intlock.lock().unwrap();
                if sysblk.is_shutdown() {
                    return;
                }
                let _ = sysblk
                    .intlock_cv
                    .wait_timeout(guard, std::time::Duration::from_millis(50))
                    .unwrap();
            }
            Err(mc) => {
                warn!("cpu {id}: machine check, entering check-stop state: {mc:?}");
                cpu.checkstop = true;
                return;
            }
        }
    }
}

/// Pull this engine's `Sysblk`-visible control state into its owned `Cpu` (SPEC_FULL.md §4.11):
/// a pending `ipl`/load-PSW request is applied and cleared, and the operator's run/stop latch is
/// mirrored onto `Cpu::stopped`, the field `Cpu::step` actually checks.
fn apply_cpu_control(cpu: &mut Cpu, sysblk: &Arc<Sysblk>, id: u16) {
    if let Some(ctl) = sysblk.cpu_controls.get(id as usize) {
        if let Some(psw_bytes) = ctl.load_psw_request.lock().unwrap().take() {
            match crate::psw::Psw::from_bytes(&psw_bytes) {
                Ok(psw) => cpu.psw = psw,
                Err(_) => warn!("cpu {id}: ipl requested an invalid PSW, ignoring"),
            }
        }
        cpu.stopped = ctl.stopped.load(std::sync::atomic::Ordering::Relaxed);
    }
}
