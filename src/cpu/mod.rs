//! Per-CPU engine (SPEC_FULL.md §4.4, component C4).
//!
//! Grounded on the teacher's `CPU` struct (`processor.rs`): a register file plus a `bus: BusPtr` it
//! reaches shared storage through. Generalized from m68k's 8 data + 8 address registers to the
//! architecture's 16 general, 16 floating-point (as 4 doublewords), and 16 control registers, and from
//! `Rc<RefCell<Bus>>` single-ownership to the `Arc<Sysblk>` every CPU and device thread shares.

pub mod dispatch;
pub mod ops;

use crate::clock::{ClockComparator, CpuTimer, IntervalTimer};
use crate::dat::Dat;
use crate::psw::Psw;
use crate::sysblk::Sysblk;
use std::sync::Arc;

/// One CPU engine's full architected state outside of main storage.
pub struct Cpu {
    pub id: u16,
    pub psw: Psw,
    pub gpr: [u32; 16],
    pub fpr: [u64; 4],
    pub cr: [u32; 16],
    pub dat: Dat,
    pub cpu_timer: CpuTimer,
    pub clock_comparator: ClockComparator,
    pub interval_timer: IntervalTimer,
    pub instr_count: u64,
    pub stopped: bool,
    pub checkstop: bool,
    pub sysblk: Arc<Sysblk>,
}

impl Cpu {
    pub fn new(id: u16, sysblk: Arc<Sysblk>) -> Self {
        Cpu {
            id,
            psw: Psw::default(),
            gpr: [0; 16],
            fpr: [0; 4],
            cr: [0; 16],
            dat: Dat::new(),
            cpu_timer: CpuTimer::new(),
            clock_comparator: ClockComparator::new(),
            interval_timer: IntervalTimer::new(),
            instr_count: 0,
            stopped: true,
            checkstop: false,
            sysblk,
        }
    }

    /// Effective address under the current addressing mode, truncated per amode (SPEC_FULL.md §4.4).
    pub fn effective_address(&self, base: u8, index: u8, displacement: u16) -> u32 {
        let b = if base == 0 { 0 } else { self.gpr[base as usize] };
        let x = if index == 0 { 0 } else { self.gpr[index as usize] };
        let ea = b.wrapping_add(x).wrapping_add(displacement as u32);
        match self.psw.amode {
            crate::psw::Amode::Bit24 => ea & 0x00FF_FFFF,
            crate::psw::Amode::Bit31 => ea & 0x7FFF_FFFF,
        }
    }

    /// Absolute address to use against `MainStorage`, applying prefixing (SPEC_FULL.md §4.1).
    pub fn absolute(&self, addr: u32) -> usize {
        crate::storage::MainStorage::prefix(addr, self.cr[0] & 0x7FFF_F000) as usize
    }

    pub fn access_key(&self) -> u8 {
        self.psw.key
    }

    /// Translate a virtual address to the absolute real-storage offset operand handlers read/write
    /// through, combining DAT translation with prefixing in the order the architecture requires.
    pub fn translate_access(
        &mut self,
        vaddr: u32,
        access: crate::dat::AccessType,
    ) -> Result<usize, crate::error::ProgramInterrupt> {
        let real = self.dat.translate(&self.sysblk.storage, vaddr, self.access_key(), access)?;
        Ok(crate::storage::MainStorage::prefix(real, self.cr[0] & 0x7FFF_F000) as usize)
    }

    /// One fetch-decode-dispatch cycle (SPEC_FULL.md §4.4). Returns `Ok(false)` when the CPU is
    /// stopped or in an unresolved wait and the run loop should block on the interrupt condvar
    /// instead of spinning.
    ///
    /// Priority order follows SPEC_FULL.md §4.3: restart is checked first (it is unmaskable and
    /// reaches a stopped CPU), then, if running, external and I/O interrupts are delivered ahead of
    /// ordinary dispatch.
    pub fn step(&mut self) -> Result<bool, crate::error::MachineCheck> {
        if self.checkstop {
            return Ok(false);
        }
        if self.take_restart_request() {
            self.stopped = false;
            self.sysblk.start_cpu(self.id as usize);
            dispatch::deliver_restart_interrupt(self);
            return Ok(true);
        }
        if self.stopped {
            return Ok(false);
        }
        if self.deliver_external_or_io_interrupt() {
            return Ok(true);
        }
        if self.psw.wait {
            return Ok(false);
        }
        match dispatch::fetch_decode_dispatch(self) {
            Ok(()) => {
                self.instr_count += 1;
                Ok(true)
            }
            Err(pi) => {
                dispatch::deliver_program_interrupt(self, pi);
                Ok(true)
            }
        }
    }

    /// Pop and clear this CPU's pending restart flag, if set.
    fn take_restart_request(&self) -> bool {
        let mut intlock = self.sysblk.intlock.lock().unwrap();
        match intlock.restart_pending.get_mut(self.id as usize) {
            Some(slot) if *slot => {
                *slot = false;
                true
            }
            _ => false,
        }
    }

    /// Pop and clear this CPU's pending external-call flag, if set.
    fn take_external_call_request(&self) -> bool {
        let mut intlock = self.sysblk.intlock.lock().unwrap();
        match intlock.external_call_pending.get_mut(self.id as usize) {
            Some(slot) if *slot => {
                *slot = false;
                true
            }
            _ => false,
        }
    }

    /// Deliver one external or I/O interrupt if either is pending and enabled, in that priority order
    /// (SPEC_FULL.md §4.3). Returns true if an interrupt was delivered.
    fn deliver_external_or_io_interrupt(&mut self) -> bool {
        let external_call = self.take_external_call_request();
        let timer_negative = self.psw.mask_allows_external() && self.cpu_timer.get() < 0;
        let interval_negative = self.psw.mask_allows_external() && self.interval_timer.get() < 0;
        let clock_due = self.psw.mask_allows_external() && self.clock_comparator.reached(self.sysblk.tod.now());
        if external_call || timer_negative || interval_negative || clock_due {
            dispatch::deliver_external_interrupt(self);
            return true;
        }
        if let Some((device_number, _scsw)) = self.sysblk.channel.present_interrupt() {
            dispatch::deliver_io_interrupt(self, device_number);
            return true;
        }
        false
    }

    /// Pending-interrupt aggregation (SPEC_FULL.md §4.3): recomputed on demand from each contributing
    /// source rather than cached, since every source here is cheap to probe. Used both to decide
    /// whether an enabled wait can be left and, via `step`, which interrupt to actually deliver.
    pub fn has_pending_interrupt(&self) -> bool {
        if self.sysblk.is_shutdown() {
            return true;
        }
        {
            let intlock = self.sysblk.intlock.lock().unwrap();
            let idx = self.id as usize;
            if intlock.restart_pending.get(idx).copied().unwrap_or(false)
                || intlock.external_call_pending.get(idx).copied().unwrap_or(false)
                || intlock.broadcast_pending
            {
                return true;
            }
        }
        if self.psw.mask_allows_external() && self.cpu_timer.get() < 0 {
            return true;
        }
        if self.psw.mask_allows_external() && self.interval_timer.get() < 0 {
            return true;
        }
        if self.psw.mask_allows_external() && self.clock_comparator.reached(self.sysblk.tod.now()) {
            return true;
        }
        self.sysblk.channel.any_interrupt_pending()
    }

    /// Decrement the CPU timer and interval timer by elapsed wall-clock time (SPEC_FULL.md §4.10):
    /// both count down only while this CPU is running, never while stopped.
    pub fn tick_timers(&self, elapsed_us: i64) {
        if self.stopped {
            return;
        }
        self.cpu_timer.tick(elapsed_us);
        self.interval_timer.tick(elapsed_us);
    }
}
