//! TOD clock, CPU timer, clock comparator, and the S/370 interval timer (SPEC_FULL.md §4.10, C10).
//!
//! Grounded on the teacher's declared but never-wired `chrono`/`timer` dependencies (the Atari ST has
//! a timer chip `atari.rs` never models); this crate actually uses `chrono` for wall-clock TOD.

use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// TOD clock epoch: 1900-01-01, per ESA/390 Principles of Operation. Stored internally as
/// microseconds since that epoch, matching the architected unit (bit 51 = 1 microsecond in the
/// 8-byte TOD format; we keep the signed microsecond count and convert to the 8-byte form on STCK).
pub struct TodClock {
    /// host-wall-clock-to-guest-epoch offset, in microseconds
    epoch_offset_us: AtomicI64,
    tz_offset_minutes: i32,
}

fn epoch_micros(sys_epoch_year: u16) -> i64 {
    let epoch = Utc.with_ymd_and_hms(sys_epoch_year as i32, 1, 1, 0, 0, 0).unwrap();
    let unix_epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
    (unix_epoch - epoch).num_microseconds().unwrap_or(0)
}

impl TodClock {
    pub fn new(sys_epoch_year: u16, tz_offset_minutes: i32) -> Self {
        TodClock {
            epoch_offset_us: AtomicI64::new(epoch_micros(sys_epoch_year)),
            tz_offset_minutes,
        }
    }

    /// Current TOD value in architected units (multiples of 2^-12 microseconds, i.e. bit 51 = 1us).
    pub fn now(&self) -> u64 {
        let wall_us = Utc::now().timestamp_micros();
        let tz_us = self.tz_offset_minutes as i64 * 60_000_000;
        let guest_us = wall_us + self.epoch_offset_us.load(Ordering::Relaxed) + tz_us;
        (guest_us as u64) << 12
    }

    pub fn set(&self, tod: u64, sys_epoch_year: u16) {
        let wall_us = Utc::now().timestamp_micros();
        let guest_us = (tod >> 12) as i64;
        let tz_us = self.tz_offset_minutes as i64 * 60_000_000;
        self.epoch_offset_us.store(guest_us - wall_us - tz_us, Ordering::Relaxed);
        let _ = sys_epoch_year;
    }
}

/// Per-CPU countdown timer; counts down while the CPU is running (SPEC_FULL.md §4.10).
pub struct CpuTimer {
    value: AtomicI64,
}

impl CpuTimer {
    pub fn new() -> Self {
        CpuTimer { value: AtomicI64::new(0) }
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Decrement by `delta_us` microseconds (architected units); returns true if this tick caused a
    /// transition from non-negative to negative (the pending-interrupt condition).
    pub fn tick(&self, delta_us: i64) -> bool {
        let delta = delta_us << 12;
        let prev = self.value.fetch_sub(delta, Ordering::Relaxed);
        prev >= 0 && prev - delta < 0
    }
}

/// Per-CPU clock comparator: raises when TOD >= comparator value.
pub struct ClockComparator {
    value: AtomicI64,
}

impl ClockComparator {
    pub fn new() -> Self {
        ClockComparator { value: AtomicI64::new(i64::MAX) }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v as i64, Ordering::Relaxed);
    }

    pub fn reached(&self, tod: u64) -> bool {
        (tod as i64) >= self.value.load(Ordering::Relaxed)
    }
}

/// S/370-compatibility interval timer at PSA+0x50, decremented by (residue/3333) per architected
/// "tick"; pending interrupt fires on the positive-to-negative transition.
pub struct IntervalTimer {
    value: AtomicI64,
}

impl IntervalTimer {
    pub fn new() -> Self {
        IntervalTimer { value: AtomicI64::new(0) }
    }

    pub fn set(&self, v: i32) {
        self.value.store(v as i64, Ordering::Relaxed);
    }

    pub fn get(&self) -> i32 {
        self.value.load(Ordering::Relaxed) as i32
    }

    pub fn tick(&self, residue_us: i64) -> bool {
        let delta = residue_us / 3333;
        if delta == 0 {
            return false;
        }
        let prev = self.value.fetch_sub(delta, Ordering::Relaxed);
        prev >= 0 && prev - delta < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_timer_signals_on_transition_to_negative() {
        let t = CpuTimer::new();
        t.set(100);
        assert!(!t.tick(50));
        assert!(t.tick(100));
    }

    #[test]
    fn clock_comparator_triggers_at_threshold() {
        let cc = ClockComparator::new();
        cc.set(1000);
        assert!(!cc.reached(999));
        assert!(cc.reached(1000));
    }

    #[test]
    fn tod_advances_monotonically() {
        let tod = TodClock::new(1970, 0);
        let a = tod.now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = tod.now();
        assert!(b > a);
    }
}
