//! Channel subsystem: subchannel state machine, SSCH/TSCH/CLRSCH semantics, interrupt queue
//! (SPEC_FULL.md §4.6, component C6).
//!
//! Grounded on the teacher's `Device` trait + `DeviceList` bus dispatch (`devices.rs`), generalized
//! from a flat memory-mapped peripheral bus into a channel-program-driven I/O fabric with a
//! subchannel per device and an asynchronous completion path.

pub mod ccw;

use crate::devices::{Device, CCW_READ};
use crate::error::ChannelError;
use crate::storage::MainStorage;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Length of the channel subsystem's own synthesized first IPL read (Principles of Operation ch. 4's
/// "24-byte IPL record" convention): the channel reads this many bytes to absolute storage 0 before
/// any guest-supplied channel program exists.
const IPL_READ_LENGTH: u16 = 24;

/// Subchannel status word fields relevant to this crate (a projection of the architected SCSW).
#[derive(Debug, Clone, Copy, Default)]
pub struct Scsw {
    pub key: u8,
    pub ccw_address: u32,
    pub format1: bool,
    pub busy: bool,
    pub start_pending: bool,
    pub interrupt_pending: bool,
    pub unit_status: u8,
    pub channel_status: u8,
    pub residual: u16,
}

pub struct Subchannel {
    pub device_number: u16,
    pub enabled: bool,
    pub device: Arc<Mutex<Box<dyn Device>>>,
    pub scsw: Mutex<Scsw>,
    pub cv: Condvar,
}

pub struct ChannelSubsystem {
    subchannels: Mutex<HashMap<u16, Arc<Subchannel>>>,
}

impl ChannelSubsystem {
    pub fn new() -> Self {
        ChannelSubsystem { subchannels: Mutex::new(HashMap::new()) }
    }

    pub fn attach(&self, device_number: u16, device: Box<dyn Device>) {
        let sch = Arc::new(Subchannel {
            device_number,
            enabled: true,
            device: Arc::new(Mutex::new(device)),
            scsw: Mutex::new(Scsw::default()),
            cv: Condvar::new(),
        });
        self.subchannels.lock().unwrap().insert(device_number, sch);
    }

    pub fn get(&self, device_number: u16) -> Result<Arc<Subchannel>, ChannelError> {
        self.subchannels
            .lock()
            .unwrap()
            .get(&device_number)
            .cloned()
            .ok_or(ChannelError::NoSuchDevice(device_number))
    }

    /// SSCH: validate and latch a channel program start; the actual CCW-chain walk happens on the
    /// device's worker thread (every start in this crate is asynchronous — SPEC_FULL.md §4.6).
    pub fn start_subchannel(
        &self,
        device_number: u16,
        ccw_address: u32,
        format1: bool,
        key: u8,
    ) -> Result<Arc<Subchannel>, ChannelError> {
        let sch = self.get(device_number)?;
        if !sch.enabled {
            return Err(ChannelError::NotEnabled(device_number));
        }
        let mut scsw = sch.scsw.lock().unwrap();
        if scsw.busy {
            return Err(ChannelError::Busy(device_number));
        }
        scsw.busy = true;
        scsw.start_pending = true;
        scsw.ccw_address = ccw_address;
        scsw.format1 = format1;
        scsw.key = key;
        drop(scsw);
        sch.cv.notify_all();
        Ok(sch)
    }

    /// TSCH: copy and clear the SCSW, return a condition code per SPEC_FULL.md §4.6.
    pub fn test_subchannel(&self, device_number: u16) -> Result<(u8, Scsw), ChannelError> {
        let sch = self.get(device_number)?;
        let mut scsw = sch.scsw.lock().unwrap();
        if scsw.interrupt_pending {
            let copy = *scsw;
            scsw.interrupt_pending = false;
            scsw.busy = false;
            return Ok((0, copy));
        }
        if scsw.start_pending {
            return Ok((1, *scsw));
        }
        Ok((3, *scsw))
    }

    pub fn clear_subchannel(&self, device_number: u16) -> Result<(), ChannelError> {
        let sch = self.get(device_number)?;
        let mut scsw = sch.scsw.lock().unwrap();
        scsw.busy = false;
        scsw.start_pending = false;
        scsw.interrupt_pending = true;
        scsw.channel_status = 0;
        Ok(())
    }

    pub fn halt_subchannel(&self, device_number: u16) -> Result<(), ChannelError> {
        let sch = self.get(device_number)?;
        let mut scsw = sch.scsw.lock().unwrap();
        scsw.interrupt_pending = true;
        Ok(())
    }

    /// Called by a device worker thread after executing a channel program to post completion.
    pub fn complete(&self, device_number: u16, unit_status: u8, channel_status: u8, residual: u16) {
        if let Ok(sch) = self.get(device_number) {
            let mut scsw = sch.scsw.lock().unwrap();
            scsw.start_pending = false;
            scsw.unit_status = unit_status;
            scsw.channel_status = channel_status;
            scsw.residual = residual;
            scsw.interrupt_pending = true;
        }
    }

    /// Whether any subchannel currently has an interrupt pending, without clearing it — used for
    /// pending-interrupt aggregation (SPEC_FULL.md §4.3).
    pub fn any_interrupt_pending(&self) -> bool {
        self.subchannels
            .lock()
            .unwrap()
            .values()
            .any(|sch| sch.scsw.lock().unwrap().interrupt_pending)
    }

    /// IPL (SPEC_FULL.md §4.11 `ipl`, §8 scenario 1): the channel subsystem, not the guest, synthesizes
    /// the first CCW, since no channel program exists in storage yet. It reads `IPL_READ_LENGTH` bytes
    /// to absolute storage 0 directly against the device (bypassing the worker thread's async path,
    /// since the caller needs the loaded PSW back synchronously), then, per the real-hardware
    /// convention that the bytes just placed at offset 8 are the next CCW, continues the channel
    /// program from address 8 the normal way. A failure in that continuation doesn't invalidate the
    /// PSW already loaded at offset 0, so only the first read's status is checked.
    pub fn ipl(&self, storage: &MainStorage, device_number: u16) -> Result<[u8; 8], ChannelError> {
        let sch = self.get(device_number)?;
        if !sch.enabled {
            return Err(ChannelError::NotEnabled(device_number));
        }
        let first = {
            let mut device = sch.device.lock().unwrap();
            (&mut **device).execute_ccw(CCW_READ, ccw::CCW_FLAG_CC, IPL_READ_LENGTH, 0, storage, 0)
        };
        if first.unit_status & (ccw::CSW_UC | ccw::CSW_UE) != 0 {
            return Err(ChannelError::ProgramCheck(device_number as u32));
        }
        {
            let mut device = sch.device.lock().unwrap();
            let _ = ccw::execute_chain(storage, &mut **device, 8, true, 0);
        }

        let mut psw_bytes = [0u8; 8];
        storage.read(0, &mut psw_bytes, 0).map_err(|_| ChannelError::ProgramCheck(device_number as u32))?;

        let mut scsw = sch.scsw.lock().unwrap();
        scsw.busy = false;
        scsw.start_pending = false;
        scsw.unit_status = first.unit_status;
        scsw.residual = first.residual;
        Ok(psw_bytes)
    }

    /// Scan for the highest-priority (here: lowest device number) pending I/O interrupt and hand it
    /// to the CPU, clearing the subchannel's pending flag (SPEC_FULL.md §4.6 present-I/O-interrupt).
    pub fn present_interrupt(&self) -> Option<(u16, Scsw)> {
        let map = self.subchannels.lock().unwrap();
        let mut candidates: Vec<u16> = map
            .iter()
            .filter(|(_, sch)| sch.scsw.lock().unwrap().interrupt_pending)
            .map(|(&dn, _)| dn)
            .collect();
        candidates.sort_unstable();
        let device_number = candidates.into_iter().next()?;
        let sch = map.get(&device_number)?;
        let mut scsw = sch.scsw.lock().unwrap();
        scsw.interrupt_pending = false;
        Some((device_number, *scsw))
    }
}

/// One device's persistent worker thread body (SPEC_FULL.md §5 "one thread per active device
/// executing a channel program"): block on the subchannel condvar until a start is latched, walk the
/// channel program, post the result, repeat. Exits when the system shuts down.
pub fn run_device_worker(sysblk: Arc<crate::sysblk::Sysblk>, device_number: u16) {
    let sch = match sysblk.channel.get(device_number) {
        Ok(sch) => sch,
        Err(_) => return,
    };
    loop {
        if sysblk.is_shutdown() {
            return;
        }
        let (ccw_address, format1, key) = {
            let mut scsw = sch.scsw.lock().unwrap();
            while !scsw.start_pending && !sysblk.is_shutdown() {
                let (guard, _timeout) = sch.cv.wait_timeout(scsw, std::time::Duration::from_millis(50)).unwrap();
                scsw = guard;
            }
            if sysblk.is_shutdown() {
                return;
            }
            (scsw.ccw_address, scsw.format1, scsw.key)
        };

        let mut device = sch.device.lock().unwrap();
        let result = ccw::execute_chain(&sysblk.storage, &mut **device, ccw_address, format1, key);
        drop(device);

        match result {
            Ok(r) => sysblk.channel.complete(device_number, r.unit_status, 0, r.residual),
            Err(_) => sysblk.channel.complete(device_number, ccw::CSW_UC, 0, 0),
        }
    }
}
