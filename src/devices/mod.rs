//! Device handlers (SPEC_FULL.md §4.8, component C8).
//!
//! Grounded on the teacher's `Device` trait object pattern and `Signal` return enum (`devices.rs`):
//! there, a device is anything with a memory-mapped read/write and an interrupt-request flag; here a
//! device is anything with the init/execute-ccw/close contract SPEC_FULL.md names, so the CCW executor
//! (`channel::ccw::execute_chain`) can drive any of them identically.

pub mod card;
pub mod ckd;
pub mod factory;
pub mod fba;
pub mod printer;
pub mod tape;
pub mod tn3270;

use crate::storage::MainStorage;

/// Result of executing exactly one CCW.
#[derive(Debug, Default)]
pub struct DeviceResult {
    pub unit_status: u8,
    pub residual: u16,
    pub sense: Vec<u8>,
}

/// The init/execute-ccw/close contract every device type implements (SPEC_FULL.md §4.8).
pub trait Device: Send {
    fn device_number(&self) -> u16;

    /// Device-identifier bytes returned by SENSE ID.
    fn sense_id(&self) -> Vec<u8>;

    fn execute_ccw(
        &mut self,
        opcode: u8,
        flags: u8,
        count: u16,
        data_address: u32,
        storage: &MainStorage,
        key: u8,
    ) -> DeviceResult;

    fn close(&mut self) {}
}

pub const CCW_WRITE: u8 = 0x01;
pub const CCW_READ: u8 = 0x02;
pub const CCW_NOP: u8 = 0x03;
pub const CCW_SENSE: u8 = 0x04;
pub const CCW_SENSE_ID: u8 = 0xE4;

use crate::channel::ccw::{CSW_CE, CSW_DE};

/// Shared terminal status for a normal single-CCW completion.
pub fn normal_status() -> u8 {
    CSW_CE | CSW_DE
}

/// Common SENSE ID handling shared by every device type: returns the device's identifier bytes,
/// honoring residual-count accounting the way the rest of the handlers do.
pub fn handle_sense_id(device_number: u16, id: Vec<u8>, count: u16, storage: &MainStorage, data_address: u32) -> DeviceResult {
    let n = id.len().min(count as usize);
    storage.write_direct(data_address as usize, &id[..n]);
    let _ = device_number;
    DeviceResult {
        unit_status: normal_status(),
        residual: count.saturating_sub(n as u16),
        sense: Vec::new(),
    }
}
