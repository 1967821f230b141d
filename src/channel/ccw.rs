//! Channel command word decode and the chain-walking executor (SPEC_FULL.md §4.7, component C7).

use crate::devices::{Device, DeviceResult};
use crate::error::ChannelError;
use crate::storage::MainStorage;

pub const CCW_FLAG_CC: u8 = 0x40; // command chain
pub const CCW_FLAG_CD: u8 = 0x20; // data chain
pub const CCW_FLAG_SLI: u8 = 0x10; // suppress length indication
pub const CCW_FLAG_SKIP: u8 = 0x08;
pub const CCW_FLAG_PCI: u8 = 0x80;

pub const CSW_CE: u8 = 0x04; // channel end
pub const CSW_DE: u8 = 0x08; // device end
pub const CSW_UC: u8 = 0x02; // unit check
pub const CSW_UE: u8 = 0x01; // unit exception

#[derive(Debug, Clone, Copy)]
pub struct Ccw {
    pub opcode: u8,
    pub flags: u8,
    pub count: u16,
    pub data_address: u32,
}

const OPCODE_TIC: u8 = 0x08;

impl Ccw {
    /// Decode a format-1 CCW: {opcode(1), flags(1), count(2), addr(4)}.
    pub fn decode_format1(bytes: &[u8; 8]) -> Ccw {
        Ccw {
            opcode: bytes[0],
            flags: bytes[1],
            count: u16::from_be_bytes([bytes[2], bytes[3]]),
            data_address: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Decode a format-0 CCW: {opcode(1), addr24(3), flags(1), reserved(1), count(2)}.
    pub fn decode_format0(bytes: &[u8; 8]) -> Ccw {
        Ccw {
            opcode: bytes[0],
            flags: bytes[4],
            count: u16::from_be_bytes([bytes[6], bytes[7]]),
            data_address: u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]),
        }
    }

    pub fn is_tic(&self) -> bool {
        self.opcode == OPCODE_TIC
    }
}

/// Outcome of walking one channel program to completion or to an error stop.
#[derive(Debug, Default)]
pub struct ChainResult {
    pub unit_status: u8,
    pub residual: u16,
    pub last_ccw_address: u32,
    pub sense: Vec<u8>,
}

/// Walk a chained channel program starting at `start_addr`, in `format1` or format-0 encoding,
/// dispatching each non-TIC CCW to `device` (SPEC_FULL.md §4.7).
pub fn execute_chain(
    storage: &MainStorage,
    device: &mut dyn Device,
    start_addr: u32,
    format1: bool,
    key: u8,
) -> Result<ChainResult, ChannelError> {
    let mut addr = start_addr;
    let mut prev_opcode: Option<u8> = None;
    let mut result = ChainResult::default();
    let mut guard = 0usize;

    loop {
        guard += 1;
        if guard > 65536 {
            return Err(ChannelError::ProgramCheck(addr));
        }
        let mut raw = [0u8; 8];
        storage
            .read(addr as usize, &mut raw, key)
            .map_err(|_| ChannelError::ProgramCheck(addr))?;
        let ccw = if format1 { Ccw::decode_format1(&raw) } else { Ccw::decode_format0(&raw) };

        if ccw.is_tic() {
            addr = ccw.data_address;
            continue;
        }

        result.last_ccw_address = addr;
        let chained_data = prev_opcode.is_some() && prev_opcode != Some(OPCODE_TIC);
        let effective_opcode = if chained_data && is_data_chain_continuation(prev_opcode) {
            prev_opcode.unwrap()
        } else {
            ccw.opcode
        };

        let DeviceResult { unit_status, residual, sense } =
            device.execute_ccw(effective_opcode, ccw.flags, ccw.count, ccw.data_address, storage, key);

        result.unit_status = unit_status;
        result.residual = residual;
        if !sense.is_empty() {
            result.sense = sense;
        }

        let chain_breaking = unit_status & (CSW_UC | CSW_UE) != 0;
        if chain_breaking && ccw.flags & CCW_FLAG_SLI == 0 {
            return Ok(result);
        }

        if ccw.flags & CCW_FLAG_CD != 0 {
            prev_opcode = Some(ccw.opcode);
            addr += 8;
            continue;
        }
        if ccw.flags & CCW_FLAG_CC != 0 && unit_status & (CSW_CE | CSW_DE) == (CSW_CE | CSW_DE) {
            prev_opcode = None;
            addr += 8;
            continue;
        }
        return Ok(result);
    }
}

fn is_data_chain_continuation(prev_opcode: Option<u8>) -> bool {
    prev_opcode.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_format1() {
        let raw = [0x02, CCW_FLAG_CC, 0x00, 0x50, 0x00, 0x01, 0x00, 0x00];
        let ccw = Ccw::decode_format1(&raw);
        assert_eq!(ccw.opcode, 0x02);
        assert_eq!(ccw.count, 0x0050);
        assert_eq!(ccw.data_address, 0x0001_0000);
    }

    #[test]
    fn decodes_format0() {
        let raw = [0x02, 0x00, 0x01, 0x00, CCW_FLAG_CC, 0x00, 0x00, 0x50];
        let ccw = Ccw::decode_format0(&raw);
        assert_eq!(ccw.opcode, 0x02);
        assert_eq!(ccw.data_address, 0x0001_0000);
        assert_eq!(ccw.count, 0x0050);
    }
}
