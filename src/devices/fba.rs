//! FBA DASD (SPEC_FULL.md §4.8 "FBA DASD") — a flat array of uniform 512-byte blocks, addressed
//! directly rather than through CKD's cylinder/head/record geometry.

use super::{handle_sense_id, normal_status, Device, DeviceResult, CCW_SENSE, CCW_SENSE_ID};
use crate::storage::MainStorage;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

pub const BLOCK_SIZE: usize = 512;

pub const CCW_DEFINE_EXTENT: u8 = 0x63;
pub const CCW_LOCATE: u8 = 0x43;
pub const CCW_READ: u8 = 0x42;
pub const CCW_WRITE: u8 = 0x41;
pub const CCW_READ_REPL: u8 = 0x49;

pub struct FbaDasd {
    device_number: u16,
    file: File,
    block_count: u32,
    /// Block number set by the most recent LOCATE; read/write CCWs act starting here and advance it.
    current_block: u32,
}

impl FbaDasd {
    pub fn open(device_number: u16, mut file: File) -> std::io::Result<Self> {
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(FbaDasd { device_number, file, block_count: (len / BLOCK_SIZE as u64) as u32, current_block: 0 })
    }

    fn block_offset(&self, block: u32) -> u64 {
        block as u64 * BLOCK_SIZE as u64
    }
}

impl Device for FbaDasd {
    fn device_number(&self) -> u16 {
        self.device_number
    }

    fn sense_id(&self) -> Vec<u8> {
        vec![0xFF, 0x32, 0x00, 0x00]
    }

    fn execute_ccw(
        &mut self,
        opcode: u8,
        _flags: u8,
        count: u16,
        data_address: u32,
        storage: &MainStorage,
        _key: u8,
    ) -> DeviceResult {
        match opcode {
            CCW_SENSE_ID => handle_sense_id(self.device_number, self.sense_id(), count, storage, data_address),
            CCW_SENSE => DeviceResult { unit_status: normal_status(), residual: count, sense: vec![0u8; 24] },
            CCW_DEFINE_EXTENT => DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() },
            CCW_LOCATE => {
                let mut buf = vec![0u8; count as usize];
                storage.read_direct(data_address as usize, &mut buf);
                // Locate-record parameter block: {operation, flags, reserved, reserved, block-number}.
                if buf.len() >= 8 {
                    self.current_block = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
                }
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_READ | CCW_READ_REPL => {
                if self.current_block >= self.block_count {
                    return DeviceResult { unit_status: normal_status(), residual: count, sense: vec![0x04] };
                }
                let mut buf = vec![0u8; BLOCK_SIZE];
                if self.file.seek(SeekFrom::Start(self.block_offset(self.current_block))).is_err()
                    || self.file.read_exact(&mut buf).is_err()
                {
                    return DeviceResult { unit_status: normal_status(), residual: count, sense: vec![0x04] };
                }
                let n = buf.len().min(count as usize);
                storage.write_direct(data_address as usize, &buf[..n]);
                self.current_block += 1;
                DeviceResult { unit_status: normal_status(), residual: count.saturating_sub(n as u16), sense: Vec::new() }
            }
            CCW_WRITE => {
                let n = (count as usize).min(BLOCK_SIZE);
                let mut buf = vec![0u8; n];
                storage.read_direct(data_address as usize, &mut buf);
                buf.resize(BLOCK_SIZE, 0);
                if self.current_block >= self.block_count {
                    self.block_count = self.current_block + 1;
                }
                let _ = self
                    .file
                    .seek(SeekFrom::Start(self.block_offset(self.current_block)))
                    .and_then(|_| self.file.write_all(&buf));
                self.current_block += 1;
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            other => DeviceResult { unit_status: normal_status(), residual: count, sense: vec![0x00, other] },
        }
    }

    fn close(&mut self) {
        let _ = self.file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn locate_then_read_returns_the_addressed_block() {
        let mut file = tempfile().unwrap();
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        file.write_all(&block).unwrap();
        file.write_all(&vec![0xCDu8; BLOCK_SIZE]).unwrap();

        let mut dasd = FbaDasd::open(0x200, file).unwrap();
        let storage = MainStorage::new(1);
        let locate = [0u8, 0, 0, 0, 0, 0, 0, 1]; // block 1
        storage.write_direct(0x1000, &locate);
        dasd.execute_ccw(CCW_LOCATE, 0, 8, 0x1000, &storage, 0);

        let r = dasd.execute_ccw(CCW_READ, 0, BLOCK_SIZE as u16, 0x2000, &storage, 0);
        assert_eq!(r.residual, 0);
        let mut buf = [0u8; BLOCK_SIZE];
        storage.read(0x2000, &mut buf, 0).unwrap();
        assert_eq!(buf[0], 0xCD);
    }

    #[test]
    fn write_past_end_extends_block_count() {
        let file = tempfile().unwrap();
        let mut dasd = FbaDasd::open(0x200, file).unwrap();
        let storage = MainStorage::new(1);
        let data = vec![0x11u8; BLOCK_SIZE];
        storage.write_direct(0x1000, &data);
        dasd.execute_ccw(CCW_WRITE, 0, BLOCK_SIZE as u16, 0x1000, &storage, 0);
        assert_eq!(dasd.block_count, 1);
    }
}
