//! Block-structured tape device (SPEC_FULL.md §4.8 "Tape").
//!
//! The backing file is a sequence of `{curlen: u32 LE, prvlen: u32 LE, flags: u8}` block headers
//! followed by `curlen` bytes of data; a tape mark is a header with `curlen == 0`.

use super::{handle_sense_id, normal_status, Device, DeviceResult, CCW_SENSE, CCW_SENSE_ID};
use crate::storage::MainStorage;
use log::debug;
use std::io::{Read, Seek, SeekFrom, Write};

pub const CCW_READ_FORWARD: u8 = 0x02;
pub const CCW_WRITE: u8 = 0x01;
pub const CCW_WRITE_TAPE_MARK: u8 = 0x1F;
pub const CCW_BACKSPACE_BLOCK: u8 = 0x27;
pub const CCW_BACKSPACE_FILE: u8 = 0x23;
pub const CCW_FORWARD_SPACE_BLOCK: u8 = 0x37;
pub const CCW_FORWARD_SPACE_FILE: u8 = 0x33;
pub const CCW_REWIND: u8 = 0x07;
pub const CCW_REWIND_UNLOAD: u8 = 0x0F;

const HEADER_LEN: u64 = 9;

struct BlockHeader {
    curlen: u32,
    prvlen: u32,
    flags: u8,
}

pub struct TapeDrive {
    device_number: u16,
    file: std::fs::File,
    position: u64,
}

impl TapeDrive {
    pub fn new(device_number: u16, file: std::fs::File) -> Self {
        TapeDrive { device_number, file, position: 0 }
    }

    fn read_header_at(&mut self, pos: u64) -> std::io::Result<Option<BlockHeader>> {
        self.file.seek(SeekFrom::Start(pos))?;
        let mut buf = [0u8; HEADER_LEN as usize];
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(Some(BlockHeader {
                curlen: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
                prvlen: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
                flags: buf[8],
            })),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_header_at(&mut self, pos: u64, h: &BlockHeader) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&h.curlen.to_le_bytes());
        buf[4..8].copy_from_slice(&h.prvlen.to_le_bytes());
        buf[8] = h.flags;
        self.file.write_all(&buf)
    }
}

impl Device for TapeDrive {
    fn device_number(&self) -> u16 {
        self.device_number
    }

    fn sense_id(&self) -> Vec<u8> {
        vec![0xFF, 0x34, 0x80, 0x00]
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
            CCW_READ_FORWARD => match self.read_header_at(self.position) {
                Ok(Some(h)) if h.curlen == 0 => {
                    self.position += HEADER_LEN;
                    DeviceResult { unit_status: normal_status() | crate::channel::ccw::CSW_UE, residual: count, sense: Vec::new() }
                }
                Ok(Some(h)) => {
                    let mut data = vec![0u8; h.curlen as usize];
                    let _ = self.file.read_exact(&mut data);
                    self.position += HEADER_LEN + h.curlen as u64;
                    let want = count as usize;
                    let n = data.len().min(want);
                    storage.write_direct(data_address as usize, &data[..n]);
                    DeviceResult { unit_status: normal_status(), residual: count.saturating_sub(n as u16), sense: Vec::new() }
                }
                Ok(None) => DeviceResult { unit_status: normal_status() | crate::channel::ccw::CSW_UE, residual: count, sense: Vec::new() },
                Err(e) => {
                    debug!("tape {:04X}: read error: {}", self.device_number, e);
                    DeviceResult { unit_status: normal_status() | crate::channel::ccw::CSW_UC, residual: count, sense: vec![0x20] }
                }
            },
            CCW_WRITE => {
                let mut data = vec![0u8; count as usize];
                storage.read_direct(data_address as usize, &mut data);
                let prvlen = if self.position >= HEADER_LEN {
                    self.read_header_at(self.position - HEADER_LEN).ok().flatten().map(|h| h.curlen).unwrap_or(0)
                } else {
                    0
                };
                let header = BlockHeader { curlen: data.len() as u32, prvlen, flags: 0 };
                let _ = self.write_header_at(self.position, &header);
                let _ = self.file.seek(SeekFrom::Start(self.position + HEADER_LEN));
                let _ = self.file.write_all(&data);
                self.position += HEADER_LEN + data.len() as u64;
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_WRITE_TAPE_MARK => {
                let header = BlockHeader { curlen: 0, prvlen: 0, flags: 0 };
                let _ = self.write_header_at(self.position, &header);
                self.position += HEADER_LEN;
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_BACKSPACE_BLOCK => {
                if self.position >= HEADER_LEN {
                    if let Ok(Some(h)) = self.read_header_at(self.position.saturating_sub(HEADER_LEN)) {
                        self.position -= HEADER_LEN + h.prvlen as u64;
                    }
                }
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_FORWARD_SPACE_BLOCK => {
                if let Ok(Some(h)) = self.read_header_at(self.position) {
                    self.position += HEADER_LEN + h.curlen as u64;
                }
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_BACKSPACE_FILE | CCW_FORWARD_SPACE_FILE => {
                // Space over blocks until a tape mark (curlen == 0) is crossed.
                loop {
                    let forward = opcode == CCW_FORWARD_SPACE_FILE;
                    let probe = if forward { self.position } else { self.position.saturating_sub(HEADER_LEN) };
                    match self.read_header_at(probe) {
                        Ok(Some(h)) if h.curlen == 0 => {
                            self.position = if forward { probe + HEADER_LEN } else { probe };
                            break;
                        }
                        Ok(Some(h)) => {
                            self.position = if forward { probe + HEADER_LEN + h.curlen as u64 } else { probe.saturating_sub(h.prvlen as u64) };
                        }
                        _ => break,
                    }
                }
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_REWIND | CCW_REWIND_UNLOAD => {
                self.position = 0;
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_SENSE => DeviceResult { unit_status: normal_status(), residual: count, sense: vec![0u8; 24] },
            other => {
                debug!("tape {:04X}: unsupported opcode {:02X}", self.device_number, other);
                DeviceResult { unit_status: normal_status(), residual: count, sense: Vec::new() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn write_then_read_forward_roundtrips() {
        let f = tempfile().unwrap();
        let mut tape = TapeDrive::new(0x181, f);
        let storage = MainStorage::new(1);
        storage.write_direct(0x1000, b"HELLO");
        tape.execute_ccw(CCW_WRITE, 0, 5, 0x1000, &storage, 0);
        tape.execute_ccw(CCW_REWIND, 0, 0, 0, &storage, 0);
        let r = tape.execute_ccw(CCW_READ_FORWARD, 0, 5, 0x2000, &storage, 0);
        assert_eq!(r.residual, 0);
        let mut buf = [0u8; 5];
        storage.read(0x2000, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"HELLO");
    }

    #[test]
    fn tape_mark_signals_unit_exception() {
        let f = tempfile().unwrap();
        let mut tape = TapeDrive::new(0x181, f);
        let storage = MainStorage::new(1);
        tape.execute_ccw(CCW_WRITE_TAPE_MARK, 0, 0, 0, &storage, 0);
        tape.execute_ccw(CCW_REWIND, 0, 0, 0, &storage, 0);
        let r = tape.execute_ccw(CCW_READ_FORWARD, 0, 80, 0x2000, &storage, 0);
        assert_eq!(r.unit_status & crate::channel::ccw::CSW_UE, crate::channel::ccw::CSW_UE);
    }
}
