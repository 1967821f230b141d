//! CKD DASD (SPEC_FULL.md §4.8 "CKD DASD"). Backs onto either a raw fixed CKD image or the
//! compressed CKD engine (`crate::ckdstor`), both exposing the same track-image contract.

use super::{handle_sense_id, normal_status, Device, DeviceResult, CCW_SENSE, CCW_SENSE_ID};
use crate::ckdstor::CompressedCkdFile;
use crate::storage::MainStorage;
use log::debug;
use std::io::{Read, Seek, SeekFrom};

pub const CCW_WRITE_DATA: u8 = 0x05;
pub const CCW_READ_DATA: u8 = 0x06;
pub const CCW_READ_COUNT: u8 = 0x12;
pub const CCW_READ_R0: u8 = 0x16;
pub const CCW_READ_KEY_DATA: u8 = 0x0E;
pub const CCW_WRITE_KEY_DATA: u8 = 0x0D;
pub const CCW_SEARCH_ID_EQ: u8 = 0x31;
pub const CCW_SEARCH_ID_HIGH: u8 = 0x51;
pub const CCW_SEARCH_ID_EQHIGH: u8 = 0x71;
pub const CCW_SEEK: u8 = 0x07;
pub const CCW_SEEK_CYL: u8 = 0x0B;
pub const CCW_DEFINE_EXTENT: u8 = 0x63;
pub const CCW_LOCATE_RECORD: u8 = 0x47;
pub const CCW_READ_IPL: u8 = 0x02;

const CSW_SM: u8 = 0x10; // status modifier, used by search CCWs on match

/// A single record on a track: {cchh, rec, klen, dlen, key, data}.
#[derive(Debug, Clone)]
pub struct Record {
    pub cyl: u16,
    pub head: u16,
    pub rec: u8,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

enum Backing {
    Raw(std::fs::File),
    Compressed(CompressedCkdFile),
}

pub struct CkdDasd {
    device_number: u16,
    backing: Backing,
    heads: u32,
    track_size: u32,
    cur_cyl: u16,
    cur_head: u16,
    /// Index into the current track's parsed record list; `None` means positioned at count-area of
    /// record 0 (home address), matching a fresh SEEK.
    orientation: Option<usize>,
    current_track: Vec<Record>,
}

impl CkdDasd {
    pub fn open_raw(device_number: u16, mut file: std::fs::File, heads: u32, track_size: u32) -> std::io::Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        Ok(CkdDasd {
            device_number,
            backing: Backing::Raw(file),
            heads,
            track_size,
            cur_cyl: 0,
            cur_head: 0,
            orientation: None,
            current_track: Vec::new(),
        })
    }

    pub fn open_compressed(device_number: u16, ckd: CompressedCkdFile, heads: u32, track_size: u32) -> Self {
        CkdDasd {
            device_number,
            backing: Backing::Compressed(ckd),
            heads,
            track_size,
            cur_cyl: 0,
            cur_head: 0,
            orientation: None,
            current_track: Vec::new(),
        }
    }

    fn track_number(&self) -> u32 {
        self.cur_cyl as u32 * self.heads + self.cur_head as u32
    }

    fn load_current_track(&mut self) -> std::io::Result<()> {
        let image = match &mut self.backing {
            Backing::Raw(file) => {
                let offset = 512u64 + self.track_number() as u64 * self.track_size as u64;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; self.track_size as usize];
                file.read_exact(&mut buf)?;
                buf
            }
            Backing::Compressed(ckd) => {
                ckd.lseek(self.track_number(), 0);
                ckd.read(self.track_size as usize).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", e)))?
            }
        };
        self.current_track = parse_track(&image);
        self.orientation = None;
        Ok(())
    }

    fn seek(&mut self, cyl: u16, head: u16) {
        if self.track_number() != cyl as u32 * self.heads + head as u32 || self.current_track.is_empty() {
            self.cur_cyl = cyl;
            self.cur_head = head;
            let _ = self.load_current_track();
        }
    }
}

fn parse_track(image: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    if image.len() < 5 {
        return records;
    }
    let mut pos = 5usize; // skip the 5-byte track header
    loop {
        if pos + 8 > image.len() {
            break;
        }
        if image[pos..pos + 8] == [0xFFu8; 8] {
            break;
        }
        let cyl = u16::from_be_bytes([image[pos], image[pos + 1]]);
        let head = u16::from_be_bytes([image[pos + 2], image[pos + 3]]);
        let rec = image[pos + 4];
        let klen = image[pos + 5] as usize;
        let dlen = u16::from_be_bytes([image[pos + 6], image[pos + 7]]) as usize;
        pos += 8;
        if pos + klen + dlen > image.len() {
            break;
        }
        let key = image[pos..pos + klen].to_vec();
        pos += klen;
        let data = image[pos..pos + dlen].to_vec();
        pos += dlen;
        records.push(Record { cyl, head, rec, key, data });
    }
    records
}

impl Device for CkdDasd {
    fn device_number(&self) -> u16 {
        self.device_number
    }

    fn sense_id(&self) -> Vec<u8> {
        vec![0xFF, 0x33, 0x90, 0x00]
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
            CCW_DEFINE_EXTENT | CCW_LOCATE_RECORD => {
                // This port does not enforce extent limits or the full locate-record parameter block;
                // it accepts the CCW (consuming its data) and lets SEEK/SEARCH drive positioning.
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_SEEK | CCW_SEEK_CYL => {
                let mut buf = vec![0u8; count as usize];
                storage.read_direct(data_address as usize, &mut buf);
                if buf.len() >= 4 {
                    let cyl = u16::from_be_bytes([buf[0], buf[1]]);
                    let head = u16::from_be_bytes([buf[2], buf[3]]);
                    self.seek(cyl, head);
                }
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_READ_IPL => {
                self.seek(0, 0);
                if self.current_track.is_empty() {
                    return DeviceResult { unit_status: normal_status(), residual: count, sense: Vec::new() };
                }
                let data = &self.current_track[0].data;
                let n = data.len().min(count as usize);
                storage.write_direct(data_address as usize, &data[..n]);
                self.orientation = Some(0);
                DeviceResult { unit_status: normal_status(), residual: count.saturating_sub(n as u16), sense: Vec::new() }
            }
            CCW_SEARCH_ID_EQ | CCW_SEARCH_ID_HIGH | CCW_SEARCH_ID_EQHIGH => {
                let mut arg = vec![0u8; count as usize];
                storage.read_direct(data_address as usize, &mut arg);
                if arg.len() < 5 {
                    return DeviceResult { unit_status: normal_status(), residual: count, sense: Vec::new() };
                }
                let want_cyl = u16::from_be_bytes([arg[0], arg[1]]);
                let want_head = u16::from_be_bytes([arg[2], arg[3]]);
                let want_rec = arg[4];
                let start = self.orientation.map(|i| i + 1).unwrap_or(0);
                let found = self.current_track[start..].iter().position(|r| match opcode {
                    CCW_SEARCH_ID_EQ => (r.cyl, r.head, r.rec) == (want_cyl, want_head, want_rec),
                    CCW_SEARCH_ID_HIGH => (r.cyl, r.head, r.rec) > (want_cyl, want_head, want_rec),
                    _ => (r.cyl, r.head, r.rec) >= (want_cyl, want_head, want_rec),
                });
                match found {
                    Some(rel) => {
                        self.orientation = Some(start + rel);
                        DeviceResult { unit_status: normal_status() | CSW_SM, residual: 0, sense: Vec::new() }
                    }
                    None => DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() },
                }
            }
            CCW_READ_COUNT => match self.orientation.and_then(|i| self.current_track.get(i)) {
                Some(r) => {
                    let mut buf = [0u8; 8];
                    buf[0..2].copy_from_slice(&r.cyl.to_be_bytes());
                    buf[2..4].copy_from_slice(&r.head.to_be_bytes());
                    buf[4] = r.rec;
                    buf[5] = r.key.len() as u8;
                    buf[6..8].copy_from_slice(&(r.data.len() as u16).to_be_bytes());
                    let n = buf.len().min(count as usize);
                    storage.write_direct(data_address as usize, &buf[..n]);
                    DeviceResult { unit_status: normal_status(), residual: count.saturating_sub(n as u16), sense: Vec::new() }
                }
                None => DeviceResult { unit_status: normal_status(), residual: count, sense: Vec::new() },
            },
            CCW_READ_R0 => match self.current_track.first() {
                Some(r) => {
                    let n = r.data.len().min(count as usize);
                    storage.write_direct(data_address as usize, &r.data[..n]);
                    self.orientation = Some(0);
                    DeviceResult { unit_status: normal_status(), residual: count.saturating_sub(n as u16), sense: Vec::new() }
                }
                None => DeviceResult { unit_status: normal_status(), residual: count, sense: Vec::new() },
            },
            CCW_READ_DATA | CCW_READ_KEY_DATA => match self.orientation.and_then(|i| self.current_track.get(i)) {
                Some(r) => {
                    let mut out = Vec::new();
                    if opcode == CCW_READ_KEY_DATA {
                        out.extend_from_slice(&r.key);
                    }
                    out.extend_from_slice(&r.data);
                    let n = out.len().min(count as usize);
                    storage.write_direct(data_address as usize, &out[..n]);
                    DeviceResult { unit_status: normal_status(), residual: count.saturating_sub(n as u16), sense: Vec::new() }
                }
                None => DeviceResult { unit_status: normal_status(), residual: count, sense: Vec::new() },
            },
            CCW_WRITE_DATA | CCW_WRITE_KEY_DATA => {
                // SPEC_FULL.md §9 Open Questions: write-CCW interaction with search-id/key equality
                // flags is gated as incomplete upstream too; this port writes unconditionally against
                // whatever record orientation currently names, the simplest rule consistent with the
                // architecture manual's "last search defines target key" reading (decided here per
                // SPEC_FULL.md §9).
                let mut buf = vec![0u8; count as usize];
                storage.read_direct(data_address as usize, &mut buf);
                if let Some(idx) = self.orientation {
                    if let Some(r) = self.current_track.get_mut(idx) {
                        if opcode == CCW_WRITE_KEY_DATA {
                            let klen = r.key.len().min(buf.len());
                            r.key = buf[..klen].to_vec();
                            r.data = buf[klen..].to_vec();
                        } else {
                            r.data = buf.clone();
                        }
                        let image = rebuild_track(self.track_size, &self.current_track);
                        if let Backing::Compressed(ckd) = &mut self.backing {
                            ckd.lseek(self.track_number(), 0);
                            let _ = ckd.write(&image);
                        }
                    }
                }
                debug!("ckd {:04X}: write at track {}", self.device_number, self.track_number());
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            other => DeviceResult { unit_status: normal_status(), residual: count, sense: vec![0x00, other] },
        }
    }

    fn close(&mut self) {
        if let Backing::Compressed(ckd) = &self.backing {
            let _ = ckd.close();
        }
    }
}

fn rebuild_track(track_size: u32, records: &[Record]) -> Vec<u8> {
    let mut buf = vec![0u8; 5];
    for r in records {
        buf.extend_from_slice(&r.cyl.to_be_bytes());
        buf.extend_from_slice(&r.head.to_be_bytes());
        buf.push(r.rec);
        buf.push(r.key.len() as u8);
        buf.extend_from_slice(&(r.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&r.key);
        buf.extend_from_slice(&r.data);
    }
    buf.extend_from_slice(&[0xFFu8; 8]);
    if (buf.len() as u32) < track_size {
        buf.resize(track_size as usize, 0);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn make_raw_image(heads: u32, track_size: u32, records: &[Record]) -> std::fs::File {
        let mut file = tempfile().unwrap();
        use std::io::Write;
        file.write_all(&[0u8; 512]).unwrap();
        file.write_all(&rebuild_track(track_size, records)).unwrap();
        let _ = heads;
        file
    }

    #[test]
    fn search_id_equal_then_read_data_returns_matching_record() {
        let records = vec![
            Record { cyl: 0, head: 0, rec: 0, key: vec![], data: vec![0xAA] },
            Record { cyl: 0, head: 0, rec: 1, key: vec![], data: b"R1".to_vec() },
            Record { cyl: 0, head: 0, rec: 2, key: vec![], data: b"R2".to_vec() },
            Record { cyl: 0, head: 0, rec: 3, key: vec![], data: b"R3".to_vec() },
        ];
        let track_size = 4096;
        let file = make_raw_image(15, track_size, &records);
        let mut dasd = CkdDasd::open_raw(0x190, file, 15, track_size).unwrap();
        let storage = MainStorage::new(1);

        dasd.seek(0, 0);
        let arg = [0u8, 0, 0, 0, 2]; // cchh=0,0 rec=2
        storage.write_direct(0x1000, &arg);
        let r = dasd.execute_ccw(CCW_SEARCH_ID_EQ, 0, 5, 0x1000, &storage, 0);
        assert_eq!(r.unit_status & CSW_SM, CSW_SM);

        let rd = dasd.execute_ccw(CCW_READ_DATA, 0, 2, 0x2000, &storage, 0);
        assert_eq!(rd.residual, 0);
        let mut buf = [0u8; 2];
        storage.read(0x2000, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"R2");
    }
}
