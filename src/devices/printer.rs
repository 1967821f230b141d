//! Printer (SPEC_FULL.md §4.8 "Printer").

use super::{handle_sense_id, normal_status, Device, DeviceResult, CCW_SENSE, CCW_SENSE_ID, CCW_WRITE};
use crate::storage::MainStorage;
use std::io::Write as _;

pub struct Printer {
    device_number: u16,
    upper_case_fold: bool,
    out: Box<dyn std::io::Write + Send>,
}

fn ebcdic_to_ascii(b: u8) -> u8 {
    const TABLE: [u8; 256] = build_ebcdic_table();
    TABLE[b as usize]
}

const fn build_ebcdic_table() -> [u8; 256] {
    // Inverse of the card reader's ASCII->EBCDIC table for the printable range; everything else maps
    // to a blank, matching how real unit-record printers render an un-translatable punch.
    let mut table = [0x20u8; 256];
    let ascii_to_ebcdic: [(u8, u8); _] = [
        (0x20, 0x40), (0x21, 0x5A), (0x22, 0x7F), (0x23, 0x7B), (0x24, 0x5B), (0x25, 0x6C),
        (0x26, 0x50), (0x27, 0x7D), (0x28, 0x4D), (0x29, 0x5D), (0x2A, 0x5C), (0x2B, 0x4E),
        (0x2C, 0x6B), (0x2D, 0x60), (0x2E, 0x4B), (0x2F, 0x61), (0x30, 0xF0), (0x31, 0xF1),
        (0x32, 0xF2), (0x33, 0xF3), (0x34, 0xF4), (0x35, 0xF5), (0x36, 0xF6), (0x37, 0xF7),
        (0x38, 0xF8), (0x39, 0xF9), (0x3A, 0x7A), (0x3B, 0x5E), (0x3C, 0x4C), (0x3D, 0x7E),
        (0x3E, 0x6E), (0x3F, 0x6F), (0x40, 0x7C), (0x41, 0xC1), (0x42, 0xC2), (0x43, 0xC3),
        (0x44, 0xC4), (0x45, 0xC5), (0x46, 0xC6), (0x47, 0xC7), (0x48, 0xC8), (0x49, 0xC9),
        (0x4A, 0xD1), (0x4B, 0xD2), (0x4C, 0xD3), (0x4D, 0xD4), (0x4E, 0xD5), (0x4F, 0xD6),
        (0x50, 0xD7), (0x51, 0xD8), (0x52, 0xD9), (0x53, 0xE2), (0x54, 0xE3), (0x55, 0xE4),
        (0x56, 0xE5), (0x57, 0xE6), (0x58, 0xE7), (0x59, 0xE8), (0x5A, 0xE9), (0x61, 0x81),
        (0x62, 0x82), (0x63, 0x83), (0x64, 0x84), (0x65, 0x85), (0x66, 0x86), (0x67, 0x87),
        (0x68, 0x88), (0x69, 0x89), (0x6A, 0x91), (0x6B, 0x92), (0x6C, 0x93), (0x6D, 0x94),
        (0x6E, 0x95), (0x6F, 0x96), (0x70, 0x97), (0x71, 0x98), (0x72, 0x99), (0x73, 0xA2),
        (0x74, 0xA3), (0x75, 0xA4), (0x76, 0xA5), (0x77, 0xA6), (0x78, 0xA7), (0x79, 0xA8),
        (0x7A, 0xA9), (0x5B, 0xBA), (0x5D, 0xBB), (0x7B, 0xC0), (0x7D, 0xD0), (0x5C, 0xE0),
        (0x7E, 0xA1), (0x5E, 0xB0), (0x5F, 0x6D), (0x60, 0x79),
    ];
    let mut i = 0;
    while i < ascii_to_ebcdic.len() {
        let (a, e) = ascii_to_ebcdic[i];
        table[e as usize] = a;
        i += 1;
    }
    table
}

impl Printer {
    pub fn new(device_number: u16, out: Box<dyn std::io::Write + Send>, upper_case_fold: bool) -> Self {
        Printer { device_number, upper_case_fold, out }
    }
}

impl Device for Printer {
    fn device_number(&self) -> u16 {
        self.device_number
    }

    fn sense_id(&self) -> Vec<u8> {
        vec![0xFF, 0x14, 0x03, 0x00]
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
            CCW_WRITE => {
                let mut buf = vec![0u8; count as usize];
                storage.read_direct(data_address as usize, &mut buf);
                let mut line: Vec<u8> = buf.iter().map(|&b| ebcdic_to_ascii(b)).collect();
                if self.upper_case_fold {
                    line.make_ascii_uppercase();
                }
                line.push(b'\n');
                let _ = self.out.write_all(&line);
                DeviceResult { unit_status: normal_status(), residual: 0, sense: Vec::new() }
            }
            CCW_SENSE => DeviceResult { unit_status: normal_status(), residual: count, sense: vec![0u8; 6] },
            _ => DeviceResult { unit_status: normal_status(), residual: count, sense: Vec::new() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_translated_line_with_newline() {
        let buf: Vec<u8> = Vec::new();
        let sink = Box::new(TestSink(std::sync::Arc::new(std::sync::Mutex::new(buf))));
        let captured = sink.0.clone();
        let mut printer = Printer::new(0x00E, sink, false);
        let storage = MainStorage::new(1);
        storage.write_direct(0x1000, &[0xC8, 0xC9]); // EBCDIC "HI"
        printer.execute_ccw(CCW_WRITE, 0, 2, 0x1000, &storage, 0);
        let out = captured.lock().unwrap();
        assert_eq!(&out[..], b"HI\n");
    }

    struct TestSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
    impl std::io::Write for TestSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
