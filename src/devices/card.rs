//! Card reader (SPEC_FULL.md §4.8 "Card reader"). Grounded on the teacher's `Device` trait shape.

use super::{handle_sense_id, normal_status, Device, DeviceResult, CCW_READ, CCW_SENSE, CCW_SENSE_ID};
use crate::channel::ccw::CSW_UE;
use crate::storage::MainStorage;
use log::debug;

/// Short-record policy when a card is shorter than the byte count requested by the CCW.
#[derive(Debug, Clone, Copy)]
pub enum ShortRecordPolicy {
    DataCheck,
    Truncate,
    Pad,
}

pub struct CardReader {
    device_number: u16,
    cards: Vec<Vec<u8>>,
    position: usize,
    policy: ShortRecordPolicy,
    eof_signaled: bool,
}

/// Minimal ASCII-to-EBCDIC table sized for the printable subset this reader accepts; unmapped bytes
/// translate to EBCDIC space (0x40), matching the conservative behavior real 2501/3505 readers take
/// for characters outside their print chain.
fn ascii_to_ebcdic(b: u8) -> u8 {
    const TABLE: [u8; 128] = [
        0x00, 0x01, 0x02, 0x03, 0x37, 0x2D, 0x2E, 0x2F, 0x16, 0x05, 0x25, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        0x10, 0x11, 0x12, 0x13, 0x3C, 0x3D, 0x32, 0x26, 0x18, 0x19, 0x3F, 0x27, 0x1C, 0x1D, 0x1E, 0x1F,
        0x40, 0x5A, 0x7F, 0x7B, 0x5B, 0x6C, 0x50, 0x7D, 0x4D, 0x5D, 0x5C, 0x4E, 0x6B, 0x60, 0x4B, 0x61,
        0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0x7A, 0x5E, 0x4C, 0x7E, 0x6E, 0x6F,
        0x7C, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0xD6,
        0xD7, 0xD8, 0xD9, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, 0xE8, 0xE9, 0xBA, 0xE0, 0xBB, 0xB0, 0x6D,
        0x79, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x91, 0x92, 0x93, 0x94, 0x95, 0x96,
        0x97, 0x98, 0x99, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xC0, 0x4F, 0xD0, 0xA1, 0x07,
    ];
    if b < 128 {
        TABLE[b as usize]
    } else {
        0x40
    }
}

impl CardReader {
    pub fn new(device_number: u16, deck_text: &str, policy: ShortRecordPolicy) -> Self {
        let cards = deck_text
            .lines()
            .map(|line| line.bytes().map(ascii_to_ebcdic).collect())
            .collect();
        CardReader { device_number, cards, position: 0, policy, eof_signaled: false }
    }
}

impl Device for CardReader {
    fn device_number(&self) -> u16 {
        self.device_number
    }

    fn sense_id(&self) -> Vec<u8> {
        vec![0xFF, 0x25, 0x01, 0x00]
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
            CCW_READ => {
                if self.position >= self.cards.len() {
                    let already = self.eof_signaled;
                    self.eof_signaled = true;
                    return DeviceResult {
                        unit_status: if already { normal_status() } else { normal_status() | CSW_UE },
                        residual: count,
                        sense: Vec::new(),
                    };
                }
                let mut card = self.cards[self.position].clone();
                self.position += 1;
                let want = count as usize;
                if card.len() < want {
                    match self.policy {
                        ShortRecordPolicy::Pad => card.resize(want, 0x40),
                        ShortRecordPolicy::Truncate | ShortRecordPolicy::DataCheck => {}
                    }
                }
                let n = card.len().min(want);
                storage.write_direct(data_address as usize, &card[..n]);
                debug!("card reader {:04X}: read {} bytes", self.device_number, n);
                DeviceResult { unit_status: normal_status(), residual: count.saturating_sub(n as u16), sense: Vec::new() }
            }
            CCW_SENSE => DeviceResult { unit_status: normal_status(), residual: count, sense: vec![0u8; 6] },
            other => {
                debug!("card reader {:04X}: unsupported opcode {:02X}", self.device_number, other);
                DeviceResult { unit_status: normal_status(), residual: count, sense: Vec::new() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_cards_in_order_and_signals_eof_once() {
        let mut rdr = CardReader::new(0x00C, "HELLO\nWORLD\n", ShortRecordPolicy::Pad);
        let storage = MainStorage::new(1);
        let r1 = rdr.execute_ccw(CCW_READ, 0, 80, 0x1000, &storage, 0);
        assert_eq!(r1.unit_status, normal_status());
        let mut buf = [0u8; 5];
        storage.read(0x1000, &mut buf, 0).unwrap();
        assert_eq!(ascii_to_ebcdic(b'H'), buf[0]);

        rdr.execute_ccw(CCW_READ, 0, 80, 0x1000, &storage, 0);
        let r3 = rdr.execute_ccw(CCW_READ, 0, 80, 0x1000, &storage, 0);
        assert_eq!(r3.unit_status & CSW_UE, CSW_UE);
        let r4 = rdr.execute_ccw(CCW_READ, 0, 80, 0x1000, &storage, 0);
        assert_eq!(r4.unit_status & CSW_UE, 0);
    }
}
