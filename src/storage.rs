//! Main storage and storage keys (SPEC_FULL.md §4.1, component C1).
//!
//! Grounded on the teacher's `memory.rs`/`Bus` (a byte-addressed buffer reached through a
//! `MemoryHandle`), generalized from a single-owner `Rc<RefCell<[u8; N]>>` to an `RwLock<Vec<u8>>` so
//! multiple CPU threads can fetch concurrently while writers serialize per access.

use crate::error::{ProgramInterrupt, ProgramInterruptCode};
use std::sync::RwLock;

pub const FRAME_SIZE: usize = 4096;

/// One storage-key byte: {access-key (bits 0-3), fetch-protect (bit 4), reference (bit 5),
/// change (bit 6), reserved (bit 7)}.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageKey(pub u8);

impl StorageKey {
    pub fn access_key(self) -> u8 {
        (self.0 >> 4) & 0x0F
    }
    pub fn fetch_protect(self) -> bool {
        self.0 & 0x08 != 0
    }
    pub fn reference(self) -> bool {
        self.0 & 0x04 != 0
    }
    pub fn change(self) -> bool {
        self.0 & 0x02 != 0
    }
    pub fn set_reference(&mut self, v: bool) {
        set_bit(&mut self.0, 2, v);
    }
    pub fn set_change(&mut self, v: bool) {
        set_bit(&mut self.0, 1, v);
    }
}

fn set_bit(byte: &mut u8, bit: u8, value: bool) {
    if value {
        *byte |= 1 << bit;
    } else {
        *byte &= !(1 << bit);
    }
}

pub enum AccessType {
    Read,
    Write,
    InstructionFetch,
}

/// The emulated machine's absolute-addressed main store, plus its per-frame key array and the
/// currently active prefix (one per CPU in the real architecture; kept here per-storage instance
/// since this crate's `sysblk` owns one `MainStorage` shared by all CPUs and prefixing is applied by
/// the caller before reaching these methods — see `cpu::dispatch`).
pub struct MainStorage {
    bytes: RwLock<Vec<u8>>,
    keys: RwLock<Vec<StorageKey>>,
    size: usize,
}

impl MainStorage {
    pub fn new(size_mb: u32) -> Self {
        let size = size_mb as usize * 1024 * 1024;
        let frames = size / FRAME_SIZE;
        MainStorage {
            bytes: RwLock::new(vec![0u8; size]),
            keys: RwLock::new(vec![StorageKey::default(); frames]),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check_bounds(&self, addr: usize, len: usize) -> Result<(), ProgramInterrupt> {
        if addr + len > self.size {
            return Err(ProgramInterrupt::new(ProgramInterruptCode::Addressing, 0));
        }
        Ok(())
    }

    pub fn fetch_key(&self, addr: usize) -> StorageKey {
        let frame = addr / FRAME_SIZE;
        self.keys.read().unwrap()[frame]
    }

    pub fn store_key(&self, addr: usize, key: u8) {
        let frame = addr / FRAME_SIZE;
        self.keys.write().unwrap()[frame].0 = key & 0xFE; // reserved bit stays 0
    }

    fn mark_referenced(&self, addr: usize, write: bool) {
        let frame = addr / FRAME_SIZE;
        let mut keys = self.keys.write().unwrap();
        keys[frame].set_reference(true);
        if write {
            keys[frame].set_change(true);
        }
    }

    /// Protection check for a guest access under `access_key`. Fetch-protect only applies to
    /// non-fetch (i.e. store) access per POP; key 0 bypasses all protection.
    fn check_protection(&self, addr: usize, access_key: u8, access: &AccessType) -> Result<(), ProgramInterrupt> {
        if access_key == 0 {
            return Ok(());
        }
        let key = self.fetch_key(addr);
        let key_mismatch = key.access_key() != access_key;
        let blocked = match access {
            AccessType::Write => key_mismatch,
            AccessType::Read | AccessType::InstructionFetch => key_mismatch && key.fetch_protect(),
        };
        if blocked {
            return Err(ProgramInterrupt::new(ProgramInterruptCode::Protection, 0));
        }
        Ok(())
    }

    pub fn read(&self, addr: usize, buf: &mut [u8], access_key: u8) -> Result<(), ProgramInterrupt> {
        self.check_bounds(addr, buf.len())?;
        self.check_protection(addr, access_key, &AccessType::Read)?;
        let bytes = self.bytes.read().unwrap();
        buf.copy_from_slice(&bytes[addr..addr + buf.len()]);
        self.mark_referenced(addr, false);
        Ok(())
    }

    pub fn write(&self, addr: usize, data: &[u8], access_key: u8) -> Result<(), ProgramInterrupt> {
        self.check_bounds(addr, data.len())?;
        self.check_protection(addr, access_key, &AccessType::Write)?;
        let mut bytes = self.bytes.write().unwrap();
        bytes[addr..addr + data.len()].copy_from_slice(data);
        drop(bytes);
        self.mark_referenced(addr, true);
        Ok(())
    }

    pub fn fetch_instruction(&self, addr: usize, buf: &mut [u8], access_key: u8) -> Result<(), ProgramInterrupt> {
        self.check_bounds(addr, buf.len())?;
        self.check_protection(addr, access_key, &AccessType::InstructionFetch)?;
        let bytes = self.bytes.read().unwrap();
        buf.copy_from_slice(&bytes[addr..addr + buf.len()]);
        self.mark_referenced(addr, false);
        Ok(())
    }

    /// Direct, unprotected access used only by device handlers performing DMA-style transfers that
    /// have already been authorized by the channel subsystem's CCW key check.
    pub fn read_direct(&self, addr: usize, buf: &mut [u8]) {
        let bytes = self.bytes.read().unwrap();
        buf.copy_from_slice(&bytes[addr..addr + buf.len()]);
    }

    pub fn write_direct(&self, addr: usize, data: &[u8]) {
        let mut bytes = self.bytes.write().unwrap();
        bytes[addr..addr + data.len()].copy_from_slice(data);
    }

    /// Apply prefixing: absolute page 0 <-> the page at `prefix`.
    pub fn prefix(addr: u32, prefix: u32) -> u32 {
        let page = addr & !0xFFF;
        if page == 0 {
            prefix | (addr & 0xFFF)
        } else if page == prefix {
            addr & 0xFFF
        } else {
            addr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let store = MainStorage::new(2);
        store.write(0x1000, &[1, 2, 3, 4], 0).unwrap();
        let mut buf = [0u8; 4];
        store.read(0x1000, &mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds_is_addressing_exception() {
        let store = MainStorage::new(2);
        let err = store.read(2 * 1024 * 1024, &mut [0u8; 4], 0).unwrap_err();
        assert_eq!(err.code, crate::error::ProgramInterruptCode::Addressing);
    }

    #[test]
    fn key_mismatch_blocks_store_but_not_fetch_protect_free_read() {
        let store = MainStorage::new(2);
        store.store_key(0x2000, 0x30); // access key 3, no fetch-protect
        let err = store.write(0x2000, &[9], 5).unwrap_err();
        assert_eq!(err.code, crate::error::ProgramInterruptCode::Protection);
        // reads are allowed since fetch-protect bit is off
        store.read(0x2000, &mut [0u8; 1], 5).unwrap();
    }

    #[test]
    fn key_zero_bypasses_protection() {
        let store = MainStorage::new(2);
        store.store_key(0x2000, 0x38); // key 3, fetch-protect set
        store.write(0x2000, &[9], 0).unwrap();
    }

    #[test]
    fn prefixing_swaps_page_zero_and_prefix_page() {
        assert_eq!(MainStorage::prefix(0x100, 0x2000), 0x2100);
        assert_eq!(MainStorage::prefix(0x2100, 0x2000), 0x100);
        assert_eq!(MainStorage::prefix(0x5000, 0x2000), 0x5000);
    }
}
