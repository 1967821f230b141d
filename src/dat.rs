//! Dynamic address translation, TLB, and ALB (SPEC_FULL.md §4.2, component C2).
//!
//! Grounded on the teacher's `memory_handle(mode, register, size) -> MemoryHandle` addressing-mode
//! resolver (`main.rs`): a small, cacheable function from "how the operand is specified" to "where its
//! bytes live". Here the input is a virtual address plus access qualification rather than a mode/
//! register pair, and the output is cached in a per-CPU TLB instead of being recomputed every time.

use crate::error::{ProgramInterrupt, ProgramInterruptCode};
use crate::storage::MainStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    InstructionFetch,
    Lra,
}

#[derive(Debug, Clone, Copy)]
pub struct TlbEntry {
    pub virtual_page: u32,
    pub real_page: u32,
    pub access_key: u8,
    pub protect: bool,
    pub segment_table_origin: u32,
    pub valid: bool,
}

impl Default for TlbEntry {
    fn default() -> Self {
        TlbEntry {
            virtual_page: 0,
            real_page: 0,
            access_key: 0,
            protect: false,
            segment_table_origin: 0,
            valid: false,
        }
    }
}

const TLB_SIZE: usize = 256;

/// Per-CPU translation state: the active segment-table origin/length plus a direct-mapped TLB.
/// An access-register lookaside buffer (ALB) is modeled alongside for AR-mode translations; it is
/// deliberately simplified per SPEC_FULL.md §9 Open Questions to first-level ALET→ASTE resolution.
pub struct Dat {
    pub segment_table_origin: u32,
    pub segment_table_length: u32,
    pub real_mode: bool,
    tlb: Vec<TlbEntry>,
    alb: Vec<AlbEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlbEntry {
    pub alet: u32,
    pub aste_origin: u32,
    pub access_key: u8,
    pub fetch_only: bool,
    pub valid: bool,
}

impl Dat {
    pub fn new() -> Self {
        Dat {
            segment_table_origin: 0,
            segment_table_length: 0,
            real_mode: true,
            tlb: vec![TlbEntry::default(); TLB_SIZE],
            alb: vec![AlbEntry::default(); 32],
        }
    }

    /// Purge the entire TLB/ALB, e.g. on a control-register write that changes translation, or on
    /// IPTE/PTLB, or when receiving a cross-CPU broadcast-purge (SPEC_FULL.md §4.2 "Purge disciplines").
    pub fn purge(&mut self) {
        for e in self.tlb.iter_mut() {
            e.valid = false;
        }
        for e in self.alb.iter_mut() {
            e.valid = false;
        }
    }

    fn tlb_slot(&self, vpage: u32) -> usize {
        (vpage as usize) % TLB_SIZE
    }

    /// Translate a virtual (or already-real, in real mode) address into a real address.
    pub fn translate(
        &mut self,
        storage: &MainStorage,
        vaddr: u32,
        access_key: u8,
        access: AccessType,
    ) -> Result<u32, ProgramInterrupt> {
        if self.real_mode && access != AccessType::Lra {
            return Ok(vaddr);
        }

        let vpage = vaddr >> 12;
        let offset = vaddr & 0xFFF;
        let slot = self.tlb_slot(vpage);
        let entry = self.tlb[slot];
        if entry.valid
            && entry.virtual_page == vpage
            && entry.segment_table_origin == self.segment_table_origin
        {
            if entry.protect && access == AccessType::Write {
                return Err(ProgramInterrupt::new(ProgramInterruptCode::Protection, 0));
            }
            return Ok((entry.real_page << 12) | offset);
        }

        let (real_page, protect) = self.walk_tables(storage, vpage)?;
        self.tlb[slot] = TlbEntry {
            virtual_page: vpage,
            real_page,
            access_key,
            protect,
            segment_table_origin: self.segment_table_origin,
            valid: true,
        };
        if protect && access == AccessType::Write {
            return Err(ProgramInterrupt::new(ProgramInterruptCode::Protection, 0));
        }
        Ok((real_page << 12) | offset)
    }

    /// Two-level (segment, page) table walk. Segment-table and page-table entries are 4 bytes: bit 31
    /// (I) invalid, bits 0-19 (or 0-23 for the segment table) giving the next table's page-aligned
    /// origin, one protect bit (segment-table entry bit 30, "P").
    fn walk_tables(&self, storage: &MainStorage, vpage: u32) -> Result<(u32, bool), ProgramInterrupt> {
        let segment_index = (vpage >> 8) & 0x7FF;
        let page_index = vpage & 0xFF;

        let ste_addr = self.segment_table_origin + segment_index * 4;
        let mut ste_bytes = [0u8; 4];
        storage
            .read(ste_addr as usize, &mut ste_bytes, 0)
            .map_err(|_| ProgramInterrupt::new(ProgramInterruptCode::SegmentTranslation, 0))?;
        let ste = u32::from_be_bytes(ste_bytes);
        if ste & 0x0000_0020 != 0 {
            return Err(ProgramInterrupt::new(ProgramInterruptCode::SegmentTranslation, 0));
        }
        let segment_protect = ste & 0x0000_0010 != 0;
        let page_table_origin = ste & 0xFFFF_FF00;

        let pte_addr = page_table_origin + page_index * 4;
        let mut pte_bytes = [0u8; 4];
        storage
            .read(pte_addr as usize, &mut pte_bytes, 0)
            .map_err(|_| ProgramInterrupt::new(ProgramInterruptCode::PageTranslation, 0))?;
        let pte = u32::from_be_bytes(pte_bytes);
        if pte & 0x0000_0400 != 0 {
            return Err(ProgramInterrupt::new(ProgramInterruptCode::PageTranslation, 0));
        }
        let real_page = pte >> 12;
        Ok((real_page, segment_protect))
    }

    /// Simplified AR-mode resolution (SPEC_FULL.md §9 Open Questions): resolves an ALET directly to
    /// an ASTE without walking the authority-table/extended-authorization-index chain.
    pub fn translate_ar(&mut self, alet: u32, aste_origin: u32, access_key: u8, fetch_only: bool) {
        let slot = (alet as usize) % self.alb.len();
        self.alb[slot] = AlbEntry { alet, aste_origin, access_key, fetch_only, valid: true };
    }

    pub fn lookup_ar(&self, alet: u32) -> Option<AlbEntry> {
        let slot = (alet as usize) % self.alb.len();
        let e = self.alb[slot];
        if e.valid && e.alet == alet {
            Some(e)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mode_passes_through() {
        let storage = MainStorage::new(2);
        let mut dat = Dat::new();
        assert_eq!(dat.translate(&storage, 0x1234, 0, AccessType::Read).unwrap(), 0x1234);
    }

    #[test]
    fn translation_is_stable_until_purge() {
        let storage = MainStorage::new(4);
        let mut dat = Dat::new();
        dat.real_mode = false;
        dat.segment_table_origin = 0x10000;
        // One segment-table entry pointing at a page table at 0x20000, not protected.
        storage.write(0x10000, &0x0002_0000u32.to_be_bytes(), 0).unwrap();
        // One page-table entry mapping page 0 to real page 5.
        storage.write(0x20000, &(5u32 << 12).to_be_bytes(), 0).unwrap();

        let r1 = dat.translate(&storage, 0x0100, 0, AccessType::Read).unwrap();
        assert_eq!(r1, 0x5100);
        // Mutate the page table; the cached translation must not change until a purge.
        storage.write(0x20000, &(9u32 << 12).to_be_bytes(), 0).unwrap();
        let r2 = dat.translate(&storage, 0x0100, 0, AccessType::Read).unwrap();
        assert_eq!(r2, 0x5100);

        dat.purge();
        let r3 = dat.translate(&storage, 0x0100, 0, AccessType::Read).unwrap();
        assert_eq!(r3, 0x9100);
    }

    #[test]
    fn invalid_segment_table_entry_raises_segment_translation_exception() {
        let storage = MainStorage::new(2);
        let mut dat = Dat::new();
        dat.real_mode = false;
        dat.segment_table_origin = 0x1000;
        storage.write(0x1000, &0x0000_0020u32.to_be_bytes(), 0).unwrap();
        let err = dat.translate(&storage, 0, 0, AccessType::Read).unwrap_err();
        assert_eq!(err.code, crate::error::ProgramInterruptCode::SegmentTranslation);
    }
}
