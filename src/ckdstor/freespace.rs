//! Free-space allocator for the compressed-CKD body (SPEC_FULL.md §4.9 "Free-space allocator").
//!
//! The free chain lives both on disk (as singly linked `FreeBlockHeader`s) and, mirrored here, as an
//! in-memory ordered `Vec` so the allocator does not need a disk read per `get_space`/`release_space`
//! call. The file lock (`ckdstor::mod::CompressedCkdFile::file`) must be held by the caller for every
//! call into this module — these functions perform no locking of their own.

use std::io::{Read, Seek, SeekFrom, Write};

pub const DEFAULT_FUDGE: u64 = 128;

/// One free region, ordered ascending by `offset`. `FreeSpace` never holds two adjacent blocks:
/// `release` always coalesces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeBlock {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Default)]
pub struct FreeSpaceStats {
    pub used: u64,
    pub size: u64,
    pub free_total: u64,
    pub free_largest: u64,
    pub free_number: u32,
    pub free_imbed: u64,
}

/// In-memory mirror of the on-disk free chain plus the header counters SPEC_FULL.md §8 requires to
/// stay consistent: `used + free_total == size`.
pub struct FreeSpace {
    pub chain: Vec<FreeBlock>,
    pub stats: FreeSpaceStats,
}

impl FreeSpace {
    pub fn new(size: u64, used: u64) -> Self {
        FreeSpace { chain: Vec::new(), stats: FreeSpaceStats { used, size, ..Default::default() } }
    }

    fn recompute_largest(&mut self) {
        self.stats.free_largest = self.chain.iter().map(|b| b.length).max().unwrap_or(0);
    }

    fn recompute_total(&mut self) {
        self.stats.free_total = self.chain.iter().map(|b| b.length).sum();
        self.stats.free_number = self.chain.len() as u32;
    }

    /// `get_space(len, fudge)`: allocate `len` bytes, returning the chosen offset. Extends the file
    /// when nothing on the chain is large enough; otherwise splits (or fully consumes) the first
    /// block that fits, per SPEC_FULL.md §4.9.
    pub fn get_space(&mut self, file: &mut std::fs::File, len: u64, fudge: u64) -> std::io::Result<u64> {
        if len > self.stats.free_largest {
            let offset = self.stats.size;
            file.set_len(offset + len + fudge)?;
            self.stats.size = offset + len + fudge;
            self.stats.used += len;
            return Ok(offset);
        }

        let idx = self
            .chain
            .iter()
            .position(|b| b.length >= len)
            .expect("free_largest invariant guarantees a fit exists");
        let block = self.chain[idx];
        const FREE_BLOCK_HEADER_SIZE: u64 = super::format::FREE_BLOCK_HEADER_SIZE as u64;
        let remainder = block.length - len;
        if remainder >= FREE_BLOCK_HEADER_SIZE {
            self.chain[idx] = FreeBlock { offset: block.offset + len, length: remainder };
        } else {
            self.chain.remove(idx);
        }
        self.recompute_largest();
        self.recompute_total();
        self.stats.used += len;
        Ok(block.offset)
    }

    /// `release_space(offset, len, fudge)`: return a region to the chain, coalescing with neighbors
    /// and truncating the file if the merged block now reaches EOF.
    pub fn release_space(&mut self, file: &mut std::fs::File, offset: u64, len: u64, _fudge: u64) -> std::io::Result<()> {
        self.stats.used = self.stats.used.saturating_sub(len);
        let mut block = FreeBlock { offset, length: len };

        // Merge with the block immediately before, if adjacent.
        let before_idx = self.chain.iter().position(|b| b.offset + b.length == block.offset);
        if let Some(idx) = before_idx {
            let prev = self.chain.remove(idx);
            block = FreeBlock { offset: prev.offset, length: prev.length + block.length };
        }
        // Merge with the block immediately after, if adjacent.
        let after_idx = self.chain.iter().position(|b| block.offset + block.length == b.offset);
        if let Some(idx) = after_idx {
            let next = self.chain.remove(idx);
            block.length += next.length;
        }

        if block.offset + block.length == self.stats.size {
            file.set_len(block.offset)?;
            self.stats.size = block.offset;
        } else {
            let pos = self.chain.iter().position(|b| b.offset > block.offset).unwrap_or(self.chain.len());
            self.chain.insert(pos, block);
        }
        self.recompute_largest();
        self.recompute_total();
        Ok(())
    }

    /// Rebuild the in-memory chain by walking the on-disk singly linked free list starting at
    /// `head_offset` (used at open time and by chkdsk).
    pub fn load_chain(file: &mut std::fs::File, head_offset: u64) -> std::io::Result<Vec<FreeBlock>> {
        let mut chain = Vec::new();
        let mut offset = head_offset;
        let mut guard = 0usize;
        while offset != 0 {
            guard += 1;
            if guard > 1_000_000 {
                break; // cyclic chain guard; chkdsk is the real repair path
            }
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = [0u8; super::format::FREE_BLOCK_HEADER_SIZE];
            file.read_exact(&mut buf)?;
            let hdr = super::format::FreeBlockHeader::from_bytes(&buf);
            chain.push(FreeBlock { offset, length: hdr.length });
            offset = hdr.next;
        }
        chain.sort();
        Ok(chain)
    }

    /// Persist the in-memory chain as the on-disk singly linked list, ascending by offset.
    pub fn store_chain(&self, file: &mut std::fs::File) -> std::io::Result<u64> {
        if self.chain.is_empty() {
            return Ok(0);
        }
        for (i, block) in self.chain.iter().enumerate() {
            let next = self.chain.get(i + 1).map(|b| b.offset).unwrap_or(0);
            let hdr = super::format::FreeBlockHeader { next, length: block.length };
            file.seek(SeekFrom::Start(block.offset))?;
            file.write_all(&hdr.to_bytes())?;
        }
        Ok(self.chain[0].offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_space_extends_file_when_nothing_fits() {
        let mut fs = FreeSpace::new(1000, 900);
        let tmp = tempfile::tempfile().unwrap();
        tmp.set_len(1000).unwrap();
        let mut file = tmp;
        let off = fs.get_space(&mut file, 200, DEFAULT_FUDGE).unwrap();
        assert_eq!(off, 1000);
        assert_eq!(fs.stats.size, 1000 + 200 + DEFAULT_FUDGE);
    }

    #[test]
    fn get_space_splits_first_fitting_block() {
        let mut fs = FreeSpace::new(1000, 600);
        fs.chain.push(FreeBlock { offset: 600, length: 400 });
        fs.recompute_largest();
        fs.recompute_total();
        let tmp = tempfile::tempfile().unwrap();
        tmp.set_len(1000).unwrap();
        let mut file = tmp;
        let off = fs.get_space(&mut file, 100, DEFAULT_FUDGE).unwrap();
        assert_eq!(off, 600);
        assert_eq!(fs.chain[0], FreeBlock { offset: 700, length: 300 });
    }

    #[test]
    fn release_space_coalesces_adjacent_blocks() {
        let mut fs = FreeSpace::new(1000, 400);
        fs.chain.push(FreeBlock { offset: 100, length: 100 });
        fs.chain.push(FreeBlock { offset: 400, length: 100 });
        fs.recompute_largest();
        fs.recompute_total();
        let tmp = tempfile::tempfile().unwrap();
        tmp.set_len(1000).unwrap();
        let mut file = tmp;
        fs.release_space(&mut file, 200, 200, DEFAULT_FUDGE).unwrap();
        assert_eq!(fs.chain, vec![FreeBlock { offset: 100, length: 400 }]);
    }

    #[test]
    fn release_space_at_eof_truncates_file() {
        let mut fs = FreeSpace::new(1000, 900);
        fs.chain.push(FreeBlock { offset: 900, length: 100 });
        fs.recompute_largest();
        fs.recompute_total();
        let tmp = tempfile::tempfile().unwrap();
        tmp.set_len(1000).unwrap();
        let mut file = tmp;
        fs.release_space(&mut file, 800, 100, DEFAULT_FUDGE).unwrap();
        assert_eq!(fs.stats.size, 800);
        assert!(fs.chain.is_empty());
    }

    #[test]
    fn used_plus_free_total_equals_size_invariant() {
        let mut fs = FreeSpace::new(1000, 1000);
        let tmp = tempfile::tempfile().unwrap();
        tmp.set_len(1000).unwrap();
        let mut file = tmp;
        let off = fs.get_space(&mut file, 200, 0).unwrap();
        fs.release_space(&mut file, off, 200, 0).unwrap();
        assert_eq!(fs.stats.used + fs.stats.free_total, fs.stats.size);
    }
}
