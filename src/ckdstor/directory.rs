//! Two-level track directory (SPEC_FULL.md §4.9 "Directory", §3 "Invariants").
//!
//! A track number `t` decomposes into `l1 = t >> 8`, `l2 = t & 0xFF`. `Directory` keeps the L1 table
//! resident (it is small — at most a few thousand 4-byte offsets) and loads/stores L2 tables from
//! disk on demand; callers hold the file lock for the duration of any method here.

use super::format::{L2Entry, L2_TABLE_ENTRIES, L2_TABLE_SIZE};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

pub struct Directory {
    /// File offset of each L2 table, or 0 if the group has never been allocated.
    pub l1: Vec<u32>,
    /// L2 tables currently loaded, keyed by L1 index. Loaded lazily and kept resident once touched;
    /// a real deployment would cap this, but groups are cheap (256 * 8 bytes) relative to main store.
    l2_cache: HashMap<u32, Vec<L2Entry>>,
}

impl Directory {
    pub fn new(l1: Vec<u32>) -> Self {
        Directory { l1, l2_cache: HashMap::new() }
    }

    fn l1_index(track: u32) -> u32 {
        track >> 8
    }
    fn l2_index(track: u32) -> usize {
        (track & 0xFF) as usize
    }

    fn load_l2(&mut self, file: &mut std::fs::File, l1_idx: u32) -> std::io::Result<()> {
        if self.l2_cache.contains_key(&l1_idx) {
            return Ok(());
        }
        let offset = self.l1[l1_idx as usize];
        let entries = if offset == 0 {
            vec![L2Entry::default(); L2_TABLE_ENTRIES]
        } else {
            file.seek(SeekFrom::Start(offset as u64))?;
            let mut buf = vec![0u8; L2_TABLE_SIZE];
            file.read_exact(&mut buf)?;
            (0..L2_TABLE_ENTRIES)
                .map(|i| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&buf[i * 8..i * 8 + 8]);
                    L2Entry::from_bytes(&raw)
                })
                .collect()
        };
        self.l2_cache.insert(l1_idx, entries);
        Ok(())
    }

    /// Look up a track's L2 entry, allocating and persisting a new (all-null) L2 table if the group
    /// has never been touched. `l1_allocator` is called to obtain a file offset for a brand new table.
    pub fn lookup(
        &mut self,
        file: &mut std::fs::File,
        track: u32,
    ) -> std::io::Result<L2Entry> {
        let l1_idx = Self::l1_index(track);
        self.load_l2(file, l1_idx)?;
        Ok(self.l2_cache[&l1_idx][Self::l2_index(track)])
    }

    /// Update a track's L2 entry in memory and flush that one 8-byte slot to disk. Allocates and
    /// writes a fresh L2 table first if the group's L1 entry is still zero.
    pub fn update(
        &mut self,
        file: &mut std::fs::File,
        track: u32,
        entry: L2Entry,
        allocate_l2: impl FnOnce(&mut std::fs::File) -> std::io::Result<u32>,
    ) -> std::io::Result<()> {
        let l1_idx = Self::l1_index(track);
        self.load_l2(file, l1_idx)?;
        if self.l1[l1_idx as usize] == 0 {
            let offset = allocate_l2(file)?;
            self.l1[l1_idx as usize] = offset;
            let entries = self.l2_cache.get(&l1_idx).unwrap();
            file.seek(SeekFrom::Start(offset as u64))?;
            for e in entries {
                file.write_all(&e.to_bytes())?;
            }
        }
        let l2_idx = Self::l2_index(track);
        self.l2_cache.get_mut(&l1_idx).unwrap()[l2_idx] = entry;
        let slot_offset = self.l1[l1_idx as usize] as u64 + (l2_idx as u64) * 8;
        file.seek(SeekFrom::Start(slot_offset))?;
        file.write_all(&entry.to_bytes())?;
        Ok(())
    }

    /// Every (l1_index, l2_index) currently pointing at a non-null track, for GC object
    /// identification (SPEC_FULL.md §4.9 "Identifying an object during relocation").
    pub fn known_l1_offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.l1.iter().copied().filter(|&o| o != 0)
    }

    pub fn group_for_l1_offset(&self, offset: u32) -> Option<u32> {
        self.l1.iter().position(|&o| o == offset).map(|i| i as u32)
    }

    pub fn cached_group(&self, l1_idx: u32) -> Option<&Vec<L2Entry>> {
        self.l2_cache.get(&l1_idx)
    }

    pub fn invalidate_cache(&mut self, l1_idx: u32) {
        self.l2_cache.remove(&l1_idx);
    }

    /// Reverse lookup: which track's L2 entry points at `offset`? Used by the garbage collector to
    /// identify an object found during a relocation scan (SPEC_FULL.md §4.9 "Identifying an object
    /// during relocation"). Loads every resident group that has not been loaded yet, so this is a
    /// GC-only operation, never called from the hot read/write path.
    pub fn find_track_by_offset(&mut self, file: &mut std::fs::File, offset: u32) -> std::io::Result<Option<u32>> {
        for l1_idx in 0..self.l1.len() as u32 {
            if self.l1[l1_idx as usize] == 0 {
                continue;
            }
            self.load_l2(file, l1_idx)?;
            let group = &self.l2_cache[&l1_idx];
            if let Some(l2_idx) = group.iter().position(|e| !e.is_null() && e.offset == offset) {
                return Ok(Some((l1_idx << 8) | l2_idx as u32));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn zero_l1_entry_means_null_track() {
        let mut dir = Directory::new(vec![0, 0]);
        let mut file = tempfile().unwrap();
        let e = dir.lookup(&mut file, 300).unwrap();
        assert!(e.is_null());
    }

    #[test]
    fn update_allocates_l2_table_on_first_write() {
        let mut dir = Directory::new(vec![0]);
        let mut file = tempfile().unwrap();
        file.set_len(4096).unwrap();
        dir.update(&mut file, 5, L2Entry { offset: 9000, length: 100, size: 100 }, |_| Ok(4096))
            .unwrap();
        assert_eq!(dir.l1[0], 4096);
        let e = dir.lookup(&mut file, 5).unwrap();
        assert_eq!(e.offset, 9000);
    }
}
