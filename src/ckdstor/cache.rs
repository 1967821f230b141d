//! Track cache: a fixed-size array of track-image buffers with LRU replacement and an optional
//! read-ahead thread (SPEC_FULL.md §4.9 "Track cache").
//!
//! Lock discipline per SPEC_FULL.md §5: `cache` is acquired before `dfw`, which is acquired before
//! `file`; all three are released in reverse. This module only ever takes its own `cache` lock
//! directly — callers in `ckdstor::mod` are responsible for the nested ordering when a miss requires
//! falling through to the deferred-write queue or the file.

use std::time::Instant;

#[derive(Clone)]
pub struct CacheSlot {
    pub track: u32,
    pub buffer: Vec<u8>,
    pub algorithm: u8,
    pub last_used: Instant,
    pub active: bool,
    pub reading: bool,
    pub writing: bool,
    pub write_pending: bool,
}

/// Outcome of a cache lookup (SPEC_FULL.md §4.9 "Contract of `read-track`").
pub enum Lookup {
    Hit(usize),
    /// A slot is free or evictable; caller should reserve it (mark `reading`) and fill it.
    Miss { slot: usize },
    /// Every slot is busy (active, write-pending, or mid-I/O); only legal for a read-ahead attempt.
    NoSlot,
}

pub struct TrackCache {
    slots: Vec<Option<CacheSlot>>,
    pub last_accessed_track: Option<u32>,
    pub readahead_in_flight: bool,
}

impl TrackCache {
    pub fn new(capacity: usize) -> Self {
        TrackCache { slots: vec![None; capacity], last_accessed_track: None, readahead_in_flight: false }
    }

    /// Look for `track`; on hit, bump `last_used` and mark `active` if this is a synchronous
    /// (non-read-ahead) caller. On miss, pick a free slot or the least-recently-used evictable slot.
    pub fn lookup(&mut self, track: u32, mark_active: bool) -> Lookup {
        if let Some(idx) = self.slots.iter().position(|s| matches!(s, Some(s) if s.track == track)) {
            let slot = self.slots[idx].as_mut().unwrap();
            slot.last_used = Instant::now();
            if mark_active {
                slot.active = true;
            }
            return Lookup::Hit(idx);
        }

        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            return Lookup::Miss { slot: idx };
        }

        let evictable = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Some(s) if !s.active && !s.write_pending && !s.reading && !s.writing))
            .min_by_key(|(_, s)| s.as_ref().unwrap().last_used);

        match evictable {
            Some((idx, _)) => Lookup::Miss { slot: idx },
            None => Lookup::NoSlot,
        }
    }

    pub fn reserve_for_read(&mut self, slot: usize, track: u32) {
        self.slots[slot] = Some(CacheSlot {
            track,
            buffer: Vec::new(),
            algorithm: 0,
            last_used: Instant::now(),
            active: false,
            reading: true,
            writing: false,
            write_pending: false,
        });
    }

    pub fn install(&mut self, slot: usize, buffer: Vec<u8>, algorithm: u8, mark_active: bool) {
        if let Some(s) = self.slots[slot].as_mut() {
            s.buffer = buffer;
            s.algorithm = algorithm;
            s.reading = false;
            s.active = mark_active;
            s.last_used = Instant::now();
        }
    }

    /// Adopt a buffer that a deferred-write entry is still holding (not yet flushed) directly into
    /// the cache, bypassing disk (SPEC_FULL.md §4.9 "A track being rewritten but not yet flushed").
    pub fn adopt(&mut self, slot: usize, track: u32, buffer: Vec<u8>) {
        self.slots[slot] = Some(CacheSlot {
            track,
            buffer,
            algorithm: 0,
            last_used: Instant::now(),
            active: true,
            reading: false,
            writing: false,
            write_pending: true,
        });
    }

    pub fn get(&self, idx: usize) -> Option<&CacheSlot> {
        self.slots[idx].as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut CacheSlot> {
        self.slots[idx].as_mut()
    }

    pub fn find_track(&self, track: u32) -> Option<usize> {
        self.slots.iter().position(|s| matches!(s, Some(s) if s.track == track))
    }

    pub fn release_active(&mut self, idx: usize) {
        if let Some(s) = self.slots[idx].as_mut() {
            s.active = false;
        }
    }

    pub fn mark_write_pending(&mut self, track: u32, pending: bool) {
        if let Some(s) = self.slots.iter_mut().flatten().find(|s| s.track == track) {
            s.write_pending = pending;
        }
    }

    /// Whether `track` looks like a sequential continuation of the last access, i.e. a candidate for
    /// read-ahead (SPEC_FULL.md §4.9 "Track cache").
    pub fn is_sequential(&self, track: u32) -> bool {
        self.last_accessed_track == Some(track.wrapping_sub(1))
    }

    pub fn note_access(&mut self, track: u32) {
        self.last_accessed_track = Some(track);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_bumps_last_used_and_marks_active() {
        let mut cache = TrackCache::new(2);
        cache.reserve_for_read(0, 5);
        cache.install(0, vec![1, 2, 3], 0, false);
        match cache.lookup(5, true) {
            Lookup::Hit(idx) => assert!(cache.get(idx).unwrap().active),
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn miss_prefers_free_slot_over_eviction() {
        let mut cache = TrackCache::new(2);
        cache.reserve_for_read(0, 1);
        cache.install(0, vec![], 0, false);
        match cache.lookup(2, false) {
            Lookup::Miss { slot } => assert_eq!(slot, 1),
            _ => panic!("expected miss"),
        }
    }

    #[test]
    fn no_slot_when_all_busy() {
        let mut cache = TrackCache::new(1);
        cache.reserve_for_read(0, 1);
        cache.install(0, vec![], 0, true); // active
        match cache.lookup(2, false) {
            Lookup::NoSlot => {}
            _ => panic!("expected no slot"),
        }
    }

    #[test]
    fn sequential_detection() {
        let mut cache = TrackCache::new(2);
        cache.note_access(10);
        assert!(cache.is_sequential(11));
        assert!(!cache.is_sequential(20));
    }
}
