//! Deferred-write queue (SPEC_FULL.md §4.9 "Deferred-write queue").
//!
//! A singly linked list in spirit; represented here as a `VecDeque` (SPEC_FULL.md §9 "Cyclic
//! structures" — an index-stable arena is unnecessary since nothing outside this module holds a
//! pointer into the queue). Enqueue coalesces onto an in-flight entry for the same track rather than
//! duplicating it, matching "at most one build per track fingerprint is in flight" (SPEC_FULL.md §3).

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct DfwEntry {
    pub track: u32,
    pub buffer: Vec<u8>,
    pub algorithm: u8,
    /// Set while a worker thread is compressing this entry; a concurrent enqueue for the same track
    /// sets `retry` instead of mutating `buffer` out from under the worker.
    pub compressing: bool,
    pub retry: bool,
}

pub const NULL_RECORD_LENGTH: usize = 0;

pub struct DeferredWriteQueue {
    queue: VecDeque<DfwEntry>,
}

impl DeferredWriteQueue {
    pub fn new() -> Self {
        DeferredWriteQueue { queue: VecDeque::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueue `(track, buffer, algorithm)`. Returns `true` if this enqueue started the queue from
    /// empty (the caller should wake/spawn the worker threads).
    pub fn enqueue(&mut self, track: u32, buffer: Vec<u8>, algorithm: u8) -> bool {
        let was_empty = self.queue.is_empty();
        if let Some(existing) = self.queue.iter_mut().find(|e| e.track == track) {
            if existing.compressing {
                existing.retry = true;
                existing.buffer = buffer;
                existing.algorithm = algorithm;
            } else {
                existing.buffer = buffer;
                existing.algorithm = algorithm;
            }
        } else {
            self.queue.push_back(DfwEntry { track, buffer, algorithm, compressing: false, retry: false });
        }
        was_empty
    }

    /// Look up a track that has an entry queued but not yet flushed, for the cache's "adopt without
    /// going to disk" path (SPEC_FULL.md §4.9 "Track cache").
    pub fn peek(&self, track: u32) -> Option<&DfwEntry> {
        self.queue.iter().find(|e| e.track == track)
    }

    pub fn pop_front(&mut self) -> Option<DfwEntry> {
        self.queue.pop_front()
    }

    pub fn mark_compressing(&mut self, track: u32) {
        if let Some(e) = self.queue.iter_mut().find(|e| e.track == track) {
            e.compressing = true;
        }
    }

    pub fn take_retry(&mut self, track: u32) -> Option<DfwEntry> {
        let idx = self.queue.iter().position(|e| e.track == track && e.retry)?;
        let mut e = self.queue.remove(idx).unwrap();
        e.retry = false;
        e.compressing = false;
        self.queue.push_front(e.clone());
        Some(e)
    }

    pub fn remove(&mut self, track: u32) {
        self.queue.retain(|e| e.track != track);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_replaces_buffer_for_same_track_not_in_flight() {
        let mut q = DeferredWriteQueue::new();
        q.enqueue(10, vec![1, 2, 3], 1);
        q.enqueue(10, vec![9, 9], 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek(10).unwrap().buffer, vec![9, 9]);
    }

    #[test]
    fn enqueue_while_compressing_sets_retry_instead_of_duplicating() {
        let mut q = DeferredWriteQueue::new();
        q.enqueue(10, vec![1], 1);
        q.mark_compressing(10);
        q.enqueue(10, vec![2], 1);
        assert_eq!(q.len(), 1);
        assert!(q.peek(10).unwrap().retry);
    }

    #[test]
    fn first_enqueue_reports_was_empty() {
        let mut q = DeferredWriteQueue::new();
        assert!(q.enqueue(1, vec![], 0));
        assert!(!q.enqueue(2, vec![], 0));
    }
}
