//! Online garbage collector (SPEC_FULL.md §4.9 "Garbage collector").
//!
//! Pure logic lives here — heat classification, object identification, and the percolate/combine
//! relocation algorithms — operating directly on a `Directory` + `FreeSpace` + open `File` so it can
//! be unit-tested without a background thread. `ckdstor::mod` wraps a call to [`run_iteration`] in the
//! GC worker's condvar-driven loop.

use super::directory::Directory;
use super::format::{L2Entry, CKD_DEVHDR_SIZE, L2_TABLE_ENTRIES};
use super::freespace::{FreeBlock, FreeSpace};
use std::io::{Read, Seek, SeekFrom, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heat {
    Critical,
    Severe,
    Moderate,
    Light,
    None,
}

/// Heat classes by free-total as a fraction of size (SPEC_FULL.md §4.9 "Garbage collector").
pub fn classify(free_total: u64, size: u64) -> Heat {
    if size == 0 {
        return Heat::None;
    }
    let ratio = free_total as f64 / size as f64;
    if ratio >= 0.5 {
        Heat::Critical
    } else if ratio >= 0.25 {
        Heat::Severe
    } else if ratio >= 0.125 {
        Heat::Moderate
    } else if ratio >= 1.0 / 16.0 {
        Heat::Light
    } else {
        Heat::None
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Algorithm {
    Percolate,
    Combine,
}

/// What the first few bytes after a free block turned out to be.
enum Identified {
    Track,
    L2Table { l1_group: u32 },
    Unknown,
}

fn identify(dir: &Directory, heads: u32, cyls: u32, buf: &[u8], offset: u64) -> Identified {
    if buf.len() >= 5 {
        let cyl = u16::from_be_bytes([buf[1], buf[2]]) as u32;
        let head = u16::from_be_bytes([buf[3], buf[4]]) as u32;
        if cyl < cyls && head < heads {
            return Identified::Track;
        }
    }
    if let Some(group) = dir.group_for_l1_offset(offset as u32) {
        return Identified::L2Table { l1_group: group };
    }
    Identified::Unknown
}

/// One relocation step: move the object at `src` (length `len`) left by `shift` bytes, patching the
/// L2 entry (for a track) or L1 entry (for an L2 table) that points at it.
fn relocate_track(file: &mut std::fs::File, dir: &mut Directory, track: u32, src: u64, shift: u64) -> std::io::Result<u64> {
    let mut entry = dir.lookup(file, track)?;
    let len = entry.size as u64;
    let dst = src - shift;
    let mut buf = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(src))?;
    file.read_exact(&mut buf)?;
    file.seek(SeekFrom::Start(dst))?;
    file.write_all(&buf)?;
    entry.offset = dst as u32;
    dir.update(file, track, entry, |_| unreachable!("group already allocated"))?;
    Ok(len)
}

fn relocate_l2_table(file: &mut std::fs::File, dir: &mut Directory, group: u32, src: u64, shift: u64) -> std::io::Result<u64> {
    let len = (L2_TABLE_ENTRIES * 8) as u64;
    let dst = src - shift;
    let mut buf = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(src))?;
    file.read_exact(&mut buf)?;
    file.seek(SeekFrom::Start(dst))?;
    file.write_all(&buf)?;
    dir.l1[group as usize] = dst as u32;
    dir.invalidate_cache(group);
    Ok(len)
}

/// Percolate: relocate objects immediately following the first free block leftward by that block's
/// length, one scan window (`size` bytes) at a time.
pub fn percolate(
    file: &mut std::fs::File,
    dir: &mut Directory,
    freespace: &mut FreeSpace,
    heads: u32,
    cyls: u32,
    size: u64,
) -> std::io::Result<bool> {
    let Some(block) = freespace.chain.first().copied() else { return Ok(false) };
    let scan_end = block.offset + block.length + size;
    let mut cursor = block.offset + block.length;
    let mut progressed = false;

    while cursor < scan_end && cursor < freespace.stats.size {
        let probe_len = 5usize.min((freespace.stats.size - cursor) as usize);
        if probe_len == 0 {
            break;
        }
        let mut probe = vec![0u8; probe_len];
        file.seek(SeekFrom::Start(cursor))?;
        file.read_exact(&mut probe)?;
        match identify(dir, heads, cyls, &probe, cursor) {
            Identified::Track => match dir.find_track_by_offset(file, cursor as u32)? {
                Some(track) => {
                    let len = relocate_track(file, dir, track, cursor, block.length)?;
                    cursor += len;
                    progressed = true;
                }
                None => break,
            },
            Identified::L2Table { l1_group } => {
                let len = relocate_l2_table(file, dir, l1_group, cursor, block.length)?;
                cursor += len;
                progressed = true;
            }
            Identified::Unknown => break,
        }
    }

    if progressed {
        freespace.chain.remove(0);
        let new_free_offset = cursor - block.length;
        if new_free_offset + block.length == freespace.stats.size {
            file.set_len(new_free_offset)?;
            freespace.stats.size = new_free_offset;
        } else {
            freespace.chain.insert(0, FreeBlock { offset: new_free_offset, length: block.length });
        }
        // Coalesce anything the relocation left adjacent.
        coalesce_chain(freespace);
    }
    Ok(progressed)
}

fn coalesce_chain(freespace: &mut FreeSpace) {
    freespace.chain.sort();
    let mut merged: Vec<FreeBlock> = Vec::new();
    for b in freespace.chain.drain(..) {
        if let Some(last) = merged.last_mut() {
            if last.offset + last.length == b.offset {
                last.length += b.length;
                continue;
            }
        }
        merged.push(b);
    }
    freespace.chain = merged;
    freespace.stats.free_largest = freespace.chain.iter().map(|b| b.length).max().unwrap_or(0);
    freespace.stats.free_number = freespace.chain.len() as u32;
}

/// Combine: pick the free block whose reach within `size` bytes would consume the most other free
/// blocks (ties toward EOF), then percolate around that block.
pub fn combine(
    file: &mut std::fs::File,
    dir: &mut Directory,
    freespace: &mut FreeSpace,
    heads: u32,
    cyls: u32,
    size: u64,
) -> std::io::Result<bool> {
    if freespace.chain.is_empty() {
        return Ok(false);
    }
    let best_idx = freespace
        .chain
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let reach = b.offset + b.length + size;
            let count = freespace.chain.iter().filter(|o| o.offset > b.offset && o.offset < reach).count();
            (i, count, b.offset)
        })
        .max_by_key(|&(_, count, offset)| (count, offset))
        .map(|(i, _, _)| i)
        .unwrap();
    freespace.chain.swap(0, best_idx);
    percolate(file, dir, freespace, heads, cyls, size)
}

/// Trim step: for each L2 group, shrink the 16 entries with the largest imbedded slack
/// (`size - length`) down to their stored length, releasing the freed tails.
pub fn trim(
    file: &mut std::fs::File,
    dir: &mut Directory,
    freespace: &mut FreeSpace,
    num_l1: usize,
) -> std::io::Result<u32> {
    let mut trimmed = 0u32;
    for l1_idx in 0..num_l1 as u32 {
        if dir.l1[l1_idx as usize] == 0 {
            continue;
        }
        dir.lookup(file, l1_idx << 8)?; // force-load the group
        let Some(group) = dir.cached_group(l1_idx) else { continue };
        let mut slack: Vec<(usize, u16)> = group
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_null() && e.size > e.length)
            .map(|(i, e)| (i, e.size - e.length))
            .collect();
        slack.sort_by(|a, b| b.1.cmp(&a.1));
        for &(idx, slack_len) in slack.iter().take(16) {
            let mut entry = group[idx];
            let tail_offset = entry.offset as u64 + entry.length as u64;
            entry.size = entry.length;
            let track = (l1_idx << 8) | idx as u32;
            dir.update(file, track, entry, |_| unreachable!())?;
            freespace.release_space(file, tail_offset, slack_len as u64, super::freespace::DEFAULT_FUDGE)?;
            trimmed += 1;
        }
    }
    Ok(trimmed)
}

/// Should trim run first this iteration? (imbedded free space exceeds half of total free, or 1/16
/// of file size — SPEC_FULL.md §4.9 "Garbage collector").
pub fn should_trim(free_imbed: u64, free_total: u64, size: u64) -> bool {
    free_imbed * 2 > free_total || free_imbed * 16 > size
}

pub const TRACK_HEADER_PROBE_OFFSET: u64 = CKD_DEVHDR_SIZE as u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heat_thresholds() {
        assert_eq!(classify(600, 1000), Heat::Critical);
        assert_eq!(classify(300, 1000), Heat::Severe);
        assert_eq!(classify(150, 1000), Heat::Moderate);
        assert_eq!(classify(80, 1000), Heat::Light);
        assert_eq!(classify(10, 1000), Heat::None);
    }

    #[test]
    fn should_trim_triggers_past_half_of_free_total() {
        assert!(should_trim(600, 1000, 100_000));
        assert!(!should_trim(10, 1000, 100_000));
    }

    #[test]
    fn coalesce_merges_adjacent_after_relocation() {
        let mut fs = FreeSpace::new(1000, 800);
        fs.chain = vec![FreeBlock { offset: 100, length: 50 }, FreeBlock { offset: 150, length: 50 }];
        coalesce_chain(&mut fs);
        assert_eq!(fs.chain, vec![FreeBlock { offset: 100, length: 100 }]);
    }
}
