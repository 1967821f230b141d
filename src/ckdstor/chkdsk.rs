//! Consistency check and endian conversion, run once at open time (SPEC_FULL.md §4.9 "chkdsk",
//! "Endian conversion").

use super::directory::Directory;
use super::format::{CompressedDeviceHeader, FreeBlockHeader, L2Entry, L2_TABLE_ENTRIES};
use super::freespace::FreeSpace;
use std::io::{Read, Seek, SeekFrom, Write};

/// Byte-swap the compressed-device header, every L1 entry, every L2 entry, and every free-block
/// header. Called once at open when the file's recorded endianness differs from the host's.
pub fn convert_endian(
    file: &mut std::fs::File,
    header: &mut CompressedDeviceHeader,
    header_offset: u64,
    dir: &mut Directory,
) -> std::io::Result<()> {
    header.byte_swap();
    header.options ^= super::format::OPT_BIGENDIAN;
    file.seek(SeekFrom::Start(header_offset))?;
    file.write_all(&header.to_bytes())?;

    for l1_idx in 0..dir.l1.len() as u32 {
        let offset = dir.l1[l1_idx as usize];
        if offset == 0 {
            continue;
        }
        dir.lookup(file, l1_idx << 8)?;
        let group = dir.cached_group(l1_idx).unwrap().clone();
        file.seek(SeekFrom::Start(offset as u64))?;
        for mut entry in group {
            entry.byte_swap();
            file.write_all(&entry.to_bytes())?;
        }
    }

    let mut offset = header.free;
    let mut guard = 0usize;
    while offset != 0 && guard < 1_000_000 {
        guard += 1;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; super::format::FREE_BLOCK_HEADER_SIZE];
        file.read_exact(&mut buf)?;
        let mut hdr = FreeBlockHeader::from_bytes(&buf);
        let next = hdr.next;
        hdr.byte_swap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&hdr.to_bytes())?;
        offset = next;
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct ChkdskReport {
    pub repaired_free_chain: bool,
    pub repaired_l1_entries: u32,
    pub free_total_reconciled: bool,
}

/// Walk the free chain, validate every L1/L2 pointer against the file size, and reconcile
/// `free_total` against the chain actually found on disk. Returns a report of what it changed.
pub fn run(
    file: &mut std::fs::File,
    header: &mut CompressedDeviceHeader,
    dir: &mut Directory,
) -> std::io::Result<ChkdskReport> {
    let mut report = ChkdskReport::default();
    let file_len = file.metadata()?.len();

    let chain = match FreeSpace::load_chain(file, header.free) {
        Ok(c) => c,
        Err(_) => {
            report.repaired_free_chain = true;
            Vec::new()
        }
    };
    let recovered_total: u64 = chain.iter().map(|b| b.length).sum();
    if recovered_total != header.free_total {
        header.free_total = recovered_total;
        report.free_total_reconciled = true;
    }
    header.free_largest = chain.iter().map(|b| b.length).max().unwrap_or(0);
    header.free_number = chain.len() as u32;

    for (l1_idx, &offset) in dir.l1.clone().iter().enumerate() {
        if offset == 0 {
            continue;
        }
        if offset as u64 + (L2_TABLE_ENTRIES * 8) as u64 > file_len {
            dir.l1[l1_idx] = 0;
            report.repaired_l1_entries += 1;
            continue;
        }
        if dir.lookup(file, (l1_idx as u32) << 8).is_err() {
            dir.l1[l1_idx] = 0;
            report.repaired_l1_entries += 1;
        } else {
            // Validate each L2 entry's on-disk reach.
            let group = dir.cached_group(l1_idx as u32).unwrap().clone();
            let mut fixed_any = false;
            let mut new_group: Vec<L2Entry> = group.clone();
            for (idx, e) in group.iter().enumerate() {
                if !e.is_null() && e.offset as u64 + e.size as u64 > file_len {
                    new_group[idx] = L2Entry::default();
                    fixed_any = true;
                }
            }
            if fixed_any {
                for (idx, e) in new_group.into_iter().enumerate() {
                    let track = ((l1_idx as u32) << 8) | idx as u32;
                    dir.update(file, track, e, |_| unreachable!("group already allocated"))?;
                }
                report.repaired_l1_entries += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chkdsk_drops_l1_entry_pointing_past_eof() {
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(100).unwrap();
        let mut dir = Directory::new(vec![5000]); // offset past EOF
        let mut header = CompressedDeviceHeader {
            options: 0,
            num_l1_entries: 1,
            num_l2_entries: 256,
            size: 100,
            used: 100,
            free: 0,
            free_total: 0,
            free_largest: 0,
            free_number: 0,
            free_imbed: 0,
            compress: 0,
            compress_parm: 0,
        };
        let report = run(&mut file, &mut header, &mut dir).unwrap();
        assert_eq!(dir.l1[0], 0);
        assert_eq!(report.repaired_l1_entries, 1);
    }
}
