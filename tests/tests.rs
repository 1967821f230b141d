//! End-to-end scenario tests exercising `rs370`'s public API across component boundaries: a card
//! reader driven through the full channel subsystem, the CPU's instruction engine dispatching a real
//! opcode out of main storage, a CKD DASD handler driven through a chained channel program, the
//! compressed-CKD engine's rewrite-growth path, the garbage collector's percolate step, and the
//! compressed-CKD header's endian conversion.

use rs370::channel::ccw::{self, CSW_CE, CSW_DE};
use rs370::ckdstor::{format, CompressedCkdFile};
use rs370::config::SystemConfig;
use rs370::cpu::dispatch;
use rs370::cpu::Cpu;
use rs370::devices::card::{CardReader, ShortRecordPolicy};
use rs370::devices::ckd::CkdDasd;
use rs370::sysblk::Sysblk;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

/// IPL from a card reader: start a channel program on a card-reader subchannel, let the device's
/// worker thread run it to completion, and confirm the first card lands in storage EBCDIC-translated.
#[test]
fn ipl_from_card_reader_completes_and_stores_translated_card() {
    let sysblk = Arc::new(Sysblk::new(SystemConfig::default()));
    let device_number = 0x00C;
    sysblk
        .channel
        .attach(device_number, Box::new(CardReader::new(device_number, "HELLO\nWORLD\n", ShortRecordPolicy::Pad)));

    let ccw_address = 0x200u32;
    let data_address = 0x1000u32;
    let mut ccw_bytes = [0u8; 8];
    ccw_bytes[0] = rs370::devices::CCW_READ;
    ccw_bytes[2..4].copy_from_slice(&80u16.to_be_bytes());
    ccw_bytes[4..8].copy_from_slice(&data_address.to_be_bytes());
    sysblk.storage.write(ccw_address as usize, &ccw_bytes, 0).unwrap();

    let worker_sysblk = Arc::clone(&sysblk);
    let worker = std::thread::spawn(move || rs370::channel::run_device_worker(worker_sysblk, device_number));

    sysblk.channel.start_subchannel(device_number, ccw_address, true, 0).unwrap();

    let mut completed = false;
    for _ in 0..200 {
        let (cc, scsw) = sysblk.channel.test_subchannel(device_number).unwrap();
        if cc == 0 {
            assert_eq!(scsw.unit_status & (CSW_CE | CSW_DE), CSW_CE | CSW_DE);
            completed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(completed, "card reader channel program never completed");

    let mut buf = [0u8; 5];
    sysblk.storage.read(data_address as usize, &mut buf, 0).unwrap();
    assert_eq!(buf[0], 0xC8); // EBCDIC 'H'

    sysblk.request_shutdown();
    worker.join().unwrap();
}

/// A device that answers CCW_READ with a fixed raw byte string, untranslated — stands in for an IPL
/// device whose first record is architected bytes (a PSW) rather than printable text.
struct RawIplRecord {
    device_number: u16,
    record: Vec<u8>,
}

impl rs370::devices::Device for RawIplRecord {
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
        storage: &rs370::storage::MainStorage,
        key: u8,
    ) -> rs370::devices::DeviceResult {
        if opcode != rs370::devices::CCW_READ {
            return rs370::devices::DeviceResult { unit_status: CSW_CE | CSW_DE | ccw::CSW_UC, residual: count, sense: vec![] };
        }
        let n = (count as usize).min(self.record.len());
        storage.write(data_address as usize, &self.record[..n], key).unwrap();
        rs370::devices::DeviceResult { unit_status: CSW_CE | CSW_DE, residual: count - n as u16, sense: vec![] }
    }
}

/// `ipl 00C` loads the PSW whose IA matches bytes 4-7 of the IPL device's first record and leaves
/// CPU 0 started, driven through the same `ChannelSubsystem::ipl` + `Sysblk::request_load_psw` path
/// the console's `PanelCommand::Ipl` handler uses.
#[test]
fn channel_ipl_loads_psw_and_starts_cpu_zero() {
    let sysblk = Arc::new(Sysblk::new(SystemConfig::default()));
    let device_number = 0x00C;

    // EC-mode PSW: ec_mode set, 31-bit addressing, IA = 0x00002000; bytes 8-23 left zero so the
    // synthetic chain continuation at address 8 harmlessly decodes to an invalid CCW.
    let mut record = vec![0u8; 24];
    record[0] = 0x08;
    record[4] = 0x80;
    record[6] = 0x20;
    sysblk.channel.attach(device_number, Box::new(RawIplRecord { device_number, record }));

    assert!(sysblk.is_cpu_stopped(0));

    let psw_bytes = sysblk.channel.ipl(&sysblk.storage, device_number).unwrap();
    sysblk.request_load_psw(0, psw_bytes);

    assert!(!sysblk.is_cpu_stopped(0));
    let loaded = sysblk.cpu_controls[0].load_psw_request.lock().unwrap().take().unwrap();
    let psw = rs370::psw::Psw::from_bytes(&loaded).unwrap();
    assert_eq!(psw.ia, 0x0000_2000);
}

/// MVCL with a destructive source/destination overlap reports condition code 3 and leaves the
/// destination untouched, per the architecture's overlap rule.
#[test]
fn mvcl_with_destructive_overlap_reports_cc3_without_modifying_destination() {
    let sysblk = Arc::new(Sysblk::new(SystemConfig::default()));
    let mut cpu = Cpu::new(0, Arc::clone(&sysblk));

    let dst_addr = 0x3000u32;
    let src_addr = 0x3005u32; // inside [dst_addr, dst_addr + dst_len)
    let dst_len = 10u32;
    let src_len = 10u32;

    let sentinel = vec![0xFFu8; dst_len as usize];
    sysblk.storage.write(dst_addr as usize, &sentinel, 0).unwrap();

    cpu.gpr[2] = dst_addr;
    cpu.gpr[3] = dst_len;
    cpu.gpr[4] = src_addr;
    cpu.gpr[5] = src_len;

    let ia = 0x4000u32;
    cpu.psw.ia = ia;
    sysblk.storage.write(ia as usize, &[0x0E, 0x24], 0).unwrap(); // MVCL r1=2,r2=4

    dispatch::fetch_decode_dispatch(&mut cpu).unwrap();

    assert_eq!(cpu.psw.cc, 3);
    let mut after = vec![0u8; dst_len as usize];
    sysblk.storage.read(dst_addr as usize, &mut after, 0).unwrap();
    assert_eq!(after, sentinel);
}

/// SEARCH ID EQUAL followed by READ DATA, command-chained through the real channel-program executor,
/// returns the matching record's data.
#[test]
fn search_id_equal_then_read_data_through_chained_channel_program() {
    let track_size = 4096u32;
    let mut image = build_raw_track(&[
        (0, 0, 0, b"R0".to_vec()),
        (0, 0, 1, b"R1".to_vec()),
        (0, 0, 2, b"R2".to_vec()),
    ]);
    image.resize(track_size as usize, 0);

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&[0u8; 512]).unwrap();
    file.write_all(&image).unwrap();

    let mut dasd = CkdDasd::open_raw(0x190, file, 15, track_size).unwrap();
    let storage = rs370::storage::MainStorage::new(1);

    let seek_arg_addr = 0x0800u32;
    let search_arg_addr = 0x1000u32;
    let read_data_addr = 0x2000u32;
    storage.write_direct(seek_arg_addr as usize, &[0, 0, 0, 0]); // cyl=0, head=0
    storage.write_direct(search_arg_addr as usize, &[0, 0, 0, 0, 2]); // cchh=(0,0) rec=2

    let program_addr = 0x100u32;
    let mut ccw0 = [0u8; 8];
    ccw0[0] = rs370::devices::ckd::CCW_SEEK;
    ccw0[1] = ccw::CCW_FLAG_CC;
    ccw0[2..4].copy_from_slice(&4u16.to_be_bytes());
    ccw0[4..8].copy_from_slice(&seek_arg_addr.to_be_bytes());
    storage.write(program_addr as usize, &ccw0, 0).unwrap();

    let mut ccw1 = [0u8; 8];
    ccw1[0] = rs370::devices::ckd::CCW_SEARCH_ID_EQ;
    ccw1[1] = ccw::CCW_FLAG_CC;
    ccw1[2..4].copy_from_slice(&5u16.to_be_bytes());
    ccw1[4..8].copy_from_slice(&search_arg_addr.to_be_bytes());
    storage.write((program_addr + 8) as usize, &ccw1, 0).unwrap();

    let mut ccw2 = [0u8; 8];
    ccw2[0] = rs370::devices::ckd::CCW_READ_DATA;
    ccw2[2..4].copy_from_slice(&2u16.to_be_bytes());
    ccw2[4..8].copy_from_slice(&read_data_addr.to_be_bytes());
    storage.write((program_addr + 16) as usize, &ccw2, 0).unwrap();

    let result = ccw::execute_chain(&storage, &mut dasd, program_addr, true, 0).unwrap();
    assert_eq!(result.residual, 0);

    let mut buf = [0u8; 2];
    storage.read(read_data_addr as usize, &mut buf, 0).unwrap();
    assert_eq!(&buf, b"R2");
}

fn build_raw_track(records: &[(u16, u16, u8, Vec<u8>)]) -> Vec<u8> {
    let mut buf = vec![0u8; 5];
    for (cyl, head, rec, data) in records {
        buf.extend_from_slice(&cyl.to_be_bytes());
        buf.extend_from_slice(&head.to_be_bytes());
        buf.push(*rec);
        buf.push(0); // key length
        buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
        buf.extend_from_slice(data);
    }
    buf.extend_from_slice(&[0xFFu8; 8]);
    buf
}

/// Rewriting a compressed-CKD track with a larger image than its first write is later read back in
/// full, at the grown length, rather than truncated to the original allocation.
#[test]
fn compressed_ckd_rewrite_with_growth_reads_back_latest_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.cckd");
    write_minimal_cckd_image(&path, 4, 15, 2048);

    let mut ckd = CompressedCkdFile::open(&path, 8).unwrap();
    ckd.set_geometry(100);

    ckd.lseek(7, 0);
    ckd.write(&vec![0xAAu8; 900]).unwrap();
    ckd.lseek(7, 0);
    ckd.write(&vec![0xBBu8; 1700]).unwrap();

    ckd.lseek(7, 0);
    let got = ckd.read(1700).unwrap();
    assert_eq!(got.len(), 1700);
    assert!(got.iter().all(|&b| b == 0xBB));

    ckd.close().unwrap();
}

/// Percolating the free chain relocates the track immediately following the first free block
/// leftward and, once that relocation reaches the object that was already at end-of-file, truncates
/// the file rather than leaving a trailing hole.
#[test]
fn gc_percolate_relocates_trailing_track_and_truncates_file_at_eof() {
    use rs370::ckdstor::directory::Directory;
    use rs370::ckdstor::format::L2Entry;
    use rs370::ckdstor::freespace::{FreeBlock, FreeSpace};
    use rs370::ckdstor::gc;

    // The L2 table occupies [l2_table_offset, l2_table_offset + L2_TABLE_SIZE) and must sit at a
    // nonzero offset: 0 is the directory's own "group never allocated" sentinel, so an L2 table
    // placed there would make `find_track_by_offset` treat its group as absent.
    let l2_table_offset = 8u64;
    let free_block_offset = l2_table_offset + format::L2_TABLE_SIZE as u64; // 2056
    let free_block_len = 50u64;
    let track_offset = free_block_offset + free_block_len; // 2106
    let track_len = 100u16;

    let mut file = tempfile::tempfile().unwrap();
    file.set_len(track_offset + track_len as u64).unwrap();

    let mut track_header = vec![0u8; track_len as usize];
    track_header[1..3].copy_from_slice(&0u16.to_be_bytes()); // cyl 0
    track_header[3..5].copy_from_slice(&0u16.to_be_bytes()); // head 0
    file.seek(SeekFrom::Start(track_offset)).unwrap();
    file.write_all(&track_header).unwrap();

    let mut dir = Directory::new(vec![0]);
    let entry = L2Entry { offset: track_offset as u32, length: track_len, size: track_len };
    dir.update(&mut file, 0, entry, |_| Ok(l2_table_offset as u32)).unwrap();

    let mut freespace = FreeSpace::new(track_offset + track_len as u64, 0);
    freespace.chain = vec![FreeBlock { offset: free_block_offset, length: free_block_len }];

    let progressed = gc::percolate(&mut file, &mut dir, &mut freespace, 15, 100, 4096).unwrap();
    assert!(progressed);

    let moved = dir.lookup(&mut file, 0).unwrap();
    assert_eq!(moved.offset as u64, track_offset - free_block_len);

    let final_len = file.metadata().unwrap().len();
    assert_eq!(final_len, track_offset + track_len as u64 - free_block_len);
}

/// A compressed-CKD device header written in the non-host endianness is converted in place when the
/// image is opened, and read/write against it behaves exactly as it would for a host-endian image.
#[test]
fn compressed_ckd_header_endian_conversion_on_open_is_transparent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("foreign_endian.cckd");
    write_minimal_cckd_image(&path, 2, 15, 1024);

    // Flip the on-disk endianness flag and byte-swap the header fields by hand, simulating an image
    // produced on a host of the opposite endianness.
    {
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(format::CKD_DEVHDR_SIZE as u64)).unwrap();
        let mut cdev_buf = [0u8; format::CDEVHDR_SIZE];
        file.read_exact(&mut cdev_buf).unwrap();
        let mut hdr = format::CompressedDeviceHeader::from_bytes(&cdev_buf);
        hdr.byte_swap();
        hdr.options ^= format::OPT_BIGENDIAN;
        file.seek(SeekFrom::Start(format::CKD_DEVHDR_SIZE as u64)).unwrap();
        file.write_all(&hdr.to_bytes()).unwrap();
    }

    let mut ckd = CompressedCkdFile::open(&path, 4).unwrap();
    ckd.set_geometry(10);
    ckd.lseek(0, 0);
    ckd.write(b"roundtrip").unwrap();
    ckd.lseek(0, 0);
    let got = ckd.read(9).unwrap();
    assert_eq!(&got, b"roundtrip");
    ckd.close().unwrap();
}

/// Build a freshly-formatted, unopened, host-endian compressed CKD image with an empty directory:
/// the minimal file `CompressedCkdFile::open` accepts.
fn write_minimal_cckd_image(path: &std::path::Path, num_l1: u32, heads: u32, track_size: u32) {
    let mut file = std::fs::File::create(path).unwrap();
    let ckd_hdr = format::CkdDeviceHeader { heads, track_size, flags: 0 };
    file.write_all(&ckd_hdr.to_bytes()).unwrap();

    let header_len = format::CKD_DEVHDR_SIZE as u64 + format::CDEVHDR_SIZE as u64 + (num_l1 as u64) * 4;
    let cdevhdr = format::CompressedDeviceHeader {
        options: 0,
        num_l1_entries: num_l1,
        num_l2_entries: format::L2_TABLE_ENTRIES as u32,
        size: header_len,
        used: header_len,
        free: 0,
        free_total: 0,
        free_largest: 0,
        free_number: 0,
        free_imbed: 0,
        compress: format::ALGO_NONE,
        compress_parm: 0,
    };
    let mut hdr_bytes = cdevhdr.to_bytes();
    if cfg!(target_endian = "big") {
        hdr_bytes[0] |= format::OPT_BIGENDIAN;
    }
    file.write_all(&hdr_bytes).unwrap();
    for _ in 0..num_l1 {
        file.write_all(&0u32.to_le_bytes()).unwrap();
    }
}
