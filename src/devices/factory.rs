//! Device factory: turns one parsed `DeviceConfig` line into a live `Device` (SPEC_FULL.md §4.8 +
//! §6 config grammar). Grounded on the teacher's `atari.rs::new()`, which hardcodes its one machine's
//! fixed peripheral set; here the set is data-driven from the config file instead of compiled in.

use super::card::{CardReader, ShortRecordPolicy};
use super::ckd::CkdDasd;
use super::fba::FbaDasd;
use super::printer::Printer;
use super::tape::TapeDrive;
use super::tn3270::Tn3270Display;
use super::Device;
use crate::ckdstor::CompressedCkdFile;
use crate::config::DeviceConfig;
use crate::error::DeviceError;
use std::fs::OpenOptions;
use std::path::Path;

const DEFAULT_CKD_HEADS: u32 = 15;
const DEFAULT_CKD_TRACK_SIZE: u32 = 56_664; // 3390-class track capacity, model 3 geometry
const DEFAULT_TRACK_CACHE_CAPACITY: usize = 64;

/// Build one device from its config line. `device_type` is matched case-insensitively against the
/// handler families this crate ships; anything else is an `Init` error naming the line.
pub fn build(cfg: &DeviceConfig) -> Result<Box<dyn Device>, DeviceError> {
    let reason = |e: std::io::Error| DeviceError::Init { device_number: cfg.device_number, reason: e.to_string() };
    match cfg.device_type.to_ascii_lowercase().as_str() {
        "3390" | "3380" | "ckd" => {
            let path = cfg.args.first().ok_or_else(|| DeviceError::Init {
                device_number: cfg.device_number,
                reason: "ckd device requires a backing file path".to_string(),
            })?;
            if path.ends_with(".cckd") {
                let ckd_file = CompressedCkdFile::open(Path::new(path), DEFAULT_TRACK_CACHE_CAPACITY)
                    .map_err(|e| DeviceError::Init { device_number: cfg.device_number, reason: e.to_string() })?;
                Ok(Box::new(CkdDasd::open_compressed(cfg.device_number, ckd_file, DEFAULT_CKD_HEADS, DEFAULT_CKD_TRACK_SIZE)))
            } else {
                let file = OpenOptions::new().read(true).write(true).open(path).map_err(reason)?;
                Ok(Box::new(
                    CkdDasd::open_raw(cfg.device_number, file, DEFAULT_CKD_HEADS, DEFAULT_CKD_TRACK_SIZE)
                        .map_err(reason)?,
                ))
            }
        }
        "3310" | "fba" => {
            let path = cfg.args.first().ok_or_else(|| DeviceError::Init {
                device_number: cfg.device_number,
                reason: "fba device requires a backing file path".to_string(),
            })?;
            let file = OpenOptions::new().read(true).write(true).open(path).map_err(reason)?;
            Ok(Box::new(FbaDasd::open(cfg.device_number, file).map_err(reason)?))
        }
        "3270" | "tn3270" => match cfg.args.first() {
            Some(addr) => Ok(Box::new(Tn3270Display::connect(cfg.device_number, addr).map_err(reason)?)),
            None => Ok(Box::new(Tn3270Display::detached(cfg.device_number))),
        },
        "3505" | "card" | "reader" => {
            let path = cfg.args.first().ok_or_else(|| DeviceError::Init {
                device_number: cfg.device_number,
                reason: "card reader requires a deck file path".to_string(),
            })?;
            let text = std::fs::read_to_string(path).map_err(reason)?;
            let policy = match cfg.args.get(1).map(String::as_str) {
                Some("truncate") => ShortRecordPolicy::Truncate,
                Some("datacheck") => ShortRecordPolicy::DataCheck,
                _ => ShortRecordPolicy::Pad,
            };
            Ok(Box::new(CardReader::new(cfg.device_number, &text, policy)))
        }
        "1403" | "printer" => {
            let path = cfg.args.first().ok_or_else(|| DeviceError::Init {
                device_number: cfg.device_number,
                reason: "printer requires an output file path".to_string(),
            })?;
            let file = OpenOptions::new().create(true).write(true).truncate(false).open(path).map_err(reason)?;
            let upper_case_fold = cfg.args.get(1).map(|s| s == "fold").unwrap_or(false);
            Ok(Box::new(Printer::new(cfg.device_number, Box::new(file), upper_case_fold)))
        }
        "3420" | "tape" => {
            let path = cfg.args.first().ok_or_else(|| DeviceError::Init {
                device_number: cfg.device_number,
                reason: "tape drive requires a backing file path".to_string(),
            })?;
            let file = OpenOptions::new().read(true).write(true).create(true).open(path).map_err(reason)?;
            Ok(Box::new(TapeDrive::new(cfg.device_number, file)))
        }
        other => Err(DeviceError::Init {
            device_number: cfg.device_number,
            reason: format!("unknown device type {other:?}"),
        }),
    }
}
