//! Minimal configuration-file reader (SPEC_FULL.md §4's ambient A3, §6 grammar).
//!
//! This intentionally is NOT a general config-parsing layer (spec Non-goals): it reads exactly the
//! line-oriented grammar in SPEC_FULL.md §6 and produces a complete `SystemConfig`, or refuses with a
//! `ConfigError` naming the offending line. There is no partial result.

use crate::error::ConfigError;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_number: u16,
    pub device_type: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub cpu_serial: u32,
    pub cpu_model: u16,
    pub main_size_mb: u32,
    pub expanded_size_mb: u32,
    pub console_port: u16,
    pub num_cpus: u8,
    pub load_parm: String,
    pub sys_epoch: u16,
    pub tz_offset_minutes: i32,
    pub devices: Vec<DeviceConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            cpu_serial: 0x000001,
            cpu_model: 0x3090,
            main_size_mb: 16,
            expanded_size_mb: 0,
            console_port: 3270,
            num_cpus: 1,
            load_parm: String::new(),
            sys_epoch: 1900,
            tz_offset_minutes: 0,
            devices: Vec::new(),
        }
    }
}

/// Parse a config file from its text, per SPEC_FULL.md §6.
///
/// Accepts either the legacy single-line header (`cpuserial cpumodel mainsize xpndsize cnslport
/// numcpu loadparm`) as a convenience alias, or the key/value form, freely intermixed with device
/// lines. Device lines are `DDDD TTTT arg...` where `DDDD` is a 4-hex-digit device number.
pub fn parse(text: &str) -> Result<SystemConfig, ConfigError> {
    let mut cfg = SystemConfig::default();
    let mut seen_devices: HashSet<u16> = HashSet::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if let Some(device_number) = parse_hex_device_number(tokens[0]) {
            if tokens.len() < 2 {
                return Err(ConfigError::Malformed {
                    line: line_no,
                    reason: "device line missing device type".to_string(),
                });
            }
            if !seen_devices.insert(device_number) {
                return Err(ConfigError::DuplicateDevice { line: line_no, device_number });
            }
            cfg.devices.push(DeviceConfig {
                device_number,
                device_type: tokens[1].to_string(),
                args: tokens[2..].iter().map(|s| s.to_string()).collect(),
            });
            continue;
        }

        match tokens[0] {
            "cpuserial" => cfg.cpu_serial = parse_u32_hex(tokens.get(1), line_no, "cpuserial")?,
            "cpumodel" => cfg.cpu_model = parse_u16_hex(tokens.get(1), line_no, "cpumodel")?,
            "mainsize" => cfg.main_size_mb = parse_range(tokens.get(1), line_no, "mainsize", 2, 256)?,
            "xpndsize" => cfg.expanded_size_mb = parse_range(tokens.get(1), line_no, "xpndsize", 0, 1024)?,
            "cnslport" => cfg.console_port = parse_u16(tokens.get(1), line_no, "cnslport")?,
            "numcpu" => cfg.num_cpus = parse_range(tokens.get(1), line_no, "numcpu", 1, 32)? as u8,
            "loadparm" => {
                cfg.load_parm = tokens.get(1).copied().unwrap_or("").to_string();
                if cfg.load_parm.len() > 8 {
                    return Err(ConfigError::Malformed {
                        line: line_no,
                        reason: "loadparm exceeds 8 characters".to_string(),
                    });
                }
            }
            "sysepoch" => cfg.sys_epoch = parse_range(tokens.get(1), line_no, "sysepoch", 1900, 2000)? as u16,
            "tzoffset" => cfg.tz_offset_minutes = parse_tzoffset(tokens.get(1), line_no)?,
            _ if tokens.len() >= 7 && is_legacy_header(&tokens) => {
                cfg.cpu_serial = parse_u32_hex(Some(&tokens[0]), line_no, "cpuserial")?;
                cfg.cpu_model = parse_u16_hex(Some(&tokens[1]), line_no, "cpumodel")?;
                cfg.main_size_mb = parse_range(Some(&tokens[2]), line_no, "mainsize", 2, 256)?;
                cfg.expanded_size_mb = parse_range(Some(&tokens[3]), line_no, "xpndsize", 0, 1024)?;
                cfg.console_port = parse_u16(Some(&tokens[4]), line_no, "cnslport")?;
                cfg.num_cpus = parse_range(Some(&tokens[5]), line_no, "numcpu", 1, 32)? as u8;
                cfg.load_parm = tokens[6].to_string();
            }
            other => {
                return Err(ConfigError::Malformed {
                    line: line_no,
                    reason: format!("unrecognized statement {:?}", other),
                });
            }
        }
    }

    Ok(cfg)
}

pub fn load(path: &Path) -> Result<SystemConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
    parse(&text)
}

fn is_legacy_header(tokens: &[&str]) -> bool {
    parse_hex_device_number(tokens[0]).is_none()
        && tokens[0].chars().all(|c| c.is_ascii_hexdigit())
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_hex_device_number(tok: &str) -> Option<u16> {
    if tok.len() == 4 && tok.chars().all(|c| c.is_ascii_hexdigit()) {
        u16::from_str_radix(tok, 16).ok()
    } else {
        None
    }
}

fn parse_u32_hex(tok: Option<&&str>, line: usize, field: &str) -> Result<u32, ConfigError> {
    tok.and_then(|t| u32::from_str_radix(t, 16).ok())
        .ok_or_else(|| ConfigError::Malformed { line, reason: format!("bad {}", field) })
}

fn parse_u16_hex(tok: Option<&&str>, line: usize, field: &str) -> Result<u16, ConfigError> {
    tok.and_then(|t| u16::from_str_radix(t, 16).ok())
        .ok_or_else(|| ConfigError::Malformed { line, reason: format!("bad {}", field) })
}

fn parse_u16(tok: Option<&&str>, line: usize, field: &str) -> Result<u16, ConfigError> {
    tok.and_then(|t| t.parse().ok())
        .ok_or_else(|| ConfigError::Malformed { line, reason: format!("bad {}", field) })
}

fn parse_range(tok: Option<&&str>, line: usize, field: &str, lo: u32, hi: u32) -> Result<u32, ConfigError> {
    let v: u32 = tok
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ConfigError::Malformed { line, reason: format!("bad {}", field) })?;
    if v < lo || v > hi {
        return Err(ConfigError::Malformed {
            line,
            reason: format!("{} out of range [{}, {}]", field, lo, hi),
        });
    }
    Ok(v)
}

fn parse_tzoffset(tok: Option<&&str>, line: usize) -> Result<i32, ConfigError> {
    let t: &str = *tok.ok_or_else(|| ConfigError::Malformed {
        line,
        reason: "missing tzoffset".to_string(),
    })?;
    let (sign, rest): (i32, &str) = match t.chars().next() {
        Some('+') => (1, &t[1..]),
        Some('-') => (-1, &t[1..]),
        _ => (1, t),
    };
    if rest.len() != 4 {
        return Err(ConfigError::Malformed { line, reason: "tzoffset must be ±HHMM".to_string() });
    }
    let hh: i32 = rest[0..2].parse().map_err(|_| ConfigError::Malformed {
        line,
        reason: "tzoffset must be ±HHMM".to_string(),
    })?;
    let mm: i32 = rest[2..4].parse().map_err(|_| ConfigError::Malformed {
        line,
        reason: "tzoffset must be ±HHMM".to_string(),
    })?;
    Ok(sign * (hh * 60 + mm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_form() {
        let text = "cpuserial 000001\ncpumodel 3090\nmainsize 16\nnumcpu 2\n00C0 3505 decklist.txt\n";
        let cfg = parse(text).expect("should parse");
        assert_eq!(cfg.num_cpus, 2);
        assert_eq!(cfg.devices.len(), 1);
        assert_eq!(cfg.devices[0].device_number, 0x00C0);
        assert_eq!(cfg.devices[0].device_type, "3505");
    }

    #[test]
    fn rejects_device_line_missing_type() {
        let err = parse("000C\n").unwrap_err();
        match err {
            ConfigError::Malformed { line, .. } => assert_eq!(line, 1),
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn rejects_duplicate_device_number() {
        let text = "000C 3505\n000C 1403\n";
        let err = parse(text).unwrap_err();
        match err {
            ConfigError::DuplicateDevice { line, device_number } => {
                assert_eq!(line, 2);
                assert_eq!(device_number, 0x000C);
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn rejects_out_of_range_mainsize() {
        let err = parse("mainsize 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn parses_tzoffset() {
        let cfg = parse("tzoffset -0500\n").unwrap();
        assert_eq!(cfg.tz_offset_minutes, -300);
    }
}
