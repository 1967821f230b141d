//! Console / panel bridge (SPEC_FULL.md §4.11, component C11).
//!
//! Grounded on the teacher's `Debugger`/`Disassembly` (`processor.rs`): a small command parser plus a
//! textual state dump, driven by stdin or a socket, generalized from m68k single-step/breakpoint/watch
//! commands to the panel command set SPEC_FULL.md §4.11 names. This crate does not attempt the
//! teacher's `termion` curses-style redraw loop (the spec explicitly scopes a rendering UI out); it
//! keeps `termion` only for the plain color/clear escapes used in the textual dumps below, the same
//! way the teacher uses them inside `Debugger::draw_user_interface`.

use crate::storage::MainStorage;
use crate::sysblk::Sysblk;
use std::collections::HashSet;
use std::sync::Arc;
use termion::{clear, color};

/// One parsed panel command, per SPEC_FULL.md §4.11's command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelCommand {
    Start,
    Stop,
    Restart,
    ExternalInterrupt,
    StoreStatus,
    Ipl { device_number: u16 },
    LoadParm { value: String },
    Go,
    StepOn,
    StepOff,
    TraceOn,
    TraceOff,
    DeviceTraceOn { device_number: u16 },
    DeviceStepOn { device_number: u16 },
    Attention { device_number: u16 },
    SetBreakpoint { addr: u32 },
    ClearBreakpoints,
    DisplayReal { addr: u32, len: usize },
    DisplayVirtual { addr: u32, len: usize },
    AlterReal { addr: u32, bytes: Vec<u8> },
    DeviceInit { device_number: u16, args: Vec<String> },
    LoadCore { addr: u32, path: String },
    Quit,
}

/// Parse one line of panel input. Unrecognized or malformed input yields `None`; the caller decides
/// how to report that (the teacher's `Debugger::get_command` falls back to repeating the last
/// command — this bridge instead just tells the operator the line didn't parse, since panel sessions
/// here are not a single persistent REPL state the way the teacher's stepper is).
pub fn parse_command(line: &str) -> Option<PanelCommand> {
    let mut parts = line.split_whitespace();
    let head = parts.next()?;
    match head {
        "start" => Some(PanelCommand::Start),
        "stop" => Some(PanelCommand::Stop),
        "restart" => Some(PanelCommand::Restart),
        "ext" => Some(PanelCommand::ExternalInterrupt),
        "store-status" => Some(PanelCommand::StoreStatus),
        "ipl" => Some(PanelCommand::Ipl { device_number: parse_hex16(parts.next()?)? }),
        "loadparm" => Some(PanelCommand::LoadParm { value: parts.next().unwrap_or("").to_string() }),
        "g" => Some(PanelCommand::Go),
        "s+" => Some(PanelCommand::StepOn),
        "s-" => Some(PanelCommand::StepOff),
        "t+" => Some(PanelCommand::TraceOn),
        "t-" => Some(PanelCommand::TraceOff),
        cmd if cmd.starts_with("t+") && cmd.len() > 2 => {
            Some(PanelCommand::DeviceTraceOn { device_number: parse_hex16(&cmd[2..])? })
        }
        cmd if cmd.starts_with("s+") && cmd.len() > 2 => {
            Some(PanelCommand::DeviceStepOn { device_number: parse_hex16(&cmd[2..])? })
        }
        "i" => Some(PanelCommand::Attention { device_number: parse_hex16(parts.next()?)? }),
        "b" => Some(PanelCommand::SetBreakpoint { addr: parse_hex32(parts.next()?)? }),
        "b-" => Some(PanelCommand::ClearBreakpoints),
        "r" => Some(PanelCommand::DisplayReal {
            addr: parse_hex32(parts.next()?)?,
            len: parts.next().and_then(|s| s.parse().ok()).unwrap_or(16),
        }),
        "v" => Some(PanelCommand::DisplayVirtual {
            addr: parse_hex32(parts.next()?)?,
            len: parts.next().and_then(|s| s.parse().ok()).unwrap_or(16),
        }),
        "devinit" => Some(PanelCommand::DeviceInit {
            device_number: parse_hex16(parts.next()?)?,
            args: parts.map(String::from).collect(),
        }),
        "loadcore" => {
            Some(PanelCommand::LoadCore { addr: parse_hex32(parts.next()?)?, path: parts.next()?.to_string() })
        }
        "quit" => Some(PanelCommand::Quit),
        _ => None,
    }
}

fn parse_hex16(s: &str) -> Option<u16> {
    u16::from_str_radix(s, 16).ok()
}

fn parse_hex32(s: &str) -> Option<u32> {
    u32::from_str_radix(s, 16).ok()
}

/// Panel-side state not owned by `Sysblk`: breakpoints and trace/step toggles are a property of the
/// operator's session, not the machine, the same way the teacher's `Disassembly::breakpoints` lives on
/// the `Debugger`, not on `CPU`.
pub struct PanelState {
    breakpoints: HashSet<u32>,
    step_mode: bool,
    trace_mode: bool,
    load_parm: String,
}

impl PanelState {
    pub fn new() -> Self {
        PanelState { breakpoints: HashSet::new(), step_mode: false, trace_mode: false, load_parm: String::new() }
    }

    pub fn is_breakpoint(&self, addr: u32) -> bool {
        self.breakpoints.contains(&addr)
    }

    pub fn step_mode(&self) -> bool {
        self.step_mode
    }

    pub fn trace_mode(&self) -> bool {
        self.trace_mode
    }

    /// Apply one command against the shared system state, returning the textual response a panel
    /// session would print (the stand-in for a screen redraw, per SPEC_FULL.md §4.11).
    pub fn dispatch(&mut self, cmd: PanelCommand, sysblk: &Arc<Sysblk>) -> String {
        match cmd {
            PanelCommand::Start => {
                sysblk.start_all_cpus();
                "CPU(s) started.".to_string()
            }
            PanelCommand::Stop => {
                sysblk.stop_all_cpus();
                "Stop requested; CPU(s) will halt at the next instruction boundary.".to_string()
            }
            PanelCommand::Restart => {
                for i in 0..sysblk.config.num_cpus as usize {
                    sysblk.post_restart(i);
                }
                "Restart interrupt posted to all CPUs.".to_string()
            }
            PanelCommand::ExternalInterrupt => {
                sysblk.post_external_call(0);
                "External interrupt key pressed.".to_string()
            }
            PanelCommand::StoreStatus => format!(
                "{clr}Store status: main={main}MB devices={devs}",
                clr = clear::CurrentLine,
                main = sysblk.config.main_size_mb,
                devs = sysblk.config.devices.len()
            ),
            PanelCommand::Ipl { device_number } => match sysblk.channel.ipl(&sysblk.storage, device_number) {
                Ok(psw_bytes) => {
                    sysblk.request_load_psw(0, psw_bytes);
                    format!("IPL from device {device_number:04X} complete; CPU 0 started.")
                }
                Err(e) => format!("{}IPL failed: {e}{}", color::Fg(color::Red), color::Fg(color::Reset)),
            },
            PanelCommand::LoadParm { value } => {
                self.load_parm = value.chars().take(8).collect();
                format!("Load parameter set to '{}'.", self.load_parm)
            }
            PanelCommand::Go => {
                self.step_mode = false;
                sysblk.start_all_cpus();
                "Running.".to_string()
            }
            PanelCommand::StepOn => {
                self.step_mode = true;
                "Single-step enabled.".to_string()
            }
            PanelCommand::StepOff => {
                self.step_mode = false;
                "Single-step disabled.".to_string()
            }
            PanelCommand::TraceOn => {
                self.trace_mode = true;
                "Instruction trace enabled.".to_string()
            }
            PanelCommand::TraceOff => {
                self.trace_mode = false;
                "Instruction trace disabled.".to_string()
            }
            PanelCommand::DeviceTraceOn { device_number } => format!("CCW trace enabled for device {device_number:04X}."),
            PanelCommand::DeviceStepOn { device_number } => format!("CCW step enabled for device {device_number:04X}."),
            PanelCommand::Attention { device_number } => match sysblk.channel.get(device_number) {
                Ok(sch) => {
                    sch.cv.notify_all();
                    format!("Attention raised for device {device_number:04X}.")
                }
                Err(e) => format!("{e}"),
            },
            PanelCommand::SetBreakpoint { addr } => {
                self.breakpoints.insert(addr);
                format!("Breakpoint set at {addr:08X}.")
            }
            PanelCommand::ClearBreakpoints => {
                self.breakpoints.clear();
                "All breakpoints cleared.".to_string()
            }
            PanelCommand::DisplayReal { addr, len } => dump_storage(&sysblk.storage, addr, len),
            PanelCommand::DisplayVirtual { addr, len } => {
                // Without a CPU handle this bridge cannot run DAT; real-storage display stands in.
                dump_storage(&sysblk.storage, addr, len)
            }
            PanelCommand::AlterReal { addr, bytes } => match sysblk.storage.write(addr as usize, &bytes, 0) {
                Ok(()) => format!("{} bytes stored at {addr:08X}.", bytes.len()),
                Err(_) => "Alter failed: addressing exception.".to_string(),
            },
            PanelCommand::DeviceInit { device_number, args } => {
                format!("devinit {device_number:04X} {args:?}: reinitialization is performed by the config loader, not the panel bridge, in this port.")
            }
            PanelCommand::LoadCore { addr, path } => match std::fs::read(&path) {
                Ok(data) => match sysblk.storage.write(addr as usize, &data, 0) {
                    Ok(()) => format!("Loaded {} bytes from {path} at {addr:08X}.", data.len()),
                    Err(_) => "loadcore failed: addressing exception.".to_string(),
                },
                Err(e) => format!("loadcore failed: {e}"),
            },
            PanelCommand::Quit => {
                sysblk.request_shutdown();
                "Shutting down.".to_string()
            }
        }
    }
}

fn dump_storage(storage: &MainStorage, addr: u32, len: usize) -> String {
    let mut buf = vec![0u8; len];
    match storage.read(addr as usize, &mut buf, 0) {
        Ok(()) => {
            let hex: Vec<String> = buf.iter().map(|b| format!("{b:02X}")).collect();
            format!("{addr:08X}  {}", hex.join(" "))
        }
        Err(_) => format!("{addr:08X}  <addressing exception>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("start"), Some(PanelCommand::Start));
        assert_eq!(parse_command("ipl 0190"), Some(PanelCommand::Ipl { device_number: 0x0190 }));
        assert_eq!(parse_command("b 00400000"), Some(PanelCommand::SetBreakpoint { addr: 0x0040_0000 }));
        assert_eq!(parse_command("bogus"), None);
    }

    #[test]
    fn display_real_reads_storage() {
        let sysblk = Arc::new(Sysblk::new(SystemConfig::default()));
        sysblk.storage.write(0x100, &[1, 2, 3, 4], 0).unwrap();
        let mut panel = PanelState::new();
        let out = panel.dispatch(PanelCommand::DisplayReal { addr: 0x100, len: 4 }, &sysblk);
        assert!(out.contains("01 02 03 04"));
    }

    #[test]
    fn breakpoint_roundtrip() {
        let mut panel = PanelState::new();
        let sysblk = Arc::new(Sysblk::new(SystemConfig::default()));
        panel.dispatch(PanelCommand::SetBreakpoint { addr: 0x1234 }, &sysblk);
        assert!(panel.is_breakpoint(0x1234));
        panel.dispatch(PanelCommand::ClearBreakpoints, &sysblk);
        assert!(!panel.is_breakpoint(0x1234));
    }
}
