//! Binary entry point: load a config file, build the system, run an operator command loop on stdin
//! (SPEC_FULL.md §4.11, component C11) until `quit`.
//!
//! Grounded on the teacher's `main()` (old `main.rs`), which built one `Emulator` and called
//! `run(progname)`; generalized here to `System::build` plus a panel command loop instead of loading a
//! raw binary straight into RAM.

use rs370::console::{parse_command, PanelCommand, PanelState};
use rs370::{config, System};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

fn main() {
    env_logger::init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "rs370.cnf".to_string());
    let config = match config::load(&PathBuf::from(&config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load {config_path}: {e}");
            std::process::exit(1);
        }
    };

    let system = System::build(config);
    let mut panel = PanelState::new();

    println!("rs370 ready. Type 'ipl DDDD' to load, 'quit' to exit.");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        match parse_command(&line) {
            Some(cmd) => {
                let quitting = cmd == PanelCommand::Quit;
                let response = panel.dispatch(cmd, &system.sysblk);
                println!("{response}");
                io::stdout().flush().ok();
                if quitting {
                    break;
                }
            }
            None => println!("unrecognized command: {line}"),
        }
    }

    system.sysblk.request_shutdown();
    system.join();
}
