//! Fetch-decode-dispatch loop (SPEC_FULL.md §4.4).
//!
//! Grounded on the teacher's `parse_instruction(opcode, cpu) -> Option<Instruction>` plus
//! `Instruction::execute(&self, cpu: &mut CPU)` split (`parser.rs`/`instructions.rs`): decoding stays a
//! pure function from opcode bytes to a decoded-operand struct, dispatch stays a table from opcode to
//! handler. Generalized from m68k's fixed 2-byte opcode word to ESA/390's 2/4/6-byte instructions,
//! whose length is determined by the top two bits of the first byte (Principles of Operation, ch. 5).

use super::ops;
use super::Cpu;
use crate::dat::AccessType;
use crate::error::{ExecResult, MachineCheck, ProgramInterrupt, ProgramInterruptCode};
use crate::psw::Psw;

/// A fully decoded instruction, tagged by architected format.
#[derive(Debug, Clone, Copy)]
pub enum Decoded {
    Rr { op: u8, r1: u8, r2: u8 },
    Rre { op: u16, r1: u8, r2: u8 },
    Rx { op: u8, r1: u8, x2: u8, b2: u8, d2: u16 },
    Rs { op: u8, r1: u8, r3: u8, b2: u8, d2: u16 },
    Si { op: u8, i2: u8, b1: u8, d1: u16 },
    Ss { op: u8, l: u8, b1: u8, d1: u16, b2: u8, d2: u16 },
    S { op: u16, b2: u8, d2: u16 },
    E { op: u8 },
}

impl Decoded {
    pub fn ilc(&self) -> u8 {
        match self {
            Decoded::Rr { .. } | Decoded::E { .. } => 2,
            Decoded::Rx { .. } | Decoded::Rs { .. } | Decoded::Si { .. } | Decoded::Rre { .. } | Decoded::S { .. } => 4,
            Decoded::Ss { .. } => 6,
        }
    }
}

/// Length in bytes implied by the top two bits of the first opcode byte (POP ch. 5).
fn length_from_first_byte(byte0: u8) -> u8 {
    match byte0 >> 6 {
        0b00 => 2,
        0b11 => 6,
        _ => 4,
    }
}

/// Fetch `len` bytes starting at the CPU's current IA, honoring DAT and prefixing. Per SPEC_FULL.md
/// §4.4, a fetch fault must not have modified any register and leaves IA at the attempted fetch.
fn fetch(cpu: &mut Cpu, len: usize) -> Result<Vec<u8>, ProgramInterrupt> {
    let real = cpu.dat.translate(&cpu.sysblk.storage, cpu.psw.ia, cpu.access_key(), AccessType::InstructionFetch)?;
    let abs = crate::storage::MainStorage::prefix(real, cpu.cr[0] & 0x7FFF_F000) as usize;
    let mut buf = vec![0u8; len];
    cpu.sysblk
        .storage
        .fetch_instruction(abs, &mut buf, cpu.access_key())
        .map_err(|_| ProgramInterrupt::new(ProgramInterruptCode::Addressing, 0))?;
    Ok(buf)
}

fn decode(op0: u8, bytes: &[u8]) -> Decoded {
    match length_from_first_byte(op0) {
        2 => Decoded::Rr { op: op0, r1: bytes[1] >> 4, r2: bytes[1] & 0x0F },
        6 => {
            let l = bytes[1];
            let b1 = bytes[2] >> 4;
            let d1 = u16::from_be_bytes([bytes[2] & 0x0F, bytes[3]]);
            let b2 = bytes[4] >> 4;
            let d2 = u16::from_be_bytes([bytes[4] & 0x0F, bytes[5]]);
            Decoded::Ss { op: op0, l, b1, d1, b2, d2 }
        }
        _ => {
            // 4-byte group: RX, RS, SI, RRE, or an S-format two-byte-opcode instruction (0xB2/0xB3).
            if op0 == 0xB2 || op0 == 0xB3 {
                let op = u16::from_be_bytes([bytes[0], bytes[1]]);
                let maybe_rre = bytes[2] & 0xF0 == 0 || op0 == 0xB3;
                if maybe_rre {
                    Decoded::Rre { op, r1: bytes[3] >> 4, r2: bytes[3] & 0x0F }
                } else {
                    let b2 = bytes[2] >> 4;
                    let d2 = u16::from_be_bytes([bytes[2] & 0x0F, bytes[3]]);
                    Decoded::S { op, b2, d2 }
                }
            } else if is_si(op0) {
                let i2 = bytes[1];
                let b1 = bytes[2] >> 4;
                let d1 = u16::from_be_bytes([bytes[2] & 0x0F, bytes[3]]);
                Decoded::Si { op: op0, i2, b1, d1 }
            } else if is_rs(op0) {
                let r1 = bytes[1] >> 4;
                let r3 = bytes[1] & 0x0F;
                let b2 = bytes[2] >> 4;
                let d2 = u16::from_be_bytes([bytes[2] & 0x0F, bytes[3]]);
                Decoded::Rs { op: op0, r1, r3, b2, d2 }
            } else {
                let r1 = bytes[1] >> 4;
                let x2 = bytes[1] & 0x0F;
                let b2 = bytes[2] >> 4;
                let d2 = u16::from_be_bytes([bytes[2] & 0x0F, bytes[3]]);
                Decoded::Rx { op: op0, r1, x2, b2, d2 }
            }
        }
    }
}

fn is_si(op: u8) -> bool {
    matches!(op, 0x91 | 0x92 | 0x93 | 0x94 | 0x95 | 0x96 | 0x97 | 0x80 | 0xAC | 0xAD)
}

fn is_rs(op: u8) -> bool {
    matches!(op, 0x86 | 0x87 | 0x88 | 0x89 | 0x8A | 0x8B | 0x8C | 0x8D | 0x8E | 0x8F | 0x90 | 0x98 | 0x99 | 0x9A | 0x9B | 0xB1)
}

/// Fetch, decode, and dispatch exactly one instruction. IA is advanced by ILC before the handler
/// runs for non-branching instructions and overwritten directly by handlers that branch, matching the
/// teacher's `pc += 2; ...; nxt.execute(self)` ordering generalized to variable-length instructions.
pub fn fetch_decode_dispatch(cpu: &mut Cpu) -> ExecResult {
    let op0_bytes = fetch(cpu, 2)?;
    let len = length_from_first_byte(op0_bytes[0]) as usize;
    let full = if len == 2 { op0_bytes } else { fetch(cpu, len)? };
    let decoded = decode(full[0], &full);
    let ilc = decoded.ilc();
    let this_ia = cpu.psw.ia;
    cpu.psw.ia = this_ia.wrapping_add(ilc as u32);

    let result = ops::execute(cpu, decoded);
    if let Err(mut pi) = result {
        pi.ilc = ilc;
        if pi.nullify {
            cpu.psw.ia = this_ia;
        }
        return Err(pi);
    }
    Ok(())
}

// PSA offsets for each interruption class's old/new PSW pair (SPEC_FULL.md §4.3; Principles of
// Operation ch. 3/6). Restart is the only pair below low core's first 16 bytes.
const PSA_RESTART_OLD: u32 = 0x08;
const PSA_RESTART_NEW: u32 = 0x00;
const PSA_EXTERNAL_OLD: u32 = 0x18;
const PSA_EXTERNAL_NEW: u32 = 0x58;
const PSA_PROGRAM_OLD: u32 = 0x28;
const PSA_PROGRAM_NEW: u32 = 0x68;
const PSA_IO_OLD: u32 = 0x38;
const PSA_IO_NEW: u32 = 0x78;

/// Store the live PSW at `old_offset` and load the new PSW from `new_offset`, both prefixed per the
/// CPU's current prefix register. Shared by every interruption class's delivery routine below;
/// returns false (caller checkstops) if either the store, the fetch, or the new PSW's parse fails.
fn store_and_load_psw(cpu: &mut Cpu, old_offset: u32, new_offset: u32) -> bool {
    let prefix = cpu.cr[0] & 0x7FFF_F000;
    let old_bytes = cpu.psw.to_bytes();
    if cpu.sysblk.storage.write(crate::storage::MainStorage::prefix(old_offset, prefix) as usize, &old_bytes, 0).is_err() {
        return false;
    }
    let mut new_bytes = [0u8; 8];
    if cpu
        .sysblk
        .storage
        .read(crate::storage::MainStorage::prefix(new_offset, prefix) as usize, &mut new_bytes, 0)
        .is_err()
    {
        return false;
    }
    match Psw::from_bytes(&new_bytes) {
        Ok(new_psw) => {
            cpu.psw = new_psw;
            true
        }
        Err(_) => false,
    }
}

/// Program-interrupt delivery (SPEC_FULL.md §4.3): store the old PSW at PSA+0x28, load the new PSW
/// from PSA+0x68, with the interruption code at PSA+0x8A.
pub fn deliver_program_interrupt(cpu: &mut Cpu, pi: ProgramInterrupt) {
    cpu.psw.intcode = pi.svc_code.unwrap_or_else(|| pi.code.code());
    cpu.psw.ilc = pi.ilc;
    if !store_and_load_psw(cpu, PSA_PROGRAM_OLD, PSA_PROGRAM_NEW) {
        cpu.checkstop = true;
    }
}

/// Restart-interrupt delivery (SPEC_FULL.md §4.3): unmaskable, and able to pull a stopped CPU back
/// into the running state — `Cpu::step` checks for a pending restart before its stopped check.
pub fn deliver_restart_interrupt(cpu: &mut Cpu) {
    if !store_and_load_psw(cpu, PSA_RESTART_OLD, PSA_RESTART_NEW) {
        cpu.checkstop = true;
    }
}

/// External-interrupt delivery (SPEC_FULL.md §4.3): CPU timer, clock comparator, external call, and
/// the operator's external-interrupt key all funnel through the same PSA pair.
pub fn deliver_external_interrupt(cpu: &mut Cpu) {
    if !store_and_load_psw(cpu, PSA_EXTERNAL_OLD, PSA_EXTERNAL_NEW) {
        cpu.checkstop = true;
    }
}

/// I/O-interrupt delivery (SPEC_FULL.md §4.3/§4.6): `device_number` rides on the stored old PSW the
/// same simplified way `deliver_program_interrupt` carries its interruption code, rather than being
/// written to a separate subchannel-identification field.
pub fn deliver_io_interrupt(cpu: &mut Cpu, device_number: u16) {
    cpu.psw.intcode = device_number;
    if !store_and_load_psw(cpu, PSA_IO_OLD, PSA_IO_NEW) {
        cpu.checkstop = true;
    }
}

/// SPEC_FULL.md §9 Open Questions: MVPG is implemented only for the non-overlapping,
/// non-conditional-swap case; the full "C bit requests a compare-and-swap against the destination's
/// change bit" variant is not modeled.
pub fn mvpg(cpu: &mut Cpu, r1: u8, r2: u8) -> ExecResult {
    let dst_page = cpu.gpr[r1 as usize] & 0xFFF_F000u32;
    let src_page = cpu.gpr[r2 as usize] & 0xFFF_F000u32;
    let dst = cpu.dat.translate(&cpu.sysblk.storage, dst_page, cpu.access_key(), AccessType::Write)?;
    let src = cpu.dat.translate(&cpu.sysblk.storage, src_page, cpu.access_key(), AccessType::Read)?;
    let prefix = cpu.cr[0] & 0x7FFF_F000;
    let dst_abs = crate::storage::MainStorage::prefix(dst, prefix) as usize;
    let src_abs = crate::storage::MainStorage::prefix(src, prefix) as usize;
    let mut buf = [0u8; 4096];
    cpu.sysblk.storage.read(src_abs, &mut buf, cpu.access_key())?;
    cpu.sysblk.storage.write(dst_abs, &buf, cpu.access_key())?;
    cpu.psw.set_cc(0);
    Ok(())
}

/// Sentinel returned by interruptible long-running instructions' inner loop (SPEC_FULL.md §9
/// "Interruptible long instructions"): when a tick budget is exhausted mid-operation, the handler backs
/// IA up to the instruction itself (nullifying it for re-dispatch) and the outer loop simply re-issues
/// the same instruction rather than the handler having to resume partway through by hand.
pub struct LongRunning;

impl LongRunning {
    /// Back the CPU's IA up by `ilc` so the current instruction re-dispatches from the top with its
    /// (already partially applied) register state as the new starting point — the standard S/370
    /// technique for CPU-interruptible instructions like MVCL, CLCL, and the move/compare-string family.
    pub fn yield_and_retry(cpu: &mut Cpu, ilc: u8) {
        cpu.psw.ia = cpu.psw.ia.wrapping_sub(ilc as u32);
    }
}

pub fn ensure_not_checkstop(cpu: &Cpu) -> Result<(), MachineCheck> {
    if cpu.checkstop {
        return Err(MachineCheck::new("cpu checkstop"));
    }
    Ok(())
}
