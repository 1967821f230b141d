//! Error taxonomy (SPEC_FULL.md §7).
//!
//! Two families live here: `thiserror`-derived host-facing errors (config parsing, channel/device
//! failures, storage-engine corruption) and the architectural control-flow types that an instruction
//! handler returns instead of panicking — `ProgramInterrupt` and `MachineCheck`. The latter are not
//! `std::error::Error`: they are outcomes of guest execution, not host failures.

use thiserror::Error;

/// One S/370/ESA-390 program-interruption code (Principles of Operation, chapter 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramInterruptCode {
    Specification,
    Operation,
    PrivilegedOperation,
    Protection,
    Addressing,
    Data,
    FixedPointOverflow,
    FixedPointDivide,
    DecimalOverflow,
    DecimalDivide,
    ExecuteException,
    SegmentTranslation,
    PageTranslation,
    Translation,
    SpecialOperation,
    TransactionConstraint,
}

impl ProgramInterruptCode {
    /// The interruption code stored at PSA+0x8A (low two bytes of the old-PSW area), per POP table 6-1.
    pub fn code(self) -> u16 {
        use ProgramInterruptCode::*;
        match self {
            Operation => 0x0001,
            PrivilegedOperation => 0x0002,
            Specification => 0x0006,
            Protection => 0x0004,
            Addressing => 0x0005,
            Data => 0x0007,
            FixedPointOverflow => 0x0008,
            FixedPointDivide => 0x0009,
            DecimalOverflow => 0x000A,
            DecimalDivide => 0x000B,
            ExecuteException => 0x0003,
            SegmentTranslation => 0x0010,
            PageTranslation => 0x0011,
            Translation => 0x0012,
            SpecialOperation => 0x0013,
            TransactionConstraint => 0x0018,
        }
    }
}

/// A decoded or executing instruction raised an architectural program interruption.
///
/// `nullify`: if true the instruction is nullified (IA is left pointing at the offending
/// instruction); if false it is suppressed/terminated/completed (IA already advanced by `ilc`).
#[derive(Debug, Clone, Copy)]
pub struct ProgramInterrupt {
    pub code: ProgramInterruptCode,
    pub ilc: u8,
    pub nullify: bool,
    /// Set only for SVC: the interruption code an SVC delivers is the 8-bit I-field rather than one
    /// of `ProgramInterruptCode`'s architected values, so it rides alongside `code` instead of
    /// replacing it.
    pub svc_code: Option<u16>,
}

impl ProgramInterrupt {
    pub fn new(code: ProgramInterruptCode, ilc: u8) -> Self {
        // Only a handful of classes nullify; the rest suppress or terminate with IA already advanced.
        let nullify = matches!(
            code,
            ProgramInterruptCode::SegmentTranslation
                | ProgramInterruptCode::PageTranslation
                | ProgramInterruptCode::Translation
                | ProgramInterruptCode::Addressing
        );
        ProgramInterrupt { code, ilc, nullify, svc_code: None }
    }

    /// SVC is delivered through the same path as any other program interruption, but its
    /// interruption code is the instruction's own I-field.
    pub fn svc(svc_code: u16) -> Self {
        ProgramInterrupt { code: ProgramInterruptCode::Operation, ilc: 2, nullify: false, svc_code: Some(svc_code) }
    }
}

/// A host-detected hardware-analogue fault (storage corruption, impossible CPU state).
#[derive(Debug, Clone)]
pub struct MachineCheck {
    pub reason: String,
}

impl MachineCheck {
    pub fn new(reason: impl Into<String>) -> Self {
        MachineCheck { reason: reason.into() }
    }
}

/// Outcome of one dispatched instruction.
pub type ExecResult = Result<(), ProgramInterrupt>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("line {line}: device number {device_number:04X} is not unique")]
    DuplicateDevice { line: usize, device_number: u16 },
    #[error("no such config file: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("subchannel {0:04X} is busy")]
    Busy(u16),
    #[error("subchannel {0:04X} is not enabled")]
    NotEnabled(u16),
    #[error("no such subchannel {0:04X}")]
    NoSuchDevice(u16),
    #[error("program check in channel program at {0:08X}")]
    ProgramCheck(u32),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {device_number:04X}: {reason}")]
    Init { device_number: u16, reason: String },
    #[error("device {device_number:04X}: unsupported CCW opcode {opcode:02X}")]
    UnsupportedCcw { device_number: u16, opcode: u8 },
    #[error("device {device_number:04X}: I/O error: {reason}")]
    Io { device_number: u16, reason: String },
}

#[derive(Debug, Error)]
pub enum StorageEngineError {
    #[error("compressed CKD image {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("compressed CKD image {path}: I/O error: {reason}")]
    Io { path: String, reason: String },
    #[error("compressed CKD image {path}: out of space")]
    OutOfSpace { path: String },
}

impl From<std::io::Error> for StorageEngineError {
    fn from(e: std::io::Error) -> Self {
        StorageEngineError::Io { path: String::new(), reason: e.to_string() }
    }
}
