//! Error types shared by the core and all adapter crates.

use thiserror::Error;

/// Core error type.
///
/// Protocol helpers never terminate the process; every fault is reported
/// through this type and the top-level driver decides what is fatal.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O error (serial port, file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level fault: USB stall, short transfer, timeout.
    /// The target state is unknown afterwards; callers must not retry.
    #[error("transport fault: {0}")]
    Transport(String),

    /// Malformed reply at the protocol framing level.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The adapter does not implement this operation.
    #[error("{0} not supported by this adapter")]
    Unsupported(&'static str),

    /// No usable adapter was detected.
    #[error("no target adapter found")]
    NoAdapter,

    /// The device reports code protection; nothing but a chip erase works.
    #[error("device is code protected (status {status:#06x})")]
    CodeProtected {
        /// Raw MCHP status value.
        status: u32,
    },

    /// An unexpected MCHP status value.
    #[error("invalid status {status:#06x} ({context})")]
    BadStatus {
        /// Raw MCHP status value.
        status: u32,
        /// Where the check failed.
        context: &'static str,
    },

    /// The EJTAG PrAcc bit never came up within the polling bound.
    #[error("PrAcc not set after {polls} polls ({context})")]
    PrAccNotSet {
        /// Number of Control register polls performed.
        polls: u32,
        /// Which operation was polling.
        context: &'static str,
    },

    /// The PE echoed back something other than the issued opcode.
    #[error("bad PE response {got:#010x}, expected {expected:#010x}")]
    PeResponse {
        /// Expected response word (opcode echo in the high half).
        expected: u32,
        /// Actual response word.
        got: u32,
    },

    /// PE version handshake failed after loading.
    #[error("bad PE version {got:#010x}, expected {expected:#010x}")]
    PeVersionMismatch {
        /// Expected handshake word.
        expected: u32,
        /// Received handshake word.
        got: u32,
    },

    /// GET_CRC verification mismatch (fatal only under the strict policy).
    #[error("checksum failed at {addr:#010x}: sum={flash:#06x}, expected={local:#06x}")]
    VerifyCrc {
        /// Start of the verified range.
        addr: u32,
        /// CRC reported by the PE.
        flash: u16,
        /// CRC computed over the local data.
        local: u16,
    },

    /// Word-by-word verification mismatch.
    #[error("verify error at {addr:#010x}: file={expected:#010x}, mem={got:#010x}")]
    VerifyMismatch {
        /// Failing word address.
        addr: u32,
        /// Expected word from the image.
        expected: u32,
        /// Word read back from the target.
        got: u32,
    },

    /// Chip erase did not complete within the polling bound.
    #[error("chip erase timed out, status {status:#06x}")]
    EraseTimeout {
        /// Last observed MCHP status.
        status: u32,
    },

    /// The probed ID code matches no table entry.
    #[error("unknown device id {0:#010x}")]
    UnknownDevice(u32),

    /// Malformed device table extension or bad family name.
    #[error("configuration error: {0}")]
    Config(String),

    /// A Programming Executive image file could not be used.
    #[error("PE image {path}: {reason}")]
    PeImage {
        /// Offending file.
        path: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
