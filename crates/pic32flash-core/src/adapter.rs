//! The capability set every programmer exposes to the session layer.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::family::Family;

bitflags! {
    /// Coarse capability flags reported by an adapter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Can read the device ID code.
        const PROBE = 1 << 0;
        /// Can erase the whole chip.
        const ERASE = 1 << 1;
        /// Can read target memory.
        const READ = 1 << 2;
        /// Can program target flash.
        const WRITE = 1 << 3;
    }
}

/// How a GET_CRC verification mismatch is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyPolicy {
    /// Mismatch is an error; the session aborts.
    #[default]
    Strict,
    /// Mismatch is logged and programming continues.
    Warn,
}

/// A debug/bootloader adapter driving one target.
///
/// Optional operations have default implementations returning
/// [`Error::Unsupported`]; the session layer falls back to an alternative
/// strategy (or reports the operation as unavailable) instead of treating
/// that as a hard fault.
pub trait Adapter {
    /// Short adapter name for diagnostics.
    fn name(&self) -> &str;

    /// Capability flags.
    fn capabilities(&self) -> Capabilities;

    /// Start of the programmable user area, when the adapter (rather than
    /// the device table) dictates it. Bootloader adapters report the area
    /// they are willing to touch.
    fn program_area(&self) -> Option<(u32, u32)> {
        None
    }

    /// Boot area size in bytes, when dictated by the adapter.
    fn boot_bytes(&self) -> u32 {
        0
    }

    /// Block size override for adapters with a fixed transfer granule.
    fn block_override(&self) -> Option<u32> {
        None
    }

    /// Tell the adapter which family was detected. Needed before any
    /// operation whose instruction sequence varies per family.
    fn set_family(&mut self, _family: &'static Family) {}

    /// Select how checksum-verify mismatches are treated, for adapters
    /// that verify through a device-side CRC.
    fn set_verify_policy(&mut self, _policy: VerifyPolicy) {}

    /// Read the 32-bit device identification code.
    fn get_idcode(&mut self) -> Result<u32>;

    /// Read one word of target memory.
    fn read_word(&mut self, _addr: u32) -> Result<u32> {
        Err(Error::Unsupported("read_word"))
    }

    /// Read `nwords` words starting at `addr`.
    fn read_data(&mut self, _addr: u32, _nwords: u32) -> Result<Vec<u32>> {
        Err(Error::Unsupported("read_data"))
    }

    /// Verify `data` against target memory at `addr`.
    fn verify_data(&mut self, _addr: u32, _data: &[u32]) -> Result<()> {
        Err(Error::Unsupported("verify_data"))
    }

    /// Load the Programming Executive into target RAM and validate its
    /// version handshake.
    fn load_executive(&mut self, _pe: &[u32], _pe_version: u16) -> Result<()> {
        Err(Error::Unsupported("load_executive"))
    }

    /// Program a 1024-byte block (bootloader-style adapters).
    fn program_block(&mut self, _addr: u32, _data: &[u32]) -> Result<()> {
        Err(Error::Unsupported("program_block"))
    }

    /// Program one flash row.
    fn program_row(&mut self, _addr: u32, _data: &[u32]) -> Result<()> {
        Err(Error::Unsupported("program_row"))
    }

    /// Program a single word.
    fn program_word(&mut self, _addr: u32, _word: u32) -> Result<()> {
        Err(Error::Unsupported("program_word"))
    }

    /// Program two adjacent words (ECC-consistent write on MM parts).
    fn program_double_word(&mut self, _addr: u32, _w0: u32, _w1: u32) -> Result<()> {
        Err(Error::Unsupported("program_double_word"))
    }

    /// Program four adjacent words (ECC-consistent write on MZ/MK parts).
    fn program_quad_word(&mut self, _addr: u32, _words: [u32; 4]) -> Result<()> {
        Err(Error::Unsupported("program_quad_word"))
    }

    /// Erase the entire chip.
    fn erase_chip(&mut self) -> Result<()>;

    /// Shut the adapter down. Must be called exactly once; `power_on`
    /// leaves target power applied where the adapter controls it.
    fn close(&mut self, power_on: bool) -> Result<()>;
}
