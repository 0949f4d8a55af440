//! CLI argument parsing.

use clap::{Parser, Subcommand, ValueEnum};
use pic32flash_core::adapter::VerifyPolicy;
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32.
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("invalid number: {}", e))
    }
}

#[derive(Parser)]
#[command(name = "pic32flash")]
#[command(author, version, about = "Flash programmer for Microchip PIC32 microcontrollers", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv for wire traces)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Adapter port. USB adapters are autodetected when omitted; serial
    /// adapters take "[proto:]port" (protocols: stk500 (default), ascii,
    /// an1388); USB adapters take "proto:vid:pid" (protocols: pickit2,
    /// pickit3, hidboot, an1388, uhb, mpsse)
    #[arg(short = 'd', long, global = true)]
    pub port: Option<String>,

    /// Serial port baud rate
    #[arg(short = 'b', long, default_value_t = 115_200, global = true)]
    pub baud: u32,

    /// Alternate baud rate offered to STK500v2 bootloaders
    #[arg(short = 'B', long, global = true)]
    pub alternate_baud: Option<u32>,

    /// Leave target power applied when closing
    #[arg(short = 'p', long, global = true)]
    pub power_on: bool,

    /// Whether a checksum-verify mismatch aborts the session
    #[arg(long, value_enum, default_value_t = VerifyPolicyArg::Strict, global = true)]
    pub verify_policy: VerifyPolicyArg,

    /// Directory holding the Programming Executive images
    #[arg(long, global = true)]
    pub pe_dir: Option<PathBuf>,

    /// Device table extension file (RON)
    #[arg(long, global = true)]
    pub device_table: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Verify policy as a CLI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VerifyPolicyArg {
    /// Abort on mismatch.
    Strict,
    /// Log and continue.
    Warn,
}

impl From<VerifyPolicyArg> for VerifyPolicy {
    fn from(arg: VerifyPolicyArg) -> Self {
        match arg {
            VerifyPolicyArg::Strict => VerifyPolicy::Strict,
            VerifyPolicyArg::Warn => VerifyPolicy::Warn,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Detect the target and show device information
    Probe,

    /// Program a firmware image (HEX or SREC) into flash
    Program {
        /// Firmware image file
        file: PathBuf,

        /// Compare flash against the image without programming
        #[arg(long)]
        verify_only: bool,

        /// Skip the verify pass after programming
        #[arg(short = 'S', long)]
        skip_verify: bool,
    },

    /// Compare flash contents against a firmware image
    Verify {
        /// Firmware image file
        file: PathBuf,
    },

    /// Read flash contents into a binary file
    Read {
        /// Output file
        file: PathBuf,

        /// Start address (hex or decimal; program flash when omitted)
        #[arg(value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Number of bytes to read
        #[arg(value_parser = parse_hex_u32)]
        nbytes: Option<u32>,
    },

    /// Erase the whole chip
    Erase,
}
