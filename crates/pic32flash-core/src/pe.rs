//! Programming Executive loader tables and image loading.
//!
//! The loader is a tiny RAM-resident routine injected instruction by
//! instruction through the EJTAG port. Once running, it receives the much
//! larger PE binary over the FastData channel and jumps into it. The
//! tables below hold the loader machine code as 16-bit halves; the
//! injection path rebuilds each 32-bit word with a `lui`/`ori` pair.
//!
//! The PE binaries themselves are Microchip-distributed blobs shipped as
//! Intel-HEX images next to the tool, not embedded in the source tree.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::family::PeSpec;

/// FastData receive loop for MIPS32 devices (MX/MZ/MK). Waits for the
/// word count announcement, copies that many words from the FastData
/// mailbox to the destination address, then jumps to the PE entry at
/// 0xa0000900 when the 0xDEAD0000 sentinel arrives.
pub static PE_LOADER: [u16; 42] = [
    0x3c07, 0xdead, // lui a3, 0xdead
    0x3c06, 0xff20, // lui a2, 0xff20
    0x3c05, 0xff20, // lui a1, 0xff20
    // L1:
    0x8cc4, 0x0000, // lw  a0, 0(a2)
    0x8cc3, 0x0000, // lw  v1, 0(a2)
    0x1067, 0x000b, // beq v1, a3, L2
    0x0000, 0x0000, // nop
    0x1060, 0xfffb, // beqz v1, L1
    0x0000, 0x0000, // nop
    // L3:
    0x8ca2, 0x0000, // lw  v0, 0(a1)
    0x2463, 0xffff, // addiu v1, -1
    0xac82, 0x0000, // sw  v0, 0(a0)
    0x2484, 0x0004, // addiu a0, 4
    0x1460, 0xfffb, // bnez v1, L3
    0x0000, 0x0000, // nop
    0x1000, 0xfff3, // b   L1
    0x0000, 0x0000, // nop
    // L2:
    0x3c02, 0xa000, // lui v0, 0xa000
    0x3442, 0x0900, // ori v0, 0x900
    0x0040, 0x0008, // jr  v0
    0x0000, 0x0000, // nop
];

/// FastData receive loop for PIC32MM devices, microMIPS encoding.
/// Same structure as [`PE_LOADER`], jumping to the PE entry at
/// 0xa0000300.
pub static PEMM_LOADER: [u16; 28] = [
    0x41a7, 0xdead,
    0x41a6, 0xff20,
    0x41a5, 0xff20,
    0xfc86, 0x0000,
    0xfc66, 0x0000,
    0x94e3, 0x000a,
    0x0c00, 0x0c00,
    0x9403, 0xfff6,
    0xfc45, 0x0000,
    0x3063, 0xffff,
    0xf844, 0x0000,
    0x3084, 0x0004,
    0xb403, 0xfff6,
    0x4582, 0x0183,
];

/// A PE binary loaded from its distribution image.
#[derive(Debug)]
pub struct PeImage {
    /// PE machine code, one word per flash-programming-spec "PE word".
    pub words: Vec<u32>,
    /// Expected version handshake value.
    pub version: u16,
}

impl PeImage {
    /// Load the PE image named by `spec`, searching `pe_dir` first and
    /// the installed data directory second.
    pub fn load(spec: &PeSpec, pe_dir: Option<&Path>) -> Result<PeImage> {
        let path = locate(spec.image, pe_dir)?;
        let text = fs::read_to_string(&path)?;
        let words = parse_hex_words(&text).map_err(|reason| Error::PeImage {
            path: path.display().to_string(),
            reason,
        })?;
        if words.len() < spec.nwords as usize {
            return Err(Error::PeImage {
                path: path.display().to_string(),
                reason: format!(
                    "image has {} words, family needs {}",
                    words.len(),
                    spec.nwords
                ),
            });
        }
        Ok(PeImage {
            words: words[..spec.nwords as usize].to_vec(),
            version: spec.version,
        })
    }
}

/// Default installed location of the PE images.
pub const DEFAULT_PE_DIR: &str = "/usr/share/pic32flash/pe";

fn locate(image: &str, pe_dir: Option<&Path>) -> Result<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = pe_dir {
        candidates.push(dir.join(image));
    }
    candidates.push(Path::new(DEFAULT_PE_DIR).join(image));
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    Err(Error::PeImage {
        path: image.to_string(),
        reason: "image not found (use --pe-dir to point at the PE images)".into(),
    })
}

/// Parse an Intel-HEX PE image into a flat little-endian word vector.
/// The images are contiguous, so only data and extended-address records
/// matter; gaps or odd alignment mean a damaged file.
fn parse_hex_words(text: &str) -> std::result::Result<Vec<u32>, String> {
    let mut bytes = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line = line
            .strip_prefix(':')
            .ok_or_else(|| format!("line {}: missing ':' prefix", lineno + 1))?;
        let raw = decode_hex(line).map_err(|e| format!("line {}: {}", lineno + 1, e))?;
        if raw.len() < 5 {
            return Err(format!("line {}: truncated record", lineno + 1));
        }
        let count = raw[0] as usize;
        if raw.len() != count + 5 {
            return Err(format!("line {}: length mismatch", lineno + 1));
        }
        let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(format!("line {}: bad record checksum", lineno + 1));
        }
        match raw[3] {
            0x00 => bytes.extend_from_slice(&raw[4..4 + count]),
            0x01 => break,
            // Address records are irrelevant for a contiguous blob.
            0x02 | 0x04 | 0x05 => {}
            other => return Err(format!("line {}: record type {:#04x}", lineno + 1, other)),
        }
    }
    if bytes.len() % 4 != 0 {
        return Err(format!("image size {} is not word aligned", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn decode_hex(s: &str) -> std::result::Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| "bad hex digit".into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_tables_are_hi_lo_pairs() {
        assert_eq!(PE_LOADER.len() % 2, 0);
        assert_eq!(PEMM_LOADER.len() % 2, 0);
    }

    fn hex_record(addr: u16, data: &[u8]) -> String {
        let mut raw = vec![data.len() as u8, (addr >> 8) as u8, addr as u8, 0x00];
        raw.extend_from_slice(data);
        let sum = raw.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        raw.push(sum.wrapping_neg());
        let body: String = raw.iter().map(|b| format!("{:02X}", b)).collect();
        format!(":{}", body)
    }

    #[test]
    fn parses_contiguous_image() {
        let image = format!(
            "{}\n{}\n:00000001FF\n",
            hex_record(0, &[0x78, 0x56, 0x34, 0x12]),
            hex_record(4, &[0xef, 0xbe, 0xad, 0xde]),
        );
        let words = parse_hex_words(&image).unwrap();
        assert_eq!(words, vec![0x12345678, 0xdeadbeef]);
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut record = hex_record(0, &[1, 2, 3, 4]);
        // Corrupt one data digit.
        record.replace_range(9..10, "f");
        assert!(parse_hex_words(&record).is_err());
    }

    #[test]
    fn rejects_unaligned_image() {
        let image = format!("{}\n:00000001FF\n", hex_record(0, &[1, 2, 3]));
        assert!(parse_hex_words(&image).is_err());
    }
}
