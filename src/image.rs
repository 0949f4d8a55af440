//! Firmware image loading: Intel HEX and Motorola SREC readers filling
//! separate boot and program flash images, with dirty-block tracking so
//! untouched flash is neither programmed nor verified.

use std::fs;
use std::path::Path;

use pic32flash_core::{Error, Result};

/// Virtual base of program flash (KSEG0).
pub const FLASHV_BASE: u32 = 0x9d00_0000;
/// Virtual base of boot flash (KSEG0).
pub const BOOTV_BASE: u32 = 0x9fc0_0000;
/// Physical base of program flash.
pub const FLASHP_BASE: u32 = 0x1d00_0000;
/// Physical base of boot flash.
pub const BOOTP_BASE: u32 = 0x1fc0_0000;

/// Largest supported program flash image.
pub const FLASH_BYTES: usize = 2048 * 1024;
/// Largest supported boot flash image.
pub const BOOT_BYTES: usize = 80 * 1024;

/// Loaded firmware image.
pub struct FirmwareImage {
    /// Boot flash contents, erased state 0xFF.
    pub boot: Vec<u8>,
    /// Program flash contents, erased state 0xFF.
    pub flash: Vec<u8>,
    /// Whether any byte landed in the boot area.
    pub boot_used: bool,
    /// Whether any byte landed in the program area.
    pub flash_used: bool,
    /// Number of bytes stored.
    pub total_bytes: usize,
}

impl FirmwareImage {
    fn new() -> Self {
        FirmwareImage {
            boot: vec![0xff; BOOT_BYTES],
            flash: vec![0xff; FLASH_BYTES],
            boot_used: false,
            flash_used: false,
            total_bytes: 0,
        }
    }

    /// Load a HEX or SREC file, detected by content.
    pub fn load(path: &Path) -> Result<FirmwareImage> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut image = FirmwareImage::new();
        let loaded = if text.starts_with(':') {
            image.read_hex(&text, path)?;
            true
        } else if text.starts_with('S') {
            image.read_srec(&text, path)?;
            true
        } else {
            false
        };
        if !loaded {
            return Err(Error::Config(format!(
                "{}: unknown file format",
                path.display()
            )));
        }
        if image.total_bytes == 0 {
            return Err(Error::Config(format!(
                "{}: no data for the target address space",
                path.display()
            )));
        }
        Ok(image)
    }

    fn store_byte(&mut self, address: u32, byte: u8) {
        let (data, used, offset) = if (BOOTV_BASE..BOOTV_BASE + BOOT_BYTES as u32)
            .contains(&address)
        {
            (&mut self.boot, &mut self.boot_used, address - BOOTV_BASE)
        } else if (BOOTP_BASE..BOOTP_BASE + BOOT_BYTES as u32).contains(&address) {
            (&mut self.boot, &mut self.boot_used, address - BOOTP_BASE)
        } else if (FLASHV_BASE..FLASHV_BASE + FLASH_BYTES as u32).contains(&address) {
            (&mut self.flash, &mut self.flash_used, address - FLASHV_BASE)
        } else if (FLASHP_BASE..FLASHP_BASE + FLASH_BYTES as u32).contains(&address) {
            (&mut self.flash, &mut self.flash_used, address - FLASHP_BASE)
        } else {
            // Data outside the flash address space is ignored.
            return;
        };
        data[offset as usize] = byte;
        *used = true;
        self.total_bytes += 1;
    }

    fn read_hex(&mut self, text: &str, path: &Path) -> Result<()> {
        let bad = |line: usize, what: &str| {
            Error::Config(format!("{}:{}: {}", path.display(), line + 1, what))
        };
        let mut high: u32 = 0;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let line = line
                .strip_prefix(':')
                .ok_or_else(|| bad(lineno, "bad HEX record"))?;
            let raw = decode_hex(line).map_err(|e| bad(lineno, e))?;
            if raw.len() < 5 {
                return Err(bad(lineno, "too short hex line"));
            }
            let count = raw[0] as usize;
            if raw.len() != count + 5 {
                return Err(bad(lineno, "too short hex line"));
            }
            let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            if sum != 0 {
                return Err(bad(lineno, "bad HEX checksum"));
            }

            let record_type = raw[3];
            let address = u32::from(raw[1]) << 8 | u32::from(raw[2]);
            let data = &raw[4..4 + count];
            match record_type {
                0x00 => {
                    let mut address = high << 16 | address;
                    if address & 3 != 0 {
                        return Err(bad(lineno, "odd address"));
                    }
                    for &byte in data {
                        self.store_byte(address, byte);
                        address += 1;
                    }
                }
                0x01 => break,
                0x04 => {
                    if count != 2 {
                        return Err(bad(lineno, "invalid linear address record"));
                    }
                    high = u32::from(data[0]) << 8 | u32::from(data[1]);
                }
                // Start addresses carry no data.
                0x03 | 0x05 => {}
                other => {
                    return Err(bad(lineno, &format!("unknown HEX record type {}", other)))
                }
            }
        }
        Ok(())
    }

    fn read_srec(&mut self, text: &str, path: &Path) -> Result<()> {
        let bad = |line: usize, what: &str| {
            Error::Config(format!("{}:{}: {}", path.display(), line + 1, what))
        };
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let rest = line
                .strip_prefix('S')
                .ok_or_else(|| bad(lineno, "bad SREC record"))?;
            let mut chars = rest.chars();
            let kind = chars
                .next()
                .ok_or_else(|| bad(lineno, "bad SREC record"))?;
            // Termination records end the image.
            if matches!(kind, '7' | '8' | '9') {
                break;
            }
            let raw = decode_hex(chars.as_str()).map_err(|e| bad(lineno, e))?;
            if raw.len() < 3 {
                return Err(bad(lineno, "bad SREC record"));
            }
            let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            if sum != 0xff {
                return Err(bad(lineno, "bad SREC checksum"));
            }

            let addr_bytes = match kind {
                '1' => 2,
                '2' => 3,
                '3' => 4,
                // Header and count records carry no flash data.
                '0' | '5' | '6' => continue,
                _ => return Err(bad(lineno, "bad SREC record")),
            };
            if raw.len() < 1 + addr_bytes + 1 {
                return Err(bad(lineno, "bad SREC record"));
            }
            let mut address: u32 = 0;
            for &b in &raw[1..1 + addr_bytes] {
                address = address << 8 | u32::from(b);
            }
            for (i, &byte) in raw[1 + addr_bytes..raw.len() - 1].iter().enumerate() {
                self.store_byte(address + i as u32, byte);
            }
        }
        Ok(())
    }

    /// The four DEVCFG words, index N holding DEVCFGN, taken from the
    /// boot image at the family's offset.
    pub fn devcfg_words(&self, devcfg_offset: u32) -> [u32; 4] {
        let at = devcfg_offset as usize;
        let word = |o: usize| {
            u32::from_le_bytes(self.boot[o..o + 4].try_into().unwrap())
        };
        // DEVCFG3 sits at the lowest address.
        [word(at + 12), word(at + 8), word(at + 4), word(at)]
    }

    /// Clear DEVSIGN0 bit 31, required before programming MZ boot images.
    pub fn clear_mz_devsign(&mut self) {
        self.boot[0xffef] &= 0x7f;
    }

    /// Whether a program-flash block contains any data.
    pub fn flash_block_dirty(&self, offset: u32, blocksz: u32) -> bool {
        let at = offset as usize;
        self.flash[at..at + blocksz as usize].iter().any(|&b| b != 0xff)
    }

    /// Whether a boot-flash block contains any data. When the family
    /// programs its DEVCFG words separately, that window is ignored.
    pub fn boot_block_dirty(&self, offset: u32, blocksz: u32, devcfg_offset: Option<u32>) -> bool {
        let devcfg = devcfg_offset
            .map(|at| at as usize..at as usize + 16)
            .unwrap_or(0..0);
        (offset as usize..(offset + blocksz) as usize)
            .any(|i| !devcfg.contains(&i) && self.boot[i] != 0xff)
    }
}

fn decode_hex(s: &str) -> std::result::Result<Vec<u8>, &'static str> {
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| "bad hex digit"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_line(addr: u16, rtype: u8, data: &[u8]) -> String {
        let mut raw = vec![data.len() as u8, (addr >> 8) as u8, addr as u8, rtype];
        raw.extend_from_slice(data);
        let sum = raw.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        raw.push(sum.wrapping_neg());
        format!(
            ":{}",
            raw.iter().map(|b| format!("{:02X}", b)).collect::<String>()
        )
    }

    #[test]
    fn hex_image_lands_in_flash_and_boot() {
        let text = format!(
            "{}\n{}\n{}\n{}\n:00000001FF\n",
            hex_line(0, 4, &[0x1d, 0x00]),
            hex_line(0x0000, 0, &[1, 2, 3, 4]),
            hex_line(0, 4, &[0x1f, 0xc0]),
            hex_line(0x0010, 0, &[5, 6, 7, 8]),
        );
        let mut image = FirmwareImage::new();
        image.read_hex(&text, Path::new("test.hex")).unwrap();
        assert!(image.flash_used);
        assert!(image.boot_used);
        assert_eq!(&image.flash[0..4], &[1, 2, 3, 4]);
        assert_eq!(&image.boot[0x10..0x14], &[5, 6, 7, 8]);
        assert_eq!(image.total_bytes, 8);
    }

    #[test]
    fn hex_checksum_error_is_fatal() {
        let mut line = hex_line(0, 0, &[1, 2, 3, 4]);
        let len = line.len();
        line.replace_range(len - 2..len, "00");
        let mut image = FirmwareImage::new();
        assert!(image.read_hex(&line, Path::new("bad.hex")).is_err());
    }

    #[test]
    fn data_outside_flash_is_ignored() {
        let text = format!(
            "{}\n{}\n:00000001FF\n",
            hex_line(0, 4, &[(0x0000u32 >> 8) as u8, 0]),
            hex_line(0x1000, 0, &[1, 2, 3, 4]),
        );
        let mut image = FirmwareImage::new();
        image.read_hex(&text, Path::new("test.hex")).unwrap();
        assert_eq!(image.total_bytes, 0);
    }

    #[test]
    fn srec_image_roundtrip() {
        // S3 record: 4-byte address 0x9d000000, data de ad be ef.
        let payload: Vec<u8> = {
            let mut raw = vec![4 + 4 + 1u8, 0x9d, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef];
            let sum = raw.iter().fold(0u8, |a, b| a.wrapping_add(*b));
            raw.push(!sum);
            raw
        };
        let text = format!(
            "S3{}\nS70500000000FA\n",
            payload
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<String>()
        );
        let mut image = FirmwareImage::new();
        image.read_srec(&text, Path::new("test.srec")).unwrap();
        assert!(image.flash_used);
        assert_eq!(&image.flash[0..4], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn devcfg_words_come_out_high_register_first() {
        let mut image = FirmwareImage::new();
        let offset = 0x2ff0usize;
        image.boot[offset..offset + 4].copy_from_slice(&0x3333_3333u32.to_le_bytes());
        image.boot[offset + 12..offset + 16].copy_from_slice(&0x0000_0000u32.to_le_bytes());
        let devcfg = image.devcfg_words(offset as u32);
        assert_eq!(devcfg[3], 0x3333_3333); // DEVCFG3 from the low address
        assert_eq!(devcfg[0], 0x0000_0000);
    }

    #[test]
    fn boot_dirty_ignores_devcfg_words() {
        let mut image = FirmwareImage::new();
        let devcfg_offset = Some(0x2ff0u32);
        // Only DEVCFG data in this block.
        image.boot[0x2ff0] = 0x12;
        assert!(!image.boot_block_dirty(0x2e00, 0x200, devcfg_offset));
        // Other data in the same block makes it dirty.
        image.boot[0x2e04] = 0x34;
        assert!(image.boot_block_dirty(0x2e00, 0x200, devcfg_offset));
        // Without a separate fuse path, the DEVCFG bytes count too.
        assert!(image.boot_block_dirty(0x2e00, 0x200, None));
    }
}
