//! Static PIC32 family descriptors.
//!
//! A family bundles everything about a device line that the programming
//! protocol needs: boot area geometry, DEVCFG placement, row size and the
//! Programming Executive used to accelerate flash access. The PE machine
//! code itself is a Microchip-distributed binary loaded at run time (see
//! [`crate::pe`]); the descriptor names the image and pins down its word
//! count and version handshake.

use crate::pe;

/// Device line, selecting per-family protocol variations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyKind {
    /// PIC32MX1xx/2xx.
    Mx1,
    /// PIC32MX3xx-7xx.
    Mx3,
    /// PIC32MZ (EC/EF/DA).
    Mz,
    /// PIC32MM.
    Mm,
    /// PIC32MK.
    Mk,
    /// Pseudo-family for bootloader adapters where the real device is
    /// unknown; geometry is the maximum over all families.
    Bootloader,
}

impl FamilyKind {
    /// Whether the PE bootstrap must configure the BMX bus matrix before
    /// RAM above the kernel partition is usable.
    pub fn needs_bus_matrix_setup(self) -> bool {
        matches!(self, FamilyKind::Mx1 | FamilyKind::Mx3 | FamilyKind::Mk)
    }

    /// MZ devices fault on the MCHP FLASH_ENABLE opcode; everything else
    /// requires it during the serial-execution bootstrap.
    pub fn supports_flash_enable(self) -> bool {
        !matches!(self, FamilyKind::Mz)
    }

    /// MZ devices need an extra DEASSERT_RST after the ERASE opcode.
    pub fn erase_needs_deassert(self) -> bool {
        matches!(self, FamilyKind::Mz)
    }
}

/// Programming Executive description for one family.
#[derive(Debug)]
pub struct PeSpec {
    /// File name of the PE image (Intel HEX), looked up in the PE
    /// directory at run time.
    pub image: &'static str,
    /// Number of 32-bit words in the PE.
    pub nwords: u32,
    /// Expected version reported by the EXEC_VERSION handshake.
    pub version: u16,
    /// RAM address the PE is linked at; the loader streams it there.
    pub ram_addr: u32,
    /// RAM address the loader itself is injected at.
    pub loader_addr: u32,
    /// Loader machine code as 16-bit immediate halves, hi/lo pairs.
    pub loader: &'static [u16],
}

/// Static family descriptor.
#[derive(Debug)]
pub struct Family {
    /// Family name as used in device table extension files.
    pub name: &'static str,
    /// Protocol variation selector.
    pub kind: FamilyKind,
    /// Boot flash size in kilobytes.
    pub boot_kbytes: u32,
    /// Byte offset of the DEVCFG registers within the boot area.
    pub devcfg_offset: u32,
    /// Flash row size in bytes (one PE row-program granule).
    pub bytes_per_row: u32,
    /// Programming Executive, absent for the bootloader pseudo-family.
    pub pe: Option<PeSpec>,
}

impl Family {
    /// Words per flash row.
    pub fn words_per_row(&self) -> u32 {
        self.bytes_per_row / 4
    }

    /// Look a family up by its extension-file name.
    pub fn by_name(name: &str) -> Option<&'static Family> {
        match name.to_ascii_uppercase().as_str() {
            "MX1" => Some(&MX1),
            "MX3" => Some(&MX3),
            "MZ" => Some(&MZ),
            "MK" => Some(&MK),
            "MM_GPL" => Some(&MM_GPL),
            "MM_GPM" => Some(&MM_GPM),
            _ => None,
        }
    }
}

/// PIC32MX1xx/2xx.
pub static MX1: Family = Family {
    name: "mx1",
    kind: FamilyKind::Mx1,
    boot_kbytes: 3,
    devcfg_offset: 0x0bf0,
    bytes_per_row: 128,
    pe: Some(PeSpec {
        image: "RIPE_11_aa.hex",
        nwords: 422,
        version: 0x0301,
        ram_addr: 0xa000_0900,
        loader_addr: 0xa000_0800,
        loader: &pe::PE_LOADER,
    }),
};

/// PIC32MX3xx-7xx.
pub static MX3: Family = Family {
    name: "mx3",
    kind: FamilyKind::Mx3,
    boot_kbytes: 12,
    devcfg_offset: 0x2ff0,
    bytes_per_row: 512,
    pe: Some(PeSpec {
        image: "RIPE_06_aa.hex",
        nwords: 1044,
        version: 0x0201,
        ram_addr: 0xa000_0900,
        loader_addr: 0xa000_0800,
        loader: &pe::PE_LOADER,
    }),
};

/// PIC32MZ EC/EF/DA.
pub static MZ: Family = Family {
    name: "mz",
    kind: FamilyKind::Mz,
    boot_kbytes: 80,
    devcfg_offset: 0xffc0,
    bytes_per_row: 2048,
    pe: Some(PeSpec {
        image: "RIPE_15_aa.hex",
        nwords: 1052,
        version: 0x0502,
        ram_addr: 0xa000_0900,
        loader_addr: 0xa000_0800,
        loader: &pe::PE_LOADER,
    }),
};

/// PIC32MK.
pub static MK: Family = Family {
    name: "mk",
    kind: FamilyKind::Mk,
    boot_kbytes: 16,
    devcfg_offset: 0x3fc0,
    bytes_per_row: 512,
    pe: Some(PeSpec {
        image: "RIPE_20_aa.hex",
        nwords: 804,
        version: 0x0506,
        ram_addr: 0xa000_0900,
        loader_addr: 0xa000_0800,
        loader: &pe::PE_LOADER,
    }),
};

/// PIC32MM GPL line.
pub static MM_GPL: Family = Family {
    name: "mm_gpl",
    kind: FamilyKind::Mm,
    boot_kbytes: 4,
    devcfg_offset: 0x1700,
    bytes_per_row: 256,
    pe: Some(PeSpec {
        image: "RIPE_14_aa.hex",
        nwords: 555,
        version: 0x0510,
        ram_addr: 0xa000_0300,
        loader_addr: 0xa000_0200,
        loader: &pe::PEMM_LOADER,
    }),
};

/// PIC32MM GPM line.
pub static MM_GPM: Family = Family {
    name: "mm_gpm",
    kind: FamilyKind::Mm,
    boot_kbytes: 4,
    devcfg_offset: 0x1700,
    bytes_per_row: 256,
    pe: Some(PeSpec {
        image: "RIPE_14_aa.hex",
        nwords: 555,
        version: 0x0510,
        ram_addr: 0xa000_0300,
        loader_addr: 0xa000_0200,
        loader: &pe::PEMM_LOADER,
    }),
};

/// Placeholder for bootloader adapters: maximum geometry, no PE.
pub static BOOTLOADER: Family = Family {
    name: "bootloader",
    kind: FamilyKind::Bootloader,
    boot_kbytes: 80,
    devcfg_offset: 0,
    bytes_per_row: 1024,
    pe: None,
};
