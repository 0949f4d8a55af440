//! EJTAG/MTAP protocol: instruction sets, register bits and the
//! transport-agnostic engine driving them over a [`crate::channel::BitChannel`].

mod engine;
mod generic;
#[cfg(test)]
pub(crate) mod mock;

pub use engine::TapEngine;
pub use generic::JtagAdapter;

/// 5-bit TAP instructions selecting a controller.
pub mod tap {
    /// Switch to the Microchip TAP controller.
    pub const SW_MTAP: u32 = 4;
    /// Switch to the EJTAG TAP controller.
    pub const SW_ETAP: u32 = 5;
}

/// MTAP-specific instructions.
pub mod mtap {
    /// Select the chip identification register.
    pub const IDCODE: u32 = 1;
    /// Connect to the MCHP command register.
    pub const COMMAND: u32 = 7;
}

/// ETAP-specific instructions.
pub mod etap {
    /// Device identification.
    pub const IDCODE: u32 = 1;
    /// Implementation register.
    pub const IMPCODE: u32 = 3;
    /// Select the Address register.
    pub const ADDRESS: u32 = 8;
    /// Select the Data register.
    pub const DATA: u32 = 9;
    /// Select the EJTAG Control register.
    pub const CONTROL: u32 = 10;
    /// Select Address, Data and Control registers at once.
    pub const ALL: u32 = 11;
    /// Take a debug exception on the next reset.
    pub const EJTAGBOOT: u32 = 12;
    /// Enter the reset handler on the next reset.
    pub const NORMALBOOT: u32 = 13;
    /// Select the FastData register.
    pub const FASTDATA: u32 = 14;
}

/// Microchip DR commands, shifted through the 8-bit MCHP command register.
pub mod mchp {
    /// Return status (the only command with a meaningful reply).
    pub const STATUS: u32 = 0x00;
    /// Assert device reset.
    pub const ASSERT_RST: u32 = 0xd1;
    /// Remove device reset.
    pub const DEASSERT_RST: u32 = 0xd0;
    /// Flash chip erase.
    pub const ERASE: u32 = 0xfc;
    /// Enable CPU access to flash.
    pub const FLASH_ENABLE: u32 = 0xfe;
    /// Disable CPU access to flash.
    pub const FLASH_DISABLE: u32 = 0xfd;

    /// Device is NOT code protected.
    pub const STATUS_CPS: u32 = 0x80;
    /// Error occurred during an NVM operation.
    pub const STATUS_NVMERR: u32 = 0x20;
    /// Configuration has been read; the CPS bit is valid.
    pub const STATUS_CFGRDY: u32 = 0x08;
    /// Flash controller busy (erase in progress).
    pub const STATUS_FCBUSY: u32 = 0x04;
    /// Flash access enabled.
    pub const STATUS_FAEN: u32 = 0x02;
    /// Device reset active.
    pub const STATUS_DEVRST: u32 = 0x01;
}

/// EJTAG Control register bits.
pub mod control {
    /// Reset occurred.
    pub const ROCC: u32 = 1 << 31;
    /// Pending processor access.
    pub const PRACC: u32 = 1 << 18;
    /// Probe will service processor accesses.
    pub const PROBEN: u32 = 1 << 15;
    /// Debug vector at 0xff200200.
    pub const PROBTRAP: u32 = 1 << 14;
    /// Debug interrupt exception.
    pub const EJTAGBRK: u32 = 1 << 12;
    /// Debug mode.
    pub const DM: u32 = 1 << 3;
}

/// Programming Executive command opcodes.
pub mod pe_op {
    /// Program one row of flash memory.
    pub const ROW_PROGRAM: u32 = 0x0;
    /// Read N 32-bit words.
    pub const READ: u32 = 0x1;
    /// Program flash memory.
    pub const PROGRAM: u32 = 0x2;
    /// Program one word of flash memory.
    pub const WORD_PROGRAM: u32 = 0x3;
    /// Erase the entire chip.
    pub const CHIP_ERASE: u32 = 0x4;
    /// Erase pages by address.
    pub const PAGE_ERASE: u32 = 0x5;
    /// Check blank memory.
    pub const BLANK_CHECK: u32 = 0x6;
    /// Read the PE software version.
    pub const EXEC_VERSION: u32 = 0x7;
    /// Get the checksum of memory.
    pub const GET_CRC: u32 = 0x8;
    /// Program N bytes.
    pub const PROGRAM_CLUSTER: u32 = 0x9;
    /// Return the hardware ID of the device.
    pub const GET_DEVICEID: u32 = 0xa;
    /// Change PE settings.
    pub const CHANGE_CFG: u32 = 0xb;
    /// Program four words at the specified address.
    pub const QUAD_WORD_PROGRAM: u32 = 0xd;
    /// Program two words at the specified address.
    pub const DOUBLE_WORD_PROGRAM: u32 = 0xe;
}
