//! pic32flash-hidboot - USB HID bootloader adapters
//!
//! Two resident-bootloader protocols over 64-byte HID reports: the
//! classic Microchip HID bootloader and the mikroE UHB bootloader.
//! Neither can probe the real device ID; both report the bootloader
//! pseudo-ID and dictate the programmable area themselves.

pub mod hid;
pub mod hidboot;
pub mod uhb;

use pic32flash_core::adapter::Adapter;
use pic32flash_core::Result;

use hid::UsbHid;

/// Microchip vendor ID.
pub const MICROCHIP_VID: u16 = 0x04d8;
/// Microchip HID bootloader.
pub const BOOTLOADER_PID: u16 = 0x003c;
/// Maximite bootloader.
pub const MAXIMITE_PID: u16 = 0xfa8d;
/// Olimex vendor ID.
pub const OLIMEX_VID: u16 = 0x15ba;
/// Olimex Duinomite bootloader.
pub const DUINOMITE_PID: u16 = 0x0032;
/// mikroElektronika bootloader IDs.
pub const MIKROE_VID: u16 = 0x1234;
pub const MIKROEBOOT_PID: u16 = 0x0001;

/// Open a Microchip HID bootloader. `vid` of zero tries the known IDs.
pub fn open_hidboot(vid: u16, pid: u16) -> Result<Option<Box<dyn Adapter>>> {
    let hid = if vid != 0 {
        UsbHid::open(vid, pid)?
    } else {
        match UsbHid::open(MICROCHIP_VID, BOOTLOADER_PID)? {
            Some(h) => Some(h),
            None => match UsbHid::open(MICROCHIP_VID, MAXIMITE_PID)? {
                Some(h) => Some(h),
                None => UsbHid::open(OLIMEX_VID, DUINOMITE_PID)?,
            },
        }
    };
    match hid {
        Some(hid) => hidboot::open_hidboot(hid).map(Some),
        None => Ok(None),
    }
}

/// Open a mikroE UHB bootloader. `vid` of zero uses the standard ID.
pub fn open_uhb(vid: u16, pid: u16) -> Result<Option<Box<dyn Adapter>>> {
    let hid = if vid != 0 {
        UsbHid::open(vid, pid)?
    } else {
        UsbHid::open(MIKROE_VID, MIKROEBOOT_PID)?
    };
    match hid {
        Some(hid) => uhb::open_uhb(hid).map(Some),
        None => Ok(None),
    }
}
