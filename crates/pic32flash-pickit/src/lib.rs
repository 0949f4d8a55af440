//! pic32flash-pickit - Microchip PICkit2/PICkit3 adapter
//!
//! The PICkit firmware runs a small script engine: TAP operations are
//! expressed as script opcodes downloaded over 64-byte HID reports and
//! executed in one round trip. PICkit3 needs the free scripting firmware
//! (not the MPLAB one) to accept the same commands as PICkit2.

pub mod device;
pub mod hid;
pub mod protocol;

use pic32flash_core::adapter::Adapter;
use pic32flash_core::Result;

use hid::{UsbHid, CHIPKIT_PID, MICROCHIP_VID, PICKIT2_PID, PICKIT3_PID};

/// Open a PICkit2. `vid` of zero autodetects the standard ID.
pub fn open_pickit2(vid: u16, pid: u16) -> Result<Option<Box<dyn Adapter>>> {
    let hid = if vid != 0 {
        UsbHid::open(vid, pid)?
    } else {
        UsbHid::open(MICROCHIP_VID, PICKIT2_PID)?
    };
    match hid {
        Some(hid) => device::open_pickit(hid, false).map(Some),
        None => Ok(None),
    }
}

/// Open a PICkit3 (or a chipKIT programmer). `vid` of zero autodetects.
pub fn open_pickit3(vid: u16, pid: u16) -> Result<Option<Box<dyn Adapter>>> {
    let hid = if vid != 0 {
        UsbHid::open(vid, pid)?
    } else {
        match UsbHid::open(MICROCHIP_VID, PICKIT3_PID)? {
            Some(hid) => Some(hid),
            None => UsbHid::open(MICROCHIP_VID, CHIPKIT_PID)?,
        }
    };
    match hid {
        Some(hid) => device::open_pickit(hid, true).map(Some),
        None => Ok(None),
    }
}
