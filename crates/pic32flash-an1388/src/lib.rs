//! pic32flash-an1388 - Microchip AN1388 bootloader adapter
//!
//! The AN1388 application note defines one framed protocol (SOH/EOT/DLE
//! escaping with a CRC-16) carried over several media; this crate
//! implements the framing once and provides USB-HID and UART transports
//! for it.

pub mod device;
pub mod hid;
pub mod protocol;
pub mod uart;

use pic32flash_core::adapter::Adapter;
use pic32flash_core::Result;

use hid::{HidTransport, BOOTLOADER_PID, MICROCHIP_VID};
use uart::UartTransport;

/// Open an AN1388 bootloader over USB HID. `vid` of zero autodetects.
pub fn open_usb(vid: u16, pid: u16) -> Result<Option<Box<dyn Adapter>>> {
    let transport = if vid != 0 {
        HidTransport::open(vid, pid)?
    } else {
        HidTransport::open(MICROCHIP_VID, BOOTLOADER_PID)?
    };
    match transport {
        Some(t) => device::open_an1388(t, "AN1388 Bootloader").map(Some),
        None => Ok(None),
    }
}

/// Open an AN1388 bootloader over a serial port.
pub fn open_uart(port: &str, baud: u32) -> Result<Box<dyn Adapter>> {
    let transport = UartTransport::open(port, baud)?;
    device::open_an1388(transport, "AN1388 UART Bootloader")
}
