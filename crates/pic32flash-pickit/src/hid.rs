//! HID report transport over nusb interrupt endpoints.

use futures_lite::future::block_on;
use nusb::transfer::RequestBuffer;
use pic32flash_core::{Error, Result};

use crate::protocol::REPORT_SIZE;

const EP_OUT: u8 = 0x01;
const EP_IN: u8 = 0x81;

/// Microchip vendor ID.
pub const MICROCHIP_VID: u16 = 0x04d8;
/// PICkit 2.
pub const PICKIT2_PID: u16 = 0x0033;
/// PICkit 3 (with the scripting firmware).
pub const PICKIT3_PID: u16 = 0x900a;
/// chipKIT programmer (PICkit3 compatible).
pub const CHIPKIT_PID: u16 = 0x8108;

/// 64-byte report transport.
pub trait HidIo {
    /// Send one output report.
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<()>;
    /// Receive one input report.
    fn read_report(&mut self, report: &mut [u8; REPORT_SIZE]) -> Result<()>;
}

/// nusb-backed HID transport.
pub struct UsbHid {
    interface: nusb::Interface,
}

impl UsbHid {
    /// Open the first device matching `vid:pid`.
    pub fn open(vid: u16, pid: u16) -> Result<Option<UsbHid>> {
        let mut devices = nusb::list_devices()
            .map_err(|e| Error::Transport(format!("usb enumeration: {}", e)))?;
        let Some(info) = devices.find(|d| d.vendor_id() == vid && d.product_id() == pid)
        else {
            return Ok(None);
        };
        let device = info
            .open()
            .map_err(|e| Error::Transport(format!("usb open: {}", e)))?;
        let interface = device
            .detach_and_claim_interface(0)
            .map_err(|e| Error::Transport(format!("claim interface: {}", e)))?;
        Ok(Some(UsbHid { interface }))
    }
}

impl HidIo for UsbHid {
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<()> {
        let completion = block_on(self.interface.interrupt_out(EP_OUT, report.to_vec()));
        completion
            .status
            .map_err(|e| Error::Transport(format!("hid write: {}", e)))
    }

    fn read_report(&mut self, report: &mut [u8; REPORT_SIZE]) -> Result<()> {
        let completion =
            block_on(self.interface.interrupt_in(EP_IN, RequestBuffer::new(REPORT_SIZE)));
        completion
            .status
            .map_err(|e| Error::Transport(format!("hid read: {}", e)))?;
        if completion.data.len() != REPORT_SIZE {
            return Err(Error::Transport(format!(
                "hid read returned {} bytes",
                completion.data.len()
            )));
        }
        report.copy_from_slice(&completion.data);
        Ok(())
    }
}
