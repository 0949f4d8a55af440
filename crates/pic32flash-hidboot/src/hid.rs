//! HID report transport over nusb interrupt endpoints.

use std::time::Duration;

use futures_lite::future::block_on;
use nusb::transfer::RequestBuffer;
use pic32flash_core::{Error, Result};

/// Report size in both directions.
pub const REPORT_SIZE: usize = 64;

const EP_OUT: u8 = 0x01;
const EP_IN: u8 = 0x81;

/// 64-byte report transport; abstracted so the protocol is testable.
pub trait HidIo {
    /// Send one output report.
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<()>;
    /// Receive one input report within `timeout`; `Ok(false)` on timeout.
    fn read_report(&mut self, report: &mut [u8; REPORT_SIZE], timeout: Duration)
        -> Result<bool>;
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

    fn read_report(
        &mut self,
        report: &mut [u8; REPORT_SIZE],
        _timeout: Duration,
    ) -> Result<bool> {
        let completion =
            block_on(self.interface.interrupt_in(EP_IN, RequestBuffer::new(REPORT_SIZE)));
        completion
            .status
            .map_err(|e| Error::Transport(format!("hid read: {}", e)))?;
        if completion.data.is_empty() {
            return Ok(false);
        }
        if completion.data.len() != REPORT_SIZE {
            return Err(Error::Transport(format!(
                "hid read returned {} bytes",
                completion.data.len()
            )));
        }
        report.copy_from_slice(&completion.data);
        Ok(true)
    }
}
