//! AN1388 over USB HID: one frame per padded 64-byte report.

use futures_lite::future::block_on;
use nusb::transfer::RequestBuffer;
use pic32flash_core::{Error, Result};

use crate::device::FrameIo;
use crate::protocol::EOT;

const REPORT_SIZE: usize = 64;
const EP_OUT: u8 = 0x01;
const EP_IN: u8 = 0x81;

/// Microchip vendor ID.
pub const MICROCHIP_VID: u16 = 0x04d8;
/// AN1388 bootloader product ID.
pub const BOOTLOADER_PID: u16 = 0x003c;

/// HID transport for the AN1388 protocol.
pub struct HidTransport {
    interface: nusb::Interface,
}

impl HidTransport {
    /// Open the first device matching `vid:pid`.
    pub fn open(vid: u16, pid: u16) -> Result<Option<HidTransport>> {
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
        Ok(Some(HidTransport { interface }))
    }
}

impl FrameIo for HidTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        // The report is padded with EOT, which the decoder treats as
        // inter-frame filler.
        let mut report = vec![EOT; REPORT_SIZE];
        report[..frame.len()].copy_from_slice(frame);
        let completion = block_on(self.interface.interrupt_out(EP_OUT, report));
        completion
            .status
            .map_err(|e| Error::Transport(format!("hid write: {}", e)))
    }

    fn recv_chunk(&mut self) -> Result<Vec<u8>> {
        let completion =
            block_on(self.interface.interrupt_in(EP_IN, RequestBuffer::new(REPORT_SIZE)));
        completion
            .status
            .map_err(|e| Error::Transport(format!("hid read: {}", e)))?;
        Ok(completion.data)
    }
}
