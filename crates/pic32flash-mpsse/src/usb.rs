//! FTDI device discovery and bulk I/O over nusb.

use futures_lite::future::block_on;
use nusb::transfer::{ControlOut, ControlType, Recipient, RequestBuffer};
use pic32flash_core::{Error, Result};

use crate::channel::ResetLines;

/// Bulk endpoint towards the FTDI chip.
const EP_OUT: u8 = 0x02;
/// Bulk endpoint from the FTDI chip.
const EP_IN: u8 = 0x81;

/// FTDI vendor requests.
const SIO_RESET: u8 = 0;
const SIO_SET_LATENCY_TIMER: u8 = 9;
const SIO_SET_BITMODE: u8 = 11;

/// One supported adapter model.
pub struct FtdiModel {
    pub vid: u16,
    pub pid: u16,
    pub name: &'static str,
    /// Base clock in MHz (6 for FT2232D, 30 for H parts).
    pub mhz: u32,
    pub reset: ResetLines,
    /// Product string to disambiguate shared VID:PID pairs.
    pub product: Option<&'static str>,
}

/// Known FT2232-based JTAG adapters.
pub static MODELS: &[FtdiModel] = &[
    FtdiModel {
        vid: 0x15ba,
        pid: 0x0004,
        name: "Olimex ARM-USB-Tiny",
        mhz: 6,
        reset: ResetLines {
            dir_control: 0x0f10,
            trst_control: 0x0100,
            trst_inverted: true,
            sysrst_control: 0x0200,
            sysrst_inverted: false,
            led_control: 0x0800,
            led_inverted: false,
        },
        product: None,
    },
    FtdiModel {
        vid: 0x15ba,
        pid: 0x002a,
        name: "Olimex ARM-USB-Tiny-H",
        mhz: 30,
        reset: ResetLines {
            dir_control: 0x0f10,
            trst_control: 0x0100,
            trst_inverted: true,
            sysrst_control: 0x0200,
            sysrst_inverted: false,
            led_control: 0x0800,
            led_inverted: false,
        },
        product: None,
    },
    FtdiModel {
        vid: 0x15ba,
        pid: 0x002b,
        name: "Olimex ARM-USB-OCD-H",
        mhz: 30,
        reset: ResetLines {
            dir_control: 0x0f10,
            trst_control: 0x0100,
            trst_inverted: true,
            sysrst_control: 0x0200,
            sysrst_inverted: false,
            led_control: 0x0800,
            led_inverted: false,
        },
        product: None,
    },
    FtdiModel {
        vid: 0x15ba,
        pid: 0x0036,
        name: "Olimex MIPS-USB-OCD-H",
        mhz: 30,
        reset: ResetLines {
            dir_control: 0x0f10,
            trst_control: 0x0100,
            trst_inverted: true,
            sysrst_control: 0x0200,
            sysrst_inverted: true,
            led_control: 0x0800,
            led_inverted: false,
        },
        product: None,
    },
    FtdiModel {
        vid: 0x0403,
        pid: 0x6010,
        name: "TinCanTools Flyswatter",
        mhz: 6,
        reset: ResetLines {
            dir_control: 0x0cf0,
            trst_control: 0x0010,
            trst_inverted: true,
            sysrst_control: 0x0020,
            sysrst_inverted: true,
            led_control: 0x0c00,
            led_inverted: true,
        },
        product: Some("Flyswatter"),
    },
    FtdiModel {
        vid: 0x0403,
        pid: 0x6010,
        name: "Dangerous Prototypes Bus Blaster",
        mhz: 30,
        reset: ResetLines {
            dir_control: 0x0f10,
            trst_control: 0x0100,
            trst_inverted: true,
            sysrst_control: 0x0200,
            sysrst_inverted: true,
            led_control: 0x0000,
            led_inverted: false,
        },
        product: None,
    },
];

/// Bulk transport under the MPSSE channel.
pub trait UsbBulk {
    /// Write one MPSSE packet.
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Read up to `buf.len()` bytes, including the status prefix.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// An opened FTDI device in MPSSE mode.
pub struct FtdiUsb {
    interface: nusb::Interface,
}

impl FtdiUsb {
    /// Find a known adapter, optionally restricted to `vid:pid`, and
    /// switch it into MPSSE mode. Returns the device and its model.
    pub fn open(vid: u16, pid: u16) -> Result<(FtdiUsb, &'static FtdiModel)> {
        let devices = nusb::list_devices()
            .map_err(|e| Error::Transport(format!("usb enumeration: {}", e)))?
            .collect::<Vec<_>>();

        for model in MODELS {
            if vid != 0 && (model.vid != vid || model.pid != pid) {
                continue;
            }
            let found = devices.iter().find(|d| {
                d.vendor_id() == model.vid
                    && d.product_id() == model.pid
                    && model
                        .product
                        .map_or(true, |p| d.product_string() == Some(p))
            });
            let Some(info) = found else { continue };

            let device = info
                .open()
                .map_err(|e| Error::Transport(format!("{}: {}", model.name, e)))?;
            let interface = device.detach_and_claim_interface(0).map_err(|e| {
                Error::Transport(format!("{}: claim interface: {}", model.name, e))
            })?;

            let mut usb = FtdiUsb { interface };
            usb.init(model)?;
            log::info!("adapter: {}", model.name);
            return Ok((usb, model));
        }
        Err(Error::NoAdapter)
    }

    fn control_out(&mut self, request: u8, value: u16, what: &'static str) -> Result<()> {
        let completion = block_on(self.interface.control_out(ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index: 1,
            data: &[],
        }));
        completion
            .status
            .map_err(|e| Error::Transport(format!("{}: {}", what, e)))
    }

    fn init(&mut self, model: &FtdiModel) -> Result<()> {
        self.control_out(SIO_RESET, 0, "FTDI reset")?;
        // Synchronous MPSSE on the low byte's four JTAG pins.
        self.control_out(SIO_SET_BITMODE, 0x020b, "set MPSSE mode")?;
        // Latency 1 ms at slow clock, 0 for H parts.
        let latency = if model.mhz > 6 { 0 } else { 1 };
        self.control_out(SIO_SET_LATENCY_TIMER, latency, "set latency timer")?;
        Ok(())
    }
}

impl UsbBulk for FtdiUsb {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("usb bulk write {} bytes", data.len());
        let completion = block_on(self.interface.bulk_out(EP_OUT, data.to_vec()));
        completion
            .status
            .map_err(|e| Error::Transport(format!("usb bulk write: {}", e)))?;
        if completion.data.actual_length() != data.len() {
            return Err(Error::Transport(format!(
                "usb bulk wrote {} bytes of {}",
                completion.data.actual_length(),
                data.len()
            )));
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        // The FTDI chip answers every IN request within its latency
        // window, so the transfer completes promptly even when no
        // payload is pending (status prefix only).
        let completion = block_on(self.interface.bulk_in(EP_IN, RequestBuffer::new(buf.len())));
        completion
            .status
            .map_err(|e| Error::Transport(format!("usb bulk read: {}", e)))?;
        let n = completion.data.len().min(buf.len());
        buf[..n].copy_from_slice(&completion.data[..n]);
        log::trace!("usb bulk read {} bytes", n);
        Ok(n)
    }
}
