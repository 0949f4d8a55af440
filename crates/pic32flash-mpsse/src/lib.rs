//! pic32flash-mpsse - FTDI FT2232 MPSSE JTAG adapter
//!
//! Drives the target's 4-wire JTAG port through an FT2232-based adapter
//! (Olimex ARM/MIPS-USB-OCD, Bus Blaster, Flyswatter). Shifts are packed
//! into MPSSE command packets; the TAP and Programming Executive protocol
//! comes from [`pic32flash_core::jtag`].

pub mod channel;
pub mod packet;
pub mod usb;

pub use channel::MpsseChannel;

use pic32flash_core::adapter::Adapter;
use pic32flash_core::jtag::JtagAdapter;
use pic32flash_core::Result;

use usb::FtdiUsb;

/// Default TCK rate.
const DEFAULT_KHZ: u32 = 500;

/// Find and open an MPSSE adapter, reset the target and probe it.
/// `vid`/`pid` of zero means any known model.
pub fn open(vid: u16, pid: u16) -> Result<Box<dyn Adapter>> {
    let (usb, model) = FtdiUsb::open(vid, pid)?;
    let mut channel = MpsseChannel::new(usb, model.reset);

    channel.set_speed(model.mhz, DEFAULT_KHZ)?;
    channel.disable_loopback()?;
    channel.set_reset(false, false, true)?;

    let mut adapter = JtagAdapter::new(channel, model.name);
    adapter.probe_idcode()?;

    // Hold the target in reset while checking its status.
    adapter
        .engine_mut()
        .channel_mut()
        .set_reset(false, true, true)?;
    std::thread::sleep(std::time::Duration::from_millis(10));
    adapter.engine_mut().check_device_status()?;

    Ok(Box::new(adapter))
}
