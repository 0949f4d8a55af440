//! Adapter selection: USB autodetection and `proto:port` dispatch.

use pic32flash_core::adapter::Adapter;
use pic32flash_core::{Error, Result};

/// Connection settings taken from the command line.
pub struct OpenOptions<'a> {
    /// Port string; `None` autodetects USB adapters.
    pub port: Option<&'a str>,
    /// Serial baud rate.
    pub baud: u32,
    /// Alternate rate for STK500v2 bootloaders.
    pub alternate_baud: Option<u32>,
}

/// Open the adapter described by the options.
pub fn open_adapter(options: &OpenOptions<'_>) -> Result<Box<dyn Adapter>> {
    match options.port {
        None => autodetect_usb(),
        Some(port) => open_named(port, options),
    }
}

/// Try all known USB adapters in preference order.
fn autodetect_usb() -> Result<Box<dyn Adapter>> {
    #[cfg(feature = "pickit")]
    {
        if let Some(adapter) = pic32flash_pickit::open_pickit2(0, 0)? {
            return Ok(adapter);
        }
        if let Some(adapter) = pic32flash_pickit::open_pickit3(0, 0)? {
            return Ok(adapter);
        }
    }
    #[cfg(feature = "mpsse")]
    {
        match pic32flash_mpsse::open(0, 0) {
            Err(Error::NoAdapter) => {}
            other => return other,
        }
    }
    #[cfg(feature = "hidboot")]
    {
        if let Some(adapter) = pic32flash_hidboot::open_hidboot(0, 0)? {
            return Ok(adapter);
        }
    }
    #[cfg(feature = "an1388")]
    {
        if let Some(adapter) = pic32flash_an1388::open_usb(0, 0)? {
            return Ok(adapter);
        }
    }
    #[cfg(feature = "hidboot")]
    {
        if let Some(adapter) = pic32flash_hidboot::open_uhb(0, 0)? {
            return Ok(adapter);
        }
    }
    Err(Error::NoAdapter)
}

/// Split a `proto:vid:pid` USB spec. `None` when the string has no
/// second colon (then it is a serial port name).
fn parse_usb_spec(rest: &str) -> Option<(u16, u16)> {
    let (vid, pid) = rest.split_once(':')?;
    let vid = u16::from_str_radix(vid, 16).ok()?;
    let pid = u16::from_str_radix(pid, 16).ok()?;
    Some((vid, pid))
}

fn open_named(port: &str, options: &OpenOptions<'_>) -> Result<Box<dyn Adapter>> {
    let Some((proto, rest)) = port.split_once(':') else {
        // A bare port name speaks the default serial protocol.
        return open_serial("stk500", port, options);
    };

    if let Some((vid, pid)) = parse_usb_spec(rest) {
        return open_usb(proto, vid, pid);
    }
    open_serial(proto, rest, options)
}

fn open_serial(proto: &str, port: &str, options: &OpenOptions<'_>) -> Result<Box<dyn Adapter>> {
    match proto.to_ascii_lowercase().as_str() {
        #[cfg(feature = "stk500v2")]
        "stk500" => pic32flash_stk500v2::open(port, options.baud, options.alternate_baud),
        #[cfg(feature = "bitbang")]
        "ascii" => pic32flash_bitbang::open(port, options.baud),
        #[cfg(feature = "an1388")]
        "an1388" => pic32flash_an1388::open_uart(port, options.baud),
        other => Err(Error::Config(format!(
            "unknown serial protocol: {}",
            other
        ))),
    }
}

fn open_usb(proto: &str, vid: u16, pid: u16) -> Result<Box<dyn Adapter>> {
    let not_found = || Error::Config(format!("{}: {:04x}:{:04x} not found", proto, vid, pid));
    match proto.to_ascii_lowercase().as_str() {
        #[cfg(feature = "pickit")]
        "pickit2" => pic32flash_pickit::open_pickit2(vid, pid)?.ok_or_else(not_found),
        #[cfg(feature = "pickit")]
        "pickit3" => pic32flash_pickit::open_pickit3(vid, pid)?.ok_or_else(not_found),
        #[cfg(feature = "hidboot")]
        "hidboot" => pic32flash_hidboot::open_hidboot(vid, pid)?.ok_or_else(not_found),
        #[cfg(feature = "hidboot")]
        "uhb" => pic32flash_hidboot::open_uhb(vid, pid)?.ok_or_else(not_found),
        #[cfg(feature = "an1388")]
        "an1388" => pic32flash_an1388::open_usb(vid, pid)?.ok_or_else(not_found),
        #[cfg(feature = "mpsse")]
        "mpsse" => pic32flash_mpsse::open(vid, pid),
        other => Err(Error::Config(format!("unknown USB protocol: {}", other))),
    }
}
