//! pic32flash-bitbang - "ascii ICSP" serial bit-bang adapter
//!
//! Talks to an intelligent ICSP programmer (typically an Arduino running
//! the ascii ICSP sketch) over a serial port. Every TDI/TMS pair is one
//! ASCII character on the wire; TDO samples come back as characters too.
//! The programmer buffers roughly a kilobyte, so writes are paced with a
//! `'>'`/`'<'` handshake to bound the in-flight byte count.
//!
//! The TAP and Programming Executive protocol comes entirely from
//! [`pic32flash_core::jtag`]; this crate only encodes bits as characters.

pub mod channel;
mod port;

pub use channel::AsciiChannel;

use std::thread::sleep;
use std::time::Duration;

use pic32flash_core::adapter::Adapter;
use pic32flash_core::jtag::JtagAdapter;
use pic32flash_core::{Error, Result};

use channel::ByteIo;
use port::Port;

/// Open an ascii ICSP programmer on `port` and probe the target behind it.
pub fn open(port: &str, baud: u32) -> Result<Box<dyn Adapter>> {
    let baud = if baud == 0 { 115_200 } else { baud };
    let mut io = Port::open(port, baud, Duration::from_millis(250))?;
    sleep(Duration::from_millis(200));

    probe_programmer(&mut io)?;

    let mut channel = AsciiChannel::new(io);
    channel.icsp_enable()?;

    let mut adapter = JtagAdapter::new(channel, "ascii ICSP");
    adapter.probe_idcode()?;
    adapter.engine_mut().check_device_status()?;
    Ok(Box::new(adapter))
}

/// Synchronize with the programmer and read its identification string.
fn probe_programmer<S: ByteIo>(io: &mut S) -> Result<()> {
    let mut synced = false;
    for _ in 0..40 {
        io.write_all(b">")?;
        let mut ch = [0u8; 1];
        if io.read(&mut ch)? == 1 && ch[0] == b'<' {
            synced = true;
            break;
        }
    }
    if !synced {
        return Err(Error::Protocol(
            "no response from 'ascii ICSP' adapter".into(),
        ));
    }

    io.write_all(b"?")?;
    let mut ident = [0u8; 14];
    let mut got = 0;
    while got < ident.len() {
        let n = io.read(&mut ident[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    if got != 14 || &ident[..13] != b"ascii ICSP v1" {
        return Err(Error::Protocol(
            "bad response from 'ascii ICSP' adapter".into(),
        ));
    }
    log::info!(
        "adapter: {}",
        String::from_utf8_lossy(&ident).trim_end_matches('\0')
    );
    Ok(())
}
