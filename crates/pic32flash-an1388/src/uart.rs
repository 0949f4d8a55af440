//! AN1388 over a serial port.

use std::io::{Read, Write};
use std::time::Duration;

use pic32flash_core::{Error, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::device::FrameIo;

/// Serial transport for the AN1388 protocol.
pub struct UartTransport {
    port: Box<dyn SerialPort>,
}

impl UartTransport {
    /// Open `device` at `baud`, with the bootloader's 1 s reply window.
    pub fn open(device: &str, baud: u32) -> Result<UartTransport> {
        let baud = if baud == 0 { 115_200 } else { baud };
        let port = serialport::new(device, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(|e| Error::Transport(format!("{}: {}", device, e)))?;
        log::debug!("opened serial port {} at {} baud", device, baud);
        Ok(UartTransport { port })
    }
}

impl FrameIo for UartTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.port
            .write_all(frame)
            .map_err(|e| Error::Transport(format!("serial write: {}", e)))
    }

    fn recv_chunk(&mut self) -> Result<Vec<u8>> {
        let mut buf = [0u8; 64];
        match self.port.read(&mut buf) {
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(Error::Transport(format!("serial read: {}", e))),
        }
    }
}
