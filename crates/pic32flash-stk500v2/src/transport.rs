//! Serial transport abstraction, mockable for protocol tests.

use std::io::{Read, Write};
use std::time::Duration;

use pic32flash_core::{Error, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

/// Byte transport with adjustable timeout and baud rate.
pub trait SerialIo {
    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
    /// Read up to `buf.len()` bytes; 0 on timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Change the receive timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    /// Change the baud rate (after CMD_SET_BAUD succeeded).
    fn set_baud(&mut self, baud: u32) -> Result<()>;
}

/// Real serial port.
pub struct Port {
    port: Box<dyn SerialPort>,
}

impl Port {
    /// Open `device` at `baud`, 8N1.
    pub fn open(device: &str, baud: u32, timeout: Duration) -> Result<Port> {
        let port = serialport::new(device, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| Error::Transport(format!("{}: {}", device, e)))?;
        log::debug!("opened serial port {} at {} baud", device, baud);
        Ok(Port { port })
    }
}

impl SerialIo for Port {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port
            .write_all(data)
            .map_err(|e| Error::Transport(format!("serial write: {}", e)))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Transport(format!("serial read: {}", e))),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| Error::Transport(format!("set timeout: {}", e)))
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.port
            .set_baud_rate(baud)
            .map_err(|e| Error::Transport(format!("set baud: {}", e)))
    }
}
