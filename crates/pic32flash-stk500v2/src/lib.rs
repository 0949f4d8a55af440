//! pic32flash-stk500v2 - STK500v2 serial bootloader adapter
//!
//! The default protocol for serial ports: Arduino-style bootloaders
//! (chipKIT and friends) speaking AVR068 framing. Unknown to the
//! protocol, the payloads address PIC32 flash in 16-bit word units
//! relative to the flash base.

pub mod device;
pub mod protocol;
pub mod transport;

use std::thread::sleep;
use std::time::Duration;

use pic32flash_core::adapter::Adapter;
use pic32flash_core::{Error, Result};

use device::Stk500v2;
use transport::Port;

/// Open an STK500v2 bootloader on `port`. `alternate_baud` is offered to
/// the bootloader via CMD_SET_BAUD once synchronized.
pub fn open(port: &str, baud: u32, alternate_baud: Option<u32>) -> Result<Box<dyn Adapter>> {
    let baud = if baud == 0 { 115_200 } else { baud };
    let io = Port::open(port, baud, Duration::from_millis(1000))?;
    sleep(Duration::from_millis(200));

    let mut dev = Stk500v2::new(io);

    // Synchronize; a stuck bootloader sometimes needs a second round
    // after a pause.
    let mut synced = false;
    'outer: for reopen in 0..2 {
        if reopen > 0 {
            sleep(Duration::from_millis(200));
        }
        for _ in 0..3 {
            if dev.sign_on()? {
                synced = true;
                break 'outer;
            }
        }
    }
    if !synced {
        return Err(Error::NoAdapter);
    }
    log::info!("adapter: STK500v2 bootloader on {}", port);

    if let Some(alternate) = alternate_baud {
        if alternate != baud {
            dev.switch_baud(alternate)?;
        }
    }
    dev.prog_enable()?;
    Ok(Box::new(dev))
}
