//! Microchip HID bootloader (the pre-AN1388 protocol).
//!
//! Single-report commands; data payloads are right-aligned inside the
//! 64-byte report, 14 words per transfer.

use std::time::Duration;

use pic32flash_core::adapter::{Adapter, Capabilities};
use pic32flash_core::{Error, Result};

use crate::hid::{HidIo, REPORT_SIZE};

const CMD_QUERY_DEVICE: u8 = 0x02;
const CMD_ERASE_DEVICE: u8 = 0x04;
const CMD_PROGRAM_DEVICE: u8 = 0x05;
const CMD_PROGRAM_COMPLETE: u8 = 0x06;
const CMD_GET_DATA: u8 = 0x07;
const CMD_RESET_DEVICE: u8 = 0x08;

/// Words per report; 56 bytes of payload.
const WORDS_PER_PACKET: u32 = 14;

/// ID code reported for bootloader sessions (no real probe possible).
const BOOTLOADER_IDCODE: u32 = 0xdeaf_b00b;

/// Reply timeout; erase can take seconds.
const READ_TIMEOUT: Duration = Duration::from_secs(4);

/// HID bootloader session.
pub struct HidBoot<H: HidIo> {
    hid: H,
    reply: [u8; REPORT_SIZE],
    user_start: u32,
    user_nbytes: u32,
}

impl<H: HidIo> HidBoot<H> {
    fn command(&mut self, cmd: u8, data: &[u8]) -> Result<()> {
        let mut report = [0u8; REPORT_SIZE];
        report[0] = cmd;
        report[1..1 + data.len()].copy_from_slice(data);
        self.hid.write_report(&report)?;

        if cmd != CMD_QUERY_DEVICE && cmd != CMD_GET_DATA {
            return Ok(());
        }
        let mut reply = [0u8; REPORT_SIZE];
        if !self.hid.read_report(&mut reply, READ_TIMEOUT)? {
            return Err(Error::Transport("hidboot: reply timed out".into()));
        }
        self.reply = reply;
        Ok(())
    }

    fn program_flash(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        let nbytes = data.len() * 4;
        if addr < self.user_start
            || addr + nbytes as u32 > self.user_start + self.user_nbytes
        {
            log::warn!("address {:#010x} out of program area", addr);
            return Ok(());
        }

        let mut request = [0u8; 63];
        request[..4].copy_from_slice(&addr.to_le_bytes());
        request[4] = nbytes as u8;
        // Payload is right-aligned against the end of the report.
        let mut at = 63 - nbytes;
        for &word in data {
            request[at..at + 4].copy_from_slice(&word.to_le_bytes());
            at += 4;
        }
        self.command(CMD_PROGRAM_DEVICE, &request)
    }
}

impl<H: HidIo> Adapter for HidBoot<H> {
    fn name(&self) -> &str {
        "HID Bootloader"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PROBE | Capabilities::ERASE | Capabilities::READ | Capabilities::WRITE
    }

    fn program_area(&self) -> Option<(u32, u32)> {
        Some((self.user_start, self.user_nbytes))
    }

    fn get_idcode(&mut self) -> Result<u32> {
        Ok(BOOTLOADER_IDCODE)
    }

    fn read_data(&mut self, addr: u32, nwords: u32) -> Result<Vec<u32>> {
        let mut data = Vec::with_capacity(nwords as usize);
        let mut addr = addr;
        let mut left = nwords;
        while left > 0 {
            let n = left.min(WORDS_PER_PACKET);
            let nbytes = (n * 4) as usize;

            let mut request = [0u8; 5];
            request[..4].copy_from_slice(&addr.to_le_bytes());
            request[4] = nbytes as u8;
            self.command(CMD_GET_DATA, &request)?;

            // Data comes back right-aligned.
            for chunk in self.reply[REPORT_SIZE - nbytes..].chunks_exact(4) {
                data.push(u32::from_le_bytes(chunk.try_into().unwrap()));
            }
            addr += n * 4;
            left -= n;
        }
        Ok(data)
    }

    fn program_block(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        for (i, chunk) in data.chunks(WORDS_PER_PACKET as usize).enumerate() {
            self.program_flash(addr + (i as u32) * WORDS_PER_PACKET * 4, chunk)?;
        }
        self.command(CMD_PROGRAM_COMPLETE, &[])
    }

    fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
        // The bootloader has no word-granular write path.
        log::debug!("hidboot: ignoring word program at {:#010x}: {:#010x}", addr, word);
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.command(CMD_ERASE_DEVICE, &[])?;
        // Erase completion is signalled by the next query answering.
        self.command(CMD_QUERY_DEVICE, &[])
    }

    fn close(&mut self, power_on: bool) -> Result<()> {
        if power_on {
            // Jump to the application.
            self.command(CMD_RESET_DEVICE, &[])?;
        }
        Ok(())
    }
}

/// Query a freshly attached bootloader and build the adapter.
pub fn open_hidboot<H: HidIo + 'static>(hid: H) -> Result<Box<dyn Adapter>> {
    let mut a = HidBoot {
        hid,
        reply: [0; REPORT_SIZE],
        user_start: 0,
        user_nbytes: 0,
    };

    a.command(CMD_QUERY_DEVICE, &[])?;
    if a.reply[0] != CMD_QUERY_DEVICE
        || a.reply[1] != 56 // packet data size
        || a.reply[2] != 3  // PIC32 device family
        || a.reply[3] != 1
    // program memory type
    {
        return Err(Error::Protocol("unexpected hidboot query reply".into()));
    }
    a.user_start =
        u32::from_le_bytes(a.reply[4..8].try_into().unwrap()) & 0x1fff_ffff;
    a.user_nbytes =
        u32::from_le_bytes(a.reply[8..12].try_into().unwrap()) & 0x0fff_ffff;
    log::info!(
        "adapter: HID bootloader, program area {:08x}-{:08x}",
        a.user_start,
        a.user_start + a.user_nbytes - 1
    );
    Ok(Box::new(a))
}
