//! mikroE USB HID bootloader (UHB).
//!
//! STX-framed commands; the info record carries the board geometry.
//! There is no chip-erase: user flash is erased block by block, and the
//! boot area lazily before its first write.

use std::time::Duration;

use pic32flash_core::adapter::{Adapter, Capabilities};
use pic32flash_core::{Error, Result};

use crate::hid::{HidIo, REPORT_SIZE};

const CMD_SYNC: u8 = 1;
const CMD_INFO: u8 = 2;
const CMD_BOOT: u8 = 3;
const CMD_REBOOT: u8 = 4;
const CMD_WRITE: u8 = 11;
const CMD_ERASE: u8 = 21;
const STX: u8 = 15;

const BOOTLOADER_IDCODE: u32 = 0xdeaf_b00b;
const BOOT_BASE: u32 = 0x1fc0_0000;
const BOOT_AREA: u32 = 8 * 1024;

const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// mikroE bootloader session.
pub struct Uhb<H: HidIo> {
    hid: H,
    reply: [u8; REPORT_SIZE],
    erase_size: u32,
    user_start: u32,
    user_nbytes: u32,
    boot_nbytes: u32,
    boot_erased: bool,
}

impl<H: HidIo> Uhb<H> {
    fn command(&mut self, cmd: u8, addr: u32, count: u16, data: &[u8]) -> Result<()> {
        let mut report = [0u8; REPORT_SIZE];
        report[0] = STX;
        report[1] = cmd;
        if cmd == CMD_WRITE || cmd == CMD_ERASE {
            report[2..6].copy_from_slice(&addr.to_le_bytes());
            report[6..8].copy_from_slice(&count.to_le_bytes());
        }
        self.hid.write_report(&report)?;

        if cmd == CMD_REBOOT {
            return Ok(());
        }
        if cmd == CMD_WRITE {
            for chunk in data.chunks(REPORT_SIZE) {
                let mut report = [0u8; REPORT_SIZE];
                report[..chunk.len()].copy_from_slice(chunk);
                self.hid.write_report(&report)?;
            }
        }

        let mut reply = [0u8; REPORT_SIZE];
        if !self.hid.read_report(&mut reply, READ_TIMEOUT)? {
            return Err(Error::Transport("uhb: reply timed out".into()));
        }
        self.reply = reply;
        Ok(())
    }
}

impl<H: HidIo> Adapter for Uhb<H> {
    fn name(&self) -> &str {
        "UHB Bootloader"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PROBE | Capabilities::ERASE | Capabilities::WRITE
    }

    fn program_area(&self) -> Option<(u32, u32)> {
        Some((self.user_start, self.user_nbytes))
    }

    fn boot_bytes(&self) -> u32 {
        self.boot_nbytes
    }

    fn get_idcode(&mut self) -> Result<u32> {
        Ok(BOOTLOADER_IDCODE)
    }

    fn program_block(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        let nbytes = data.len() as u32 * 4;
        let in_user = addr >= self.user_start
            && addr + nbytes <= self.user_start + self.user_nbytes;
        let in_boot = addr >= BOOT_BASE && addr + nbytes <= BOOT_BASE + BOOT_AREA;
        if !in_user && !in_boot {
            log::warn!("address {:#010x} out of program area", addr);
            return Ok(());
        }

        if in_boot && !self.boot_erased {
            // The boot area is erased lazily, one block at a time.
            let mut block = BOOT_BASE;
            for _ in 0..BOOT_AREA / self.erase_size {
                log::debug!("uhb: erase boot block {:#010x}", block);
                self.command(CMD_ERASE, block, 1, &[])?;
                block += self.erase_size;
            }
            self.boot_erased = true;
        }

        let mut bytes = Vec::with_capacity(nbytes as usize);
        for &word in data {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        self.command(CMD_WRITE, addr, nbytes as u16, &bytes)
    }

    fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
        log::debug!("uhb: ignoring word program at {:#010x}: {:#010x}", addr, word);
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        let mut addr = self.user_start;
        for _ in 0..self.user_nbytes / self.erase_size {
            log::debug!("uhb: erase flash block {:#010x}", addr);
            self.command(CMD_ERASE, addr, 1, &[])?;
            addr += self.erase_size;
        }
        Ok(())
    }

    fn close(&mut self, _power_on: bool) -> Result<()> {
        self.command(CMD_REBOOT, 0, 0, &[])
    }
}

/// Read the info record, enter bootloader mode and build the adapter.
pub fn open_uhb<H: HidIo + 'static>(hid: H) -> Result<Box<dyn Adapter>> {
    let mut a = Uhb {
        hid,
        reply: [0; REPORT_SIZE],
        erase_size: 0,
        user_start: 0,
        user_nbytes: 0,
        boot_nbytes: 0,
        boot_erased: false,
    };

    a.command(CMD_INFO, 0, 0, &[])?;
    let r = &a.reply;
    // The info record is a tagged field list with fixed layout.
    if r[0] != 56      // record size
        || r[1] != 1   // tag: MCU type
        || r[2] != 20  // PIC32 family
        || r[4] != 8   // tag: flash size
        || r[12] != 3  // tag: erase block size
        || r[16] != 4  // tag: write block size
        || r[20] != 5  // tag: bootloader version
        || r[24] != 6  // tag: bootloader start address
        || r[32] != 7
    // tag: board name
    {
        return Err(Error::Protocol("unexpected UHB info record".into()));
    }
    let erase_size = u32::from(u16::from_le_bytes([r[14], r[15]]));
    let version = u16::from_le_bytes([r[22], r[23]]);
    let boot_start = u32::from_le_bytes([r[28], r[29], r[30], r[31]]);
    let name: String = r[33..64]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();

    a.erase_size = erase_size;
    a.user_start = 0x1d00_0000;
    a.user_nbytes = boot_start & 0x00ff_ffff;
    a.boot_nbytes = 12 * 1024 - erase_size;
    log::info!(
        "adapter: UHB bootloader '{}', version {:x}.{:02x}",
        name,
        version >> 8,
        version & 0xff
    );

    a.command(CMD_BOOT, 0, 0, &[])?;
    if a.reply[0] != STX || a.reply[1] != CMD_BOOT {
        return Err(Error::Protocol("cannot enter UHB bootloader mode".into()));
    }
    let _ = CMD_SYNC; // part of the protocol, unused by this flow
    Ok(Box::new(a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeHid {
        sent: Vec<[u8; REPORT_SIZE]>,
        replies: VecDeque<[u8; REPORT_SIZE]>,
    }

    impl HidIo for FakeHid {
        fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<()> {
            self.sent.push(*report);
            Ok(())
        }

        fn read_report(
            &mut self,
            report: &mut [u8; REPORT_SIZE],
            _timeout: Duration,
        ) -> Result<bool> {
            match self.replies.pop_front() {
                Some(r) => {
                    *report = r;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    fn info_record() -> [u8; REPORT_SIZE] {
        let mut r = [0u8; REPORT_SIZE];
        r[0] = 56;
        r[1] = 1;
        r[2] = 20;
        r[4] = 8;
        r[8..12].copy_from_slice(&(512 * 1024u32).to_le_bytes());
        r[12] = 3;
        r[14..16].copy_from_slice(&4096u16.to_le_bytes());
        r[16] = 4;
        r[18..20].copy_from_slice(&2048u16.to_le_bytes());
        r[20] = 5;
        r[22..24].copy_from_slice(&0x0120u16.to_le_bytes());
        r[24] = 6;
        r[28..32].copy_from_slice(&0x1d07_0000u32.to_le_bytes());
        r[32] = 7;
        r[33..38].copy_from_slice(b"mikro");
        r
    }

    fn boot_ack() -> [u8; REPORT_SIZE] {
        let mut r = [0u8; REPORT_SIZE];
        r[0] = STX;
        r[1] = CMD_BOOT;
        r
    }

    fn ack() -> [u8; REPORT_SIZE] {
        [0u8; REPORT_SIZE]
    }

    #[test]
    fn info_record_sets_geometry() {
        let mut hid = FakeHid::default();
        hid.replies.push_back(info_record());
        hid.replies.push_back(boot_ack());
        let adapter = open_uhb(hid).unwrap();
        assert_eq!(adapter.program_area(), Some((0x1d00_0000, 0x0007_0000)));
        assert_eq!(adapter.boot_bytes(), 12 * 1024 - 4096);
    }

    #[test]
    fn boot_area_write_erases_boot_blocks_first() {
        let mut hid = FakeHid::default();
        // Two erase acks plus the write ack.
        for _ in 0..3 {
            hid.replies.push_back(ack());
        }
        let mut uhb = Uhb {
            hid,
            reply: [0; REPORT_SIZE],
            erase_size: 4096,
            user_start: 0x1d00_0000,
            user_nbytes: 0x0007_0000,
            boot_nbytes: 8 * 1024,
            boot_erased: false,
        };
        uhb.program_block(BOOT_BASE, &[0u32; 256]).unwrap();

        // 8 KiB boot area / 4 KiB erase blocks = 2 erase commands, then
        // one write command followed by 16 payload reports.
        let erases = uhb
            .hid
            .sent
            .iter()
            .filter(|r| r[0] == STX && r[1] == CMD_ERASE)
            .count();
        assert_eq!(erases, 2);
        let writes = uhb
            .hid
            .sent
            .iter()
            .filter(|r| r[0] == STX && r[1] == CMD_WRITE)
            .count();
        assert_eq!(writes, 1);
        assert!(uhb.boot_erased);

        // A second boot write must not erase again.
        uhb.hid.replies.push_back(ack());
        uhb.program_block(BOOT_BASE + 1024, &[0u32; 256]).unwrap();
        let erases_after = uhb
            .hid
            .sent
            .iter()
            .filter(|r| r[0] == STX && r[1] == CMD_ERASE)
            .count();
        assert_eq!(erases_after, 2);
    }
}
