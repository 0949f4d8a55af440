//! STK500v2 bootloader adapter.
//!
//! Writes go through a 128-byte page cache folded onto LOAD_ADDRESS
//! calls; reads come back as 256-byte pages. Framing faults trigger a
//! bounded resend after draining the input, unlike the transports where
//! a fault is immediately fatal.

use std::time::Duration;

use pic32flash_core::adapter::{Adapter, Capabilities};
use pic32flash_core::{Error, Result};

use crate::protocol::*;
use crate::transport::SerialIo;

/// Resend attempts per command before giving up.
const SEND_RETRIES: usize = 3;

/// Flash-relative addressing base, in 16-bit word units.
const FLASH_WORD_BASE: u32 = 0x1d00_0000 >> 1;

/// STK500v2 session.
pub struct Stk500v2<S: SerialIo> {
    io: S,
    sequence_number: u8,
    page_addr: u32,
    page_addr_fetched: bool,
    last_load_addr: u32,
    page: [u8; PAGE_NBYTES],
    first_program: bool,
}

impl<S: SerialIo> Stk500v2<S> {
    /// Wrap an opened transport (no probing yet).
    pub fn new(io: S) -> Self {
        Stk500v2 {
            io,
            sequence_number: 0,
            page_addr: 0,
            page_addr_fetched: false,
            last_load_addr: u32::MAX,
            page: [0xff; PAGE_NBYTES],
            first_program: true,
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut got = 0;
        while got < buf.len() {
            let n = self.io.read(&mut buf[got..])?;
            if n == 0 {
                return Ok(false);
            }
            got += n;
        }
        Ok(true)
    }

    fn drain_input(&mut self) -> Result<()> {
        let mut scratch = [0u8; 300];
        self.io.read(&mut scratch)?;
        Ok(())
    }

    /// Send one command and collect its response body, resending after
    /// a drained input on framing errors, up to the retry bound.
    fn send_receive(&mut self, cmd: &[u8], reply_len: usize) -> Result<Vec<u8>> {
        for attempt in 0..SEND_RETRIES {
            self.sequence_number = self.sequence_number.wrapping_add(1);
            let header = [
                MESSAGE_START,
                self.sequence_number,
                (cmd.len() >> 8) as u8,
                cmd.len() as u8,
                TOKEN,
            ];
            let mut sum = header.iter().fold(0u8, |acc, b| acc ^ b);
            for &b in cmd {
                sum ^= b;
            }

            self.io.write_all(&header)?;
            self.io.write_all(cmd)?;
            self.io.write_all(&[sum])?;

            let mut reply_header = [0u8; 5];
            if !self.read_exact(&mut reply_header)? {
                return Ok(Vec::new());
            }
            if reply_header[0] != MESSAGE_START
                || reply_header[1] != self.sequence_number
                || reply_header[4] != TOKEN
            {
                log::debug!(
                    "invalid reply header {:02x?}, attempt {}",
                    reply_header,
                    attempt + 1
                );
                self.drain_input()?;
                continue;
            }
            let rlen = usize::from(reply_header[2]) << 8 | usize::from(reply_header[3]);
            if rlen == 0 || rlen > reply_len {
                log::debug!("invalid reply length {}, expecting {}", rlen, reply_len);
                self.drain_input()?;
                continue;
            }

            let mut response = vec![0u8; rlen];
            if !self.read_exact(&mut response)? {
                return Ok(Vec::new());
            }
            let mut sum = [0u8; 1];
            if !self.read_exact(&mut sum)? {
                return Ok(Vec::new());
            }

            let mut check = sum[0];
            for &b in &reply_header {
                check ^= b;
            }
            for &b in &response {
                check ^= b;
            }
            if check != 0 {
                log::debug!("invalid reply checksum, attempt {}", attempt + 1);
                self.drain_input()?;
                continue;
            }
            return Ok(response);
        }
        Ok(Vec::new())
    }

    fn get_parameter(&mut self, param: u8) -> Result<u8> {
        let response = self.send_receive(&[CMD_GET_PARAMETER, param], 3)?;
        if response.len() != 3
            || response[0] != CMD_GET_PARAMETER
            || response[1] != STATUS_CMD_OK
        {
            return Err(Error::Protocol(format!("cannot fetch parameter {}", param)));
        }
        Ok(response[2])
    }

    fn set_parameter(&mut self, param: u8, value: u8) -> Result<()> {
        let response = self.send_receive(&[CMD_SET_PARAMETER, param, value], 2)?;
        if response.len() != 2
            || response[0] != CMD_SET_PARAMETER
            || response[1] != STATUS_CMD_OK
        {
            return Err(Error::Protocol(format!("cannot set parameter {}", param)));
        }
        Ok(())
    }

    /// Try to switch the link to `baud`; stays at the probe rate when
    /// the bootloader does not support CMD_SET_BAUD.
    pub fn switch_baud(&mut self, baud: u32) -> Result<()> {
        let b = baud.to_le_bytes();
        let cmd = [CMD_SET_BAUD, b[0], b[1], b[2], b[3]];
        let response = self.send_receive(&cmd, 6)?;
        if response.len() == 6
            && response[0] == CMD_SET_BAUD
            && response[1] == STATUS_CMD_OK
            && response[2..6] == b
        {
            self.io.set_baud(baud)?;
            log::info!("baud rate {} bps", baud);
        }
        Ok(())
    }

    /// Probe for the bootloader with CMD_SIGN_ON.
    pub fn sign_on(&mut self) -> Result<bool> {
        let response = self.send_receive(&[CMD_SIGN_ON], 11)?;
        Ok(response.len() == 11
            && (response.starts_with(b"\x01\x00\x08STK500_2")
                || response.starts_with(b"\x01\x00\x08AVRISP_2")))
    }

    /// Enter programming mode.
    pub fn prog_enable(&mut self) -> Result<()> {
        #[rustfmt::skip]
        let cmd = [
            CMD_ENTER_PROGMODE_ISP,
            200,  // timeout in ms
            100,  // pin stabilization delay
            25,   // command execution delay
            32,   // synchronization loops
            0,    // per-byte delay
            0x53, // poll value
            3,    // poll index
            0xac, 0x53, 0x00, 0x00,
        ];
        let response = self.send_receive(&cmd, 2)?;
        if response.len() != 2
            || response[0] != CMD_ENTER_PROGMODE_ISP
            || response[1] != STATUS_CMD_OK
        {
            return Err(Error::Protocol("cannot enter programming mode".into()));
        }
        Ok(())
    }

    fn prog_disable(&mut self) -> Result<()> {
        // Leave programming mode; errors are ignored on the way out.
        self.drain_input()?;
        let _ = self.send_receive(&[CMD_LEAVE_PROGMODE_ISP, 1, 1], 2)?;
        Ok(())
    }

    fn load_address(&mut self, mut addr: u32) -> Result<()> {
        // Addresses on the wire are flash-relative 16-bit word counts.
        if addr >= FLASH_WORD_BASE {
            addr -= FLASH_WORD_BASE;
        }
        if self.last_load_addr == addr {
            return Ok(());
        }
        let cmd = [
            CMD_LOAD_ADDRESS,
            (addr >> 24) as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
        ];
        let response = self.send_receive(&cmd, 2)?;
        if response.len() != 2
            || response[0] != CMD_LOAD_ADDRESS
            || response[1] != STATUS_CMD_OK
        {
            return Err(Error::Protocol("load address failed".into()));
        }
        self.last_load_addr = addr;
        Ok(())
    }

    fn flush_write_buffer(&mut self) -> Result<()> {
        if !self.page_addr_fetched {
            return Ok(());
        }
        self.load_address(self.page_addr >> 1)?;

        // An early chipKIT bootloader erases the whole chip on the first
        // PROGRAM_FLASH command, which can take several seconds.
        if self.first_program {
            self.io.set_timeout(Duration::from_millis(5000))?;
            self.first_program = false;
        } else {
            self.io.set_timeout(Duration::from_millis(1000))?;
        }

        log::debug!("programming page {:#x}", self.page_addr);
        let mut cmd = Vec::with_capacity(10 + PAGE_NBYTES);
        cmd.extend_from_slice(&[
            CMD_PROGRAM_FLASH_ISP,
            (PAGE_NBYTES >> 8) as u8,
            PAGE_NBYTES as u8,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
        ]);
        cmd.extend_from_slice(&self.page);
        let response = self.send_receive(&cmd, 2)?;
        if response.len() != 2 || response[0] != CMD_PROGRAM_FLASH_ISP {
            return Err(Error::Protocol("program flash failed".into()));
        }
        if response[1] != STATUS_CMD_OK {
            log::warn!("programming flash: timeout at {:#x}", self.page_addr);
        }

        self.page_addr_fetched = false;
        self.last_load_addr += (PAGE_NBYTES / 2) as u32;
        Ok(())
    }

    /// Page-cached byte write; out-of-page bytes flush the cache.
    fn write_byte(&mut self, addr: u32, byte: u8) -> Result<()> {
        let page = PAGE_NBYTES as u32;
        if self.page_addr / page != addr / page {
            self.flush_write_buffer()?;
        }
        if !self.page_addr_fetched {
            self.page_addr = addr / page * page;
            self.page_addr_fetched = true;
            self.page.fill(0xff);
        }
        self.page[(addr % page) as usize] = byte;
        Ok(())
    }

    fn read_page(&mut self, addr: u32) -> Result<Vec<u8>> {
        self.load_address(addr >> 1)?;
        let cmd = [
            CMD_READ_FLASH_ISP,
            (READ_NBYTES >> 8) as u8,
            READ_NBYTES as u8,
            0x20,
        ];
        let response = self.send_receive(&cmd, 3 + READ_NBYTES)?;
        if response.len() != 3 + READ_NBYTES
            || response[0] != CMD_READ_FLASH_ISP
            || response[1] != STATUS_CMD_OK
            || response[2 + READ_NBYTES] != STATUS_CMD_OK
        {
            return Err(Error::Protocol("read page failed".into()));
        }
        self.last_load_addr += (READ_NBYTES / 2) as u32;
        Ok(response[2..2 + READ_NBYTES].to_vec())
    }
}

impl<S: SerialIo> Adapter for Stk500v2<S> {
    fn name(&self) -> &str {
        "STK500v2 Bootloader"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PROBE | Capabilities::ERASE | Capabilities::READ | Capabilities::WRITE
    }

    fn program_area(&self) -> Option<(u32, u32)> {
        Some((0x1d00_0000, 2048 * 1024))
    }

    fn boot_bytes(&self) -> u32 {
        80 * 1024
    }

    fn block_override(&self) -> Option<u32> {
        Some(1024)
    }

    fn get_idcode(&mut self) -> Result<u32> {
        // Scribble the bootloader pseudo-ID into the DEVID parameter
        // slots; a DEVID-aware bootloader overwrites them with the real
        // ID, anything else echoes them back.
        self.set_parameter(PARAM_CK_DEVID_LOW, 0x0b)?;
        self.set_parameter(PARAM_CK_DEVID_MID, 0xb0)?;
        self.set_parameter(PARAM_CK_DEVID_HIGH, 0xaf)?;
        self.set_parameter(PARAM_CK_DEVID_TOP, 0xde)?;

        let id = u32::from(self.get_parameter(PARAM_CK_DEVID_LOW)?)
            | u32::from(self.get_parameter(PARAM_CK_DEVID_MID)?) << 8
            | u32::from(self.get_parameter(PARAM_CK_DEVID_HIGH)?) << 16
            | u32::from(self.get_parameter(PARAM_CK_DEVID_TOP)?) << 24;
        if id == 0 {
            log::debug!("bootloader does not expose the target DEVID");
            return Ok(0xdeaf_b00b);
        }
        Ok(id)
    }

    fn read_word(&mut self, addr: u32) -> Result<u32> {
        self.load_address(addr >> 1)?;
        let cmd = [CMD_READ_FLASH_ISP, 0, 4, 0x20];
        let response = self.send_receive(&cmd, 7)?;
        if response.len() != 7
            || response[0] != CMD_READ_FLASH_ISP
            || response[1] != STATUS_CMD_OK
            || response[6] != STATUS_CMD_OK
        {
            return Err(Error::Protocol("read word failed".into()));
        }
        Ok(u32::from_le_bytes([
            response[2],
            response[3],
            response[4],
            response[5],
        ]))
    }

    fn read_data(&mut self, addr: u32, nwords: u32) -> Result<Vec<u32>> {
        let mut bytes = Vec::with_capacity(nwords as usize * 4);
        let mut at = addr;
        while bytes.len() < nwords as usize * 4 {
            bytes.extend(self.read_page(at)?);
            at += READ_NBYTES as u32;
        }
        bytes.truncate(nwords as usize * 4);
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    fn verify_data(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        let block = self.read_data(addr, data.len() as u32)?;
        for (i, (&got, &expected)) in block.iter().zip(data).enumerate() {
            if got != expected {
                return Err(Error::VerifyMismatch {
                    addr: addr + i as u32 * 4,
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }

    fn program_block(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        for (i, &word) in data.iter().enumerate() {
            let at = addr + i as u32 * 4;
            for (j, byte) in word.to_le_bytes().into_iter().enumerate() {
                self.write_byte(at + j as u32, byte)?;
            }
        }
        self.flush_write_buffer()
    }

    fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
        // DEVCFG fuses cannot be touched through this bootloader.
        log::debug!("stk500v2: ignoring word program at {:#010x}: {:#010x}", addr, word);
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        // No known PIC32 STK500 bootloader implements a real chip erase
        // (an early version even hangs on it); re-entering programming
        // mode is all that is needed before the first write.
        self.prog_enable()
    }

    fn close(&mut self, _power_on: bool) -> Result<()> {
        self.prog_disable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Chunked fake: each queued chunk models bytes available in one
    /// receive window; an empty chunk models a timeout.
    #[derive(Default)]
    struct FakeSerial {
        written: Vec<u8>,
        chunks: VecDeque<Vec<u8>>,
        baud_changes: Vec<u32>,
    }

    impl FakeSerial {
        fn push_chunk(&mut self, bytes: Vec<u8>) {
            self.chunks.push_back(bytes);
        }

        fn push_timeout(&mut self) {
            self.chunks.push_back(Vec::new());
        }

        /// Queue a well-formed reply for the given sequence number.
        fn push_reply(&mut self, seq: u8, body: &[u8]) {
            let header = [
                MESSAGE_START,
                seq,
                (body.len() >> 8) as u8,
                body.len() as u8,
                TOKEN,
            ];
            let mut sum = header.iter().fold(0u8, |acc, b| acc ^ b);
            for &b in body {
                sum ^= b;
            }
            let mut bytes = header.to_vec();
            bytes.extend_from_slice(body);
            bytes.push(sum);
            self.push_chunk(bytes);
        }
    }

    impl SerialIo for FakeSerial {
        fn write_all(&mut self, data: &[u8]) -> Result<()> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let Some(front) = self.chunks.front_mut() else {
                return Ok(0);
            };
            if front.is_empty() {
                self.chunks.pop_front();
                return Ok(0);
            }
            let n = front.len().min(buf.len());
            buf[..n].copy_from_slice(&front[..n]);
            front.drain(..n);
            if front.is_empty() {
                self.chunks.pop_front();
            }
            Ok(n)
        }

        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn set_baud(&mut self, baud: u32) -> Result<()> {
            self.baud_changes.push(baud);
            Ok(())
        }
    }

    #[test]
    fn sign_on_accepts_both_identities() {
        let mut io = FakeSerial::default();
        io.push_reply(1, b"\x01\x00\x08STK500_2");
        let mut dev = Stk500v2::new(io);
        assert!(dev.sign_on().unwrap());

        let mut io = FakeSerial::default();
        io.push_reply(1, b"\x01\x00\x08AVRISP_2");
        let mut dev = Stk500v2::new(io);
        assert!(dev.sign_on().unwrap());
    }

    #[test]
    fn corrupted_reply_is_retried_then_accepted() {
        let mut io = FakeSerial::default();
        // First receive window: garbage header -> drained, resent.
        io.push_chunk(vec![0xff; 5]);
        io.push_timeout(); // nothing left to drain
        // Second reply matches the resent sequence number 2.
        io.push_reply(2, b"\x01\x00\x08STK500_2");
        let mut dev = Stk500v2::new(io);
        assert!(dev.sign_on().unwrap());
    }

    #[test]
    fn persistent_garbage_exhausts_the_retry_bound() {
        let mut io = FakeSerial::default();
        for _ in 0..SEND_RETRIES {
            io.push_chunk(vec![0xff; 5]);
            io.push_timeout();
        }
        let mut dev = Stk500v2::new(io);
        assert!(!dev.sign_on().unwrap());
    }

    #[test]
    fn page_cache_folds_sequential_writes() {
        let mut io = FakeSerial::default();
        // load_address reply (seq 1) and program reply (seq 2).
        io.push_reply(1, &[CMD_LOAD_ADDRESS, STATUS_CMD_OK]);
        io.push_reply(2, &[CMD_PROGRAM_FLASH_ISP, STATUS_CMD_OK]);
        let mut dev = Stk500v2::new(io);

        let data = vec![0x04030201u32; 32]; // exactly one 128-byte page
        dev.program_block(0x1d00_0000, &data).unwrap();
        // One LOAD_ADDRESS + one PROGRAM_FLASH command on the wire.
        let starts = dev
            .io
            .written
            .iter()
            .filter(|&&b| b == MESSAGE_START)
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn baud_switch_applies_only_on_echo() {
        let baud = 500_000u32.to_le_bytes();
        let mut io = FakeSerial::default();
        io.push_reply(
            1,
            &[CMD_SET_BAUD, STATUS_CMD_OK, baud[0], baud[1], baud[2], baud[3]],
        );
        let mut dev = Stk500v2::new(io);
        dev.switch_baud(500_000).unwrap();
        assert_eq!(dev.io.baud_changes, vec![500_000]);

        // A bootloader without CMD_SET_BAUD leaves the rate alone.
        let mut io = FakeSerial::default();
        io.push_timeout();
        let mut dev = Stk500v2::new(io);
        dev.switch_baud(500_000).unwrap();
        assert!(dev.io.baud_changes.is_empty());
    }

    #[test]
    fn devid_scribble_detects_unaware_bootloader() {
        let mut io = FakeSerial::default();
        for seq in 1..=4 {
            io.push_reply(seq, &[CMD_SET_PARAMETER, STATUS_CMD_OK]);
        }
        for (seq, byte) in (5..=8).zip([0x0bu8, 0xb0, 0xaf, 0xde]) {
            io.push_reply(seq, &[CMD_GET_PARAMETER, STATUS_CMD_OK, byte]);
        }
        let mut dev = Stk500v2::new(io);
        assert_eq!(dev.get_idcode().unwrap(), 0xdeaf_b00b);
    }

    #[test]
    fn devid_aware_bootloader_reports_real_id() {
        let mut io = FakeSerial::default();
        for seq in 1..=4 {
            io.push_reply(seq, &[CMD_SET_PARAMETER, STATUS_CMD_OK]);
        }
        for (seq, byte) in (5..=8).zip([0x53u8, 0x70, 0x30, 0x04]) {
            io.push_reply(seq, &[CMD_GET_PARAMETER, STATUS_CMD_OK, byte]);
        }
        let mut dev = Stk500v2::new(io);
        assert_eq!(dev.get_idcode().unwrap(), 0x0430_7053);
    }
}
