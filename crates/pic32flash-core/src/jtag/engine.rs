//! The transport-agnostic TAP/PE protocol engine.
//!
//! All JTAG-capable transports share this state machine; they differ only
//! in how bits reach the wire. The engine drives TAP selection, the
//! serial-execution bootstrap, instruction injection, Programming
//! Executive loading and the PE command set over one
//! [`BitChannel`](crate::channel::BitChannel).

use crate::adapter::VerifyPolicy;
use crate::channel::{shift_read, BitChannel};
use crate::crc::crc16_words;
use crate::error::{Error, Result};
use crate::family::{Family, FamilyKind};
use crate::jtag::{control, etap, mchp, mtap, pe_op, tap};

/// Control register poll limit for PrAcc.
const PRACC_POLL_LIMIT: u32 = 150;
/// Poll count after which a 10 ms target delay is inserted per iteration.
const PRACC_SLOW_AFTER: u32 = 100;
/// Chip erase status poll limit (10 ms steps).
const ERASE_POLL_LIMIT: u32 = 100;

/// Control word shifted while polling for PrAcc. EJTAGBRK must stay
/// clear here or the poll re-arms the debug exception.
const PRACC_POLL_WORD: u32 = control::PRACC | control::PROBEN | control::PROBTRAP;
/// Control word that lets the halted CPU execute the pending access.
const EXECUTE_WORD: u32 = control::PROBEN | control::PROBTRAP;

/// TAP/PE protocol state machine over one bit channel.
pub struct TapEngine<C: BitChannel> {
    chan: C,
    family: Option<&'static Family>,
    verify_policy: VerifyPolicy,
    use_executive: bool,
    serial_execution_mode: bool,
}

impl<C: BitChannel> TapEngine<C> {
    /// Wrap a channel. The family is bound later, once the device has
    /// been probed and matched against the device table.
    pub fn new(chan: C) -> Self {
        TapEngine {
            chan,
            family: None,
            verify_policy: VerifyPolicy::default(),
            use_executive: false,
            serial_execution_mode: false,
        }
    }

    /// Bind the detected family.
    pub fn set_family(&mut self, family: &'static Family) {
        self.family = family.into();
    }

    /// Select the GET_CRC mismatch behavior.
    pub fn set_verify_policy(&mut self, policy: VerifyPolicy) {
        self.verify_policy = policy;
    }

    /// Whether the PE has been loaded.
    pub fn use_executive(&self) -> bool {
        self.use_executive
    }

    /// Direct channel access for transport-specific setup.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.chan
    }

    fn kind(&self) -> FamilyKind {
        // Before probing completes only family-independent operations
        // run; MX behavior is the neutral default.
        self.family.map_or(FamilyKind::Mx3, |f| f.kind)
    }

    /// Shift a 5-bit TAP or ETAP instruction.
    fn send_command(&mut self, cmd: u32) -> Result<()> {
        self.chan.shift(1, 1, 5, u64::from(cmd), false)?;
        Ok(())
    }

    /// Shift an 8-bit MCHP DR command, optionally reading the reply.
    fn xfer_data8(&mut self, data: u32, read: bool) -> Result<u32> {
        match self.chan.shift(0, 0, 8, u64::from(data), read)? {
            Some(word) => Ok(word as u32),
            None => Ok(0),
        }
    }

    /// Shift a 32-bit DR word.
    fn xfer_data32(&mut self, data: u32) -> Result<()> {
        self.chan.shift(0, 0, 32, u64::from(data), false)?;
        Ok(())
    }

    /// Reset the TAP controller: TMS 1-1-1-1-1-0.
    pub fn reset_tap(&mut self) -> Result<()> {
        self.chan.shift(6, 31, 0, 0, false)?;
        Ok(())
    }

    /// Read the device identification code. After a TAP reset the IDCODE
    /// register is selected, so the 32-bit read follows directly.
    pub fn get_idcode(&mut self) -> Result<u32> {
        let word = shift_read(&mut self.chan, 6, 31, 32, 0)?;
        Ok(word as u32)
    }

    /// Read the MCHP status register.
    pub fn read_status(&mut self) -> Result<u32> {
        self.send_command(tap::SW_MTAP)?;
        self.send_command(mtap::COMMAND)?;
        self.xfer_data8(mchp::STATUS, true)
    }

    /// Check device status after power-up/reset, before any programming.
    ///
    /// The revised (datasheet-aligned) check issues a STATUS prime, a
    /// short delay and a STATUS read, requiring CFGRDY set and FCBUSY
    /// clear. The `oldway-status` feature restores the pre-revision
    /// FLASH_ENABLE-based check for legacy adapter firmware.
    pub fn check_device_status(&mut self) -> Result<u32> {
        self.send_command(tap::SW_MTAP)?;
        self.send_command(mtap::COMMAND)?;
        #[cfg(feature = "oldway-status")]
        {
            self.xfer_data8(mchp::FLASH_ENABLE, false)?;
            let status = self.xfer_data8(mchp::STATUS, true)?;
            if (status & !mchp::STATUS_DEVRST)
                != (mchp::STATUS_CPS | mchp::STATUS_CFGRDY | mchp::STATUS_FAEN)
            {
                return Err(Error::BadStatus {
                    status,
                    context: "device status check",
                });
            }
            Ok(status)
        }
        #[cfg(not(feature = "oldway-status"))]
        {
            self.xfer_data8(mchp::STATUS, false)?;
            self.chan.target_delay_ms(10)?;
            let status = self.xfer_data8(mchp::STATUS, true)?;
            if (status & (mchp::STATUS_CFGRDY | mchp::STATUS_FCBUSY)) != mchp::STATUS_CFGRDY {
                return Err(Error::BadStatus {
                    status,
                    context: "device status check",
                });
            }
            Ok(status)
        }
    }

    /// Force the target CPU into EJTAG debug boot so instructions can be
    /// injected. Entered at most once per session.
    pub fn serial_execution(&mut self) -> Result<()> {
        if self.serial_execution_mode {
            return Ok(());
        }
        self.serial_execution_mode = true;
        log::debug!("enter serial execution");

        self.send_command(tap::SW_MTAP)?;
        self.send_command(mtap::COMMAND)?;
        let status = self.xfer_data8(mchp::STATUS, true)?;
        log::debug!("status {:#06x}", status);
        if status & mchp::STATUS_CPS == 0 {
            return Err(Error::CodeProtected { status });
        }

        self.xfer_data8(mchp::ASSERT_RST, false)?;

        self.send_command(tap::SW_ETAP)?;
        self.send_command(etap::EJTAGBOOT)?;

        self.send_command(tap::SW_MTAP)?;
        self.send_command(mtap::COMMAND)?;
        self.xfer_data8(mchp::DEASSERT_RST, false)?;

        if self.kind().supports_flash_enable() {
            self.xfer_data8(mchp::FLASH_ENABLE, false)?;
            // The CPU must have halted into debug boot with flash access
            // up; anything else here means the bootstrap did not take.
            let status = self.xfer_data8(mchp::STATUS, true)?;
            if (status & !mchp::STATUS_DEVRST)
                != (mchp::STATUS_CPS | mchp::STATUS_CFGRDY | mchp::STATUS_FAEN)
            {
                return Err(Error::BadStatus {
                    status,
                    context: "serial execution",
                });
            }
        }

        self.send_command(tap::SW_ETAP)?;
        self.chan.flush()
    }

    /// Poll the EJTAG Control register until PrAcc is observed set.
    fn wait_pracc(&mut self, context: &'static str) -> Result<()> {
        self.send_command(etap::CONTROL)?;
        let mut polls = 0;
        loop {
            if polls > PRACC_SLOW_AFTER {
                self.chan.target_delay_ms(10)?;
            }
            let ctl =
                shift_read(&mut self.chan, 0, 0, 32, u64::from(PRACC_POLL_WORD))? as u32;
            polls += 1;
            if ctl & control::PRACC != 0 {
                return Ok(());
            }
            if polls >= PRACC_POLL_LIMIT {
                return Err(Error::PrAccNotSet { polls, context });
            }
        }
    }

    /// Inject one MIPS instruction into the halted CPU.
    pub fn xfer_instruction(&mut self, instruction: u32) -> Result<()> {
        log::trace!("xfer instruction {:#010x}", instruction);
        self.wait_pracc("xfer_instruction")?;

        self.send_command(etap::DATA)?;
        self.xfer_data32(instruction)?;

        self.send_command(etap::CONTROL)?;
        self.xfer_data32(EXECUTE_WORD)
    }

    /// Read the 32-bit value the halted CPU placed in the Data register,
    /// then let it resume.
    pub fn get_pe_response(&mut self) -> Result<u32> {
        self.wait_pracc("get_pe_response")?;

        self.send_command(etap::DATA)?;
        let response = shift_read(&mut self.chan, 0, 0, 32, 0)? as u32;

        self.send_command(etap::CONTROL)?;
        self.xfer_data32(EXECUTE_WORD)?;
        log::trace!("PE response {:#010x}", response);
        Ok(response)
    }

    /// One 33-bit FastData transfer: 32 data bits plus the PrAcc sync bit.
    fn xfer_fastdata(&mut self, word: u32) -> Result<()> {
        self.chan.shift(0, 0, 33, u64::from(word) << 1, false)?;
        Ok(())
    }

    /// Read one word over FastData. The low bit of the 33-bit shift
    /// carries no data and is masked off.
    fn read_fastdata(&mut self) -> Result<u32> {
        let word = shift_read(&mut self.chan, 0, 0, 33, 0)?;
        Ok((word >> 1) as u32)
    }

    /// Read one word of memory without the PE, through a five-instruction
    /// load/store sequence and a FastData pickup.
    pub fn read_word(&mut self, addr: u32) -> Result<u32> {
        let addr_lo = addr & 0xffff;
        let addr_hi = (addr >> 16) & 0xffff;

        self.serial_execution()?;

        self.xfer_instruction(0x3c13ff20)?; // lui s3, 0xff20
        self.xfer_instruction(0x3c080000 | addr_hi)?; // lui t0, addr_hi
        self.xfer_instruction(0x35080000 | addr_lo)?; // ori t0, addr_lo
        self.xfer_instruction(0x8d090000)?; // lw  t1, 0(t0)
        self.xfer_instruction(0xae690000)?; // sw  t1, 0(s3)

        self.send_command(etap::FASTDATA)?;
        let word = self.read_fastdata()?;
        log::debug!("read word at {:#010x} -> {:#010x}", addr, word);
        Ok(word)
    }

    /// Read a block of memory. Uses the PE in 32-word chunks once it is
    /// resident, single-word reads otherwise.
    pub fn read_data(&mut self, addr: u32, nwords: u32) -> Result<Vec<u32>> {
        if !self.use_executive {
            let mut data = Vec::with_capacity(nwords as usize);
            for i in 0..nwords {
                data.push(self.read_word(addr + i * 4)?);
            }
            return Ok(data);
        }

        let mut data = Vec::with_capacity(nwords.next_multiple_of(32) as usize);
        let mut addr = addr;
        while (data.len() as u32) < nwords {
            self.send_command(etap::FASTDATA)?;
            self.xfer_fastdata(pe_op::READ << 16 | 32)?;
            self.xfer_fastdata(addr)?;

            let response = self.get_pe_response()?;
            if response != pe_op::READ << 16 {
                return Err(Error::PeResponse {
                    expected: pe_op::READ << 16,
                    got: response,
                });
            }
            for _ in 0..32 {
                let word = self.get_pe_response()?;
                data.push(word);
            }
            addr += 32 * 4;
        }
        data.truncate(nwords as usize);
        Ok(data)
    }

    fn require_executive(&self, op: &'static str) -> Result<()> {
        if self.use_executive {
            Ok(())
        } else {
            Err(Error::Unsupported(op))
        }
    }

    /// Download the PE loader and the Programming Executive, then verify
    /// the version handshake. The exact step order is load-bearing; the
    /// loader and PE sit at fixed RAM addresses the injected code itself
    /// encodes.
    pub fn load_executive(&mut self, pe: &[u32], pe_version: u16) -> Result<()> {
        let spec = self
            .family
            .and_then(|f| f.pe.as_ref())
            .ok_or(Error::Unsupported("load_executive"))?;
        let loader = spec.loader;
        let loader_hi = spec.loader_addr >> 16;
        let loader_lo = spec.loader_addr & 0xffff;

        self.use_executive = true;
        self.serial_execution()?;

        log::debug!("download PE loader");
        if self.kind().needs_bus_matrix_setup() {
            // Step 1: make RAM above the kernel partition executable.
            self.xfer_instruction(0x3c04bf88)?; // lui a0, 0xbf88
            self.xfer_instruction(0x34842000)?; // ori a0, 0x2000 - BMXCON
            self.xfer_instruction(0x3c05001f)?; // lui a1, 0x1f
            self.xfer_instruction(0x34a50040)?; // ori a1, 0x40
            self.xfer_instruction(0xac850000)?; // sw  a1, 0(a0)

            // Step 2: BMXDKPBA.
            self.xfer_instruction(0x34050800)?; // li  a1, 0x800
            self.xfer_instruction(0xac850010)?; // sw  a1, 16(a0)

            // Step 3: BMXDUDBA and BMXDUPBA from BMXDMSZ.
            self.xfer_instruction(0x8c850040)?; // lw  a1, 64(a0)
            self.xfer_instruction(0xac850020)?; // sw  a1, 32(a0)
            self.xfer_instruction(0xac850030)?; // sw  a1, 48(a0)
        }

        // Step 4: destination pointer for the loader.
        self.xfer_instruction(0x3c040000 | loader_hi)?; // lui a0
        self.xfer_instruction(0x34840000 | loader_lo)?; // ori a0

        // Step 5: write the loader, one word per lui/ori/sw/addiu group.
        for pair in loader.chunks_exact(2) {
            self.xfer_instruction(0x3c060000 | u32::from(pair[0]))?; // lui a2, hi
            self.xfer_instruction(0x34c60000 | u32::from(pair[1]))?; // ori a2, lo
            self.xfer_instruction(0xac860000)?; // sw  a2, 0(a0)
            self.xfer_instruction(0x24840004)?; // addiu a0, 4
        }

        // Step 6: jump into the loader.
        self.xfer_instruction(0x3c190000 | loader_hi)?; // lui t9
        self.xfer_instruction(0x37390000 | loader_lo)?; // ori t9
        self.xfer_instruction(0x03200008)?; // jr  t9
        self.xfer_instruction(0x00000000)?; // nop

        // Switch from serial to fast execution mode.
        self.send_command(tap::SW_ETAP)?;
        self.reset_tap()?;

        // Step 7-A: loader parameters, destination and word count.
        self.send_command(etap::FASTDATA)?;
        self.xfer_fastdata(spec.ram_addr)?;
        self.xfer_fastdata(pe.len() as u32)?;

        // Step 7-B: stream the PE itself.
        log::debug!("download PE, {} words", pe.len());
        for &word in pe {
            self.xfer_fastdata(word)?;
        }
        self.chan.flush()?;
        self.chan.target_delay_ms(10)?;

        // Step 8: jump to the PE.
        self.xfer_fastdata(0)?;
        self.xfer_fastdata(0xdead0000)?;
        self.chan.flush()?;
        self.chan.target_delay_ms(10)?;

        self.xfer_fastdata(pe_op::EXEC_VERSION << 16)?;
        let version = self.get_pe_response()?;
        let expected = pe_op::EXEC_VERSION << 16 | u32::from(pe_version);
        if version != expected {
            return Err(Error::PeVersionMismatch {
                expected,
                got: version,
            });
        }
        log::debug!("PE version {:#06x}", version & 0xffff);
        Ok(())
    }

    /// Program one word of flash through the PE.
    pub fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
        log::debug!("program word at {:#010x}: {:#010x}", addr, word);
        self.require_executive("program_word without executive")?;

        self.send_command(etap::FASTDATA)?;
        self.xfer_fastdata(pe_op::WORD_PROGRAM << 16 | 2)?;
        self.chan.flush()?;
        self.xfer_fastdata(addr)?;
        self.chan.flush()?;
        self.xfer_fastdata(word)?;

        let response = self.get_pe_response()?;
        if response != pe_op::WORD_PROGRAM << 16 {
            return Err(Error::PeResponse {
                expected: pe_op::WORD_PROGRAM << 16,
                got: response,
            });
        }
        Ok(())
    }

    /// Program one full flash row through the PE. A malformed status
    /// aborts the session: a partially consumed row cannot be retried.
    pub fn program_row(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        log::debug!("row program {} words at {:#010x}", data.len(), addr);
        self.require_executive("program_row without executive")?;

        self.send_command(etap::FASTDATA)?;
        self.xfer_fastdata(pe_op::ROW_PROGRAM << 16 | data.len() as u32)?;
        self.chan.flush()?;
        self.xfer_fastdata(addr)?;

        for (i, &word) in data.iter().enumerate() {
            if i % 8 == 0 {
                self.chan.flush()?;
            }
            self.xfer_fastdata(word)?;
        }
        self.chan.flush()?;

        let response = self.get_pe_response()?;
        if response != pe_op::ROW_PROGRAM << 16 {
            return Err(Error::PeResponse {
                expected: pe_op::ROW_PROGRAM << 16,
                got: response,
            });
        }
        Ok(())
    }

    /// Program two adjacent words, keeping ECC parity consistent.
    pub fn program_double_word(&mut self, addr: u32, w0: u32, w1: u32) -> Result<()> {
        self.require_executive("program_double_word without executive")?;

        self.send_command(etap::FASTDATA)?;
        self.xfer_fastdata(pe_op::DOUBLE_WORD_PROGRAM << 16)?;
        self.xfer_fastdata(addr)?;
        self.xfer_fastdata(w0)?;
        self.xfer_fastdata(w1)?;

        let response = self.get_pe_response()?;
        if response != pe_op::DOUBLE_WORD_PROGRAM << 16 {
            return Err(Error::PeResponse {
                expected: pe_op::DOUBLE_WORD_PROGRAM << 16,
                got: response,
            });
        }
        Ok(())
    }

    /// Program four adjacent words, keeping ECC parity consistent.
    pub fn program_quad_word(&mut self, addr: u32, words: [u32; 4]) -> Result<()> {
        self.require_executive("program_quad_word without executive")?;

        self.send_command(etap::FASTDATA)?;
        self.xfer_fastdata(pe_op::QUAD_WORD_PROGRAM << 16)?;
        self.xfer_fastdata(addr)?;
        for word in words {
            self.xfer_fastdata(word)?;
        }

        let response = self.get_pe_response()?;
        if response != pe_op::QUAD_WORD_PROGRAM << 16 {
            return Err(Error::PeResponse {
                expected: pe_op::QUAD_WORD_PROGRAM << 16,
                got: response,
            });
        }
        Ok(())
    }

    /// Verify a block via the PE GET_CRC command against a locally
    /// computed CRC over the same byte range.
    pub fn verify_data(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        self.require_executive("verify_data without executive")?;

        self.send_command(etap::FASTDATA)?;
        self.xfer_fastdata(pe_op::GET_CRC << 16)?;
        self.chan.flush()?;
        self.xfer_fastdata(addr)?;
        self.chan.flush()?;
        self.xfer_fastdata(data.len() as u32 * 4)?;

        let response = self.get_pe_response()?;
        if response != pe_op::GET_CRC << 16 {
            return Err(Error::PeResponse {
                expected: pe_op::GET_CRC << 16,
                got: response,
            });
        }
        let flash_crc = (self.get_pe_response()? & 0xffff) as u16;

        let local_crc = crc16_words(0xffff, data);
        if flash_crc != local_crc {
            match self.verify_policy {
                VerifyPolicy::Strict => {
                    return Err(Error::VerifyCrc {
                        addr,
                        flash: flash_crc,
                        local: local_crc,
                    })
                }
                VerifyPolicy::Warn => log::warn!(
                    "checksum failed at {:#010x}: sum={:#06x}, expected={:#06x}",
                    addr,
                    flash_crc,
                    local_crc
                ),
            }
        }
        Ok(())
    }

    /// Erase all flash memory at the MTAP level and poll until the flash
    /// controller goes idle.
    pub fn erase_chip(&mut self) -> Result<()> {
        self.send_command(tap::SW_MTAP)?;
        self.send_command(mtap::COMMAND)?;
        self.xfer_data8(mchp::ERASE, false)?;

        if self.kind().erase_needs_deassert() {
            self.xfer_data8(mchp::DEASSERT_RST, false)?;
        }

        let mut status = 0;
        for _ in 0..ERASE_POLL_LIMIT {
            self.chan.target_delay_ms(10)?;
            status = self.xfer_data8(mchp::STATUS, true)?;
            if (status & (mchp::STATUS_CFGRDY | mchp::STATUS_FCBUSY)) == mchp::STATUS_CFGRDY {
                return Ok(());
            }
        }
        Err(Error::EraseTimeout { status })
    }

    /// End the session: clear EJTAGBOOT so the next reset boots normally,
    /// then release the channel.
    pub fn finish(&mut self, power_on: bool) -> Result<()> {
        self.send_command(tap::SW_ETAP)?;
        self.reset_tap()?;
        self.chan.flush()?;
        self.chan.finish(power_on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family;
    use crate::jtag::mock::MockChannel;

    fn engine(chan: MockChannel) -> TapEngine<MockChannel> {
        TapEngine::new(chan)
    }

    fn healthy_status() -> u64 {
        u64::from(mchp::STATUS_CPS | mchp::STATUS_CFGRDY | mchp::STATUS_FAEN)
    }

    #[test]
    fn idcode_read_follows_tap_reset() {
        let mut chan = MockChannel::new();
        chan.data_reads.push_back(0x0430_7053);
        let mut eng = engine(chan);
        assert_eq!(eng.get_idcode().unwrap(), 0x0430_7053);
        let calls = &eng.channel_mut().calls;
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].tms_nbits, calls[0].tms), (6, 31));
        assert_eq!(calls[0].tdi_nbits, 32);
        assert!(calls[0].read);
    }

    #[test]
    fn pracc_poll_gives_up_after_exact_bound() {
        let mut chan = MockChannel::new();
        chan.control_response = 0; // PrAcc never comes up
        let mut eng = engine(chan);
        match eng.xfer_instruction(0) {
            Err(Error::PrAccNotSet { polls, .. }) => assert_eq!(polls, PRACC_POLL_LIMIT),
            other => panic!("expected PrAccNotSet, got {:?}", other),
        }
        let control_polls = eng
            .channel_mut()
            .calls
            .iter()
            .filter(|c| c.tdi_nbits == 32 && c.read)
            .count();
        assert_eq!(control_polls as u32, PRACC_POLL_LIMIT);
        // Slow transports get a 10 ms breather per poll past the threshold.
        assert_eq!(
            eng.channel_mut().delays.len() as u32,
            PRACC_POLL_LIMIT - PRACC_SLOW_AFTER - 1
        );
    }

    #[test]
    fn serial_execution_is_entered_once() {
        let mut chan = MockChannel::new();
        chan.status_default = healthy_status();
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);
        eng.serial_execution().unwrap();
        let first = eng.channel_mut().calls.len();
        eng.serial_execution().unwrap();
        assert_eq!(eng.channel_mut().calls.len(), first, "replay emitted traffic");
    }

    #[test]
    fn serial_execution_rejects_code_protection() {
        let mut chan = MockChannel::new();
        chan.status_reads.push_back(u64::from(mchp::STATUS_CFGRDY));
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);
        match eng.serial_execution() {
            Err(Error::CodeProtected { .. }) => {}
            other => panic!("expected CodeProtected, got {:?}", other),
        }
    }

    #[test]
    fn serial_execution_sequences_reset_around_ejtagboot() {
        let mut chan = MockChannel::new();
        chan.status_default = healthy_status();
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);
        eng.serial_execution().unwrap();

        let data8: Vec<u32> = eng
            .channel_mut()
            .calls
            .iter()
            .filter(|c| c.tdi_nbits == 8)
            .map(|c| c.tdi as u32)
            .collect();
        assert_eq!(
            data8,
            vec![
                mchp::STATUS,
                mchp::ASSERT_RST,
                mchp::DEASSERT_RST,
                mchp::FLASH_ENABLE,
                mchp::STATUS
            ]
        );
    }

    #[test]
    fn failed_bootstrap_status_check_is_fatal() {
        let mut chan = MockChannel::new();
        chan.status_reads.push_back(healthy_status());
        // Flash access never came up after the reset dance.
        chan.status_reads
            .push_back(u64::from(mchp::STATUS_CPS | mchp::STATUS_CFGRDY));
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);
        match eng.serial_execution() {
            Err(Error::BadStatus { context, .. }) => {
                assert_eq!(context, "serial execution")
            }
            other => panic!("expected BadStatus, got {:?}", other),
        }
    }

    #[test]
    fn mz_bootstrap_skips_flash_enable() {
        let mut chan = MockChannel::new();
        chan.status_reads.push_back(healthy_status());
        let mut eng = engine(chan);
        eng.set_family(&family::MZ);
        eng.serial_execution().unwrap();
        assert!(
            !eng.channel_mut()
                .calls
                .iter()
                .any(|c| c.tdi_nbits == 8 && c.tdi as u32 == mchp::FLASH_ENABLE),
            "FLASH_ENABLE issued on MZ"
        );
    }

    #[test]
    fn loader_injection_emits_one_quadruple_per_word() {
        let mut chan = MockChannel::new();
        chan.status_default = healthy_status();
        // EXEC_VERSION handshake reply.
        chan.data_reads
            .push_back(u64::from(pe_op::EXEC_VERSION << 16 | 0x0201));
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);

        let pe = [0x1000_0000u32, 0x2000_0000, 0x3000_0000];
        eng.load_executive(&pe, 0x0201).unwrap();

        let loader_len = family::MX3.pe.as_ref().unwrap().loader.len();
        // Injected instructions only; drop the Control writes that
        // resume the CPU after each injection.
        let instr_writes: Vec<u32> = eng
            .channel_mut()
            .calls
            .iter()
            .filter(|c| c.tdi_nbits == 32 && !c.read)
            .map(|c| c.tdi as u32)
            .filter(|&w| w != EXECUTE_WORD)
            .collect();
        let stores = instr_writes.iter().filter(|&&w| w == 0xac86_0000).count();
        let advances = instr_writes.iter().filter(|&&w| w == 0x2484_0004).count();
        assert_eq!(stores, loader_len / 2, "one sw per loader word");
        assert_eq!(advances, loader_len / 2, "one addiu per loader word");
        // Each sw is immediately followed by its pointer advance: the
        // destination address increases strictly, in steps of four.
        for pair in instr_writes.windows(2) {
            if pair[0] == 0xac86_0000 {
                assert_eq!(pair[1], 0x2484_0004);
            }
        }

        // The PE words and the jump sentinel go out over FastData.
        let fastdata: Vec<u32> = eng
            .channel_mut()
            .calls
            .iter()
            .filter(|c| c.tdi_nbits == 33 && !c.read)
            .map(|c| (c.tdi >> 1) as u32)
            .collect();
        let spec = family::MX3.pe.as_ref().unwrap();
        assert_eq!(fastdata[0], spec.ram_addr);
        assert_eq!(fastdata[1], pe.len() as u32);
        assert_eq!(&fastdata[2..5], &pe);
        assert_eq!(&fastdata[5..7], &[0, 0xdead_0000]);
    }

    #[test]
    fn pe_version_mismatch_is_fatal() {
        let mut chan = MockChannel::new();
        chan.status_default = healthy_status();
        chan.data_reads
            .push_back(u64::from(pe_op::EXEC_VERSION << 16 | 0x0105));
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);
        match eng.load_executive(&[0; 4], 0x0201) {
            Err(Error::PeVersionMismatch { expected, got }) => {
                assert_eq!(expected, pe_op::EXEC_VERSION << 16 | 0x0201);
                assert_eq!(got, pe_op::EXEC_VERSION << 16 | 0x0105);
            }
            other => panic!("expected PeVersionMismatch, got {:?}", other),
        }
    }

    fn pe_loaded_engine(mut chan: MockChannel) -> TapEngine<MockChannel> {
        chan.status_default = healthy_status();
        chan.data_reads
            .push_front(u64::from(pe_op::EXEC_VERSION << 16 | 0x0201));
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);
        eng.load_executive(&[0; 4], 0x0201).unwrap();
        eng.channel_mut().calls.clear();
        eng
    }

    #[test]
    fn get_crc_match_verifies_silently() {
        let data = [0x11223344u32, 0x55667788];
        let crc = crc16_words(0xffff, &data);
        let mut chan = MockChannel::new();
        chan.data_reads.push_back(u64::from(pe_op::GET_CRC << 16));
        chan.data_reads.push_back(u64::from(crc));
        let mut eng = pe_loaded_engine(chan);
        eng.verify_data(0x1d00_0000, &data).unwrap();
    }

    #[test]
    fn get_crc_mismatch_honors_policy() {
        let data = [0x11223344u32, 0x55667788];
        for (policy, fatal) in [(VerifyPolicy::Strict, true), (VerifyPolicy::Warn, false)] {
            let mut chan = MockChannel::new();
            chan.data_reads.push_back(u64::from(pe_op::GET_CRC << 16));
            chan.data_reads.push_back(0x5678);
            let mut eng = pe_loaded_engine(chan);
            eng.set_verify_policy(policy);
            let result = eng.verify_data(0x1d00_0000, &data);
            match (fatal, result) {
                (true, Err(Error::VerifyCrc { flash, .. })) => assert_eq!(flash, 0x5678),
                (false, Ok(())) => {}
                (_, other) => panic!("unexpected outcome under {:?}: {:?}", policy, other),
            }
        }
    }

    #[test]
    fn row_program_checks_opcode_echo() {
        let row = vec![0u32; 32];
        let mut chan = MockChannel::new();
        chan.data_reads.push_back(0xdead_dead);
        let mut eng = pe_loaded_engine(chan);
        match eng.program_row(0x1d00_0000, &row) {
            Err(Error::PeResponse { expected, .. }) => {
                assert_eq!(expected, pe_op::ROW_PROGRAM << 16)
            }
            other => panic!("expected PeResponse, got {:?}", other),
        }
    }

    #[test]
    fn read_data_uses_32_word_pe_chunks() {
        let mut chan = MockChannel::new();
        chan.data_reads.push_back(u64::from(pe_op::READ << 16));
        for i in 0..32u64 {
            chan.data_reads.push_back(i);
        }
        let mut eng = pe_loaded_engine(chan);
        let data = eng.read_data(0x1d00_0000, 10).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(data[9], 9);
        // The READ announcement covers a full 32-word chunk.
        let announce = eng
            .channel_mut()
            .calls
            .iter()
            .find(|c| c.tdi_nbits == 33 && (c.tdi >> 1) as u32 == pe_op::READ << 16 | 32);
        assert!(announce.is_some());
    }

    #[test]
    fn erase_polls_until_flash_controller_idle() {
        let mut chan = MockChannel::new();
        let busy = u64::from(mchp::STATUS_CFGRDY | mchp::STATUS_FCBUSY);
        chan.status_reads.push_back(busy);
        chan.status_reads.push_back(busy);
        chan.status_reads.push_back(u64::from(mchp::STATUS_CFGRDY));
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);
        eng.erase_chip().unwrap();
        assert_eq!(eng.channel_mut().delays.len(), 3);
    }

    #[test]
    fn erase_times_out_when_busy_persists() {
        let mut chan = MockChannel::new();
        chan.status_default = u64::from(mchp::STATUS_CFGRDY | mchp::STATUS_FCBUSY);
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);
        match eng.erase_chip() {
            Err(Error::EraseTimeout { .. }) => {}
            other => panic!("expected EraseTimeout, got {:?}", other),
        }
        assert_eq!(eng.channel_mut().delays.len() as u32, ERASE_POLL_LIMIT);
    }

    #[test]
    fn mz_erase_deasserts_reset_after_erase_command() {
        let mut chan = MockChannel::new();
        chan.status_reads.push_back(u64::from(mchp::STATUS_CFGRDY));
        let mut eng = engine(chan);
        eng.set_family(&family::MZ);
        eng.erase_chip().unwrap();
        let data8: Vec<u32> = eng
            .channel_mut()
            .calls
            .iter()
            .filter(|c| c.tdi_nbits == 8 && !c.read)
            .map(|c| c.tdi as u32)
            .collect();
        assert_eq!(data8[0], mchp::ERASE);
        assert_eq!(data8[1], mchp::DEASSERT_RST);
    }

    #[test]
    fn bootstrap_replay_leaves_idcode_stable() {
        // Replaying the bootstrap must not disturb the ID code readout.
        let mut chan = MockChannel::new();
        chan.status_default = healthy_status();
        chan.data_reads.push_back(0x0430_7053);
        chan.data_reads.push_back(0x0430_7053);
        let mut eng = engine(chan);
        eng.set_family(&family::MX3);
        let before = eng.get_idcode().unwrap();
        eng.serial_execution().unwrap();
        eng.serial_execution().unwrap();
        let after = eng.get_idcode().unwrap();
        assert_eq!(before, after);
    }
}
