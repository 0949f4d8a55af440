//! PICkit2/PICkit3 adapter: the TAP protocol is expressed as scripts
//! executed by the programmer's own firmware, so this adapter implements
//! [`Adapter`] directly instead of going through a bit channel.

use pic32flash_core::adapter::{Adapter, Capabilities};
use pic32flash_core::family::Family;
use pic32flash_core::jtag::{etap, mchp, mtap, tap};
use pic32flash_core::{Error, Result};

use crate::hid::HidIo;
use crate::protocol::*;

/// Target power supply.
const VDD_VOLTAGE: f64 = 3.3;
const VDD_LIMIT: f64 = 2.81;
/// Reset (Vpp) supply.
const VPP_VOLTAGE: f64 = 3.28;
const VPP_LIMIT: f64 = 2.26;

fn wb(word: u32) -> [u8; 4] {
    word.to_le_bytes()
}

/// PICkit2 or PICkit3 in scripting mode.
pub struct Pickit<H: HidIo> {
    hid: H,
    is_pk3: bool,
    name: &'static str,
    family: Option<&'static Family>,
    reply: [u8; REPORT_SIZE],
    use_executive: bool,
    serial_execution_mode: bool,
    capabilities: Capabilities,
}

impl<H: HidIo> Pickit<H> {
    fn send(&mut self, parts: &[u8]) -> Result<()> {
        let mut report = [CMD_END_OF_BUFFER; REPORT_SIZE];
        report[..parts.len()].copy_from_slice(parts);
        self.hid.write_report(&report)
    }

    fn recv(&mut self) -> Result<()> {
        let mut report = [0u8; REPORT_SIZE];
        self.hid.read_report(&mut report)?;
        self.reply = report;
        Ok(())
    }

    /// Poll the programmer status and fail if the ICD port timed out.
    fn check_timeout(&mut self, context: &'static str) -> Result<()> {
        self.send(&[CMD_READ_STATUS])?;
        self.recv()?;
        let status = u16::from_le_bytes([self.reply[0], self.reply[1]]);
        if status & STATUS_ICD_TIMEOUT != 0 {
            return Err(Error::BadStatus {
                status: u32::from(status),
                context,
            });
        }
        Ok(())
    }

    fn read_status(&mut self) -> Result<u16> {
        self.send(&[CMD_CLEAR_UPLOAD_BUFFER, CMD_READ_STATUS])?;
        self.recv()?;
        Ok(u16::from_le_bytes([self.reply[0], self.reply[1]]))
    }

    fn serial_execution(&mut self) -> Result<()> {
        if self.serial_execution_mode {
            return Ok(());
        }
        self.serial_execution_mode = true;
        log::debug!("{}: enter serial execution", self.name);

        #[rustfmt::skip]
        let script = [
            CMD_EXECUTE_SCRIPT, 27,
            SCRIPT_JT2_SENDCMD, tap::SW_MTAP as u8,
            SCRIPT_JT2_SENDCMD, mtap::COMMAND as u8,
            SCRIPT_JT2_XFERDATA8_LIT, mchp::STATUS as u8,
            SCRIPT_JT2_SENDCMD, tap::SW_MTAP as u8,
            SCRIPT_JT2_SENDCMD, mtap::COMMAND as u8,
            SCRIPT_JT2_XFERDATA8_LIT, mchp::ASSERT_RST as u8,
            SCRIPT_JT2_SENDCMD, tap::SW_ETAP as u8,
            SCRIPT_JT2_SETMODE, 6, 0x1f,
            SCRIPT_JT2_SENDCMD, etap::EJTAGBOOT as u8,
            SCRIPT_JT2_SENDCMD, tap::SW_MTAP as u8,
            SCRIPT_JT2_SENDCMD, mtap::COMMAND as u8,
            SCRIPT_JT2_XFERDATA8_LIT, mchp::DEASSERT_RST as u8,
            SCRIPT_JT2_XFERDATA8_LIT, mchp::FLASH_ENABLE as u8,
        ];
        // MZ parts fault on FLASH_ENABLE; drop the last script op there.
        let flash_enable_ok = self
            .family
            .map_or(true, |f| f.kind.supports_flash_enable());
        if flash_enable_ok {
            self.send(&script)
        } else {
            let mut script = script.to_vec();
            script.truncate(script.len() - 2);
            script[1] -= 2;
            self.send(&script)
        }
    }

    /// Append a DOWNLOAD_DATA part carrying up to 15 words.
    fn download_words(&mut self, words: &[u32], clear_first: bool) -> Result<()> {
        let mut parts = Vec::with_capacity(3 + words.len() * 4);
        if clear_first {
            parts.push(CMD_CLEAR_DOWNLOAD_BUFFER);
        }
        parts.push(CMD_DOWNLOAD_DATA);
        parts.push((words.len() * 4) as u8);
        for &word in words {
            parts.extend_from_slice(&wb(word));
        }
        self.send(&parts)
    }

}

impl<H: HidIo> Adapter for Pickit<H> {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn set_family(&mut self, family: &'static Family) {
        self.family = Some(family);
    }

    fn get_idcode(&mut self) -> Result<u32> {
        self.send(&[
            CMD_CLEAR_UPLOAD_BUFFER,
            CMD_EXECUTE_SCRIPT,
            9,
            SCRIPT_JT2_SENDCMD,
            tap::SW_MTAP as u8,
            SCRIPT_JT2_SENDCMD,
            mtap::IDCODE as u8,
            SCRIPT_JT2_XFERDATA32_LIT,
            0,
            0,
            0,
            0,
        ])?;
        self.send(&[CMD_UPLOAD_DATA])?;
        self.recv()?;
        if self.reply[0] != 4 {
            return Ok(0);
        }
        Ok(u32::from_le_bytes([
            self.reply[1],
            self.reply[2],
            self.reply[3],
            self.reply[4],
        ]))
    }

    fn read_word(&mut self, addr: u32) -> Result<u32> {
        self.serial_execution()?;

        let addr_lo = addr & 0xffff;
        let addr_hi = (addr >> 16) & 0xffff;

        // Pass 1: 31 data bits arrive MSB-justified; the LSB is garbage.
        let mut parts = vec![CMD_CLEAR_DOWNLOAD_BUFFER, CMD_CLEAR_UPLOAD_BUFFER];
        parts.extend_from_slice(&[CMD_DOWNLOAD_DATA, 24]);
        for word in [
            0x3c13ff20,            // lui s3, 0xff20
            0x3c080000 | addr_hi,  // lui t0, addr_hi
            0x35080000 | addr_lo,  // ori t0, addr_lo
            0x8d090000,            // lw  t1, 0(t0)
            0xae690000,            // sw  t1, 0(s3)
            0x00000000,            // nop
        ] {
            parts.extend_from_slice(&wb(word));
        }
        parts.extend_from_slice(&[
            CMD_EXECUTE_SCRIPT, 18,
            SCRIPT_JT2_SENDCMD, tap::SW_ETAP as u8,
            SCRIPT_JT2_SETMODE, 6, 0x1f,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_SENDCMD, etap::FASTDATA as u8,
            SCRIPT_JT2_XFERDATA32_LIT, 0, 0, 0, 0,
            CMD_UPLOAD_DATA,
        ]);
        self.send(&parts)?;
        self.recv()?;
        if self.reply[0] != 4 {
            return Err(Error::Protocol(format!(
                "read word {:#010x}: bad reply length {}",
                addr, self.reply[0]
            )));
        }
        let word1 = u32::from_le_bytes([
            self.reply[1],
            self.reply[2],
            self.reply[3],
            self.reply[4],
        ]);

        // Pass 2: shift the value right by one first, recovering bit 31.
        let mut parts = vec![CMD_CLEAR_DOWNLOAD_BUFFER, CMD_CLEAR_UPLOAD_BUFFER];
        parts.extend_from_slice(&[CMD_DOWNLOAD_DATA, 28]);
        for word in [
            0x3c13ff20,            // lui s3, 0xff20
            0x3c080000 | addr_hi,  // lui t0, addr_hi
            0x35080000 | addr_lo,  // ori t0, addr_lo
            0x8d090000,            // lw  t1, 0(t0)
            0x00094842,            // srl t1, 1
            0xae690004,            // sw  t1, 4(s3)
            0x00000000,            // nop
        ] {
            parts.extend_from_slice(&wb(word));
        }
        parts.extend_from_slice(&[
            CMD_EXECUTE_SCRIPT, 19,
            SCRIPT_JT2_SENDCMD, tap::SW_ETAP as u8,
            SCRIPT_JT2_SETMODE, 6, 0x1f,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_SENDCMD, etap::FASTDATA as u8,
            SCRIPT_JT2_XFERDATA32_LIT, 0, 0, 0, 0,
            CMD_UPLOAD_DATA,
        ]);
        self.send(&parts)?;
        self.recv()?;
        if self.reply[0] != 4 {
            return Err(Error::Protocol(format!(
                "read word {:#010x}: bad reply length {}",
                addr, self.reply[0]
            )));
        }
        let word2 = u32::from_le_bytes([
            self.reply[1],
            self.reply[2],
            self.reply[3],
            self.reply[4],
        ]);

        Ok((word1 >> 1) | (word2 & 0x8000_0000))
    }

    fn read_data(&mut self, addr: u32, nwords: u32) -> Result<Vec<u32>> {
        if !self.use_executive {
            let mut data = Vec::with_capacity(nwords as usize);
            for i in 0..nwords {
                data.push(self.read_word(addr + i * 4)?);
            }
            return Ok(data);
        }

        let mut data = Vec::with_capacity(nwords.next_multiple_of(256) as usize);
        while (data.len() as u32) < nwords {
            // Queue addresses for eight 32-word script runs.
            let mut parts = vec![CMD_CLEAR_DOWNLOAD_BUFFER, CMD_DOWNLOAD_DATA, 8 * 4];
            for i in 0..8u32 {
                parts.extend_from_slice(&wb(addr + data.len() as u32 * 4 + i * 32 * 4));
            }
            self.send(&parts)?;

            for _ in 0..8 {
                self.send(&[
                    CMD_CLEAR_UPLOAD_BUFFER,
                    CMD_EXECUTE_SCRIPT, 13,
                    SCRIPT_JT2_SENDCMD, etap::FASTDATA as u8,
                    SCRIPT_JT2_XFRFASTDAT_LIT, 0x20, 0, 1, 0, // READ, 32 words
                    SCRIPT_JT2_XFRFASTDAT_BUF,
                    SCRIPT_JT2_WAIT_PE_RESP,
                    SCRIPT_JT2_GET_PE_RESP,
                    SCRIPT_LOOP, 1, 31,
                    CMD_UPLOAD_DATA_NOLEN,
                ])?;
                self.recv()?;
                for chunk in self.reply.chunks_exact(4) {
                    data.push(u32::from_le_bytes(chunk.try_into().unwrap()));
                }
                // Second half of the upload buffer.
                self.send(&[CMD_UPLOAD_DATA_NOLEN])?;
                self.recv()?;
                for chunk in self.reply.chunks_exact(4) {
                    data.push(u32::from_le_bytes(chunk.try_into().unwrap()));
                }
            }
        }
        data.truncate(nwords as usize);
        Ok(data)
    }

    fn load_executive(&mut self, pe: &[u32], pe_version: u16) -> Result<()> {
        let spec = self
            .family
            .and_then(|f| f.pe.as_ref())
            .ok_or(Error::Unsupported("load_executive"))?;
        self.use_executive = true;
        self.serial_execution()?;

        log::debug!("{}: download PE loader", self.name);
        let needs_bmx = self
            .family
            .map_or(true, |f| f.kind.needs_bus_matrix_setup());
        if needs_bmx {
            self.download_words(
                &[
                    0x3c04bf88, // lui a0, 0xbf88
                    0x34842000, // ori a0, 0x2000 - BMXCON
                    0x3c05001f, // lui a1, 0x1f
                    0x34a50040, // ori a1, 0x40
                    0xac850000, // sw  a1, 0(a0)
                    0x34050800, // li  a1, 0x800
                    0xac850010, // sw  a1, 16(a0) - BMXDKPBA
                ],
                true,
            )?;
            self.send(&[
                CMD_EXECUTE_SCRIPT, 12,
                SCRIPT_JT2_SENDCMD, tap::SW_ETAP as u8,
                SCRIPT_JT2_SETMODE, 6, 0x1f,
                SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
                SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
                SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
                SCRIPT_JT2_XFERINST_BUF,
            ])?;
            self.check_timeout("bus matrix setup")?;

            self.download_words(
                &[
                    0x8c850040, // lw  a1, 64(a0) - BMXDMSZ
                    0xac850020, // sw  a1, 32(a0)
                    0xac850030, // sw  a1, 48(a0)
                    0x3c040000 | spec.loader_addr >> 16,
                    0x34840000 | spec.loader_addr & 0xffff,
                ],
                true,
            )?;
            self.send(&[
                CMD_EXECUTE_SCRIPT, 5,
                SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
                SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
                SCRIPT_JT2_XFERINST_BUF,
            ])?;
            self.check_timeout("loader pointer setup")?;
        } else {
            self.download_words(
                &[
                    0x3c040000 | spec.loader_addr >> 16,
                    0x34840000 | spec.loader_addr & 0xffff,
                ],
                true,
            )?;
            self.send(&[
                CMD_EXECUTE_SCRIPT, 7,
                SCRIPT_JT2_SENDCMD, tap::SW_ETAP as u8,
                SCRIPT_JT2_SETMODE, 6, 0x1f,
                SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
            ])?;
            self.check_timeout("loader pointer setup")?;
        }

        // One download-and-execute round per loader word.
        for pair in spec.loader.chunks_exact(2) {
            self.download_words(
                &[
                    0x3c060000 | u32::from(pair[0]), // lui a2, hi
                    0x34c60000 | u32::from(pair[1]), // ori a2, lo
                    0xac860000,                      // sw  a2, 0(a0)
                    0x24840004,                      // addiu a0, 4
                ],
                true,
            )?;
            self.send(&[
                CMD_EXECUTE_SCRIPT, 4,
                SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
                SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
            ])?;
            self.check_timeout("loader download")?;
        }

        // Jump into the loader and announce destination and size.
        self.download_words(
            &[
                0x3c190000 | spec.loader_addr >> 16,
                0x37390000 | spec.loader_addr & 0xffff,
                0x03200008, // jr t9
                0x00000000, // nop
            ],
            true,
        )?;
        let ram = wb(spec.ram_addr);
        let nwords = pe.len() as u32;
        self.send(&[
            CMD_EXECUTE_SCRIPT, 21,
            SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_XFERINST_BUF, SCRIPT_JT2_XFERINST_BUF,
            SCRIPT_JT2_SENDCMD, tap::SW_ETAP as u8,
            SCRIPT_JT2_SETMODE, 6, 0x1f,
            SCRIPT_JT2_SENDCMD, etap::FASTDATA as u8,
            SCRIPT_JT2_XFRFASTDAT_LIT, ram[0], ram[1], ram[2], ram[3],
            SCRIPT_JT2_XFRFASTDAT_LIT,
            nwords as u8, (nwords >> 8) as u8, 0, 0,
        ])?;
        self.check_timeout("loader start")?;

        // Stream the PE ten words per round trip.
        log::debug!("{}: download PE code", self.name);
        for chunk in pe.chunks(10) {
            self.download_words(chunk, true)?;
            let mut parts = vec![CMD_EXECUTE_SCRIPT, chunk.len() as u8];
            parts.extend(std::iter::repeat(SCRIPT_JT2_XFRFASTDAT_BUF).take(chunk.len()));
            self.send(&parts)?;
            self.check_timeout("PE download")?;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));

        // Jump to the PE.
        self.download_words(&[0x00000000, 0xdead0000], true)?;
        self.send(&[
            CMD_EXECUTE_SCRIPT, 2,
            SCRIPT_JT2_XFRFASTDAT_BUF, SCRIPT_JT2_XFRFASTDAT_BUF,
        ])?;
        self.check_timeout("PE start")?;
        std::thread::sleep(std::time::Duration::from_millis(100));

        // Version handshake.
        self.send(&[
            CMD_CLEAR_UPLOAD_BUFFER,
            CMD_EXECUTE_SCRIPT, 8,
            SCRIPT_JT2_SENDCMD, etap::FASTDATA as u8,
            SCRIPT_JT2_XFRFASTDAT_LIT, 0x00, 0x00, 0x07, 0x00, // EXEC_VERSION
            SCRIPT_JT2_GET_PE_RESP,
        ])?;
        self.check_timeout("EXEC_VERSION")?;
        self.send(&[CMD_UPLOAD_DATA])?;
        self.recv()?;

        let opcode = u16::from_le_bytes([self.reply[3], self.reply[4]]);
        let version = u16::from_le_bytes([self.reply[1], self.reply[2]]);
        if opcode != 0x0007 || version != pe_version {
            return Err(Error::PeVersionMismatch {
                expected: 0x0007u32 << 16 | u32::from(pe_version),
                got: u32::from(opcode) << 16 | u32::from(version),
            });
        }
        log::debug!("{}: PE version {:#06x}", self.name, version);
        Ok(())
    }

    fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
        if !self.use_executive {
            return Err(Error::Unsupported("program_word without executive"));
        }
        let a = wb(addr);
        let w = wb(word);
        self.send(&[
            CMD_CLEAR_UPLOAD_BUFFER,
            CMD_EXECUTE_SCRIPT, 18,
            SCRIPT_JT2_SENDCMD, etap::FASTDATA as u8,
            SCRIPT_JT2_XFRFASTDAT_LIT, 2, 0, 3, 0, // WORD_PROGRAM, length 2
            SCRIPT_JT2_XFRFASTDAT_LIT, a[0], a[1], a[2], a[3],
            SCRIPT_JT2_XFRFASTDAT_LIT, w[0], w[1], w[2], w[3],
            SCRIPT_JT2_GET_PE_RESP,
            CMD_UPLOAD_DATA,
        ])?;
        self.recv()?;
        if self.reply[0] != 4 || self.reply[1] != 0 {
            return Err(Error::Protocol(format!(
                "failed to program word {:#010x} at {:#010x}",
                word, addr
            )));
        }
        Ok(())
    }

    fn program_quad_word(&mut self, addr: u32, words: [u32; 4]) -> Result<()> {
        if !self.use_executive {
            return Err(Error::Unsupported("program_quad_word without executive"));
        }
        let a = wb(addr);
        let mut parts = vec![
            CMD_CLEAR_UPLOAD_BUFFER,
            CMD_EXECUTE_SCRIPT,
            33,
            SCRIPT_JT2_SENDCMD,
            etap::FASTDATA as u8,
            SCRIPT_JT2_XFRFASTDAT_LIT,
            0,
            0,
            13,
            0, // QUAD_WORD_PROGRAM
            SCRIPT_JT2_XFRFASTDAT_LIT,
            a[0],
            a[1],
            a[2],
            a[3],
        ];
        for word in words {
            parts.push(SCRIPT_JT2_XFRFASTDAT_LIT);
            parts.extend_from_slice(&wb(word));
        }
        parts.push(SCRIPT_JT2_GET_PE_RESP);
        parts.push(CMD_UPLOAD_DATA);
        self.send(&parts)?;
        self.recv()?;
        if self.reply[0] != 4 || self.reply[1] != 0 {
            return Err(Error::Protocol(format!(
                "failed to program quad word at {:#010x}",
                addr
            )));
        }
        Ok(())
    }

    fn program_row(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        if !self.use_executive {
            return Err(Error::Unsupported("program_row without executive"));
        }
        let words_per_row = data.len();
        let a = wb(addr);
        self.send(&[
            CMD_CLEAR_UPLOAD_BUFFER,
            CMD_EXECUTE_SCRIPT, 12,
            SCRIPT_JT2_SENDCMD, etap::FASTDATA as u8,
            SCRIPT_JT2_XFRFASTDAT_LIT, words_per_row as u8, 0, 0, 0, // ROW_PROGRAM
            SCRIPT_JT2_XFRFASTDAT_LIT, a[0], a[1], a[2], a[3],
        ])?;

        if words_per_row == 32 {
            // MX1/2: one 32-word row fits the download buffer.
            self.download_words(&data[..15], true)?;
            self.download_words(&data[15..30], false)?;
            let mut parts = vec![CMD_DOWNLOAD_DATA, 2 * 4];
            parts.extend_from_slice(&wb(data[30]));
            parts.extend_from_slice(&wb(data[31]));
            parts.extend_from_slice(&[
                CMD_EXECUTE_SCRIPT, 6,
                SCRIPT_JT2_SENDCMD, etap::FASTDATA as u8,
                SCRIPT_JT2_XFRFASTDAT_BUF,
                SCRIPT_LOOP, 1, 31,
            ]);
            self.send(&parts)?;
        } else {
            // Larger rows go out in 64-word groups.
            for group in data.chunks_exact(64) {
                self.download_words(&group[..15], true)?;
                self.download_words(&group[15..30], false)?;
                self.download_words(&group[30..45], false)?;
                self.download_words(&group[45..60], false)?;
                let mut parts = vec![CMD_DOWNLOAD_DATA, 4 * 4];
                for &word in &group[60..64] {
                    parts.extend_from_slice(&wb(word));
                }
                parts.extend_from_slice(&[
                    CMD_EXECUTE_SCRIPT, 6,
                    SCRIPT_JT2_SENDCMD, etap::FASTDATA as u8,
                    SCRIPT_JT2_XFRFASTDAT_BUF,
                    SCRIPT_LOOP, 1, 63,
                ]);
                self.send(&parts)?;
            }
        }

        self.send(&[
            CMD_CLEAR_UPLOAD_BUFFER,
            CMD_EXECUTE_SCRIPT, 1,
            SCRIPT_JT2_GET_PE_RESP,
            CMD_UPLOAD_DATA,
        ])?;
        self.recv()?;
        if self.reply[0] != 4 || self.reply[1] != 0 {
            return Err(Error::Protocol(format!(
                "failed to program row at {:#010x}",
                addr
            )));
        }
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.send(&[
            CMD_CLEAR_UPLOAD_BUFFER,
            CMD_EXECUTE_SCRIPT, 8,
            SCRIPT_JT2_SENDCMD, tap::SW_MTAP as u8,
            SCRIPT_JT2_SENDCMD, mtap::COMMAND as u8,
            SCRIPT_JT2_XFERDATA8_LIT, mchp::ERASE as u8,
            SCRIPT_DELAY_LONG, 74, // 400 ms
        ])?;
        self.check_timeout("chip erase")
    }

    fn close(&mut self, power_on: bool) -> Result<()> {
        // Exit programming mode.
        self.send(&[
            CMD_CLEAR_UPLOAD_BUFFER,
            CMD_EXECUTE_SCRIPT, 15,
            SCRIPT_JT2_SETMODE, 5, 0x1f,
            SCRIPT_VPP_OFF,
            SCRIPT_MCLR_GND_ON,
            SCRIPT_VPP_PWM_OFF,
            SCRIPT_SET_ICSP_PINS, 6, // PGC high, PGD input
            SCRIPT_SET_ICSP_PINS, 2, // PGC low, PGD input
            SCRIPT_SET_ICSP_PINS, 3, // both input
            SCRIPT_DELAY_LONG, 10,   // 50 ms
            SCRIPT_BUSY_LED_OFF,
        ])?;

        if !power_on {
            self.send(&[CMD_EXECUTE_SCRIPT, 2, SCRIPT_VDD_OFF, SCRIPT_VDD_GND_ON])?;
        }
        self.send(&[CMD_EXECUTE_SCRIPT, 1, SCRIPT_MCLR_GND_OFF])?;
        self.check_timeout("close")
    }
}

/// Shared open path once a HID endpoint is claimed.
pub fn open_pickit<H: HidIo>(hid: H, is_pk3: bool) -> Result<Box<dyn Adapter>>
where
    H: 'static,
{
    let mut a = Pickit {
        hid,
        is_pk3,
        name: if is_pk3 { "PICkit3" } else { "PICkit2" },
        family: None,
        reply: [0; REPORT_SIZE],
        use_executive: false,
        serial_execution_mode: false,
        capabilities: Capabilities::PROBE
            | Capabilities::ERASE
            | Capabilities::READ
            | Capabilities::WRITE,
    };

    // Firmware version; PICkit3 must run the scripting firmware.
    if a.is_pk3 {
        a.send(&[CMD_GETVERSIONS_MPLAB, 0])?;
        a.recv()?;
        if &a.reply[30..33] != b"Pk3" {
            return Err(Error::Protocol(
                "incompatible PICkit3 firmware; flash the scripting firmware".into(),
            ));
        }
        log::info!(
            "adapter: {} version {}.{}.{}",
            a.name,
            a.reply[33],
            a.reply[34],
            a.reply[35]
        );
    } else {
        a.send(&[CMD_CLEAR_UPLOAD_BUFFER, CMD_GET_VERSION])?;
        a.recv()?;
        log::info!(
            "adapter: {} version {}.{}.{}",
            a.name,
            a.reply[0],
            a.reply[1],
            a.reply[2]
        );
    }

    // Detach power while configuring the supplies.
    a.send(&[CMD_EXECUTE_SCRIPT, 2, SCRIPT_VDD_OFF, SCRIPT_VDD_GND_ON])?;

    if a.is_pk3 {
        let vdd = (VDD_VOLTAGE * 8.0 + 2.5) as u16;
        a.send(&[CMD_SET_VDD, vdd as u8, (vdd >> 8) as u8])?;
        let vpp = (VPP_VOLTAGE * 8.0 + 2.5) as u16;
        a.send(&[CMD_SET_VPP, vpp as u8, (vpp >> 8) as u8])?;
    } else {
        let vdd = ((VDD_VOLTAGE * 32.0 + 10.5) as u16) << 6;
        let vdd_limit = ((VDD_LIMIT / 5.0) * 255.0) as u8;
        a.send(&[CMD_SET_VDD, vdd as u8, (vdd >> 8) as u8, vdd_limit])?;
        let vpp = (VPP_VOLTAGE * 18.61) as u8;
        let vpp_limit = (VPP_LIMIT * 18.61) as u8;
        a.send(&[CMD_SET_VPP, 0x40, vpp, vpp_limit])?;
    }

    // Serial speed 8 MHz / divisor.
    a.send(&[CMD_EXECUTE_SCRIPT, 2, SCRIPT_SET_ICSP_SPEED, 10])?;
    a.send(&[CMD_EXECUTE_SCRIPT, 1, SCRIPT_MCLR_GND_ON])?;

    let status = a.read_status()?;
    log::debug!("{}: status {:#06x}", a.name, status);
    match status & !(STATUS_RESET | STATUS_BUTTON_PRESSED) {
        // Self-powered boards.
        s if s == STATUS_VPP_GND_ON || s == STATUS_VPP_GND_ON | STATUS_VPP_ON => {}
        s if s == STATUS_VDD_GND_ON | STATUS_VDD_ON | STATUS_VPP_GND_ON
            || s == STATUS_VDD_GND_ON | STATUS_VDD_ON | STATUS_VPP_GND_ON | STATUS_VPP_ON => {}
        s if s == STATUS_VDD_GND_ON | STATUS_VPP_GND_ON => {
            // Power the board from the adapter.
            log::debug!("{}: enable power", a.name);
            a.send(&[CMD_EXECUTE_SCRIPT, 2, SCRIPT_VDD_GND_OFF, SCRIPT_VDD_ON])?;
            let status = a.read_status()?;
            if status != STATUS_VDD_ON | STATUS_VPP_GND_ON {
                return Err(Error::BadStatus {
                    status: u32::from(status),
                    context: "board power-up",
                });
            }
            std::thread::sleep(std::time::Duration::from_millis(500));
        }
        _ => {
            return Err(Error::BadStatus {
                status: u32::from(status),
                context: "adapter power state",
            });
        }
    }

    // Enter programming mode: Vpp dance, the MCHP signature, then a
    // first status readout.
    a.send(&[
        CMD_CLEAR_UPLOAD_BUFFER,
        CMD_EXECUTE_SCRIPT, 39,
        SCRIPT_VPP_OFF,
        SCRIPT_MCLR_GND_ON,
        SCRIPT_VPP_PWM_ON,
        SCRIPT_BUSY_LED_ON,
        SCRIPT_SET_ICSP_PINS, 0, // PGC, PGD output low
        SCRIPT_DELAY_LONG, 20,   // 100 ms
        SCRIPT_MCLR_GND_OFF,
        SCRIPT_VPP_ON,
        SCRIPT_DELAY_SHORT, 23,  // 1 ms
        SCRIPT_VPP_OFF,
        SCRIPT_MCLR_GND_ON,
        SCRIPT_DELAY_SHORT, 47,  // 2 ms
        SCRIPT_WRITE_BYTE_LITERAL, 0xb2, // MCHP signature
        SCRIPT_WRITE_BYTE_LITERAL, 0xc2,
        SCRIPT_WRITE_BYTE_LITERAL, 0x12,
        SCRIPT_WRITE_BYTE_LITERAL, 0x0a,
        SCRIPT_MCLR_GND_OFF,
        SCRIPT_VPP_ON,
        SCRIPT_DELAY_LONG, 2,    // 10 ms
        SCRIPT_SET_ICSP_PINS, 2, // PGC low, PGD input
        SCRIPT_JT2_SETMODE, 6, 0x1f,
        SCRIPT_JT2_SENDCMD, tap::SW_MTAP as u8,
        SCRIPT_JT2_SENDCMD, mtap::COMMAND as u8,
        SCRIPT_JT2_XFERDATA8_LIT, mchp::STATUS as u8,
    ])?;
    a.send(&[CMD_UPLOAD_DATA])?;
    a.recv()?;
    if a.reply[0] != 1 {
        return Err(Error::Protocol("cannot get MCHP status".into()));
    }
    let mchp_status = u32::from(a.reply[1]);
    if mchp_status & mchp::STATUS_CFGRDY == 0 {
        return Err(Error::BadStatus {
            status: mchp_status,
            context: "no device attached",
        });
    }
    if mchp_status & mchp::STATUS_CPS == 0 {
        log::warn!("{}: device is code protected", a.name);
        a.capabilities = Capabilities::ERASE;
    }

    Ok(Box::new(a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pic32flash_core::family;
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

        fn read_report(&mut self, report: &mut [u8; REPORT_SIZE]) -> Result<()> {
            // An unscripted read models an idle programmer status.
            *report = self.replies.pop_front().unwrap_or([0; REPORT_SIZE]);
            Ok(())
        }
    }

    fn pickit() -> Pickit<FakeHid> {
        Pickit {
            hid: FakeHid::default(),
            is_pk3: false,
            name: "PICkit2",
            family: None,
            reply: [0; REPORT_SIZE],
            use_executive: false,
            serial_execution_mode: false,
            capabilities: Capabilities::all(),
        }
    }

    fn upload_reply(word: u32) -> [u8; REPORT_SIZE] {
        let mut reply = [0u8; REPORT_SIZE];
        reply[0] = 4;
        reply[1..5].copy_from_slice(&word.to_le_bytes());
        reply
    }

    /// Positions of `pattern` inside one report.
    fn find(report: &[u8; REPORT_SIZE], pattern: &[u8]) -> bool {
        report.windows(pattern.len()).any(|w| w == pattern)
    }

    #[test]
    fn idcode_comes_from_the_upload_buffer() {
        let mut a = pickit();
        a.hid.replies.push_back(upload_reply(0x0430_7053));
        assert_eq!(a.get_idcode().unwrap(), 0x0430_7053);
        // Script run, then the upload request.
        assert_eq!(a.hid.sent.len(), 2);
        assert_eq!(a.hid.sent[0][0], CMD_CLEAR_UPLOAD_BUFFER);
        assert_eq!(a.hid.sent[1][0], CMD_UPLOAD_DATA);
    }

    #[test]
    fn short_upload_reply_reads_as_zero_idcode() {
        let mut a = pickit();
        let mut reply = [0u8; REPORT_SIZE];
        reply[0] = 1;
        a.hid.replies.push_back(reply);
        assert_eq!(a.get_idcode().unwrap(), 0);
    }

    #[test]
    fn bootstrap_script_carries_the_reset_dance() {
        let mut a = pickit();
        a.family = Some(&family::MX3);
        a.serial_execution().unwrap();
        let script = &a.hid.sent[0];
        assert!(find(script, &[SCRIPT_JT2_XFERDATA8_LIT, mchp::ASSERT_RST as u8]));
        assert!(find(script, &[SCRIPT_JT2_SENDCMD, etap::EJTAGBOOT as u8]));
        assert!(find(script, &[SCRIPT_JT2_XFERDATA8_LIT, mchp::DEASSERT_RST as u8]));
        assert!(find(script, &[SCRIPT_JT2_XFERDATA8_LIT, mchp::FLASH_ENABLE as u8]));

        // Replay sends nothing.
        a.serial_execution().unwrap();
        assert_eq!(a.hid.sent.len(), 1);
    }

    #[test]
    fn mz_bootstrap_drops_flash_enable() {
        let mut a = pickit();
        a.family = Some(&family::MZ);
        a.serial_execution().unwrap();
        let script = &a.hid.sent[0];
        assert!(!find(script, &[SCRIPT_JT2_XFERDATA8_LIT, mchp::FLASH_ENABLE as u8]));
        assert_eq!(script[1], 25, "script length shrinks with the dropped op");
    }

    #[test]
    fn pe_commands_require_the_executive() {
        let mut a = pickit();
        assert!(matches!(
            a.program_word(0x1d00_0000, 0),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            a.program_row(0x1d00_0000, &[0; 32]),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            a.program_quad_word(0x1d00_0000, [0; 4]),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn word_program_issues_the_pe_opcode() {
        let mut a = pickit();
        a.use_executive = true;
        a.hid.replies.push_back(upload_reply(0x0003_0000));
        a.program_word(0x1d00_1000, 0xcafe_f00d).unwrap();
        let script = &a.hid.sent[0];
        // WORD_PROGRAM with the length field, then address and data.
        assert!(find(script, &[SCRIPT_JT2_XFRFASTDAT_LIT, 2, 0, 3, 0]));
        assert!(find(script, &[SCRIPT_JT2_XFRFASTDAT_LIT, 0x00, 0x10, 0x00, 0x1d]));
        assert!(find(script, &[SCRIPT_JT2_XFRFASTDAT_LIT, 0x0d, 0xf0, 0xfe, 0xca]));
    }

    #[test]
    fn word_program_rejects_a_bad_pe_status() {
        let mut a = pickit();
        a.use_executive = true;
        a.hid.replies.push_back(upload_reply(0x0000_0001));
        assert!(a.program_word(0x1d00_1000, 0).is_err());
    }

    #[test]
    fn mx1_row_fits_one_download_round() {
        let mut a = pickit();
        a.use_executive = true;
        a.hid.replies.push_back(upload_reply(0));
        let row: Vec<u32> = (0..32).collect();
        a.program_row(0x1d00_0000, &row).unwrap();
        // Announcement, three download reports, status pickup.
        assert_eq!(a.hid.sent.len(), 5);
        assert!(find(&a.hid.sent[0], &[SCRIPT_JT2_XFRFASTDAT_LIT, 32, 0, 0, 0]));
        assert!(find(&a.hid.sent[3], &[SCRIPT_LOOP, 1, 31]));
    }

    #[test]
    fn erase_runs_at_the_mtap_level() {
        let mut a = pickit();
        a.erase_chip().unwrap();
        let script = &a.hid.sent[0];
        assert!(find(script, &[SCRIPT_JT2_SENDCMD, tap::SW_MTAP as u8]));
        assert!(find(script, &[SCRIPT_JT2_XFERDATA8_LIT, mchp::ERASE as u8]));
        assert!(find(script, &[SCRIPT_DELAY_LONG, 74]));
    }

    #[test]
    fn icd_timeout_surfaces_as_bad_status() {
        let mut a = pickit();
        let mut status = [0u8; REPORT_SIZE];
        status[..2].copy_from_slice(&STATUS_ICD_TIMEOUT.to_le_bytes());
        a.hid.replies.push_back(status);
        assert!(matches!(
            a.erase_chip(),
            Err(Error::BadStatus { context: "chip erase", .. })
        ));
    }
}
