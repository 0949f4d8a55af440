//! AN1388 bootloader adapter, transport-independent part.

use pic32flash_core::adapter::{Adapter, Capabilities, VerifyPolicy};
use pic32flash_core::crc::crc16;
use pic32flash_core::{Error, Result};

use crate::protocol::{encode_frame, Decoded, FrameDecoder, CMD_ERASE_FLASH,
    CMD_JUMP_APP, CMD_PROGRAM_FLASH, CMD_READ_CRC, CMD_READ_VERSION};

/// ID code reported for bootloader sessions.
const BOOTLOADER_IDCODE: u32 = 0xdeaf_b00b;

/// Byte transport carrying encoded frames.
pub trait FrameIo {
    /// Send one encoded frame.
    fn send(&mut self, frame: &[u8]) -> Result<()>;
    /// Read a chunk of reply bytes; `Ok(empty)` means timeout.
    fn recv_chunk(&mut self) -> Result<Vec<u8>>;
}

/// AN1388 bootloader session over any frame transport.
pub struct An1388<T: FrameIo> {
    io: T,
    name: &'static str,
    user_start: u32,
    user_nbytes: u32,
    verify_policy: VerifyPolicy,
}

impl<T: FrameIo> An1388<T> {
    /// Send a command and collect its reply payload. `None` when the
    /// bootloader did not answer with a valid frame.
    fn command(&mut self, cmd: u8, data: &[u8]) -> Result<Option<Vec<u8>>> {
        self.io.send(&encode_frame(cmd, data))?;
        if cmd == CMD_JUMP_APP {
            // No reply expected.
            return Ok(None);
        }

        let mut decoder = FrameDecoder::new();
        loop {
            let chunk = self.io.recv_chunk()?;
            if chunk.is_empty() {
                // Timeout; a CRC-damaged or absent reply shows up as
                // "no response" to the caller.
                return Ok(None);
            }
            let mut rest = chunk.as_slice();
            while !rest.is_empty() {
                let (consumed, decoded) = decoder.feed(rest);
                rest = &rest[consumed..];
                match decoded {
                    Decoded::Incomplete => {}
                    Decoded::BadFrame => return Ok(None),
                    Decoded::Frame(payload) => return Ok(Some(payload)),
                }
            }
        }
    }

    fn expect_ack(&mut self, cmd: u8, data: &[u8], context: &'static str) -> Result<()> {
        match self.command(cmd, data)? {
            Some(reply) if reply.len() == 1 && reply[0] == cmd => Ok(()),
            _ => Err(Error::Protocol(format!("{}: no response", context))),
        }
    }

    /// Issue the linear-address record selecting the upper address half.
    fn set_flash_address(&mut self, addr: u32) -> Result<()> {
        let mut request = [0u8; 7];
        request[0] = 2;
        request[3] = 4; // record type: linear address
        request[4] = (addr >> 24) as u8;
        request[5] = (addr >> 16) as u8;
        request[6] = record_checksum(&request[..6]);
        self.expect_ack(CMD_PROGRAM_FLASH, &request, "set flash address")
    }

    /// Program up to 8 words as one data record. Fully erased chunks are
    /// skipped without any wire traffic.
    fn program_flash(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        if data.iter().all(|&w| w == 0xffff_ffff) {
            return Ok(());
        }
        let nbytes = data.len() * 4;
        let mut request = Vec::with_capacity(nbytes + 5);
        request.push(nbytes as u8);
        request.push((addr >> 8) as u8);
        request.push(addr as u8);
        request.push(0); // record type: data
        for &word in data {
            request.extend_from_slice(&word.to_le_bytes());
        }
        request.push(record_checksum(&request));
        self.expect_ack(CMD_PROGRAM_FLASH, &request, "program flash")
    }
}

fn record_checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |sum, b| sum.wrapping_add(*b))
        .wrapping_neg()
}

impl<T: FrameIo> Adapter for An1388<T> {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> Capabilities {
        // The protocol can checksum flash (READ_CRC) but not read it back.
        Capabilities::PROBE | Capabilities::ERASE | Capabilities::WRITE
    }

    fn program_area(&self) -> Option<(u32, u32)> {
        Some((self.user_start, self.user_nbytes))
    }

    fn set_verify_policy(&mut self, policy: VerifyPolicy) {
        self.verify_policy = policy;
    }

    fn get_idcode(&mut self) -> Result<u32> {
        Ok(BOOTLOADER_IDCODE)
    }

    fn verify_data(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        let nbytes = data.len() as u32 * 4;
        let mut request = [0u8; 8];
        request[..4].copy_from_slice(&addr.to_le_bytes());
        request[3] = (addr >> 24) as u8 + 0x80; // physical to KSEG0
        request[4..8].copy_from_slice(&nbytes.to_le_bytes());

        let reply = match self.command(CMD_READ_CRC, &request)? {
            Some(reply) if reply.len() == 3 && reply[0] == CMD_READ_CRC => reply,
            _ => {
                return Err(Error::Protocol(format!(
                    "cannot read crc at {:#010x}",
                    addr
                )))
            }
        };
        let flash_crc = u16::from(reply[1]) | u16::from(reply[2]) << 8;

        let mut bytes = Vec::with_capacity(nbytes as usize);
        for &word in data {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let local_crc = crc16(0, &bytes);
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

    fn program_block(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        self.set_flash_address(addr)?;
        for (i, chunk) in data.chunks(8).enumerate() {
            self.program_flash(addr + i as u32 * 32, chunk)?;
        }
        Ok(())
    }

    fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
        // DEVCFG words can only be written as part of the image.
        log::debug!(
            "an1388: ignoring word program at {:#010x}: {:#010x}",
            addr,
            word
        );
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.expect_ack(CMD_ERASE_FLASH, &[], "erase")
    }

    fn close(&mut self, _power_on: bool) -> Result<()> {
        // Jump to the application.
        self.command(CMD_JUMP_APP, &[])?;
        Ok(())
    }
}

/// Read the bootloader version and build the adapter.
pub fn open_an1388<T: FrameIo + 'static>(io: T, name: &'static str) -> Result<Box<dyn Adapter>> {
    let mut a = An1388 {
        io,
        name,
        user_start: 0x1d00_0000,
        user_nbytes: 512 * 1024,
        verify_policy: VerifyPolicy::default(),
    };

    match a.command(CMD_READ_VERSION, &[])? {
        Some(reply) if reply.len() >= 3 && reply[0] == CMD_READ_VERSION => {
            log::info!(
                "adapter: AN1388 bootloader version {}.{}, program area {:08x}-{:08x}",
                reply[1],
                reply[2],
                a.user_start,
                a.user_start + a.user_nbytes - 1
            );
        }
        _ => return Err(Error::Protocol("AN1388 bootloader not answering".into())),
    }
    Ok(Box::new(a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeIo {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl FrameIo for FakeIo {
        fn send(&mut self, frame: &[u8]) -> Result<()> {
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn recv_chunk(&mut self) -> Result<Vec<u8>> {
            Ok(self.replies.pop_front().unwrap_or_default())
        }
    }

    fn device(replies: Vec<Vec<u8>>) -> An1388<FakeIo> {
        An1388 {
            io: FakeIo {
                sent: Vec::new(),
                replies: replies.into(),
            },
            name: "an1388",
            user_start: 0x1d00_0000,
            user_nbytes: 512 * 1024,
            verify_policy: VerifyPolicy::default(),
        }
    }

    #[test]
    fn erased_chunks_produce_no_traffic() {
        // Address record ack only; data records must never go out.
        let mut dev = device(vec![encode_frame(CMD_PROGRAM_FLASH, &[])]);
        dev.program_block(0x1d00_0000, &[0xffff_ffff; 256]).unwrap();
        assert_eq!(dev.io.sent.len(), 1, "only the address record was sent");
    }

    #[test]
    fn dirty_chunk_is_programmed_with_record_checksum() {
        let acks = vec![
            encode_frame(CMD_PROGRAM_FLASH, &[]),
            encode_frame(CMD_PROGRAM_FLASH, &[]),
        ];
        let mut dev = device(acks);
        let mut block = [0xffff_ffffu32; 256];
        block[8] = 0x0102_0304;
        dev.program_block(0x1d00_0000, &block).unwrap();
        // Address record plus exactly one data record.
        assert_eq!(dev.io.sent.len(), 2);
    }

    #[test]
    fn crc_mismatch_follows_policy() {
        let data = [0x11111111u32; 4];
        let mut bytes = Vec::new();
        for w in &data {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let good = crc16(0, &bytes);

        // Matching CRC passes silently.
        let reply = encode_frame(CMD_READ_CRC, &[good as u8, (good >> 8) as u8]);
        let mut dev = device(vec![reply]);
        dev.verify_data(0x1d00_0000, &data).unwrap();

        // Mismatch is fatal under the strict policy...
        let reply = encode_frame(CMD_READ_CRC, &[0x34, 0x12]);
        let mut dev = device(vec![reply]);
        match dev.verify_data(0x1d00_0000, &data) {
            Err(Error::VerifyCrc { flash, .. }) => assert_eq!(flash, 0x1234),
            other => panic!("expected VerifyCrc, got {:?}", other),
        }

        // ...and only logged under the warn policy.
        let reply = encode_frame(CMD_READ_CRC, &[0x34, 0x12]);
        let mut dev = device(vec![reply]);
        dev.set_verify_policy(VerifyPolicy::Warn);
        dev.verify_data(0x1d00_0000, &data).unwrap();
    }

    #[test]
    fn missing_reply_is_a_protocol_error() {
        let mut dev = device(vec![]);
        match dev.erase_chip() {
            Err(Error::Protocol(msg)) => assert!(msg.contains("no response")),
            other => panic!("expected Protocol error, got {:?}", other),
        }
    }
}
