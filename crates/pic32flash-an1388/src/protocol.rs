//! AN1388 bootloader framing.
//!
//! Frames are `SOH (payload, DLE-escaped) EOT`, where the payload is the
//! command byte, its data, and a CRC-16/CCITT (seed 0) over command and
//! data, appended low byte first. Any literal SOH, EOT or DLE inside the
//! payload is preceded by DLE.

use pic32flash_core::crc::crc16;

/// Start of header.
pub const SOH: u8 = 0x01;
/// End of transmission.
pub const EOT: u8 = 0x04;
/// Escape.
pub const DLE: u8 = 0x10;

/// Bootloader commands.
pub const CMD_READ_VERSION: u8 = 0x01;
pub const CMD_ERASE_FLASH: u8 = 0x02;
pub const CMD_PROGRAM_FLASH: u8 = 0x03;
pub const CMD_READ_CRC: u8 = 0x04;
pub const CMD_JUMP_APP: u8 = 0x05;

fn push_escaped(buf: &mut Vec<u8>, byte: u8) {
    if byte == SOH || byte == EOT || byte == DLE {
        buf.push(DLE);
    }
    buf.push(byte);
}

/// Encode one command frame.
pub fn encode_frame(cmd: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 8);
    buf.push(SOH);
    push_escaped(&mut buf, cmd);
    let mut crc = crc16(0, &[cmd]);
    for &byte in data {
        push_escaped(&mut buf, byte);
    }
    crc = crc16(crc, data);
    push_escaped(&mut buf, crc as u8);
    push_escaped(&mut buf, (crc >> 8) as u8);
    buf.push(EOT);
    buf
}

/// Outcome of feeding bytes into the decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// No complete frame yet.
    Incomplete,
    /// A frame arrived and its CRC checked out; payload is command plus
    /// data, CRC stripped.
    Frame(Vec<u8>),
    /// A frame terminator arrived but the CRC (or length) was wrong.
    BadFrame,
}

/// Incremental frame decoder, fed from whatever chunking the transport
/// delivers.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    payload: Vec<u8>,
    escaped: bool,
}

impl FrameDecoder {
    /// Fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume input bytes; stops at the first complete frame and
    /// reports how many bytes were consumed.
    pub fn feed(&mut self, input: &[u8]) -> (usize, Decoded) {
        for (i, &byte) in input.iter().enumerate() {
            if self.escaped {
                self.payload.push(byte);
                self.escaped = false;
                continue;
            }
            match byte {
                DLE => self.escaped = true,
                SOH => self.payload.clear(),
                EOT => {
                    let payload = std::mem::take(&mut self.payload);
                    let decoded = if payload.len() > 2 {
                        let n = payload.len() - 2;
                        let crc =
                            u16::from(payload[n]) | u16::from(payload[n + 1]) << 8;
                        if crc == crc16(0, &payload[..n]) {
                            Decoded::Frame(payload[..n].to_vec())
                        } else {
                            Decoded::BadFrame
                        }
                    } else {
                        Decoded::BadFrame
                    };
                    return (i + 1, decoded);
                }
                _ => self.payload.push(byte),
            }
        }
        (input.len(), Decoded::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: u8, data: &[u8]) -> Vec<u8> {
        let frame = encode_frame(cmd, data);
        let mut decoder = FrameDecoder::new();
        match decoder.feed(&frame) {
            (n, Decoded::Frame(payload)) => {
                assert_eq!(n, frame.len());
                payload
            }
            (_, other) => panic!("decode failed: {:?}", other),
        }
    }

    #[test]
    fn plain_frame_roundtrip() {
        let payload = roundtrip(CMD_READ_VERSION, &[]);
        assert_eq!(payload, vec![CMD_READ_VERSION]);
    }

    #[test]
    fn special_bytes_are_escaped_at_every_position() {
        let specials = [SOH, EOT, DLE];
        for &special in &specials {
            for position in 0..6 {
                let mut data = vec![0x20u8, 0x21, 0x22, 0x23, 0x24, 0x25];
                data[position] = special;
                let payload = roundtrip(CMD_PROGRAM_FLASH, &data);
                assert_eq!(payload[0], CMD_PROGRAM_FLASH);
                assert_eq!(&payload[1..], &data[..]);
            }
        }
    }

    #[test]
    fn all_special_data_roundtrips() {
        let data = [SOH, EOT, DLE, DLE, EOT, SOH];
        let payload = roundtrip(CMD_READ_CRC, &data);
        assert_eq!(&payload[1..], &data[..]);
    }

    #[test]
    fn corrupted_byte_is_detected() {
        let data = [0x40u8, 0x41, 0x42, 0x43];
        let frame = encode_frame(CMD_PROGRAM_FLASH, &data);
        // Flip one non-framing payload byte.
        for i in 0..frame.len() {
            if frame[i] == SOH || frame[i] == EOT || frame[i] == DLE {
                continue;
            }
            let mut bad = frame.clone();
            bad[i] ^= 0x20;
            if bad[i] == SOH || bad[i] == EOT || bad[i] == DLE {
                continue;
            }
            let mut decoder = FrameDecoder::new();
            let (_, decoded) = decoder.feed(&bad);
            assert_eq!(decoded, Decoded::BadFrame, "corruption at {} missed", i);
        }
    }

    #[test]
    fn frame_split_across_chunks() {
        let frame = encode_frame(CMD_ERASE_FLASH, &[0xaa, DLE]);
        let mut decoder = FrameDecoder::new();
        let (n, first) = decoder.feed(&frame[..3]);
        assert_eq!((n, first), (3, Decoded::Incomplete));
        match decoder.feed(&frame[3..]) {
            (_, Decoded::Frame(payload)) => {
                assert_eq!(payload, vec![CMD_ERASE_FLASH, 0xaa, DLE])
            }
            (_, other) => panic!("decode failed: {:?}", other),
        }
    }

    #[test]
    fn garbage_before_soh_is_ignored() {
        let mut stream = vec![0xff, 0x55];
        stream.extend(encode_frame(CMD_READ_VERSION, &[]));
        let mut decoder = FrameDecoder::new();
        match decoder.feed(&stream) {
            (_, Decoded::Frame(payload)) => assert_eq!(payload, vec![CMD_READ_VERSION]),
            (_, other) => panic!("decode failed: {:?}", other),
        }
    }
}
