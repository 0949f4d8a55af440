//! MPSSE command stream assembly and read-back correction.
//!
//! A shift becomes up to five MPSSE commands: TMS prologue (split when it
//! exceeds seven bits), whole data bytes, a partial data byte, the last
//! data bit folded into the first epilogue TMS bit, and the trailing TMS
//! epilogue. Reads need post-processing: the partial byte arrives
//! MSB-justified, and the final bit arrives in a separate byte at bit 6.

/// Clock data out on negative edge.
pub const CLKWNEG: u8 = 0x01;
/// Bit mode (as opposed to byte mode).
pub const BITMODE: u8 = 0x02;
/// LSB first.
pub const LSB: u8 = 0x08;
/// Write TDI.
pub const WTDI: u8 = 0x10;
/// Read TDO.
pub const RTDO: u8 = 0x20;
/// Write TMS.
pub const WTMS: u8 = 0x40;

/// Worst-case encoded size of one shift (6+8+3+3+3 bytes).
pub const MAX_SHIFT_BYTES: usize = 23;

/// Accumulates MPSSE commands and the bookkeeping needed to decode the
/// next read-back.
#[derive(Debug, Default)]
pub struct Packet {
    /// Encoded command stream awaiting a flush.
    pub output: Vec<u8>,
    /// Payload bytes the adapter will return for queued reads.
    pub bytes_to_read: usize,
    bytes_per_word: usize,
    high_byte_bits: u32,
    fix_high_bit: u64,
    high_byte_mask: u64,
    high_bit_mask: u64,
}

impl Packet {
    /// Append one shift operation to the command stream.
    pub fn encode_shift(
        &mut self,
        mut tms_nbits: u32,
        mut tms: u32,
        mut tdi_nbits: u32,
        mut tdi: u64,
        read: bool,
    ) {
        let mut tms_epilog_nbits = 0;
        let mut tms_epilog = 0;

        if tdi_nbits > 0 {
            // Generic prologue TMS 1-0-0 and epilogue TMS 1-0 bracket
            // the data phase.
            tms |= 1 << tms_nbits;
            tms_nbits += 3;
            tms_epilog = 1;
            tms_epilog_nbits = 2;
        }

        if tms_nbits > 0 {
            // Prologue TMS, 1 to 14 bits; the command takes at most 7.
            self.output.push(WTMS + BITMODE + CLKWNEG + LSB);
            if tms_nbits < 8 {
                self.output.push((tms_nbits - 1) as u8);
                self.output.push(tms as u8);
            } else {
                self.output.push(7 - 1);
                self.output.push((tms & 0x7f) as u8);
                self.output.push(WTMS + BITMODE + CLKWNEG + LSB);
                self.output.push((tms_nbits - 7 - 1) as u8);
                self.output.push((tms >> 7) as u8);
            }
        }

        if tdi_nbits > 0 {
            if tms_epilog_nbits > 0 {
                // The last bit rides along with TMS=1.
                tdi_nbits -= 1;
            }
            let mut nbytes = tdi_nbits / 8;
            let last_byte_bits = tdi_nbits & 7;
            if read {
                self.high_byte_bits = last_byte_bits;
                self.fix_high_bit = 0;
                self.high_byte_mask = 0;
                self.bytes_per_word = nbytes as usize;
                if self.high_byte_bits > 0 {
                    self.bytes_per_word += 1;
                }
                self.bytes_to_read += self.bytes_per_word;
            }
            if nbytes > 0 {
                self.output.push(if read {
                    WTDI + RTDO + CLKWNEG + LSB
                } else {
                    WTDI + CLKWNEG + LSB
                });
                self.output.push((nbytes - 1) as u8);
                self.output.push(((nbytes - 1) >> 8) as u8);
                while nbytes > 0 {
                    self.output.push(tdi as u8);
                    tdi >>= 8;
                    nbytes -= 1;
                }
            }
            if last_byte_bits > 0 {
                self.output.push(if read {
                    WTDI + RTDO + BITMODE + CLKWNEG + LSB
                } else {
                    WTDI + BITMODE + CLKWNEG + LSB
                });
                self.output.push((last_byte_bits - 1) as u8);
                self.output.push(tdi as u8);
                tdi >>= last_byte_bits;
                if read {
                    self.high_byte_mask = 0xffu64 << ((self.bytes_per_word - 1) * 8);
                }
            }
            if tms_epilog_nbits > 0 {
                tdi_nbits += 1;
                self.output.push(if read {
                    WTMS + RTDO + BITMODE + CLKWNEG + LSB
                } else {
                    WTMS + BITMODE + CLKWNEG + LSB
                });
                self.output.push(1);
                self.output
                    .push(((tdi << 7) as u8) | 1 | ((tms_epilog << 1) as u8));
                tms_epilog_nbits -= 1;
                tms_epilog >>= 1;
                if read {
                    // That bit arrives in an extra byte; remember where.
                    self.fix_high_bit = 0x40u64 << (self.bytes_per_word * 8);
                    self.bytes_per_word += 1;
                    self.bytes_to_read += 1;
                }
            }
            if read {
                self.high_bit_mask = 1u64 << (tdi_nbits - 1);
            }
        }

        if tms_epilog_nbits > 0 {
            self.output.push(WTMS + BITMODE + CLKWNEG + LSB);
            self.output.push((tms_epilog_nbits - 1) as u8);
            self.output.push(tms_epilog as u8);
        }
    }

    /// Whether another worst-case shift still fits the packet.
    pub fn is_full(&self, limit: usize) -> bool {
        self.output.len() > limit - MAX_SHIFT_BYTES
    }

    /// Reassemble a read word from the raw reply bytes.
    pub fn fix_data(&self, word: u64) -> u64 {
        let fix_high_bit = word & self.fix_high_bit;
        let mut word = word;

        if self.high_byte_bits > 0 {
            // The partial byte is MSB-justified on the wire.
            let high_byte = self.high_byte_mask
                & ((word & self.high_byte_mask) >> (8 - self.high_byte_bits));
            word = (word & !self.high_byte_mask) | high_byte;
        }
        word &= self.high_bit_mask - 1;
        if fix_high_bit != 0 {
            word |= self.high_bit_mask;
        }
        word
    }

    /// Drop buffered commands and read bookkeeping after a flush.
    pub fn clear(&mut self) {
        self.output.clear();
        self.bytes_to_read = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_bit_command_with_brackets() {
        let mut p = Packet::default();
        p.encode_shift(1, 1, 5, 4, false);
        assert_eq!(
            p.output,
            vec![
                0x4b, 3, 0x03, // TMS prologue 1 + 1-0-0, four bits
                0x1b, 3, 0x04, // four data bits
                0x4b, 1, 0x03, // last data bit with TMS=1, then TMS 0...
                0x4b, 0, 0x00, // trailing epilogue bit
            ]
        );
        assert_eq!(p.bytes_to_read, 0);
    }

    #[test]
    fn long_tms_prologue_is_split() {
        let mut p = Packet::default();
        // TAP reset plus data phase: 6 TMS bits + 3 prologue bits = 9.
        p.encode_shift(6, 31, 32, 0, true);
        assert_eq!(&p.output[..6], &[0x4b, 6, 0x5f, 0x4b, 1, 0x00]);
        // 31 full data bits: 3 bytes then 7 bits.
        assert_eq!(&p.output[6..12], &[0x39, 2, 0, 0, 0, 0]);
        assert_eq!(&p.output[12..15], &[0x3b, 6, 0]);
        // Epilogue carries the last data bit with read.
        assert_eq!(&p.output[15..18], &[0x6b, 1, 0x03]);
        assert_eq!(&p.output[18..], &[0x4b, 0, 0x00]);
        // 3 whole bytes + partial byte + epilogue bit byte.
        assert_eq!(p.bytes_to_read, 5);
    }

    #[test]
    fn fix_data_reassembles_32_bit_read() {
        let mut p = Packet::default();
        p.encode_shift(6, 31, 32, 0, true);
        // 0x92345678 on the wire: low 3 bytes verbatim, bits 24..30
        // MSB-justified in byte 3, bit 31 at bit 6 of byte 4.
        let raw: u64 =
            0x78 | 0x56 << 8 | 0x34 << 16 | ((0x12u64) << 1) << 24 | 0x40u64 << 32;
        assert_eq!(p.fix_data(raw), 0x9234_5678);
    }

    #[test]
    fn fix_data_masks_fastdata_garbage() {
        let mut p = Packet::default();
        p.encode_shift(0, 0, 33, 0, true);
        assert_eq!(p.bytes_to_read, 5);
        // 33-bit read: 4 whole bytes, the 33rd bit in the epilogue byte.
        let raw: u64 = 0xffff_ffff | 0x00 << 32;
        let word = p.fix_data(raw);
        assert_eq!(word, 0xffff_ffff);
        let raw: u64 = 0x2468_acf0 | 0x40u64 << 32;
        assert_eq!(p.fix_data(raw), 0x1_2468_acf0);
    }

    #[test]
    fn eight_bit_write_is_one_byte_command() {
        let mut p = Packet::default();
        p.encode_shift(0, 0, 8, 0xd1, false);
        // 7 data bits as a byte-less bit command plus the folded last bit.
        assert_eq!(
            p.output,
            vec![
                0x4b, 2, 0x01, // prologue 1-0-0
                0x1b, 6, 0xd1, // seven low bits (bit 7 is not clocked here)
                0x4b, 1, 0x83, // bit 7 (set) with TMS
                0x4b, 0, 0x00,
            ]
        );
    }

    #[test]
    fn packet_flush_threshold() {
        let mut p = Packet::default();
        assert!(!p.is_full(256));
        p.output.resize(256 - MAX_SHIFT_BYTES, 0);
        assert!(!p.is_full(256));
        p.output.push(0);
        assert!(p.is_full(256));
    }
}
