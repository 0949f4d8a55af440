//! [`BitChannel`] over an FTDI chip in MPSSE mode.

use std::thread::sleep;
use std::time::Duration;

use pic32flash_core::channel::BitChannel;
use pic32flash_core::{Error, Result};

use crate::packet::Packet;
use crate::usb::UsbBulk;

/// MPSSE transmit packet cap; auto-flushed when the worst-case shift no
/// longer fits.
const PACKET_LIMIT: usize = 256 * 16;

/// Bit channel packing shifts into MPSSE packets.
pub struct MpsseChannel<U: UsbBulk> {
    usb: U,
    packet: Packet,
    /// GPIO state driving /TRST, /SYSRST and the LED.
    reset: ResetLines,
}

/// GPIO mapping of the adapter's reset and LED lines.
#[derive(Debug, Clone, Copy)]
pub struct ResetLines {
    pub dir_control: u16,
    pub trst_control: u16,
    pub trst_inverted: bool,
    pub sysrst_control: u16,
    pub sysrst_inverted: bool,
    pub led_control: u16,
    pub led_inverted: bool,
}

impl<U: UsbBulk> MpsseChannel<U> {
    /// Wrap an initialized MPSSE-mode FTDI device.
    pub fn new(usb: U, reset: ResetLines) -> Self {
        MpsseChannel {
            usb,
            packet: Packet::default(),
            reset,
        }
    }

    /// Push buffered commands out and collect any expected reply bytes.
    fn flush_packet(&mut self) -> Result<Vec<u8>> {
        if self.packet.output.is_empty() {
            return Ok(Vec::new());
        }
        self.usb.write(&self.packet.output)?;

        let expected = self.packet.bytes_to_read;
        let mut input = Vec::with_capacity(expected);
        while input.len() < expected {
            // Every bulk read is prefixed with two modem status bytes.
            let mut chunk = vec![0u8; expected - input.len() + 2];
            let n = self.usb.read(&mut chunk)?;
            if n > 2 {
                input.extend_from_slice(&chunk[2..n]);
            } else if n == 0 {
                return Err(Error::Transport("usb bulk read returned no data".into()));
            }
        }
        self.packet.clear();
        Ok(input)
    }

    /// Drive the /TRST, /SYSRST and LED outputs.
    pub fn set_reset(&mut self, trst: bool, sysrst: bool, led: bool) -> Result<()> {
        let r = &self.reset;
        let mut output: u16 = 0x0008; // TCK idle high
        let direction: u16 = 0x000b | r.dir_control;

        if trst {
            output |= r.trst_control;
        }
        if r.trst_inverted {
            output ^= r.trst_control;
        }
        if sysrst {
            output |= r.sysrst_control;
        }
        if r.sysrst_inverted {
            output ^= r.sysrst_control;
        }
        if led {
            output |= r.led_control;
        }
        if r.led_inverted {
            output ^= r.led_control;
        }

        // Set data bits, low byte then high byte.
        self.usb
            .write(&[0x80, output as u8, direction as u8])?;
        self.usb
            .write(&[0x82, (output >> 8) as u8, (direction >> 8) as u8])?;
        log::debug!(
            "reset lines trst={} sysrst={} led={} -> output {:#06x}",
            trst,
            sysrst,
            led,
            output
        );
        Ok(())
    }

    /// Program the TCK divisor for the requested frequency.
    pub fn set_speed(&mut self, base_mhz: u32, khz: u32) -> Result<()> {
        let mut divisor = (base_mhz * 2000 / khz).div_ceil(2) as i32 - 1;
        if divisor < 0 {
            divisor = 0;
        }
        if base_mhz > 6 {
            // 60 MHz master clock: disable divide-by-5, adaptive and
            // three-phase clocking.
            self.usb.write(&[0x8a, 0x97, 0x8d])?;
        }
        self.usb
            .write(&[0x86, divisor as u8, (divisor >> 8) as u8])?;
        log::debug!(
            "clock rate {:.1} MHz",
            (base_mhz as f64 * 2.0 / (divisor as f64 + 1.0)) / 2.0
        );
        Ok(())
    }

    /// Disable the TDI-to-TDO loopback.
    pub fn disable_loopback(&mut self) -> Result<()> {
        self.usb.write(&[0x85])
    }
}

impl<U: UsbBulk> BitChannel for MpsseChannel<U> {
    fn shift(
        &mut self,
        tms_nbits: u32,
        tms: u32,
        tdi_nbits: u32,
        tdi: u64,
        read: bool,
    ) -> Result<Option<u64>> {
        if self.packet.is_full(PACKET_LIMIT) {
            self.flush_packet()?;
        }
        self.packet
            .encode_shift(tms_nbits, tms, tdi_nbits, tdi, read);
        if !read {
            return Ok(None);
        }

        let input = self.flush_packet()?;
        let mut raw = [0u8; 8];
        let n = input.len().min(8);
        raw[..n].copy_from_slice(&input[input.len() - n..]);
        // The word of interest is the last one queued; preceding write
        // commands produce no reply bytes.
        let word = u64::from_le_bytes(raw);
        Ok(Some(self.packet_fix(word)))
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_packet()?;
        Ok(())
    }

    fn target_delay_ms(&mut self, ms: u32) -> Result<()> {
        self.flush_packet()?;
        sleep(Duration::from_millis(u64::from(ms)));
        Ok(())
    }

    fn finish(&mut self, _power_on: bool) -> Result<()> {
        self.flush_packet()?;
        // Pulse /SYSRST so the target reboots out of debug mode.
        self.set_reset(false, true, true)?;
        self.set_reset(false, false, false)
    }
}

impl<U: UsbBulk> MpsseChannel<U> {
    fn packet_fix(&self, word: u64) -> u64 {
        self.packet.fix_data(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeUsb {
        writes: Vec<Vec<u8>>,
        reads: Vec<Vec<u8>>,
    }

    impl UsbBulk for FakeUsb {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.writes.push(data.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.reads.is_empty() {
                return Ok(0);
            }
            let chunk = self.reads.remove(0);
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    fn lines() -> ResetLines {
        ResetLines {
            dir_control: 0x0f10,
            trst_control: 0x0100,
            trst_inverted: true,
            sysrst_control: 0x0200,
            sysrst_inverted: false,
            led_control: 0x0800,
            led_inverted: false,
        }
    }

    #[test]
    fn writes_are_batched_until_read() {
        let mut chan = MpsseChannel::new(FakeUsb::default(), lines());
        chan.shift(1, 1, 5, 4, false).unwrap();
        chan.shift(0, 0, 8, 0xd1, false).unwrap();
        assert!(chan.usb.writes.is_empty(), "writes flushed early");
        chan.flush().unwrap();
        assert_eq!(chan.usb.writes.len(), 1);
    }

    #[test]
    fn read_strips_status_prefix_and_fixes_word() {
        let mut chan = MpsseChannel::new(FakeUsb::default(), lines());
        // 32-bit read reply for ID code 0x12345678 (bit 31 clear).
        chan.usb.reads.push(vec![
            0x32, 0x60, // modem status
            0x78, 0x56, 0x34, 0x24, 0x00,
        ]);
        let word = chan.shift(6, 31, 32, 0, true).unwrap().unwrap();
        assert_eq!(word, 0x1234_5678);
        assert_eq!(chan.usb.writes.len(), 1);
    }

    #[test]
    fn short_reads_accumulate() {
        let mut chan = MpsseChannel::new(FakeUsb::default(), lines());
        chan.usb.reads.push(vec![0x32, 0x60, 0x78, 0x56]);
        chan.usb.reads.push(vec![0x32, 0x60, 0x34, 0x24, 0x00]);
        let word = chan.shift(6, 31, 32, 0, true).unwrap().unwrap();
        assert_eq!(word, 0x1234_5678);
    }

    #[test]
    fn reset_line_mapping_honors_inversion() {
        let mut chan = MpsseChannel::new(FakeUsb::default(), lines());
        chan.set_reset(false, true, true).unwrap();
        // trst inactive but inverted -> bit set; sysrst active; led on.
        let low = &chan.usb.writes[0];
        let high = &chan.usb.writes[1];
        assert_eq!(low[0], 0x80);
        assert_eq!(high[0], 0x82);
        let output = u16::from(low[1]) | u16::from(high[1]) << 8;
        assert_eq!(output, 0x0008 | 0x0100 | 0x0200 | 0x0800);
    }
}
