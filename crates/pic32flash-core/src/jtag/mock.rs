//! Scripted bit channel for exercising the protocol engine hermetically.

use std::collections::VecDeque;

use crate::channel::BitChannel;
use crate::error::Result;
use crate::jtag::control;

/// One recorded `shift` invocation.
#[derive(Debug, Clone, Copy)]
pub struct ShiftCall {
    pub tms_nbits: u32,
    pub tms: u32,
    pub tdi_nbits: u32,
    pub tdi: u64,
    pub read: bool,
}

/// A channel that records every shift and answers reads from scripted
/// queues, keyed by the shape of the access:
///
/// - 8-bit reads are MCHP status reads (`status_reads`, falling back to
///   `status_default`),
/// - 32-bit reads with a non-zero TDI are Control register polls
///   (`control_response`),
/// - 32-bit reads with zero TDI are Data register reads (`data_reads`),
/// - 33-bit reads are FastData reads (`fastdata_reads`).
pub struct MockChannel {
    pub calls: Vec<ShiftCall>,
    pub status_reads: VecDeque<u64>,
    pub status_default: u64,
    pub control_response: u64,
    pub data_reads: VecDeque<u64>,
    pub fastdata_reads: VecDeque<u64>,
    pub delays: Vec<u32>,
    pub flushes: usize,
    pub finished: Option<bool>,
}

impl MockChannel {
    pub fn new() -> Self {
        MockChannel {
            calls: Vec::new(),
            status_reads: VecDeque::new(),
            status_default: 0,
            // PrAcc comes up immediately unless a test says otherwise.
            control_response: u64::from(control::PRACC | control::PROBEN | control::PROBTRAP),
            data_reads: VecDeque::new(),
            fastdata_reads: VecDeque::new(),
            delays: Vec::new(),
            flushes: 0,
            finished: None,
        }
    }
}

impl BitChannel for MockChannel {
    fn shift(
        &mut self,
        tms_nbits: u32,
        tms: u32,
        tdi_nbits: u32,
        tdi: u64,
        read: bool,
    ) -> Result<Option<u64>> {
        self.calls.push(ShiftCall {
            tms_nbits,
            tms,
            tdi_nbits,
            tdi,
            read,
        });
        if !read {
            return Ok(None);
        }
        let word = match tdi_nbits {
            8 => self
                .status_reads
                .pop_front()
                .unwrap_or(self.status_default),
            32 if tdi != 0 => self.control_response,
            32 => self.data_reads.pop_front().unwrap_or(0),
            33 => self.fastdata_reads.pop_front().unwrap_or(0),
            _ => self.data_reads.pop_front().unwrap_or(0),
        };
        Ok(Some(word))
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }

    fn target_delay_ms(&mut self, ms: u32) -> Result<()> {
        self.delays.push(ms);
        Ok(())
    }

    fn finish(&mut self, power_on: bool) -> Result<()> {
        self.finished = Some(power_on);
        Ok(())
    }
}
