//! [`Adapter`] implementation shared by every transport that can expose a
//! raw [`BitChannel`]. Transport crates open their hardware, wrap it in a
//! channel and hand it to [`JtagAdapter`]; all protocol logic lives in
//! [`TapEngine`].

use crate::adapter::{Adapter, Capabilities, VerifyPolicy};
use crate::channel::BitChannel;
use crate::error::{Error, Result};
use crate::family::Family;
use crate::jtag::TapEngine;

/// Generic JTAG/ICSP adapter over a bit channel.
pub struct JtagAdapter<C: BitChannel> {
    engine: TapEngine<C>,
    name: String,
    capabilities: Capabilities,
}

impl<C: BitChannel> JtagAdapter<C> {
    /// Wrap an opened channel.
    pub fn new(chan: C, name: impl Into<String>) -> Self {
        JtagAdapter {
            engine: TapEngine::new(chan),
            name: name.into(),
            capabilities: Capabilities::PROBE
                | Capabilities::ERASE
                | Capabilities::READ
                | Capabilities::WRITE,
        }
    }

    /// Access the protocol engine (adapter open/probe sequences).
    pub fn engine_mut(&mut self) -> &mut TapEngine<C> {
        &mut self.engine
    }

    /// Reset the TAP and read the ID code, checking the Microchip
    /// manufacturer ID in the low bits.
    pub fn probe_idcode(&mut self) -> Result<u32> {
        let idcode = self.engine.get_idcode()?;
        if idcode & 0xfff != 0x053 {
            return Err(Error::Protocol(format!(
                "incompatible CPU detected, IDCODE={:#010x}",
                idcode
            )));
        }
        Ok(idcode)
    }
}

impl<C: BitChannel> Adapter for JtagAdapter<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn set_family(&mut self, family: &'static Family) {
        self.engine.set_family(family);
    }

    fn set_verify_policy(&mut self, policy: VerifyPolicy) {
        self.engine.set_verify_policy(policy);
    }

    fn get_idcode(&mut self) -> Result<u32> {
        self.engine.get_idcode()
    }

    fn read_word(&mut self, addr: u32) -> Result<u32> {
        self.engine.read_word(addr)
    }

    fn read_data(&mut self, addr: u32, nwords: u32) -> Result<Vec<u32>> {
        self.engine.read_data(addr, nwords)
    }

    fn verify_data(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        self.engine.verify_data(addr, data)
    }

    fn load_executive(&mut self, pe: &[u32], pe_version: u16) -> Result<()> {
        self.engine.load_executive(pe, pe_version)
    }

    fn program_row(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        self.engine.program_row(addr, data)
    }

    fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
        self.engine.program_word(addr, word)
    }

    fn program_double_word(&mut self, addr: u32, w0: u32, w1: u32) -> Result<()> {
        self.engine.program_double_word(addr, w0, w1)
    }

    fn program_quad_word(&mut self, addr: u32, words: [u32; 4]) -> Result<()> {
        self.engine.program_quad_word(addr, words)
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.engine.erase_chip()
    }

    fn close(&mut self, power_on: bool) -> Result<()> {
        self.engine.finish(power_on)
    }
}
