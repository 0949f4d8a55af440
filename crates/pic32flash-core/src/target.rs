//! One programming session: an opened adapter bound to a detected device.

use std::path::Path;

use crate::adapter::{Adapter, Capabilities};
use crate::device::DeviceTable;
use crate::error::{Error, Result};
use crate::family::{Family, FamilyKind};
use crate::pe::PeImage;

/// Physical base of program flash.
pub const FLASH_BASE: u32 = 0x1d00_0000;
/// Physical base of boot flash.
pub const BOOT_BASE: u32 = 0x1fc0_0000;
/// Physical base of the MK boot-flash-1 alias.
pub const MK_BOOT1_BASE: u32 = 0x1fc4_0000;

/// Largest transfer handed to an adapter in one call, in words.
const CHUNK_WORDS: u32 = 256;

/// DEVCFG data for [`Target::program_devcfg`], shaped per family layout.
#[derive(Debug, Clone)]
pub enum DevcfgSet {
    /// DEVCFG0..DEVCFG3 for MX/MZ/MK-style layouts.
    Words {
        /// Register values, index N holding DEVCFGN.
        devcfg: [u32; 4],
    },
    /// The PIC32MM register file, primary and alternate copies:
    /// FDEVOPT, FICD, FPOR, FWDT, FOSCSEL, FSEC.
    MmRegs {
        /// Primary copy.
        primary: [u32; 6],
        /// Alternate copy.
        alternate: [u32; 6],
    },
    /// The PIC32MK dual boot-flash layout, one record per bank.
    MkBanks {
        /// Boot flash 1.
        bank1: MkBootConfig,
        /// Boot flash 2.
        bank2: MkBootConfig,
    },
}

/// Configuration words of one MK boot flash bank.
#[derive(Debug, Clone, Copy)]
pub struct MkBootConfig {
    /// DEVCFG0..DEVCFG3.
    pub devcfg: [u32; 4],
    /// DEVCP word.
    pub devcp: u32,
    /// DEVSIGN word.
    pub devsign: u32,
    /// Boot sequence number.
    pub seq: u32,
}

/// Translate KSEG0/KSEG1 virtual addresses to physical.
pub fn virt_to_phys(addr: u32) -> u32 {
    match addr {
        0x8000_0000..=0x9fff_ffff => addr - 0x8000_0000,
        0xa000_0000..=0xbfff_ffff => addr - 0xa000_0000,
        _ => addr,
    }
}

/// A programming session. Created by probing, closed exactly once.
pub struct Target {
    adapter: Box<dyn Adapter>,
    cpu_name: String,
    idcode: u32,
    family: &'static Family,
    flash_addr: u32,
    flash_bytes: u32,
    boot_bytes: u32,
    closed: bool,
}

impl Target {
    /// Probe the adapter, resolve the variant and bind the family. An
    /// adapter that probed an unusable device is powered down here; it
    /// never reaches the caller.
    pub fn probe(mut adapter: Box<dyn Adapter>, table: &DeviceTable) -> Result<Target> {
        let idcode = adapter.get_idcode()?;
        let variant = match table.lookup(idcode) {
            Some(variant) if idcode != 0 => variant,
            _ => {
                if let Err(e) = adapter.close(false) {
                    log::warn!("adapter close failed: {}", e);
                }
                return Err(Error::UnknownDevice(idcode));
            }
        };

        let family = variant.family;
        adapter.set_family(family);

        let (flash_addr, flash_bytes, boot_bytes) = if variant.flash_kbytes != 0 {
            (
                FLASH_BASE,
                variant.flash_kbytes * 1024,
                family.boot_kbytes * 1024,
            )
        } else {
            // Bootloader pseudo-device: the adapter dictates geometry.
            let (start, bytes) = adapter.program_area().unwrap_or((FLASH_BASE, 0));
            (start, bytes, adapter.boot_bytes())
        };

        log::info!(
            "processor {} (id {:08X}), flash {} kbytes",
            variant.name,
            idcode,
            flash_bytes / 1024
        );
        Ok(Target {
            cpu_name: variant.name.clone(),
            idcode,
            family,
            flash_addr,
            flash_bytes,
            boot_bytes,
            adapter,
            closed: false,
        })
    }

    /// Adapter name.
    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    /// Adapter capability flags.
    pub fn capabilities(&self) -> Capabilities {
        self.adapter.capabilities()
    }

    /// CPU marketing name.
    pub fn cpu_name(&self) -> &str {
        &self.cpu_name
    }

    /// Probed ID code.
    pub fn idcode(&self) -> u32 {
        self.idcode
    }

    /// Family descriptor.
    pub fn family(&self) -> &'static Family {
        self.family
    }

    /// Program flash size in bytes.
    pub fn flash_bytes(&self) -> u32 {
        self.flash_bytes
    }

    /// Program flash physical base address.
    pub fn flash_addr(&self) -> u32 {
        self.flash_addr
    }

    /// Boot flash size in bytes.
    pub fn boot_bytes(&self) -> u32 {
        self.boot_bytes
    }

    /// Byte offset of the DEVCFG words inside the boot area.
    pub fn devcfg_offset(&self) -> u32 {
        self.family.devcfg_offset
    }

    /// Flash block size used for chunked program/verify passes.
    pub fn block_size(&self) -> u32 {
        self.adapter
            .block_override()
            .unwrap_or(self.family.bytes_per_row)
    }

    /// Load the Programming Executive when the adapter and family support
    /// one. A missing PE image degrades to the slow path with a warning.
    pub fn use_executive(&mut self, pe_dir: Option<&Path>) -> Result<()> {
        let Some(spec) = self.family.pe.as_ref() else {
            return Ok(());
        };
        let image = match PeImage::load(spec, pe_dir) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("{}; continuing without the PE (slow)", e);
                return Ok(());
            }
        };
        match self.adapter.load_executive(&image.words, image.version) {
            Err(Error::Unsupported(_)) => {
                log::debug!("adapter has no PE support, continuing without");
                Ok(())
            }
            other => other,
        }
    }

    /// Read one word of memory.
    pub fn read_word(&mut self, addr: u32) -> Result<u32> {
        self.adapter.read_word(virt_to_phys(addr))
    }

    /// Read a block of memory, chunked to the adapter's transfer size.
    pub fn read_block(&mut self, addr: u32, nwords: u32) -> Result<Vec<u32>> {
        let mut addr = virt_to_phys(addr);
        let mut left = nwords;
        let mut data = Vec::with_capacity(nwords as usize);
        while left > 0 {
            let n = left.min(CHUNK_WORDS);
            data.extend(self.adapter.read_data(addr, n)?);
            addr += n * 4;
            left -= n;
        }
        Ok(data)
    }

    /// Verify a block against `data`. Falls back to read-and-compare when
    /// the adapter has no checksum verification.
    pub fn verify_block(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        match self.adapter.verify_data(virt_to_phys(addr), data) {
            Err(Error::Unsupported(_)) => {}
            other => return other,
        }
        let block = self.read_block(addr, data.len() as u32)?;
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

    /// Erase the whole chip.
    pub fn erase(&mut self) -> Result<()> {
        self.adapter.erase_chip()
    }

    /// Program a block of memory. Block-oriented adapters take 256-word
    /// chunks; everything else goes row by row, skipping rows that are
    /// fully erased.
    pub fn program_block(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        let addr = virt_to_phys(addr);

        match self.program_block_chunks(addr, data) {
            Err(Error::Unsupported(_)) => {}
            other => return other,
        }

        let words_per_row = self.family.words_per_row() as usize;
        for (i, row) in data.chunks(words_per_row).enumerate() {
            if row.iter().all(|&w| w == 0xffff_ffff) {
                continue;
            }
            self.adapter
                .program_row(addr + (i * words_per_row * 4) as u32, row)?;
        }
        Ok(())
    }

    fn program_block_chunks(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        for (i, chunk) in data.chunks(CHUNK_WORDS as usize).enumerate() {
            if chunk.iter().all(|&w| w == 0xffff_ffff) {
                continue;
            }
            self.adapter
                .program_block(addr + (i * CHUNK_WORDS as usize * 4) as u32, chunk)?;
        }
        Ok(())
    }

    /// Program one word.
    pub fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
        self.adapter.program_word(virt_to_phys(addr), word)
    }

    /// Program the configuration words, using the write granule each
    /// family requires.
    pub fn program_devcfg(&mut self, set: &DevcfgSet) -> Result<()> {
        if self.family.devcfg_offset == 0 {
            return Ok(());
        }
        let devcfg_addr = BOOT_BASE + self.family.devcfg_offset;

        match (self.family.kind, set) {
            (FamilyKind::Mm, DevcfgSet::MmRegs { primary, alternate }) => {
                // MM parts only support double-word writes. The register
                // file repeats at a primary and an alternate offset, with
                // one word of padding on each end.
                for (offset, regs) in [(0xc0u32, primary), (0x40u32, alternate)] {
                    let base = devcfg_addr + offset;
                    self.adapter
                        .program_double_word(base, 0xffff_ffff, regs[0])?;
                    self.adapter.program_double_word(base + 0x08, regs[1], regs[2])?;
                    self.adapter.program_double_word(base + 0x10, regs[3], regs[4])?;
                    self.adapter
                        .program_double_word(base + 0x18, regs[5], 0xffff_ffff)?;
                }
                Ok(())
            }
            (FamilyKind::Mk, DevcfgSet::MkBanks { bank1, bank2 }) => {
                // MK configuration space lives in the boot-flash-1 alias
                // and repeats for boot flash 2; only quad-word writes are
                // allowed there.
                let base = devcfg_addr + (MK_BOOT1_BASE - BOOT_BASE);
                for (bank_offset, bank) in [(0u32, bank1), (0x2_0000u32, bank2)] {
                    let at = base + bank_offset;
                    self.adapter.program_quad_word(
                        at,
                        [bank.devcfg[3], bank.devcfg[2], bank.devcfg[1], bank.devcfg[0]],
                    )?;
                    self.adapter.program_quad_word(
                        at + 0x10,
                        [0xffff_ffff, 0xffff_ffff, 0xffff_ffff, bank.devcp],
                    )?;
                    self.adapter.program_quad_word(
                        at + 0x20,
                        [0xffff_ffff, 0xffff_ffff, 0xffff_ffff, bank.devsign],
                    )?;
                    self.adapter.program_quad_word(
                        at + 0x30,
                        [bank.seq, 0xffff_ffff, 0xffff_ffff, 0xffff_ffff],
                    )?;
                }
                Ok(())
            }
            (FamilyKind::Mm | FamilyKind::Mk, DevcfgSet::Words { .. }) => {
                Err(Error::Config(
                    "this family needs its full configuration register set".into(),
                ))
            }
            (_, DevcfgSet::Words { devcfg }) => {
                let uses_quad = self
                    .family
                    .pe
                    .as_ref()
                    .is_some_and(|pe| pe.version >= 0x0500);
                if uses_quad {
                    // ECC-protected configuration rows must be written in
                    // one quad-word transaction.
                    self.adapter.program_quad_word(
                        devcfg_addr,
                        [devcfg[3], devcfg[2], devcfg[1], devcfg[0]],
                    )
                } else {
                    self.adapter.program_word(devcfg_addr, devcfg[3])?;
                    self.adapter.program_word(devcfg_addr + 4, devcfg[2])?;
                    self.adapter.program_word(devcfg_addr + 8, devcfg[1])?;
                    self.adapter.program_word(devcfg_addr + 12, devcfg[0])
                }
            }
            (kind, _) => Err(Error::Config(format!(
                "DEVCFG data does not match the {:?} family layout",
                kind
            ))),
        }
    }

    /// Shut the session down. Safe to call once; later calls are rejected
    /// so double power-down sequences cannot reach the adapter.
    pub fn close(&mut self, power_on: bool) -> Result<()> {
        if self.closed {
            return Err(Error::Protocol("target already closed".into()));
        }
        self.closed = true;
        self.adapter.close(power_on)
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.adapter.close(false) {
                log::warn!("adapter close failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Adapter stub recording row/block traffic.
    #[derive(Default)]
    struct StubState {
        rows: Vec<(u32, Vec<u32>)>,
        blocks: Vec<(u32, Vec<u32>)>,
        words: Vec<(u32, u32)>,
        quads: Vec<(u32, [u32; 4])>,
        closes: usize,
    }

    struct StubAdapter {
        state: Rc<RefCell<StubState>>,
        with_blocks: bool,
    }

    impl Adapter for StubAdapter {
        fn name(&self) -> &str {
            "stub"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::all()
        }

        fn get_idcode(&mut self) -> Result<u32> {
            Ok(0x0430_7053)
        }

        fn program_row(&mut self, addr: u32, data: &[u32]) -> Result<()> {
            self.state.borrow_mut().rows.push((addr, data.to_vec()));
            Ok(())
        }

        fn program_block(&mut self, addr: u32, data: &[u32]) -> Result<()> {
            if !self.with_blocks {
                return Err(Error::Unsupported("program_block"));
            }
            self.state.borrow_mut().blocks.push((addr, data.to_vec()));
            Ok(())
        }

        fn program_word(&mut self, addr: u32, word: u32) -> Result<()> {
            self.state.borrow_mut().words.push((addr, word));
            Ok(())
        }

        fn program_quad_word(&mut self, addr: u32, words: [u32; 4]) -> Result<()> {
            self.state.borrow_mut().quads.push((addr, words));
            Ok(())
        }

        fn erase_chip(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self, _power_on: bool) -> Result<()> {
            self.state.borrow_mut().closes += 1;
            Ok(())
        }
    }

    fn target_with(with_blocks: bool) -> (Target, Rc<RefCell<StubState>>) {
        let state = Rc::new(RefCell::new(StubState::default()));
        let adapter = StubAdapter {
            state: state.clone(),
            with_blocks,
        };
        let table = DeviceTable::new();
        let target = Target::probe(Box::new(adapter), &table).unwrap();
        (target, state)
    }

    #[test]
    fn probe_binds_variant_and_family() {
        let (target, _) = target_with(false);
        assert_eq!(target.cpu_name(), "MX795F512L");
        assert_eq!(target.flash_bytes(), 512 * 1024);
        assert_eq!(target.family().kind, FamilyKind::Mx3);
    }

    #[test]
    fn empty_block_emits_no_row_traffic() {
        let (mut target, state) = target_with(false);
        let block = vec![0xffff_ffffu32; 128];
        target.program_block(0x9d00_0000, &block).unwrap();
        assert!(state.borrow().rows.is_empty(), "erased rows were programmed");
    }

    #[test]
    fn dirty_rows_are_programmed_in_address_order() {
        let (mut target, state) = target_with(false);
        let words_per_row = family::MX3.words_per_row() as usize;
        let mut block = vec![0xffff_ffffu32; words_per_row * 3];
        block[0] = 0x1234_5678; // row 0 dirty
        block[words_per_row * 2] = 0x8765_4321; // row 2 dirty
        target.program_block(0x9d00_0000, &block).unwrap();

        let rows = &state.borrow().rows;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, 0x1d00_0000);
        assert_eq!(rows[1].0, 0x1d00_0000 + 2 * (words_per_row as u32) * 4);
        assert_eq!(rows[0].1.len(), words_per_row);
    }

    #[test]
    fn block_capable_adapter_takes_256_word_chunks() {
        let (mut target, state) = target_with(true);
        let block = vec![0u32; 512];
        target.program_block(0x1d00_0000, &block).unwrap();
        let blocks = &state.borrow().blocks;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, 0x1d00_0000);
        assert_eq!(blocks[1].0, 0x1d00_0400);
        assert!(state.borrow().rows.is_empty());
    }

    #[test]
    fn devcfg_on_mx_uses_word_programs_high_register_first() {
        let (mut target, state) = target_with(false);
        target
            .program_devcfg(&DevcfgSet::Words {
                devcfg: [0x0000_7fff, 0x1111, 0x2222, 0x3333],
            })
            .unwrap();
        let words = &state.borrow().words;
        let base = BOOT_BASE + family::MX3.devcfg_offset;
        assert_eq!(words[0], (base, 0x3333));
        assert_eq!(words[3].0, base + 12);
        assert!(state.borrow().quads.is_empty());
    }

    #[test]
    fn close_is_single_shot() {
        let (mut target, state) = target_with(false);
        target.close(false).unwrap();
        assert!(target.close(false).is_err());
        drop(target);
        assert_eq!(state.borrow().closes, 1);
    }

    #[test]
    fn drop_closes_once() {
        let (target, state) = target_with(false);
        drop(target);
        assert_eq!(state.borrow().closes, 1);
    }

    #[test]
    fn virtual_addresses_map_to_physical() {
        assert_eq!(virt_to_phys(0x9d00_0000), 0x1d00_0000);
        assert_eq!(virt_to_phys(0xbfc0_0000), 0x1fc0_0000);
        assert_eq!(virt_to_phys(0x1fc0_0000), 0x1fc0_0000);
    }
}
