//! `program`: erase, write and verify a firmware image.

use std::path::Path;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use pic32flash_core::adapter::Capabilities;
use pic32flash_core::family::FamilyKind;
use pic32flash_core::target::{DevcfgSet, Target};
use pic32flash_core::{Error, Result};

use crate::image::{FirmwareImage, BOOTV_BASE, FLASHV_BASE};

pub struct ProgramArgs<'a> {
    pub file: &'a Path,
    pub verify_only: bool,
    pub skip_verify: bool,
    pub pe_dir: Option<&'a Path>,
}

fn progress_bar(blocks: u64, phase: &str) -> ProgressBar {
    let bar = ProgressBar::new(blocks);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} blocks {}",
                phase
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar
}

pub fn run(target: &mut Target, args: &ProgramArgs<'_>) -> Result<()> {
    if !args.verify_only && !target.capabilities().contains(Capabilities::WRITE) {
        return Err(Error::Unsupported("target write"));
    }

    let mut image = FirmwareImage::load(args.file)?;

    let flash_bytes = target.flash_bytes();
    let boot_bytes = target.boot_bytes();
    let blocksz = target.block_size();
    let devcfg_offset = target.devcfg_offset();

    println!("    Processor: {}", target.cpu_name());
    println!(" Flash memory: {} kbytes", flash_bytes / 1024);
    if boot_bytes > 0 {
        println!("  Boot memory: {} kbytes", boot_bytes / 1024);
    }
    println!("         Data: {} bytes", image.total_bytes);

    // The standalone fuse-programming path applies to the four-word
    // DEVCFG layouts; MM and MK configuration spaces are written as part
    // of their boot image blocks.
    let four_word_devcfg = matches!(
        target.family().kind,
        FamilyKind::Mx1 | FamilyKind::Mx3 | FamilyKind::Mz
    );
    // MZ flash always ends up with DEVSIGN0<31> clear; match the image.
    if image.boot_used && devcfg_offset == 0xffc0 {
        image.clear_mz_devsign();
    }

    let devcfg = if !args.verify_only && image.boot_used && devcfg_offset != 0 && four_word_devcfg {
        let devcfg = image.devcfg_words(devcfg_offset);
        if devcfg[0] == 0xffff_ffff {
            return Err(Error::Config(
                "DEVCFG values are missing -- check your HEX file!".into(),
            ));
        }
        Some(devcfg)
    } else {
        None
    };

    if !args.verify_only {
        println!("        Erase: ...");
        target.erase()?;
    }
    target.use_executive(args.pe_dir)?;

    // Dirty-block maps; fully erased blocks produce no wire traffic.
    let flash_dirty: Vec<u32> = (0..flash_bytes)
        .step_by(blocksz as usize)
        .filter(|&at| image.flash_used && image.flash_block_dirty(at, blocksz))
        .collect();
    let boot_dirty: Vec<u32> = (0..boot_bytes)
        .step_by(blocksz as usize)
        .filter(|&at| {
            image.boot_used
                && image.boot_block_dirty(at, blocksz, four_word_devcfg.then_some(devcfg_offset))
        })
        .collect();

    let started = Instant::now();

    if !args.verify_only {
        if !flash_dirty.is_empty() {
            let bar = progress_bar(flash_dirty.len() as u64, "program flash");
            for &at in &flash_dirty {
                let words = image_words(&image.flash, at, blocksz);
                target.program_block(FLASHV_BASE + at, &words)?;
                bar.inc(1);
            }
            bar.finish();
        }
        if !boot_dirty.is_empty() {
            let bar = progress_bar(boot_dirty.len() as u64, "program boot");
            for &at in &boot_dirty {
                let words = image_words(&image.boot, at, blocksz);
                target.program_block(BOOTV_BASE + at, &words)?;
                bar.inc(1);
            }
            bar.finish();
        }
        if let Some(devcfg) = devcfg {
            // When the devcfg block carried nothing but the fuses, it
            // was skipped above and the words are programmed here.
            if !boot_dirty.contains(&(devcfg_offset / blocksz * blocksz)) {
                target.program_devcfg(&DevcfgSet::Words { devcfg })?;
            }
        }
    }

    if !args.skip_verify {
        if !flash_dirty.is_empty() {
            let bar = progress_bar(flash_dirty.len() as u64, "verify flash");
            for &at in &flash_dirty {
                let words = image_words(&image.flash, at, blocksz);
                target.verify_block(FLASHV_BASE + at, &words)?;
                bar.inc(1);
            }
            bar.finish();
        }
        if !boot_dirty.is_empty() {
            let bar = progress_bar(boot_dirty.len() as u64, "verify boot");
            for &at in &boot_dirty {
                let words = image_words(&image.boot, at, blocksz);
                target.verify_block(BOOTV_BASE + at, &words)?;
                bar.inc(1);
            }
            bar.finish();
        }
    }

    if image.boot_used || image.flash_used {
        let elapsed = started.elapsed().as_millis().max(1);
        println!(
            " Program rate: {} bytes per second",
            image.total_bytes as u128 * 1000 / elapsed
        );
    }
    Ok(())
}

fn image_words(data: &[u8], offset: u32, blocksz: u32) -> Vec<u32> {
    data[offset as usize..(offset + blocksz) as usize]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}
