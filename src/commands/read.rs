//! `read`: dump a flash range into a binary file.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use pic32flash_core::adapter::Capabilities;
use pic32flash_core::target::Target;
use pic32flash_core::{Error, Result};

/// Read in 1-kbyte blocks.
const BLOCKSZ: u32 = 1024;

pub fn run(
    target: &mut Target,
    file: &Path,
    address: Option<u32>,
    nbytes: Option<u32>,
    pe_dir: Option<&Path>,
) -> Result<()> {
    if !target.capabilities().contains(Capabilities::READ) {
        return Err(Error::Unsupported("target read"));
    }

    let base = address.unwrap_or(target.flash_addr());
    let nbytes = nbytes.unwrap_or(target.flash_bytes());
    println!("       Memory: total {} bytes", nbytes);

    let mut out = File::create(file)
        .map_err(|e| Error::Config(format!("{}: {}", file.display(), e)))?;

    target.use_executive(pe_dir)?;

    let bar = ProgressBar::new(u64::from(nbytes));
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let started = Instant::now();
    let mut addr = base;
    while addr - base < nbytes {
        let chunk = BLOCKSZ.min(nbytes - (addr - base));
        let words = target.read_block(addr, chunk / 4)?;
        for word in words {
            out.write_all(&word.to_le_bytes())?;
        }
        addr += chunk;
        bar.inc(u64::from(chunk));
    }
    bar.finish();

    let elapsed = started.elapsed().as_millis().max(1);
    println!(
        "         Rate: {} bytes per second",
        u128::from(nbytes) * 1000 / elapsed
    );
    Ok(())
}
