//! `probe`: detect the target and print what was found.

use pic32flash_core::adapter::Capabilities;
use pic32flash_core::target::{Target, BOOT_BASE};
use pic32flash_core::{Error, Result};

pub fn run(target: &mut Target) -> Result<()> {
    if !target.capabilities().contains(Capabilities::PROBE) {
        return Err(Error::Unsupported("target probe"));
    }

    println!("    Processor: {} (id {:08X})", target.cpu_name(), target.idcode());
    println!(" Flash memory: {} kbytes", target.flash_bytes() / 1024);
    if target.boot_bytes() > 0 {
        println!("  Boot memory: {} kbytes", target.boot_bytes() / 1024);
    }

    // Raw configuration words; decoding them is a datasheet exercise.
    let offset = target.devcfg_offset();
    if offset != 0 && target.capabilities().contains(Capabilities::READ) {
        let addr = BOOT_BASE + offset;
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = target.read_word(addr + i as u32 * 4)?;
        }
        // All-ones or all-zeros means the fuses are not readable here.
        if words != [0xffff_ffff, 0xffff_ffff, 0xffff_ffff, 0x7fff_ffff]
            && words != [0; 4]
        {
            println!("Configuration:");
            for (i, word) in words.iter().enumerate() {
                println!("    DEVCFG{} = {:08x}", 3 - i, word);
            }
        }
    }
    Ok(())
}
