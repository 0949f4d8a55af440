//! `erase`: full chip erase.

use pic32flash_core::adapter::Capabilities;
use pic32flash_core::target::Target;
use pic32flash_core::{Error, Result};

pub fn run(target: &mut Target) -> Result<()> {
    if !target.capabilities().contains(Capabilities::ERASE) {
        return Err(Error::Unsupported("target erase"));
    }
    print!("        Erase: ");
    target.erase()?;
    println!("done");
    Ok(())
}
