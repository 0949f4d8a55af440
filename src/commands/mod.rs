//! Command implementations.

pub mod erase;
pub mod probe;
pub mod program;
pub mod read;

use pic32flash_core::device::DeviceTable;
use pic32flash_core::target::Target;
use pic32flash_core::Result;

use crate::adapters::{self, OpenOptions};
use crate::cli::Cli;

/// Open the adapter named on the command line and probe the target.
pub fn open_target(cli: &Cli) -> Result<Target> {
    let mut table = DeviceTable::new();
    if let Some(path) = &cli.device_table {
        let added = table.extend_from_file(path)?;
        log::info!("loaded {} device table entries from {}", added, path.display());
    }

    let mut adapter = adapters::open_adapter(&OpenOptions {
        port: cli.port.as_deref(),
        baud: cli.baud,
        alternate_baud: cli.alternate_baud,
    })?;
    adapter.set_verify_policy(cli.verify_policy.into());
    Target::probe(adapter, &table)
}
