//! pic32flash - flash programmer for Microchip PIC32 microcontrollers
//!
//! The heavy lifting lives in `pic32flash-core` (the EJTAG/Programming
//! Executive protocol) and one crate per physical adapter; this binary
//! parses arguments, loads firmware images and drives one programming
//! session.

mod adapters;
mod cli;
mod commands;
mod image;

use clap::Parser;
use cli::{Cli, Commands};
use commands::program::ProgramArgs;

fn main() {
    let cli = Cli::parse();
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("pic32flash: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> pic32flash_core::Result<()> {
    let mut target = commands::open_target(cli)?;

    let result = match &cli.command {
        Commands::Probe => commands::probe::run(&mut target),
        Commands::Program {
            file,
            verify_only,
            skip_verify,
        } => commands::program::run(
            &mut target,
            &ProgramArgs {
                file,
                verify_only: *verify_only,
                skip_verify: *skip_verify,
                pe_dir: cli.pe_dir.as_deref(),
            },
        ),
        Commands::Verify { file } => commands::program::run(
            &mut target,
            &ProgramArgs {
                file,
                verify_only: true,
                skip_verify: false,
                pe_dir: cli.pe_dir.as_deref(),
            },
        ),
        Commands::Read {
            file,
            address,
            nbytes,
        } => commands::read::run(&mut target, file, *address, *nbytes, cli.pe_dir.as_deref()),
        Commands::Erase => commands::erase::run(&mut target),
    };

    // The session is closed exactly once, on success and on failure.
    let closed = target.close(cli.power_on);
    result.and(closed)
}
