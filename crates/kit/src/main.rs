//! Command line entry point for cbl-vmm.

use clap::{CommandFactory, FromArgMatches, Subcommand};
use color_eyre::{Report, Result};

use cbl_vmm::common_opts::gate_graphical;
use cbl_vmm::config::Context;
use cbl_vmm::firmware::{self, PrintFirmwareOpts};
use cbl_vmm::iso::HttpDownloader;
use cbl_vmm::vm::{self, ListOpts, RemoveOpts, RunOpts, SetupOpts};

/// Create and boot QEMU virtual machines for kernel development.
///
/// Machines are kept under `$VM_FOLDER` (default: a `vm` directory next to
/// this program) grouped by architecture. Each one has a primary
/// qcow2 disk, its own UEFI variable store and a folder shared with the
/// guest over virtiofs.
#[derive(clap::Parser)]
#[command(name = "cbl-vmm", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the virtual machines set up for an architecture
    #[clap(alias = "ls")]
    List(ListOpts),

    /// Create a fresh virtual machine and boot its installation media
    Setup(SetupOpts),

    /// Boot an existing virtual machine
    Run(RunOpts),

    /// Delete a virtual machine and all of its files
    #[clap(alias = "rm")]
    Remove(RemoveOpts),

    /// Show where UEFI firmware for an architecture is looked for
    PrintFirmware(PrintFirmwareOpts),
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let ctx = Context::from_env()?;
    let matches = gate_graphical(Cli::command(), &["setup", "run"], ctx.display_available)
        .get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    tracing::debug!("VM base directory: {}", ctx.base);
    let downloader = HttpDownloader;

    match cli.command {
        Commands::List(opts) => vm::print_list(&ctx, &opts)?,
        Commands::Setup(opts) => vm::setup(&ctx, &opts, &downloader)?,
        Commands::Run(opts) => vm::run(&ctx, &opts, &downloader)?,
        Commands::Remove(opts) => vm::remove(&ctx, &opts)?,
        Commands::PrintFirmware(opts) => firmware::print(&ctx, opts)?,
    }
    tracing::debug!("exiting");
    Ok(())
}
