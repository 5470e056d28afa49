// cli/src/main.rs — bootsyncctl Entrypoint
// Reconciles the ESP vendor directory with the staged kernels, then points
// shim's fallback config and the firmware boot entries at what is installed.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bootsync::bootmgr::BootManager;
use bootsync::config::{Config, CONFIG_PATH};
use bootsync::efi::EfiVariables;
use bootsync::fs::OsFs;
use bootsync::kernel::KernelManager;

mod render;

#[derive(Parser)]
#[command(
    name = "bootsyncctl",
    version,
    about = "bootsyncctl — keep ESP kernels and UEFI boot entries in sync",
    long_about = "bootsyncctl installs staged kernel images into the EFI System Partition, retires obsolete ones, and rewrites shim's fallback configuration and the firmware Boot#### / BootOrder variables to match."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file
    #[arg(long, global = true, env = "BOOTSYNC_CONFIG", default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Do not use or update the EFI variables
    #[arg(long, global = true)]
    no_efivars: bool,

    /// Enable JSON output
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Install new kernels, commit, remove obsolete kernels, commit again (default)
    Update,
    /// List staged and installed kernels
    Kernels,
    /// List firmware boot entries and the boot order
    Entries,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Boot(#[from] bootsync::Error),
    #[error("efi variables are disabled")]
    EfivarsDisabled,
    #[error("cannot render json: {0}")]
    Json(#[from] serde_json::Error),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[cfg(target_os = "linux")]
fn firmware_variables() -> Box<dyn EfiVariables> {
    Box::new(bootsync::efi::EfivarfsVariables::new())
}

#[cfg(not(target_os = "linux"))]
fn firmware_variables() -> Box<dyn EfiVariables> {
    Box::new(bootsync::efi::NoEfiVariables)
}

fn boot_manager(cli: &Cli, config: &Config) -> Result<Option<BootManager>, CliError> {
    if cli.no_efivars || !config.efivars {
        return Ok(None);
    }
    Ok(Some(BootManager::new(firmware_variables())?))
}

fn update(cli: &Cli, config: &Config) -> Result<(), CliError> {
    let bm = boot_manager(cli, config)?;
    let mut km = KernelManager::new(Rc::new(OsFs), config.settings()?, bm)?;

    let install = km.install_kernels();
    let commit = km.commit_to_boot_loader()?;
    let removal = km.remove_obsolete_kernels();
    let cleanup = km.commit_to_boot_loader()?;

    info!(
        "{} installed, {} unchanged, {} removed",
        install.installed.len(),
        install.unchanged.len(),
        removal.removed.len()
    );
    render::update(cli.json, &install, &commit, &removal, &cleanup)
}

fn kernels(cli: &Cli, config: &Config) -> Result<(), CliError> {
    let km = KernelManager::new(Rc::new(OsFs), config.settings()?, None)?;
    render::kernels(cli.json, &km)
}

fn entries(cli: &Cli, config: &Config) -> Result<(), CliError> {
    let bm = boot_manager(cli, config)?.ok_or(CliError::EfivarsDisabled)?;
    render::entries(cli.json, &bm)
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(&cli.config)?;
    match cli.command.unwrap_or(Commands::Update) {
        Commands::Update => update(cli, &config),
        Commands::Kernels => kernels(cli, &config),
        Commands::Entries => entries(cli, &config),
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("[bootsyncctl] {}", e);
        process::exit(1);
    }
}
