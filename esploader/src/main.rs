mod cli;
mod config;
mod config_exec;
mod progress;
mod serial;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use esploader_lib::ram_stub::load_stub_file;
use esploader_lib::utils::Utils;
use esploader_lib::{
    EraseFlashTrait, EspLoader, EspLoaderBase, FlashJob, FlashSettings, ReadFlashTrait,
    SerialPortLink, WriteFlashTrait,
};
use std::path::Path;
use std::process;

use crate::cli::{Cli, Commands, MergedConfig, ReadFlash, WriteFlash, get_command, merge_config};
use crate::config::EspLoaderConfig;
use crate::progress::create_progress_callback;
use crate::serial::{check_port_available, normalize_port_name};

type Loader = EspLoader<SerialPortLink>;

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => {
            let config = EspLoaderConfig::from_file(path)
                .map_err(|e| anyhow!("Failed to load config file '{}': {}", path, e))?;
            config
                .validate()
                .map_err(|e| anyhow!("Invalid config file '{}': {}", path, e))?;
            Some(config)
        }
        None => None,
    };

    let command = get_command(&args, config.as_ref())?;
    let mut merged = merge_config(&args, config)?;
    merged.port = normalize_port_name(&merged.port);
    check_port_available(&merged.port)?;

    let mut loader = connect(&merged)?;
    execute(&mut loader, command)?;

    loader
        .run_after_operation()
        .context("Failed to run the after operation")?;
    Ok(())
}

/// 连接芯片，按需下载 stub 并切换波特率
fn connect(merged: &MergedConfig) -> Result<Loader> {
    let base = EspLoaderBase {
        before: merged.before,
        after: merged.after,
        baud: merged.baud,
        connect_attempts: merged.connect_attempts,
        reset_sequence: merged.reset_sequence.clone(),
        chip: merged.chip,
        quiet: merged.quiet,
        progress_callback: create_progress_callback(),
        ..EspLoaderBase::default()
    };

    let mut loader = EspLoader::new(SerialPortLink::new(merged.port.clone()), base);
    let profile = loader
        .connect()
        .with_context(|| format!("Failed to connect on {}", merged.port))?;

    let stub = match (&merged.stub_path, merged.no_stub) {
        (Some(path), false) => Some(
            load_stub_file(Path::new(path), profile.chip)
                .with_context(|| format!("Failed to load stub from '{}'", path))?,
        ),
        _ => None,
    };
    loader
        .setup(stub.as_ref())
        .context("Failed to prepare the bootloader")?;
    Ok(loader)
}

fn execute(loader: &mut Loader, command: Commands) -> Result<()> {
    match command {
        Commands::WriteFlash(params) => write_flash(loader, params),
        Commands::ReadFlash(params) => read_flash(loader, params),
        Commands::EraseFlash => loader
            .erase_flash()
            .context("Failed to execute erase_flash command"),
        Commands::FlashId => flash_id(loader),
    }
}

fn write_flash(loader: &mut Loader, params: WriteFlash) -> Result<()> {
    let mut files = Vec::new();
    for spec in &params.files {
        let mut parsed = Utils::parse_file_info(spec)
            .with_context(|| format!("Failed to parse file {}", spec))?;
        files.append(&mut parsed);
    }

    let mut job = FlashJob::new(files);
    job.erase_all = params.erase_all;
    job.compress = !params.no_compress;
    job.settings = FlashSettings {
        mode: params.flash_mode,
        freq: params.flash_freq,
        size: params.flash_size,
    };
    if params.no_verify {
        job.digest = None;
    }

    loader
        .write_flash(job)
        .context("Failed to execute write_flash command")
}

fn read_flash(loader: &mut Loader, params: ReadFlash) -> Result<()> {
    let files = params
        .files
        .iter()
        .map(|spec| {
            Utils::parse_read_file_info(spec)
                .with_context(|| format!("Failed to parse read spec {}", spec))
        })
        .collect::<Result<Vec<_>>>()?;

    loader
        .read_flash_to_files(&files)
        .context("Failed to execute read_flash command")
}

fn flash_id(loader: &mut Loader) -> Result<()> {
    let id = loader.read_flash_id().context("Failed to read flash id")?;
    println!("Manufacturer: {:02x}", id & 0xFF);
    println!("Device: {:02x}{:02x}", (id >> 8) & 0xFF, (id >> 16) & 0xFF);

    match loader
        .detect_flash_size()
        .context("Failed to detect flash size")?
    {
        Some(size) => println!("Detected flash size: {}", size),
        None => println!("Detected flash size: Unknown"),
    }
    Ok(())
}
