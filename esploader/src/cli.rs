use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use esploader_lib::{AfterOperation, BeforeOperation, ChipType, FlashMode};

use crate::config::EspLoaderConfig;

/// 命令行与配置文件合并后的连接参数
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub chip: Option<ChipType>,
    pub port: String,
    pub baud: u32,
    pub before: BeforeOperation,
    pub after: AfterOperation,
    pub connect_attempts: u32,
    pub reset_sequence: Option<String>,
    pub stub_path: Option<String>,
    pub no_stub: bool,
    pub quiet: bool,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "esploader CLI", long_about = None)]
pub struct Cli {
    /// JSON configuration file path
    #[arg(long = "config", short = 'f')]
    pub config: Option<String>,

    /// Expected chip type, the connection fails if another chip answers
    #[arg(short = 'c', long = "chip", value_enum)]
    pub chip: Option<ChipType>,

    /// Serial port device
    #[arg(short = 'p', long = "port")]
    pub port: Option<String>,

    /// Serial port baud rate used after connecting (default: 460800)
    #[arg(short = 'b', long = "baud")]
    pub baud: Option<u32>,

    /// What to do before connecting to the chip (default: default_reset)
    #[arg(long = "before", value_enum)]
    pub before: Option<BeforeOperation>,

    /// What to do after esploader is finished (default: hard_reset)
    #[arg(long = "after", value_enum)]
    pub after: Option<AfterOperation>,

    /// Number of attempts to connect (default: 7)
    #[arg(long = "connect-attempts")]
    pub connect_attempts: Option<u32>,

    /// Custom DTR/RTS reset sequence, e.g. "D0|R1|W100|D1|R0|W50|D0"
    #[arg(long = "reset-sequence")]
    pub reset_sequence: Option<String>,

    /// Flasher stub ELF file, or a directory holding one stub per chip
    #[arg(long = "stub")]
    pub stub: Option<String>,

    /// Talk to the ROM bootloader only
    #[arg(long = "no-stub")]
    pub no_stub: bool,

    /// Suppress progress bar output (default: false)
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Write binary blobs to flash
    #[command(name = "write_flash")]
    WriteFlash(WriteFlash),

    /// Read a binary blob from flash
    #[command(name = "read_flash")]
    ReadFlash(ReadFlash),

    /// Erase the entire flash
    #[command(name = "erase_flash")]
    EraseFlash,

    /// Read the SPI flash JEDEC id and detect its size
    #[command(name = "flash_id")]
    FlashId,
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Write binary blobs to flash")]
pub struct WriteFlash {
    /// Skip the MD5 check of the written data
    #[arg(long = "no-verify")]
    pub no_verify: bool,

    /// Disable data compression during transfer
    #[arg(short = 'u', long = "no-compress")]
    pub no_compress: bool,

    /// Erase the entire flash before programming
    #[arg(short = 'e', long = "erase-all")]
    pub erase_all: bool,

    /// SPI flash mode written into the bootloader image header
    #[arg(long = "flash-mode", value_enum)]
    pub flash_mode: Option<FlashMode>,

    /// SPI flash frequency, e.g. 40m or 80m ("keep" leaves the header untouched)
    #[arg(long = "flash-freq")]
    pub flash_freq: Option<String>,

    /// SPI flash size, e.g. 4MB ("keep" leaves the header untouched, "detect" reads the flash id)
    #[arg(long = "flash-size")]
    pub flash_size: Option<String>,

    /// Binary file (format: <filename@address>, Intel HEX files carry their own addresses)
    #[arg(required = true)]
    pub files: Vec<String>,
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Read a binary blob from flash")]
pub struct ReadFlash {
    /// Output file (format: <filename@address:size>)
    #[arg(required = true)]
    pub files: Vec<String>,
}

/// Merge CLI arguments with configuration file, CLI args take precedence
pub fn merge_config(args: &Cli, config: Option<EspLoaderConfig>) -> Result<MergedConfig> {
    let base_config = config.unwrap_or_else(EspLoaderConfig::with_defaults);

    let chip = match args.chip {
        Some(chip) => Some(chip),
        None => base_config
            .parse_chip_type()
            .map_err(|e| anyhow!("Invalid chip type in config: {}", e))?,
    };

    let port = args
        .port
        .clone()
        .unwrap_or_else(|| base_config.port.clone());
    let baud = args.baud.unwrap_or(base_config.baud);

    let before = match args.before {
        Some(before) => before,
        None => base_config
            .parse_before()
            .map_err(|e| anyhow!("Invalid before operation in config: {}", e))?,
    };

    let after = match args.after {
        Some(after) => after,
        None => base_config
            .parse_after()
            .map_err(|e| anyhow!("Invalid after operation in config: {}", e))?,
    };

    let connect_attempts = args
        .connect_attempts
        .unwrap_or(base_config.connect_attempts);
    let reset_sequence = args
        .reset_sequence
        .clone()
        .or_else(|| base_config.reset_sequence.clone());
    let stub_path = args.stub.clone().or_else(|| base_config.stub_path.clone());
    let no_stub = args.no_stub || base_config.no_stub;
    let quiet = args.quiet || base_config.quiet;

    if port.is_empty() {
        bail!("Port must be specified either via --port or in config file");
    }
    if connect_attempts == 0 {
        bail!("connect-attempts must be at least 1");
    }

    Ok(MergedConfig {
        chip,
        port,
        baud,
        before,
        after,
        connect_attempts,
        reset_sequence,
        stub_path,
        no_stub,
        quiet,
    })
}

/// Determine which command to execute from CLI args or config file
pub fn get_command(args: &Cli, config: Option<&EspLoaderConfig>) -> Result<Commands> {
    match (&args.command, config) {
        (Some(cmd), _) => Ok(cmd.clone()),
        (None, Some(cfg)) => cfg.to_command(),
        (None, None) => {
            bail!("No command specified. Use a subcommand or provide a config file with a command.")
        }
    }
}
