use clap::ValueEnum;
use esploader_lib::{AfterOperation, BeforeOperation, ChipType, FlashMode};
use serde::{Deserialize, Serialize};

/// 配置文件中未给出时使用的默认值
pub struct Defaults;

impl Defaults {
    pub const BAUD: u32 = 460_800;
    pub const BEFORE: &'static str = "default_reset";
    pub const AFTER: &'static str = "hard_reset";
    pub const CONNECT_ATTEMPTS: u32 = 7;
}

/// 十六进制字符串，例如 "0x10000"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HexString(pub String);

impl HexString {
    pub fn to_u32(&self) -> Result<u32, String> {
        let hex_part = self
            .0
            .strip_prefix("0x")
            .or_else(|| self.0.strip_prefix("0X"))
            .ok_or_else(|| format!("Invalid hex string format: {}", self.0))?;
        u32::from_str_radix(hex_part, 16)
            .map_err(|e| format!("Failed to parse hex string '{}': {}", self.0, e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFlashFileConfig {
    pub path: String,
    /// Intel HEX 文件可以省略地址
    pub address: Option<HexString>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFlashFileConfig {
    pub path: String,
    pub address: HexString,
    pub size: HexString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFlashCommandConfig {
    #[serde(default)]
    pub no_verify: bool,
    #[serde(default)]
    pub erase_all: bool,
    #[serde(default)]
    pub no_compress: bool,
    pub flash_mode: Option<String>,
    pub flash_freq: Option<String>,
    pub flash_size: Option<String>,
    pub files: Vec<WriteFlashFileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFlashCommandConfig {
    pub files: Vec<ReadFlashFileConfig>,
}

/// 无参数命令的占位结构，JSON 中写作 `{}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyCommandConfig {}

/// JSON 配置文件的根结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EspLoaderConfig {
    pub chip: Option<String>,
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_before")]
    pub before: String,
    #[serde(default = "default_after")]
    pub after: String,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    pub reset_sequence: Option<String>,
    pub stub_path: Option<String>,
    #[serde(default)]
    pub no_stub: bool,
    #[serde(default)]
    pub quiet: bool,

    // 以下命令最多只能出现一个
    pub write_flash: Option<WriteFlashCommandConfig>,
    pub read_flash: Option<ReadFlashCommandConfig>,
    pub erase_flash: Option<EmptyCommandConfig>,
    pub flash_id: Option<EmptyCommandConfig>,
}

fn default_baud() -> u32 {
    Defaults::BAUD
}
fn default_before() -> String {
    Defaults::BEFORE.to_string()
}
fn default_after() -> String {
    Defaults::AFTER.to_string()
}
fn default_connect_attempts() -> u32 {
    Defaults::CONNECT_ATTEMPTS
}

impl EspLoaderConfig {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: EspLoaderConfig = serde_json::from_str(content)?;
        Ok(config)
    }

    /// 只有默认值、不含命令的配置
    pub fn with_defaults() -> Self {
        Self {
            chip: None,
            port: String::new(),
            baud: Defaults::BAUD,
            before: Defaults::BEFORE.to_string(),
            after: Defaults::AFTER.to_string(),
            connect_attempts: Defaults::CONNECT_ATTEMPTS,
            reset_sequence: None,
            stub_path: None,
            no_stub: false,
            quiet: false,
            write_flash: None,
            read_flash: None,
            erase_flash: None,
            flash_id: None,
        }
    }

    pub fn parse_chip_type(&self) -> Result<Option<ChipType>, String> {
        self.chip
            .as_deref()
            .map(|chip| {
                chip.parse::<ChipType>()
                    .map_err(|_| format!("Invalid chip type: {}", chip))
            })
            .transpose()
    }

    pub fn parse_before(&self) -> Result<BeforeOperation, String> {
        BeforeOperation::from_str(&self.before, true)
            .map_err(|_| format!("Invalid before operation: {}", self.before))
    }

    pub fn parse_after(&self) -> Result<AfterOperation, String> {
        AfterOperation::from_str(&self.after, true)
            .map_err(|_| format!("Invalid after operation: {}", self.after))
    }

    fn command_count(&self) -> usize {
        [
            self.write_flash.is_some(),
            self.read_flash.is_some(),
            self.erase_flash.is_some(),
            self.flash_id.is_some(),
        ]
        .iter()
        .filter(|&&x| x)
        .count()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.command_count() != 1 {
            return Err("Configuration must contain exactly one command (write_flash, read_flash, erase_flash, or flash_id)".to_string());
        }

        self.parse_chip_type()?;
        self.parse_before()?;
        self.parse_after()?;

        if let Some(ref write_flash) = self.write_flash {
            if write_flash.files.is_empty() {
                return Err("write_flash requires at least one file".to_string());
            }
            for file in &write_flash.files {
                if let Some(ref addr) = file.address {
                    addr.to_u32().map_err(|e| {
                        format!("Invalid address in write_flash file '{}': {}", file.path, e)
                    })?;
                }
            }
            if let Some(ref mode) = write_flash.flash_mode {
                mode.parse::<FlashMode>()
                    .map_err(|_| format!("Invalid flash_mode '{}'", mode))?;
            }
        }

        if let Some(ref read_flash) = self.read_flash {
            for file in &read_flash.files {
                file.address.to_u32().map_err(|e| {
                    format!("Invalid address in read_flash file '{}': {}", file.path, e)
                })?;
                file.size.to_u32().map_err(|e| {
                    format!("Invalid size in read_flash file '{}': {}", file.path, e)
                })?;
            }
        }

        Ok(())
    }
}
