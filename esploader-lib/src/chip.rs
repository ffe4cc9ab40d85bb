//! 芯片识别与芯片参数表
//!
//! 每个芯片家族对应一个不可变的 [`ChipProfile`]，连接时通过读取魔数寄存器选择。

use crate::{Error, Result};
use phf::phf_map;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

#[derive(EnumString, EnumIter, Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[strum(ascii_case_insensitive)]
pub enum ChipType {
    #[strum(serialize = "esp8266")]
    #[cfg_attr(feature = "cli", clap(name = "esp8266"))]
    Esp8266,
    #[strum(serialize = "esp32")]
    #[cfg_attr(feature = "cli", clap(name = "esp32"))]
    Esp32,
    #[strum(serialize = "esp32s2")]
    #[cfg_attr(feature = "cli", clap(name = "esp32s2"))]
    Esp32s2,
    #[strum(serialize = "esp32s3")]
    #[cfg_attr(feature = "cli", clap(name = "esp32s3"))]
    Esp32s3,
    #[strum(serialize = "esp32c3")]
    #[cfg_attr(feature = "cli", clap(name = "esp32c3"))]
    Esp32c3,
    #[strum(serialize = "esp32c2")]
    #[cfg_attr(feature = "cli", clap(name = "esp32c2"))]
    Esp32c2,
    #[strum(serialize = "esp32c6")]
    #[cfg_attr(feature = "cli", clap(name = "esp32c6"))]
    Esp32c6,
    #[strum(serialize = "esp32c61")]
    #[cfg_attr(feature = "cli", clap(name = "esp32c61"))]
    Esp32c61,
    #[strum(serialize = "esp32c5")]
    #[cfg_attr(feature = "cli", clap(name = "esp32c5"))]
    Esp32c5,
    #[strum(serialize = "esp32h2")]
    #[cfg_attr(feature = "cli", clap(name = "esp32h2"))]
    Esp32h2,
    #[strum(serialize = "esp32p4")]
    #[cfg_attr(feature = "cli", clap(name = "esp32p4"))]
    Esp32p4,
}

impl ChipType {
    pub fn profile(self) -> &'static ChipProfile {
        // PROFILES 与枚举一一对应
        &PROFILES[self as usize]
    }
}

/// 芯片识别魔数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipMagic {
    /// 完整的 32 位寄存器值
    Word(&'static [u32]),
    /// 只有 8 位的魔数，寄存器值必须恰好等于该字节
    Byte(u8),
}

impl ChipMagic {
    pub fn matches(&self, value: u32) -> bool {
        match self {
            ChipMagic::Word(values) => values.contains(&value),
            ChipMagic::Byte(byte) => value == u32::from(*byte),
        }
    }
}

/// SPI 控制器寄存器布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiRegisters {
    pub base: u32,
    pub usr_offs: u32,
    pub usr1_offs: u32,
    pub usr2_offs: u32,
    pub mosi_dlen_offs: Option<u32>,
    pub miso_dlen_offs: Option<u32>,
    pub w0_offs: u32,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offs
    }

    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offs
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offs
    }

    pub fn mosi_dlen(&self) -> Option<u32> {
        self.mosi_dlen_offs.map(|offs| self.base + offs)
    }

    pub fn miso_dlen(&self) -> Option<u32> {
        self.miso_dlen_offs.map(|offs| self.base + offs)
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offs
    }
}

const fn spi_esp32_layout(base: u32) -> SpiRegisters {
    SpiRegisters {
        base,
        usr_offs: 0x18,
        usr1_offs: 0x1c,
        usr2_offs: 0x20,
        mosi_dlen_offs: Some(0x24),
        miso_dlen_offs: Some(0x28),
        w0_offs: 0x58,
    }
}

/// FLASH_BEGIN 中擦除长度的计算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseSizePolicy {
    /// 擦除长度等于写入长度
    PassThrough,
    /// ESP8266 ROM 的擦除函数有缺陷，需要按扇区/块修正
    Esp8266Rom,
}

const ESP8266_SECTOR_SIZE: u32 = 4096;
const ESP8266_SECTORS_PER_BLOCK: u32 = 16;

impl EraseSizePolicy {
    pub fn erase_size(self, offset: u32, size: u32) -> u32 {
        match self {
            EraseSizePolicy::PassThrough => size,
            EraseSizePolicy::Esp8266Rom => {
                let num_sectors = size.div_ceil(ESP8266_SECTOR_SIZE);
                let start_sector = offset / ESP8266_SECTOR_SIZE;

                let head_sectors = (ESP8266_SECTORS_PER_BLOCK
                    - start_sector % ESP8266_SECTORS_PER_BLOCK)
                    .min(num_sectors);

                if num_sectors < 2 * head_sectors {
                    (num_sectors + 1) / 2 * ESP8266_SECTOR_SIZE
                } else {
                    (num_sectors - head_sectors) * ESP8266_SECTOR_SIZE
                }
            }
        }
    }
}

static ESP32_FLASH_SIZES: phf::Map<&'static str, u8> = phf_map! {
    "1MB" => 0x00,
    "2MB" => 0x10,
    "4MB" => 0x20,
    "8MB" => 0x30,
    "16MB" => 0x40,
    "32MB" => 0x50,
    "64MB" => 0x60,
    "128MB" => 0x70,
};

static ESP8266_FLASH_SIZES: phf::Map<&'static str, u8> = phf_map! {
    "512KB" => 0x00,
    "256KB" => 0x10,
    "1MB" => 0x20,
    "2MB" => 0x30,
    "4MB" => 0x40,
    "2MB-c1" => 0x50,
    "4MB-c1" => 0x60,
    "8MB" => 0x80,
    "16MB" => 0x90,
};

static DEFAULT_FLASH_FREQUENCY: phf::Map<&'static str, u8> = phf_map! {
    "80m" => 0xf,
    "40m" => 0x0,
    "26m" => 0x1,
    "20m" => 0x2,
};

static ESP32C2_FLASH_FREQUENCY: phf::Map<&'static str, u8> = phf_map! {
    "60m" => 0xf,
    "30m" => 0x0,
    "20m" => 0x1,
    "15m" => 0x2,
};

static ESP32C6_FLASH_FREQUENCY: phf::Map<&'static str, u8> = phf_map! {
    "80m" => 0x0,
    "40m" => 0x0,
    "20m" => 0x2,
};

static ESP32H2_FLASH_FREQUENCY: phf::Map<&'static str, u8> = phf_map! {
    "48m" => 0xf,
    "24m" => 0x0,
    "16m" => 0x1,
    "12m" => 0x2,
};

static ESP32C5_FLASH_FREQUENCY: phf::Map<&'static str, u8> = phf_map! {
    "80m" => 0xf,
    "40m" => 0x0,
    "20m" => 0x2,
};

/// JEDEC ID 中容量字节与容量标签的对应关系
pub static DETECTED_FLASH_SIZES: phf::Map<u8, &'static str> = phf_map! {
    0x12u8 => "256KB",
    0x13u8 => "512KB",
    0x14u8 => "1MB",
    0x15u8 => "2MB",
    0x16u8 => "4MB",
    0x17u8 => "8MB",
    0x18u8 => "16MB",
    0x19u8 => "32MB",
    0x1au8 => "64MB",
    0x1bu8 => "128MB",
    0x1cu8 => "256MB",
    0x20u8 => "64MB",
    0x21u8 => "128MB",
    0x22u8 => "256MB",
    0x32u8 => "256KB",
    0x33u8 => "512KB",
    0x34u8 => "1MB",
    0x35u8 => "2MB",
    0x36u8 => "4MB",
    0x37u8 => "8MB",
    0x38u8 => "16MB",
    0x39u8 => "32MB",
    0x3au8 => "64MB",
};

/// 芯片家族的静态参数
#[derive(Debug)]
pub struct ChipProfile {
    pub chip: ChipType,
    pub name: &'static str,
    pub magic: ChipMagic,
    pub spi: SpiRegisters,
    /// UART 缓冲区编号寄存器及表示 USB-OTG 的取值
    pub uart_dev_buf_no: Option<(u32, u32)>,
    pub bootloader_flash_offset: u32,
    pub erase_policy: EraseSizePolicy,
    pub flash_sizes: &'static phf::Map<&'static str, u8>,
    pub flash_frequencies: &'static phf::Map<&'static str, u8>,
    pub rom_flash_write_size: u32,
    /// ROM 的 FLASH_BEGIN / FLASH_DEFL_BEGIN 需要额外的加密标志字段
    pub supports_encrypted_flash: bool,
    /// ROM 响应末尾状态字节的长度
    pub rom_status_len: usize,
}

impl ChipProfile {
    /// 根据魔数寄存器的值查找芯片
    pub fn from_magic(value: u32) -> Result<&'static ChipProfile> {
        PROFILES
            .iter()
            .find(|profile| profile.magic.matches(value))
            .ok_or(Error::UnknownChip(value))
    }

    pub fn all() -> impl Iterator<Item = &'static ChipProfile> {
        ChipType::iter().map(ChipType::profile)
    }

    pub fn erase_size(&self, offset: u32, size: u32) -> u32 {
        self.erase_policy.erase_size(offset, size)
    }

    pub fn flash_size_code(&self, label: &str) -> Result<u8> {
        self.flash_sizes.get(label).copied().ok_or_else(|| {
            Error::UnsupportedChip(format!(
                "flash size {} is not supported by {}",
                label, self.name
            ))
        })
    }

    pub fn flash_frequency_code(&self, label: &str) -> Result<u8> {
        self.flash_frequencies.get(label).copied().ok_or_else(|| {
            Error::UnsupportedChip(format!(
                "flash frequency {} is not supported by {}",
                label, self.name
            ))
        })
    }
}

/// 把 "4MB"、"256KB"、"2MB-c1" 之类的标签换算为字节数
pub fn flash_size_bytes(label: &str) -> Option<u32> {
    let label = label.strip_suffix("-c1").unwrap_or(label);
    if let Some(mb) = label.strip_suffix("MB") {
        mb.parse::<u32>().ok()?.checked_mul(1024 * 1024)
    } else if let Some(kb) = label.strip_suffix("KB") {
        kb.parse::<u32>().ok()?.checked_mul(1024)
    } else {
        None
    }
}

static PROFILES: [ChipProfile; 11] = [
    ChipProfile {
        chip: ChipType::Esp8266,
        name: "ESP8266",
        magic: ChipMagic::Word(&[0xfff0_c101]),
        spi: SpiRegisters {
            base: 0x6000_0200,
            usr_offs: 0x1c,
            usr1_offs: 0x20,
            usr2_offs: 0x24,
            mosi_dlen_offs: None,
            miso_dlen_offs: None,
            w0_offs: 0x40,
        },
        uart_dev_buf_no: None,
        bootloader_flash_offset: 0,
        erase_policy: EraseSizePolicy::Esp8266Rom,
        flash_sizes: &ESP8266_FLASH_SIZES,
        flash_frequencies: &DEFAULT_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: false,
        rom_status_len: 2,
    },
    ChipProfile {
        chip: ChipType::Esp32,
        name: "ESP32",
        magic: ChipMagic::Word(&[0x00f0_1d83]),
        spi: SpiRegisters {
            base: 0x3ff4_2000,
            usr_offs: 0x1c,
            usr1_offs: 0x20,
            usr2_offs: 0x24,
            mosi_dlen_offs: Some(0x28),
            miso_dlen_offs: Some(0x2c),
            w0_offs: 0x80,
        },
        uart_dev_buf_no: None,
        bootloader_flash_offset: 0x1000,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &DEFAULT_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: false,
        rom_status_len: 4,
    },
    ChipProfile {
        chip: ChipType::Esp32s2,
        name: "ESP32-S2",
        magic: ChipMagic::Word(&[0x0000_07c6]),
        spi: spi_esp32_layout(0x3f40_2000),
        uart_dev_buf_no: Some((0x3fff_fd14, 2)),
        bootloader_flash_offset: 0x1000,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &DEFAULT_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: true,
        rom_status_len: 4,
    },
    ChipProfile {
        chip: ChipType::Esp32s3,
        name: "ESP32-S3",
        magic: ChipMagic::Byte(0x09),
        spi: spi_esp32_layout(0x6000_2000),
        uart_dev_buf_no: Some((0x3fce_f14c, 3)),
        bootloader_flash_offset: 0,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &DEFAULT_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: true,
        rom_status_len: 4,
    },
    ChipProfile {
        chip: ChipType::Esp32c3,
        name: "ESP32-C3",
        magic: ChipMagic::Word(&[0x6921_506f, 0x1b31_506f, 0x4881_606f, 0x4361_606f]),
        spi: spi_esp32_layout(0x6000_2000),
        uart_dev_buf_no: None,
        bootloader_flash_offset: 0,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &DEFAULT_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: true,
        rom_status_len: 4,
    },
    ChipProfile {
        chip: ChipType::Esp32c2,
        name: "ESP32-C2",
        magic: ChipMagic::Word(&[0x6f51_306f, 0x7c41_a06f]),
        spi: spi_esp32_layout(0x6000_2000),
        uart_dev_buf_no: None,
        bootloader_flash_offset: 0,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &ESP32C2_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: true,
        rom_status_len: 4,
    },
    ChipProfile {
        chip: ChipType::Esp32c6,
        name: "ESP32-C6",
        magic: ChipMagic::Word(&[0x2ce0_806f]),
        spi: spi_esp32_layout(0x6000_3000),
        uart_dev_buf_no: None,
        bootloader_flash_offset: 0,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &ESP32C6_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: true,
        rom_status_len: 4,
    },
    ChipProfile {
        chip: ChipType::Esp32c61,
        name: "ESP32-C61",
        magic: ChipMagic::Word(&[0x33f0_206f, 0x2421_606f]),
        spi: spi_esp32_layout(0x6000_3000),
        uart_dev_buf_no: None,
        bootloader_flash_offset: 0,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &ESP32C5_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: true,
        rom_status_len: 4,
    },
    ChipProfile {
        chip: ChipType::Esp32c5,
        name: "ESP32-C5",
        magic: ChipMagic::Word(&[0x1101_406f, 0x63e1_406f, 0x5fd1_406f]),
        spi: spi_esp32_layout(0x6000_3000),
        uart_dev_buf_no: None,
        bootloader_flash_offset: 0x2000,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &ESP32C5_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: true,
        rom_status_len: 4,
    },
    ChipProfile {
        chip: ChipType::Esp32h2,
        name: "ESP32-H2",
        magic: ChipMagic::Word(&[0xd7b7_3e80]),
        spi: spi_esp32_layout(0x6000_3000),
        uart_dev_buf_no: None,
        bootloader_flash_offset: 0,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &ESP32H2_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: true,
        rom_status_len: 4,
    },
    ChipProfile {
        chip: ChipType::Esp32p4,
        name: "ESP32-P4",
        magic: ChipMagic::Word(&[0x0, 0x0add_bad0, 0x0703_9ad9]),
        spi: spi_esp32_layout(0x5008_d000),
        uart_dev_buf_no: None,
        bootloader_flash_offset: 0x2000,
        erase_policy: EraseSizePolicy::PassThrough,
        flash_sizes: &ESP32_FLASH_SIZES,
        flash_frequencies: &ESP32C5_FLASH_FREQUENCY,
        rom_flash_write_size: 0x400,
        supports_encrypted_flash: true,
        rom_status_len: 4,
    },
];
