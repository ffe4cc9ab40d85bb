//! 固件头中的 flash 参数修补
//!
//! 写入到 bootloader 偏移处的镜像，其第 2、3 字节记录了 SPI flash 的
//! 模式、频率和容量，写入前按用户要求改写。

use crate::chip::ChipProfile;
use crate::{Error, Result};
use strum::{Display, EnumString};

pub const ESP_IMAGE_MAGIC: u8 = 0xE9;

/// 表示“保持镜像中原有设置”的标签
pub const KEEP: &str = "keep";

/// 从设备读取 flash ID 自动识别容量
pub const DETECT: &str = "detect";

#[derive(EnumString, Display, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[strum(serialize_all = "lowercase")]
pub enum FlashMode {
    Qio = 0,
    Qout = 1,
    Dio = 2,
    Dout = 3,
}

/// 写入 flash 时对镜像头的修改要求，`None` 表示保持不变
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashSettings {
    pub mode: Option<FlashMode>,
    pub freq: Option<String>,
    pub size: Option<String>,
}

impl FlashSettings {
    pub fn is_keep(&self) -> bool {
        self.mode.is_none() && self.freq.is_none() && self.size.is_none()
    }
}

fn requested(label: &Option<String>) -> Option<&str> {
    label.as_deref().filter(|l| *l != KEEP)
}

/// 修补镜像头，仅当地址为 bootloader 偏移且首字节为镜像魔数时生效
pub fn update_image_flash_params(
    profile: &ChipProfile,
    address: u32,
    settings: &FlashSettings,
    image: &mut [u8],
) -> Result<()> {
    if address != profile.bootloader_flash_offset || settings.is_keep() {
        return Ok(());
    }
    if image.len() < 8 {
        return Ok(());
    }
    if image[0] != ESP_IMAGE_MAGIC {
        tracing::warn!(
            "Image at 0x{:x} doesn't look like an image file, flash parameters not updated",
            address
        );
        return Ok(());
    }

    let mut mode = image[2];
    if let Some(flash_mode) = settings.mode {
        mode = flash_mode as u8;
    }

    let mut size_freq = image[3];
    if let Some(freq) = requested(&settings.freq) {
        size_freq = (size_freq & 0xF0) | profile.flash_frequency_code(freq)?;
    }
    if let Some(size) = requested(&settings.size) {
        if size == DETECT {
            return Err(Error::invalid_input(
                "flash size must be resolved before patching the image header",
            ));
        }
        size_freq = (size_freq & 0x0F) | profile.flash_size_code(size)?;
    }

    if mode != image[2] || size_freq != image[3] {
        tracing::info!(
            "Flash params set to 0x{:02x}{:02x}",
            mode,
            size_freq
        );
    }
    image[2] = mode;
    image[3] = size_freq;
    Ok(())
}

/// 以 0xFF 补齐到 4 字节对齐
pub fn pad_to_alignment(data: &mut Vec<u8>, alignment: usize) {
    let rem = data.len() % alignment;
    if rem != 0 {
        data.resize(data.len() + alignment - rem, 0xFF);
    }
}
