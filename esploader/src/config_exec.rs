use anyhow::{Result, anyhow, bail};

use crate::cli::{Commands, ReadFlash, WriteFlash};
use crate::config::EspLoaderConfig;
use esploader_lib::FlashMode;

impl EspLoaderConfig {
    /// 把配置文件中的命令转换为与命令行等价的形式
    pub fn to_command(&self) -> Result<Commands> {
        if let Some(ref write_flash) = self.write_flash {
            let mut files = Vec::with_capacity(write_flash.files.len());
            for file in &write_flash.files {
                match &file.address {
                    Some(addr) => {
                        let address = addr.to_u32().map_err(|e| {
                            anyhow!("Invalid write_flash address '{}': {}", addr.0, e)
                        })?;
                        files.push(format!("{}@0x{:x}", file.path, address));
                    }
                    None => files.push(file.path.clone()),
                }
            }
            let flash_mode = write_flash
                .flash_mode
                .as_deref()
                .map(|mode| {
                    mode.parse::<FlashMode>()
                        .map_err(|_| anyhow!("Invalid flash_mode '{}'", mode))
                })
                .transpose()?;

            Ok(Commands::WriteFlash(WriteFlash {
                no_verify: write_flash.no_verify,
                no_compress: write_flash.no_compress,
                erase_all: write_flash.erase_all,
                flash_mode,
                flash_freq: write_flash.flash_freq.clone(),
                flash_size: write_flash.flash_size.clone(),
                files,
            }))
        } else if let Some(ref read_flash) = self.read_flash {
            let mut files = Vec::with_capacity(read_flash.files.len());
            for file in &read_flash.files {
                let address = file.address.to_u32().map_err(|e| {
                    anyhow!("Invalid read_flash address '{}': {}", file.address.0, e)
                })?;
                let size = file
                    .size
                    .to_u32()
                    .map_err(|e| anyhow!("Invalid read_flash size '{}': {}", file.size.0, e))?;
                files.push(format!("{}@0x{:x}:0x{:x}", file.path, address, size));
            }
            Ok(Commands::ReadFlash(ReadFlash { files }))
        } else if self.erase_flash.is_some() {
            Ok(Commands::EraseFlash)
        } else if self.flash_id.is_some() {
            Ok(Commands::FlashId)
        } else {
            bail!("No valid command found in config file")
        }
    }
}
