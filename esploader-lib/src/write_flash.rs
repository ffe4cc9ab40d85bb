use crate::chip::flash_size_bytes;
use crate::command::{
    self, CHIP_DETECT_MAGIC_REG_ADDR, DEFAULT_TIMEOUT, ERASE_REGION_TIMEOUT_PER_MB,
    ERASE_WRITE_TIMEOUT_PER_MB, MD5_TIMEOUT_PER_MB, Opcode,
};
use crate::compress::{Compressor, Inflater, ZlibCompressor};
use crate::image::{self, DETECT, FlashSettings, KEEP};
use crate::progress::{ProgressOperation, ProgressStatus};
use crate::transport::SerialLink;
use crate::utils::Utils;
use crate::{EraseFlashTrait, EspLoader, Error, Result};
use std::cell::Cell;
use std::time::Duration;

/// 待写入 flash 的一段数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashFile {
    pub address: u32,
    pub data: Vec<u8>,
}

pub type DigestFn = fn(&[u8]) -> [u8; 16];

/// 写入进度回调：`(文件序号, 已写入的原始字节数, 文件总字节数)`
pub type FileProgressFn = Box<dyn FnMut(usize, u64, u64)>;

/// 一次 write_flash 调用的全部参数
pub struct FlashJob {
    pub files: Vec<FlashFile>,
    /// 写入前整片擦除（仅 stub）
    pub erase_all: bool,
    pub compress: bool,
    pub settings: FlashSettings,
    /// 计算写入数据摘要的函数，`None` 时跳过校验
    pub digest: Option<DigestFn>,
    pub on_progress: Option<FileProgressFn>,
}

impl FlashJob {
    pub fn new(files: Vec<FlashFile>) -> Self {
        Self {
            files,
            erase_all: false,
            compress: true,
            settings: FlashSettings::default(),
            digest: Some(Utils::md5_digest),
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, on_progress: impl FnMut(usize, u64, u64) + 'static) -> Self {
        self.on_progress = Some(Box::new(on_progress));
        self
    }
}

pub trait WriteFlashTrait {
    fn write_flash(&mut self, job: FlashJob) -> Result<()>;
}

impl<L: SerialLink> EspLoader<L> {
    /// ROM 在部分芯片上要求 FLASH_BEGIN 携带加密标志字段
    fn begin_params(&self, fields: &[u32]) -> Result<Vec<u8>> {
        let profile = self.profile()?;
        let mut params = command::pack_u32(fields);
        if profile.supports_encrypted_flash && !self.is_stub() {
            params.extend_from_slice(&0u32.to_le_bytes());
        }
        Ok(params)
    }

    /// 开始一次非压缩写入，返回数据块数量
    pub fn flash_begin(&mut self, size: u32, offset: u32) -> Result<u32> {
        let profile = self.profile()?;
        let write_size = self.flash_write_size;
        let blocks = size.div_ceil(write_size);
        // ESP8266 ROM 的擦除长度修正只适用于 ROM，stub 按原始长度擦除
        let erase_size = if self.is_stub() {
            size
        } else {
            profile.erase_size(offset, size)
        };
        let timeout = if self.is_stub() {
            DEFAULT_TIMEOUT
        } else {
            command::timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB, size)
        };

        let params = self.begin_params(&[erase_size, blocks, write_size, offset])?;
        self.connection.check_command(
            "enter Flash download mode",
            Opcode::FlashBegin,
            &params,
            0,
            timeout,
        )?;
        Ok(blocks)
    }

    pub fn flash_block(&mut self, data: &[u8], seq: u32, timeout: Duration) -> Result<()> {
        let mut payload = command::pack_u32(&[data.len() as u32, seq, 0, 0]);
        payload.extend_from_slice(data);
        self.connection.check_command(
            &format!("write to target Flash after seq {}", seq),
            Opcode::FlashData,
            &payload,
            u32::from(command::checksum(data)),
            timeout,
        )?;
        Ok(())
    }

    pub fn flash_finish(&mut self, reboot: bool) -> Result<()> {
        let payload = command::pack_u32(&[u32::from(!reboot)]);
        self.connection.check_command(
            "leave Flash mode",
            Opcode::FlashEnd,
            &payload,
            0,
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    /// 开始一次压缩写入，返回压缩数据块数量
    ///
    /// ROM 按写入块大小对齐擦除长度，stub 直接使用原始长度。
    pub fn flash_defl_begin(&mut self, size: u32, compsize: u32, offset: u32) -> Result<u32> {
        let write_size = self.flash_write_size;
        let blocks = compsize.div_ceil(write_size);
        let erase_size = if self.is_stub() {
            size
        } else {
            size.div_ceil(write_size) * write_size
        };
        let timeout = if self.is_stub() {
            DEFAULT_TIMEOUT
        } else {
            command::timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB, erase_size)
        };
        tracing::debug!(
            "compressed write: {} bytes ({} compressed) at 0x{:08X}, {} blocks",
            size,
            compsize,
            offset,
            blocks
        );

        let params = self.begin_params(&[erase_size, blocks, write_size, offset])?;
        self.connection.check_command(
            "enter compressed flash mode",
            Opcode::FlashDeflBegin,
            &params,
            0,
            timeout,
        )?;
        Ok(blocks)
    }

    pub fn flash_defl_block(&mut self, data: &[u8], seq: u32, timeout: Duration) -> Result<()> {
        let mut payload = command::pack_u32(&[data.len() as u32, seq, 0, 0]);
        payload.extend_from_slice(data);
        self.connection.check_command(
            &format!("write compressed data to flash after seq {}", seq),
            Opcode::FlashDeflData,
            &payload,
            u32::from(command::checksum(data)),
            timeout,
        )?;
        Ok(())
    }

    pub fn flash_defl_finish(&mut self, reboot: bool) -> Result<()> {
        let payload = command::pack_u32(&[u32::from(!reboot)]);
        self.connection.check_command(
            "leave compressed flash mode",
            Opcode::FlashDeflEnd,
            &payload,
            0,
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    /// 计算 flash 区域的 MD5
    ///
    /// ROM 返回 32 个十六进制字符，stub 返回 16 个原始字节。
    pub fn flash_md5sum(&mut self, address: u32, size: u32) -> Result<[u8; 16]> {
        let timeout = command::timeout_per_mb(MD5_TIMEOUT_PER_MB, size);
        let payload = command::pack_u32(&[address, size, 0, 0]);
        let data = self
            .connection
            .check_command("calculate md5sum", Opcode::SpiFlashMd5, &payload, 0, timeout)?
            .into_data()
            .ok_or_else(|| Error::protocol("SPI_FLASH_MD5 returned no digest"))?;
        parse_md5_response(&data)
    }
}

fn parse_md5_response(data: &[u8]) -> Result<[u8; 16]> {
    let mut digest = [0u8; 16];
    if data.len() >= 32 && data[..32].iter().all(u8::is_ascii_hexdigit) {
        let text = std::str::from_utf8(&data[..32])
            .map_err(|e| Error::protocol(format!("invalid md5 text: {}", e)))?;
        for (i, byte) in digest.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)?;
        }
        return Ok(digest);
    }
    if data.len() >= 16 {
        digest.copy_from_slice(&data[..16]);
        return Ok(digest);
    }
    Err(Error::protocol(format!(
        "md5 response too short: {} bytes",
        data.len()
    )))
}

/// 通用的 Flash 写入流程
pub struct FlashWriter;

impl FlashWriter {
    /// 检查所有文件都落在 flash 容量以内
    pub fn check_flash_fit(files: &[FlashFile], size_label: Option<&str>) -> Result<()> {
        let Some(label) = size_label.filter(|l| *l != KEEP && *l != DETECT) else {
            return Ok(());
        };
        let flash_size = flash_size_bytes(label)
            .ok_or_else(|| Error::invalid_input(format!("unknown flash size {}", label)))?;
        for (index, file) in files.iter().enumerate() {
            let end = u64::from(file.address) + file.data.len() as u64;
            if end > u64::from(flash_size) {
                return Err(Error::FlashFit {
                    index,
                    end,
                    flash_size,
                });
            }
        }
        Ok(())
    }

    /// 把 `detect` 替换为从 flash ID 读出的容量
    fn resolve_flash_size<L: SerialLink>(
        loader: &mut EspLoader<L>,
        settings: &mut FlashSettings,
    ) -> Result<()> {
        if settings.size.as_deref() != Some(DETECT) {
            return Ok(());
        }
        settings.size = match loader.detect_flash_size()? {
            Some(label) => {
                tracing::info!("Auto-detected flash size: {}", label);
                Some(label.to_string())
            }
            None => {
                tracing::warn!("Could not auto-detect flash size, keeping the image header");
                None
            }
        };
        Ok(())
    }

    /// 按块发送压缩数据
    ///
    /// 边发送边解压以统计每块对应的原始字节数。ROM 使用当前块的超时，
    /// stub 在收到整块后才开始写入，因此使用上一块的超时。
    fn write_compressed<L: SerialLink>(
        loader: &mut EspLoader<L>,
        index: usize,
        image: &[u8],
        address: u32,
        on_progress: &mut Option<FileProgressFn>,
    ) -> Result<Duration> {
        let compressed = ZlibCompressor::default().compress(image)?;
        let total = image.len() as u64;
        loader.flash_defl_begin(image.len() as u32, compressed.len() as u32, address)?;

        let bar = loader.progress.create_bar(
            total,
            ProgressOperation::WriteFlash {
                address,
                size: total,
            },
        );

        let inflated = Cell::new(0u64);
        let mut inflater = Inflater::new(|n| inflated.set(inflated.get() + n as u64));
        let mut timeout = DEFAULT_TIMEOUT;
        let mut last_total = 0u64;
        let write_size = loader.flash_write_size as usize;
        let block_count = compressed.len().div_ceil(write_size);

        for (seq, block) in compressed.chunks(write_size).enumerate() {
            inflater.push(block, seq + 1 == block_count)?;
            let block_uncompressed = inflated.get() - last_total;
            last_total = inflated.get();

            let block_timeout =
                command::timeout_per_mb(ERASE_WRITE_TIMEOUT_PER_MB, block_uncompressed as u32);
            if !loader.is_stub() {
                timeout = block_timeout;
            }
            if let Err(e) = loader.flash_defl_block(block, seq as u32, timeout) {
                bar.finish(ProgressStatus::Failed);
                return Err(e);
            }
            if loader.is_stub() {
                timeout = block_timeout;
            }

            bar.inc(block_uncompressed);
            if let Some(cb) = on_progress.as_mut() {
                cb(index, last_total.min(total), total);
            }
        }

        bar.finish(ProgressStatus::Success);
        Ok(timeout)
    }

    /// 按块发送原始数据，最后一块以 0xFF 补齐
    fn write_uncompressed<L: SerialLink>(
        loader: &mut EspLoader<L>,
        index: usize,
        image: &[u8],
        address: u32,
        on_progress: &mut Option<FileProgressFn>,
    ) -> Result<Duration> {
        let total = image.len() as u64;
        loader.flash_begin(image.len() as u32, address)?;

        let bar = loader.progress.create_bar(
            total,
            ProgressOperation::WriteFlash {
                address,
                size: total,
            },
        );

        let write_size = loader.flash_write_size as usize;
        let timeout = if loader.is_stub() {
            DEFAULT_TIMEOUT
        } else {
            command::timeout_per_mb(ERASE_WRITE_TIMEOUT_PER_MB, write_size as u32)
        };
        let mut written = 0u64;

        for (seq, chunk) in image.chunks(write_size).enumerate() {
            let mut block = chunk.to_vec();
            block.resize(write_size, 0xFF);
            if let Err(e) = loader.flash_block(&block, seq as u32, timeout) {
                bar.finish(ProgressStatus::Failed);
                return Err(e);
            }
            written += chunk.len() as u64;
            bar.inc(chunk.len() as u64);
            if let Some(cb) = on_progress.as_mut() {
                cb(index, written, total);
            }
        }

        bar.finish(ProgressStatus::Success);
        Ok(timeout)
    }

    /// 比较设备计算的 MD5 与本地摘要，不匹配时不重试
    pub fn verify<L: SerialLink>(
        loader: &mut EspLoader<L>,
        address: u32,
        len: u32,
        expected: [u8; 16],
    ) -> Result<()> {
        let spinner = loader
            .progress
            .create_spinner(ProgressOperation::Verify { address, len });
        let actual = match loader.flash_md5sum(address, len) {
            Ok(actual) => actual,
            Err(e) => {
                spinner.finish(ProgressStatus::Failed);
                return Err(e);
            }
        };
        if actual != expected {
            spinner.finish(ProgressStatus::Failed);
            return Err(Error::Md5Mismatch {
                expected: Utils::hex_string(&expected),
                actual: Utils::hex_string(&actual),
            });
        }
        tracing::debug!("Hash of data verified: {}", Utils::hex_string(&actual));
        spinner.finish(ProgressStatus::Success);
        Ok(())
    }
}

impl<L: SerialLink> WriteFlashTrait for EspLoader<L> {
    fn write_flash(&mut self, mut job: FlashJob) -> Result<()> {
        let profile = self.profile()?;
        let mut settings = job.settings.clone();

        FlashWriter::check_flash_fit(&job.files, settings.size.as_deref())?;
        FlashWriter::resolve_flash_size(self, &mut settings)?;
        FlashWriter::check_flash_fit(&job.files, settings.size.as_deref())?;

        if job.erase_all {
            self.erase_flash()?;
        }

        for (index, file) in job.files.iter().enumerate() {
            let mut image = file.data.clone();
            image::pad_to_alignment(&mut image, 4);
            image::update_image_flash_params(profile, file.address, &settings, &mut image)?;
            let expected = job.digest.map(|digest| digest(&image));

            let timeout = if job.compress {
                FlashWriter::write_compressed(self, index, &image, file.address, &mut job.on_progress)?
            } else {
                FlashWriter::write_uncompressed(self, index, &image, file.address, &mut job.on_progress)?
            };

            if self.is_stub() {
                // stub 写入是异步的，读寄存器确认最后一块已完成
                self.connection
                    .read_reg_timeout(CHIP_DETECT_MAGIC_REG_ADDR, timeout)?;
            }

            if let Some(expected) = expected {
                FlashWriter::verify(self, file.address, image.len() as u32, expected)?;
            }
        }

        if self.is_stub() {
            // 让 stub 离开写入状态，但不运行用户程序
            self.flash_begin(0, 0)?;
            if job.compress {
                self.flash_defl_finish(false)?;
            } else {
                self.flash_finish(false)?;
            }
        }
        Ok(())
    }
}
