//! 通过 SPI 控制器寄存器直接访问 flash

use crate::chip::{ChipType, DETECTED_FLASH_SIZES};
use crate::command::{self, DEFAULT_TIMEOUT, Opcode};
use crate::progress::{ProgressOperation, ProgressStatus};
use crate::transport::SerialLink;
use crate::{EspLoader, Error, Result};

const SPI_USR_COMMAND: u32 = 1 << 31;
const SPI_USR_MISO: u32 = 1 << 28;
const SPI_USR_MOSI: u32 = 1 << 27;
const SPI_CMD_USR: u32 = 1 << 18;
const SPI_USR2_COMMAND_LEN_SHIFT: u32 = 28;
const SPI_USR1_MISO_BITLEN_SHIFT: u32 = 8;
const SPI_USR1_MOSI_BITLEN_SHIFT: u32 = 17;

const SPIFLASH_RDID: u8 = 0x9F;
const SPI_POLL_ATTEMPTS: usize = 10;

impl<L: SerialLink> EspLoader<L> {
    /// 把 SPI flash 挂到引导程序上
    ///
    /// ESP8266 的 ROM 没有 SPI_ATTACH，改用一次空的 FLASH_BEGIN。
    pub fn flash_spi_attach(&mut self, hspi_arg: u32) -> Result<()> {
        let profile = self.profile()?;
        if profile.chip == ChipType::Esp8266 && !self.is_stub() {
            self.flash_begin(0, 0)?;
            return Ok(());
        }

        let mut payload = command::pack_u32(&[hspi_arg]);
        if !self.is_stub() {
            // ROM 额外需要一个“是否为 legacy 模式”的字段
            payload.extend_from_slice(&0u32.to_le_bytes());
        }
        self.connection.check_command(
            "configure SPI flash pins",
            Opcode::SpiAttach,
            &payload,
            0,
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    /// 用 SPI 控制器执行一条 flash 命令，返回读到的最多 32 位数据
    pub fn run_spiflash_command(
        &mut self,
        spiflash_command: u8,
        data: &[u8],
        read_bits: u32,
    ) -> Result<u32> {
        if read_bits > 32 {
            return Err(Error::invalid_input(
                "reading more than 32 bits back from a SPI flash operation is unsupported",
            ));
        }
        if data.len() > 64 {
            return Err(Error::invalid_input(
                "writing more than 64 bytes of data with one SPI command is unsupported",
            ));
        }

        let spi = self.profile()?.spi;
        let data_bits = data.len() as u32 * 8;
        let old_usr = self.read_reg(spi.usr())?;
        let old_usr2 = self.read_reg(spi.usr2())?;

        let mut flags = SPI_USR_COMMAND;
        if read_bits > 0 {
            flags |= SPI_USR_MISO;
        }
        if data_bits > 0 {
            flags |= SPI_USR_MOSI;
        }
        self.set_spi_data_lengths(data_bits, read_bits)?;
        self.write_reg(spi.usr(), flags, 0xFFFF_FFFF, 0)?;
        self.write_reg(
            spi.usr2(),
            (7 << SPI_USR2_COMMAND_LEN_SHIFT) | u32::from(spiflash_command),
            0xFFFF_FFFF,
            0,
        )?;

        if data.is_empty() {
            self.write_reg(spi.w0(), 0, 0xFFFF_FFFF, 0)?;
        } else {
            let mut padded = data.to_vec();
            padded.resize(data.len().div_ceil(4) * 4, 0);
            for (i, word) in padded.chunks_exact(4).enumerate() {
                let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                self.write_reg(spi.w0() + i as u32 * 4, value, 0xFFFF_FFFF, 0)?;
            }
        }

        self.write_reg(spi.cmd(), SPI_CMD_USR, 0xFFFF_FFFF, 0)?;
        let mut done = false;
        for _ in 0..SPI_POLL_ATTEMPTS {
            if self.read_reg(spi.cmd())? & SPI_CMD_USR == 0 {
                done = true;
                break;
            }
        }
        if !done {
            return Err(Error::timeout("waiting for the SPI flash command to complete"));
        }

        let status = self.read_reg(spi.w0())?;
        self.write_reg(spi.usr(), old_usr, 0xFFFF_FFFF, 0)?;
        self.write_reg(spi.usr2(), old_usr2, 0xFFFF_FFFF, 0)?;
        Ok(status)
    }

    fn set_spi_data_lengths(&mut self, mosi_bits: u32, miso_bits: u32) -> Result<()> {
        let spi = self.profile()?.spi;
        match (spi.mosi_dlen(), spi.miso_dlen()) {
            (Some(mosi_dlen), Some(miso_dlen)) => {
                if mosi_bits > 0 {
                    self.write_reg(mosi_dlen, mosi_bits - 1, 0xFFFF_FFFF, 0)?;
                }
                if miso_bits > 0 {
                    self.write_reg(miso_dlen, miso_bits - 1, 0xFFFF_FFFF, 0)?;
                }
            }
            _ => {
                let mosi_mask = mosi_bits.saturating_sub(1);
                let miso_mask = miso_bits.saturating_sub(1);
                self.write_reg(
                    spi.usr1(),
                    (miso_mask << SPI_USR1_MISO_BITLEN_SHIFT)
                        | (mosi_mask << SPI_USR1_MOSI_BITLEN_SHIFT),
                    0xFFFF_FFFF,
                    0,
                )?;
            }
        }
        Ok(())
    }

    /// 读取 JEDEC ID：制造商、类型、容量各一字节
    pub fn read_flash_id(&mut self) -> Result<u32> {
        self.run_spiflash_command(SPIFLASH_RDID, &[], 24)
    }

    /// 根据 flash ID 的容量字节推断 flash 容量，无法识别时返回 `None`
    pub fn detect_flash_size(&mut self) -> Result<Option<&'static str>> {
        let spinner = self
            .progress
            .create_spinner(ProgressOperation::DetectFlashSize);
        let flash_id = match self.read_flash_id() {
            Ok(id) => id,
            Err(e) => {
                spinner.finish(ProgressStatus::Failed);
                return Err(e);
            }
        };
        let size_id = ((flash_id >> 16) & 0xFF) as u8;
        let label = DETECTED_FLASH_SIZES.get(&size_id).copied();
        tracing::debug!("flash id 0x{:06X}, size id 0x{:02X}", flash_id, size_id);

        match label {
            Some(_) => spinner.finish(ProgressStatus::Success),
            None => {
                tracing::warn!(
                    "Unknown flash size id 0x{:02X} (flash id 0x{:06X})",
                    size_id,
                    flash_id
                );
                spinner.finish(ProgressStatus::Skipped);
            }
        }
        Ok(label)
    }
}
