use crate::command::{self, DEFAULT_TIMEOUT, FLASH_SECTOR_SIZE, Opcode};
use crate::progress::{ProgressOperation, ProgressStatus};
use crate::transport::SerialLink;
use crate::utils::Utils;
use crate::{EspLoader, Error, Result};
use std::fs::File;
use std::io::Write;

/// stub 在等待主机确认前最多连续发送的数据包数量
const READ_FLASH_MAX_IN_FLIGHT: u32 = 64;

/// `<filename@address:size>` 描述的读取任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFlashFile {
    pub file_path: String,
    pub address: u32,
    pub size: u32,
}

pub trait ReadFlashTrait {
    /// 读取 flash 区域并校验 stub 附带的 MD5
    fn read_flash(&mut self, address: u32, size: u32) -> Result<Vec<u8>>;

    fn read_flash_to_files(&mut self, files: &[ReadFlashFile]) -> Result<()>;
}

impl<L: SerialLink> ReadFlashTrait for EspLoader<L> {
    fn read_flash(&mut self, address: u32, size: u32) -> Result<Vec<u8>> {
        self.require_stub(Opcode::ReadFlash)?;

        let payload =
            command::pack_u32(&[address, size, FLASH_SECTOR_SIZE, READ_FLASH_MAX_IN_FLIGHT]);
        self.connection
            .check_command("read flash", Opcode::ReadFlash, &payload, 0, DEFAULT_TIMEOUT)?;

        let bar = self
            .progress
            .create_bar(u64::from(size), ProgressOperation::ReadFlash { address, size });
        let expected_len = size as usize;
        let mut data = Vec::with_capacity(expected_len);

        while data.len() < expected_len {
            let packet = match self.connection.read_frame(DEFAULT_TIMEOUT) {
                Ok(packet) => packet,
                Err(e) => {
                    bar.finish(ProgressStatus::Failed);
                    return Err(e);
                }
            };
            data.extend_from_slice(&packet);
            if data.len() < expected_len && packet.len() < FLASH_SECTOR_SIZE as usize {
                bar.finish(ProgressStatus::Failed);
                return Err(Error::protocol(format!(
                    "corrupt data, expected 0x{:x} bytes but received 0x{:x} bytes",
                    FLASH_SECTOR_SIZE,
                    packet.len()
                )));
            }
            // 每收到一包回复当前累计的字节数
            self.connection
                .write_frame(&(data.len() as u32).to_le_bytes())?;
            bar.inc(packet.len() as u64);
        }

        if data.len() > expected_len {
            bar.finish(ProgressStatus::Failed);
            return Err(Error::protocol(format!(
                "read more than expected: 0x{:x} of 0x{:x} bytes",
                data.len(),
                expected_len
            )));
        }

        let digest_frame = self.connection.read_frame(DEFAULT_TIMEOUT)?;
        if digest_frame.len() != 16 {
            bar.finish(ProgressStatus::Failed);
            return Err(Error::protocol(format!(
                "expected a 16 byte digest after the data, got {} bytes",
                digest_frame.len()
            )));
        }
        let actual = Utils::md5_digest(&data);
        if digest_frame[..] != actual[..] {
            bar.finish(ProgressStatus::Failed);
            return Err(Error::Md5Mismatch {
                expected: Utils::hex_string(&digest_frame),
                actual: Utils::hex_string(&actual),
            });
        }

        bar.finish(ProgressStatus::Success);
        Ok(data)
    }

    fn read_flash_to_files(&mut self, files: &[ReadFlashFile]) -> Result<()> {
        for file in files {
            let data = self.read_flash(file.address, file.size)?;
            let mut out = File::create(&file.file_path)?;
            out.write_all(&data)?;
            tracing::info!(
                "Read {} bytes at 0x{:08X} into {}",
                data.len(),
                file.address,
                file.file_path
            );
        }
        Ok(())
    }
}
