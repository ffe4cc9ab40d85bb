//! stub 加载程序：从 ELF 读取段并下载到 RAM 中运行

use crate::chip::ChipType;
use crate::command::{self, DEFAULT_TIMEOUT, ESP_RAM_BLOCK, MEM_END_ROM_TIMEOUT, Opcode};
use crate::progress::{ProgressOperation, ProgressStatus};
use crate::transport::SerialLink;
use crate::{ConnectionState, EspLoader, Error, Result};
use goblin::elf::{Elf, program_header::PT_LOAD};
use phf::phf_map;
use std::path::Path;
use std::time::Duration;

/// stub 启动后发送的确认字
pub const STUB_HELLO: &[u8] = b"OHAI";

const STUB_HELLO_READS: usize = 100;
const STUB_HELLO_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// 目录形式的 stub 路径中，各芯片对应的文件名
pub static STUB_FILE_NAME: phf::Map<&'static str, &'static str> = phf_map! {
    "esp8266" => "stub_flasher_8266.elf",
    "esp32" => "stub_flasher_32.elf",
    "esp32s2" => "stub_flasher_32s2.elf",
    "esp32s3" => "stub_flasher_32s3.elf",
    "esp32c3" => "stub_flasher_32c3.elf",
    "esp32c2" => "stub_flasher_32c2.elf",
    "esp32c6" => "stub_flasher_32c6.elf",
    "esp32c61" => "stub_flasher_32c61.elf",
    "esp32c5" => "stub_flasher_32c5.elf",
    "esp32h2" => "stub_flasher_32h2.elf",
    "esp32p4" => "stub_flasher_32p4.elf",
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSegment {
    pub address: u32,
    pub data: Vec<u8>,
}

/// 待下载的 stub 程序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubImage {
    pub entry: u32,
    pub segments: Vec<StubSegment>,
}

impl StubImage {
    pub fn new(entry: u32, segments: Vec<StubSegment>) -> Self {
        Self { entry, segments }
    }

    /// 取 ELF 中所有带数据的 LOAD 段
    pub fn from_elf(bytes: &[u8]) -> Result<Self> {
        let elf = Elf::parse(bytes)?;
        let mut segments = Vec::new();

        for header in elf.program_headers.iter() {
            if header.p_type != PT_LOAD || header.p_filesz == 0 {
                continue;
            }
            let start = header.p_offset as usize;
            let end = start + header.p_filesz as usize;
            let data = bytes.get(start..end).ok_or_else(|| {
                Error::invalid_input(format!(
                    "stub segment at 0x{:08X} lies outside the ELF file",
                    header.p_vaddr
                ))
            })?;
            segments.push(StubSegment {
                address: header.p_vaddr as u32,
                data: data.to_vec(),
            });
        }

        if segments.is_empty() {
            return Err(Error::invalid_input("stub ELF contains no loadable segments"));
        }
        Ok(Self {
            entry: elf.entry as u32,
            segments,
        })
    }

    /// stub 驻留的 RAM 区间
    pub fn ranges(&self) -> Result<Vec<(u32, u32)>> {
        self.segments
            .iter()
            .map(|seg| Ok((seg.address, region_end(seg.address, seg.data.len())?)))
            .collect()
    }
}

/// `[start, start + len)` 的结束地址，超出 32 位地址空间时报错
fn region_end(start: u32, len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len))
        .ok_or_else(|| {
            Error::invalid_input(format!(
                "region of {} bytes at 0x{:08X} exceeds the 32-bit address space",
                len, start
            ))
        })
}

/// 加载 stub，`path` 可以是 ELF 文件，也可以是包含各芯片 stub 的目录
pub fn load_stub_file(path: &Path, chip: ChipType) -> Result<StubImage> {
    let file = if path.is_dir() {
        let name = STUB_FILE_NAME.get(chip.to_string().as_str()).ok_or_else(|| {
            Error::UnsupportedChip(format!("no stub is known for {}", chip))
        })?;
        path.join(name)
    } else {
        path.to_path_buf()
    };

    tracing::info!("Loading stub file: {}", file.display());
    let bytes = std::fs::read(&file).map_err(|e| {
        tracing::error!("Failed to read stub file '{}': {}", file.display(), e);
        e
    })?;
    StubImage::from_elf(&bytes)
}

pub trait DownloadStub {
    /// 下载 stub 并等待它启动
    fn run_stub(&mut self, stub: &StubImage) -> Result<()>;
}

impl<L: SerialLink> EspLoader<L> {
    pub fn mem_begin(&mut self, size: u32, blocks: u32, block_size: u32, offset: u32) -> Result<()> {
        if self.is_stub() {
            let load_end = region_end(offset, size as usize)?;
            for &(start, end) in &self.resident_stub {
                if offset < end && load_end > start {
                    return Err(Error::invalid_input(format!(
                        "software loader is resident at 0x{:08X}-0x{:08X}, \
                         can't load binary at overlapping address range 0x{:08X}-0x{:08X}",
                        start, end, offset, load_end
                    )));
                }
            }
        }

        let payload = command::pack_u32(&[size, blocks, block_size, offset]);
        self.connection.check_command(
            "enter RAM download mode",
            Opcode::MemBegin,
            &payload,
            0,
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    pub fn mem_block(&mut self, data: &[u8], seq: u32) -> Result<()> {
        let mut payload = command::pack_u32(&[data.len() as u32, seq, 0, 0]);
        payload.extend_from_slice(data);
        self.connection.check_command(
            "write to target RAM",
            Opcode::MemData,
            &payload,
            u32::from(command::checksum(data)),
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    /// 结束 RAM 下载并跳转到 `entry`
    ///
    /// ROM 跳转后可能来不及回复，此时的超时不视为错误。
    pub fn mem_finish(&mut self, entry: u32) -> Result<()> {
        let timeout = if self.is_stub() {
            DEFAULT_TIMEOUT
        } else {
            MEM_END_ROM_TIMEOUT
        };
        let payload = command::pack_u32(&[u32::from(entry == 0), entry]);
        match self.connection.check_command(
            "leave RAM download mode",
            Opcode::MemEnd,
            &payload,
            0,
            timeout,
        ) {
            Ok(_) => Ok(()),
            Err(e) if !self.is_stub() && e.is_timeout() => {
                tracing::debug!("no reply to MEM_END, assuming the ROM jumped to the entry");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn upload_stub(&mut self, stub: &StubImage) -> Result<()> {
        for segment in &stub.segments {
            let size = segment.data.len() as u32;
            let blocks = size.div_ceil(ESP_RAM_BLOCK);
            tracing::debug!(
                "stub segment 0x{:08X}: {} bytes in {} blocks",
                segment.address,
                size,
                blocks
            );
            self.mem_begin(size, blocks, ESP_RAM_BLOCK, segment.address)?;
            for (seq, chunk) in segment.data.chunks(ESP_RAM_BLOCK as usize).enumerate() {
                self.mem_block(chunk, seq as u32)?;
            }
        }
        self.mem_finish(stub.entry)
    }

    fn wait_stub_hello(&mut self) -> Result<()> {
        let mut received = Vec::new();
        for _ in 0..STUB_HELLO_READS {
            match self.connection.read_raw(STUB_HELLO_READ_TIMEOUT) {
                Ok(bytes) => received.extend_from_slice(&bytes),
                Err(e) if e.is_timeout() => {}
                Err(e) => return Err(e),
            }
            if received.len() >= 6
                && received
                    .windows(STUB_HELLO.len())
                    .any(|window| window == STUB_HELLO)
            {
                return Ok(());
            }
        }
        Err(Error::StubStart(format!(
            "no acknowledgement from the stub, received {:02X?}",
            received
        )))
    }
}

impl<L: SerialLink> DownloadStub for EspLoader<L> {
    fn run_stub(&mut self, stub: &StubImage) -> Result<()> {
        if self.sync_stub_detected {
            tracing::info!("Stub is already running, no upload is necessary");
            self.enter_stub_mode();
            return Ok(());
        }

        let ranges = stub.ranges()?;
        let spinner = self.progress.create_spinner(ProgressOperation::DownloadStub);
        self.set_state(ConnectionState::StubUploading);

        let result = self.upload_stub(stub).and_then(|_| self.wait_stub_hello());
        if let Err(e) = result {
            self.set_state(ConnectionState::Failed);
            spinner.finish(ProgressStatus::Failed);
            return Err(e);
        }

        self.resident_stub = ranges;
        self.enter_stub_mode();
        tracing::info!("Stub running");
        spinner.finish(ProgressStatus::Success);
        Ok(())
    }
}
