//! 引导程序命令定义
//!
//! 请求包格式：`00 op size:u16le chk:u32le payload`
//! 响应包格式：`01 op size:u16le value:u32le payload`

use std::time::Duration;
use strum::{Display, FromRepr};

/// 命令操作码
#[derive(Display, FromRepr, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Opcode {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0a,
    SpiAttach = 0x0d,
    ChangeBaudrate = 0x0f,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    SpiFlashMd5 = 0x13,
    EraseFlash = 0xd0,
    ReadFlash = 0xd2,
    RunUserCode = 0xd3,
}

impl Opcode {
    /// 仅 stub 支持的命令
    pub fn stub_only(self) -> bool {
        matches!(
            self,
            Opcode::EraseFlash | Opcode::ReadFlash | Opcode::RunUserCode
        )
    }
}

pub const DIRECTION_REQUEST: u8 = 0x00;
pub const DIRECTION_RESPONSE: u8 = 0x01;
pub const HEADER_LEN: usize = 8;

/// ROM 拒绝未知命令时状态字节中携带的错误码
pub const ROM_INVALID_RECV_MSG: u8 = 0x05;

pub const CHECKSUM_MAGIC: u8 = 0xEF;
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

pub const ESP_RAM_BLOCK: u32 = 0x1800;
pub const STUB_FLASH_WRITE_SIZE: u32 = 0x4000;
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const CHIP_ERASE_TIMEOUT: Duration = Duration::from_millis(120_000);
pub const MAX_TIMEOUT: Duration = Duration::from_millis(240_000);
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
pub const MEM_END_ROM_TIMEOUT: Duration = Duration::from_millis(200);

pub const ERASE_REGION_TIMEOUT_PER_MB: u64 = 30_000;
pub const ERASE_WRITE_TIMEOUT_PER_MB: u64 = 40_000;
pub const MD5_TIMEOUT_PER_MB: u64 = 8_000;

/// 与数据量成比例的超时，不低于 [`DEFAULT_TIMEOUT`]
pub fn timeout_per_mb(ms_per_mb: u64, size_bytes: u32) -> Duration {
    let scaled = ms_per_mb * u64::from(size_bytes) / 1_000_000;
    Duration::from_millis(scaled).max(DEFAULT_TIMEOUT)
}

/// 以 0xEF 为初值的异或校验，用于 FLASH_DATA / MEM_DATA 负载
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_MAGIC, |chk, b| chk ^ b)
}

/// 组装未经 SLIP 编码的请求包
pub fn build_request(op: Opcode, payload: &[u8], chk: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.push(DIRECTION_REQUEST);
    packet.push(op as u8);
    packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    packet.extend_from_slice(&chk.to_le_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// 解码后的响应包
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub direction: u8,
    pub op: u8,
    pub size: u16,
    /// 寄存器读命令的结果，其它命令通常为 0
    pub value: u32,
    pub data: Vec<u8>,
}

impl ResponsePacket {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            direction: frame[0],
            op: frame[1],
            size: u16::from_le_bytes([frame[2], frame[3]]),
            value: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            data: frame[HEADER_LEN..].to_vec(),
        })
    }

    /// ROM 以状态字节报告“收到无效消息”
    pub fn is_invalid_message(&self) -> bool {
        self.data.len() >= 2 && self.data[0] != 0 && self.data[1] == ROM_INVALID_RECV_MSG
    }
}

/// `check_command` 的返回值：负载超过 4 字节时返回数据，否则返回 value 字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Value(u32),
    Data(Vec<u8>),
}

impl CommandResult {
    pub fn value(&self) -> Option<u32> {
        match self {
            CommandResult::Value(v) => Some(*v),
            CommandResult::Data(_) => None,
        }
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            CommandResult::Data(d) => Some(d),
            CommandResult::Value(_) => None,
        }
    }
}

/// 把若干 32 位小端字段拼接成负载
pub fn pack_u32(fields: &[u32]) -> Vec<u8> {
    fields.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// SYNC 命令的固定负载
pub fn sync_payload() -> Vec<u8> {
    let mut payload = vec![0x07, 0x07, 0x12, 0x20];
    payload.extend_from_slice(&[0x55; 32]);
    payload
}
