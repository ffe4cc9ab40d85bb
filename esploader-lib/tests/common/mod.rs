//! 模拟 ROM / stub 引导程序的串口设备
#![allow(dead_code)]

use esploader_lib::chip::ChipType;
use esploader_lib::command::{CHIP_DETECT_MAGIC_REG_ADDR, Opcode};
use esploader_lib::slip;
use esploader_lib::{Error, Result, SerialLink};
use flate2::read::ZlibDecoder;
use md5::{Digest, Md5};
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::time::Duration;

pub const ESP32_MAGIC: u32 = 0x00f0_1d83;
pub const ESP32S3_MAGIC: u32 = 0x09;
pub const ROM_SYNC_VALUE: u32 = 0x2012_0707;
pub const FLASH_SIZE: usize = 0x40_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Dtr(bool),
    Rts(bool),
}

/// 一条已解码的请求
#[derive(Debug, Clone)]
pub struct Request {
    pub op: u8,
    pub chk: u32,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn word(&self, index: usize) -> u32 {
        let b = &self.payload[index * 4..index * 4 + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

pub struct FakeEsp {
    pub chip: ChipType,
    pub magic: u32,
    /// 设备是否正在运行 stub
    pub stub: bool,
    /// 前若干次 SYNC 不回复
    pub sync_failures: usize,
    pub sync_value: u32,
    pub send_stub_hello: bool,
    pub corrupt_md5: bool,
    /// 这些命令会被当作未知命令拒绝
    pub rejected: Vec<Opcode>,
    pub flash_id: u32,
    pub flash: Vec<u8>,
    pub regs: HashMap<u32, u32>,
    pub requests: Vec<Request>,
    pub signals: Vec<Signal>,
    pub bauds: Vec<u32>,
    pub product_id: Option<u16>,
    rx: VecDeque<u8>,
    incoming: Vec<u8>,
    write_offset: u32,
    write_block_size: u32,
    defl_offset: u32,
    defl_data: Vec<u8>,
    baud: u32,
}

impl FakeEsp {
    pub fn new(chip: ChipType, magic: u32) -> Self {
        Self {
            chip,
            magic,
            stub: false,
            sync_failures: 0,
            sync_value: ROM_SYNC_VALUE,
            send_stub_hello: true,
            corrupt_md5: false,
            rejected: Vec::new(),
            flash_id: 0x0016_40EF,
            flash: vec![0xFF; FLASH_SIZE],
            regs: HashMap::new(),
            requests: Vec::new(),
            signals: Vec::new(),
            bauds: Vec::new(),
            product_id: None,
            rx: VecDeque::new(),
            incoming: Vec::new(),
            write_offset: 0,
            write_block_size: 0,
            defl_offset: 0,
            defl_data: Vec::new(),
            baud: 0,
        }
    }

    pub fn esp32() -> Self {
        Self::new(ChipType::Esp32, ESP32_MAGIC)
    }

    pub fn esp32s3() -> Self {
        Self::new(ChipType::Esp32s3, ESP32S3_MAGIC)
    }

    /// 已经在运行 stub 的设备
    pub fn with_stub(mut self) -> Self {
        self.stub = true;
        self.sync_value = 0;
        self
    }

    pub fn requests_for(&self, op: Opcode) -> Vec<&Request> {
        self.requests.iter().filter(|r| r.op == op as u8).collect()
    }

    pub fn queue_raw(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn queue_frame(&mut self, frame: &[u8]) {
        let encoded = slip::encode(frame);
        self.rx.extend(encoded);
    }

    fn reply(&mut self, op: u8, value: u32, data: &[u8]) {
        let mut payload = data.to_vec();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        let mut frame = vec![0x01, op];
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&value.to_le_bytes());
        frame.extend_from_slice(&payload);
        self.queue_frame(&frame);
    }

    fn reject(&mut self) {
        let frame = [0x01, 0x00, 0x04, 0x00, 0, 0, 0, 0, 0x01, 0x05, 0x00, 0x00];
        self.queue_frame(&frame);
    }

    fn flush_deflated(&mut self) {
        if self.defl_data.is_empty() {
            return;
        }
        let mut decoder = ZlibDecoder::new(&self.defl_data[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        let start = self.defl_offset as usize;
        self.flash[start..start + out.len()].copy_from_slice(&out);
        self.defl_data.clear();
    }

    fn handle(&mut self, frame: Vec<u8>) {
        // 读 flash 时主机回送的确认帧只有 4 字节
        if frame.len() < 8 || frame[0] != 0x00 {
            return;
        }
        let request = Request {
            op: frame[1],
            chk: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            payload: frame[8..].to_vec(),
        };
        self.requests.push(request.clone());

        let Some(op) = Opcode::from_repr(request.op) else {
            self.reject();
            return;
        };
        if self.rejected.contains(&op) || (op.stub_only() && !self.stub) {
            self.reject();
            return;
        }

        match op {
            Opcode::Sync => {
                if self.sync_failures > 0 {
                    self.sync_failures -= 1;
                    return;
                }
                let value = self.sync_value;
                self.reply(op as u8, value, &[]);
            }
            Opcode::ReadReg => {
                let addr = request.word(0);
                let value = if addr == CHIP_DETECT_MAGIC_REG_ADDR {
                    self.magic
                } else {
                    self.regs.get(&addr).copied().unwrap_or(0)
                };
                self.reply(op as u8, value, &[]);
            }
            Opcode::WriteReg => {
                let (addr, value) = (request.word(0), request.word(1));
                self.regs.insert(addr, value);
                self.run_spi_command(addr, value);
                self.reply(op as u8, 0, &[]);
            }
            Opcode::MemBegin | Opcode::MemData => self.reply(op as u8, 0, &[]),
            Opcode::MemEnd => {
                self.reply(op as u8, 0, &[]);
                self.stub = true;
                if self.send_stub_hello {
                    self.queue_frame(b"OHAI");
                }
            }
            Opcode::FlashBegin => {
                self.write_offset = request.word(3);
                self.write_block_size = request.word(2);
                self.reply(op as u8, 0, &[]);
            }
            Opcode::FlashData => {
                let len = request.word(0) as usize;
                let seq = request.word(1);
                let start = (self.write_offset + seq * self.write_block_size) as usize;
                let data = request.payload[16..16 + len].to_vec();
                let end = (start + len).min(self.flash.len());
                self.flash[start..end].copy_from_slice(&data[..end - start]);
                self.reply(op as u8, 0, &[]);
            }
            Opcode::FlashDeflBegin => {
                self.flush_deflated();
                self.defl_offset = request.word(3);
                self.reply(op as u8, 0, &[]);
            }
            Opcode::FlashDeflData => {
                let len = request.word(0) as usize;
                let data = request.payload[16..16 + len].to_vec();
                self.defl_data.extend_from_slice(&data);
                self.reply(op as u8, 0, &[]);
            }
            Opcode::FlashEnd | Opcode::FlashDeflEnd => {
                self.flush_deflated();
                self.reply(op as u8, 0, &[]);
            }
            Opcode::SpiFlashMd5 => {
                self.flush_deflated();
                let (addr, size) = (request.word(0) as usize, request.word(1) as usize);
                let mut digest: [u8; 16] = Md5::digest(&self.flash[addr..addr + size]).into();
                if self.corrupt_md5 {
                    digest[0] ^= 0xFF;
                }
                if self.stub {
                    self.reply(op as u8, 0, &digest);
                } else {
                    let text: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
                    self.reply(op as u8, 0, text.as_bytes());
                }
            }
            Opcode::SpiAttach | Opcode::ChangeBaudrate => self.reply(op as u8, 0, &[]),
            Opcode::EraseFlash => {
                self.flash.fill(0xFF);
                self.reply(op as u8, 0, &[]);
            }
            Opcode::ReadFlash => {
                let (addr, size) = (request.word(0) as usize, request.word(1) as usize);
                let sector = request.word(2) as usize;
                self.reply(op as u8, 0, &[]);
                let data = self.flash[addr..addr + size].to_vec();
                for chunk in data.chunks(sector) {
                    self.queue_frame(chunk);
                }
                let digest: [u8; 16] = Md5::digest(&data).into();
                self.queue_frame(&digest);
            }
            Opcode::RunUserCode => {}
        }
    }

    /// 模拟 SPI 控制器执行 RDID
    fn run_spi_command(&mut self, addr: u32, value: u32) {
        let spi = self.chip.profile().spi;
        if addr != spi.cmd() || value & (1 << 18) == 0 {
            return;
        }
        let command = self.regs.get(&spi.usr2()).copied().unwrap_or(0) & 0xFF;
        if command == 0x9F {
            self.regs.insert(spi.w0(), self.flash_id);
        }
        self.regs.insert(spi.cmd(), 0);
    }
}

impl SerialLink for FakeEsp {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.incoming.extend_from_slice(data);
        loop {
            let (frame, rest) = slip::decode(&self.incoming);
            self.incoming = rest;
            match frame {
                Some(frame) => self.handle(frame),
                None => break,
            }
        }
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        if self.rx.is_empty() {
            return Err(Error::timeout("reading from fake device"));
        }
        Ok(self.rx.drain(..).collect())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.signals.push(Signal::Dtr(level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.signals.push(Signal::Rts(level));
        Ok(())
    }

    fn connect(&mut self, baud: u32) -> Result<()> {
        self.baud = baud;
        self.bauds.push(baud);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn product_id(&self) -> Option<u16> {
        self.product_id
    }

    fn clear_input(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }
}

/// 记录每条命令之后第一次读取所用的超时
pub struct TimedLink {
    pub device: FakeEsp,
    /// `(opcode, 超时)`，按发送顺序排列
    pub waits: Vec<(u8, Duration)>,
    awaiting_reply: bool,
}

impl TimedLink {
    pub fn new(device: FakeEsp) -> Self {
        Self {
            device,
            waits: Vec::new(),
            awaiting_reply: false,
        }
    }

    /// 从第一条 `first` 命令开始的等待记录
    pub fn waits_from(&self, first: Opcode) -> Vec<(u8, Duration)> {
        self.waits
            .iter()
            .skip_while(|(op, _)| *op != first as u8)
            .copied()
            .collect()
    }
}

impl SerialLink for TimedLink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let sent = self.device.requests.len();
        self.device.write(data)?;
        if self.device.requests.len() > sent {
            self.awaiting_reply = true;
        }
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        if self.awaiting_reply {
            self.awaiting_reply = false;
            if let Some(request) = self.device.requests.last() {
                self.waits.push((request.op, timeout));
            }
        }
        self.device.read(timeout)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.device.set_dtr(level)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.device.set_rts(level)
    }

    fn connect(&mut self, baud: u32) -> Result<()> {
        self.device.connect(baud)
    }

    fn disconnect(&mut self) -> Result<()> {
        self.device.disconnect()
    }

    fn baud_rate(&self) -> u32 {
        self.device.baud_rate()
    }

    fn product_id(&self) -> Option<u16> {
        self.device.product_id()
    }

    fn clear_input(&mut self) -> Result<()> {
        self.device.clear_input()
    }
}
