use crate::command::{
    self, CommandResult, DEFAULT_TIMEOUT, DIRECTION_RESPONSE, Opcode, ResponsePacket,
    SYNC_TIMEOUT,
};
use crate::slip::{self, SlipReader};
use crate::transport::SerialLink;
use crate::{Error, Result};
use std::time::Duration;

/// 单次等待响应时最多检查的数据包数量
pub const MAX_READ_PACKETS: usize = 100;

/// 同步成功后 ROM 还会回送的额外 SYNC 响应数量
const EXTRA_SYNC_RESPONSES: usize = 7;

/// 请求/响应通道
///
/// 同一时刻只允许一个未完成的请求；读取时遇到的不匹配数据包会被丢弃。
pub struct Connection<L: SerialLink> {
    link: L,
    reader: SlipReader,
    status_len: usize,
}

impl<L: SerialLink> Connection<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            reader: SlipReader::new(),
            status_len: 2,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// 响应负载末尾状态字节的长度（ESP32 系列 ROM 为 4，stub 与 ESP8266 为 2）
    pub fn set_status_len(&mut self, len: usize) {
        self.status_len = len;
    }

    /// 发送一个 SLIP 编码的原始负载
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        tracing::trace!("frame -> {:02X?}", payload);
        self.link.write(&slip::encode(payload))
    }

    /// 读取一个原始 SLIP 帧（不解析包头）
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.reader.read_frame(&mut self.link, timeout)
    }

    /// 读取未经 SLIP 解码的字节
    pub fn read_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.reader.read_raw(&mut self.link, timeout)
    }

    /// 丢弃缓存与串口中尚未处理的输入
    pub fn flush_input(&mut self) -> Result<()> {
        self.reader.clear();
        self.link.clear_input()
    }

    /// 发送命令并（可选地）等待对应的响应
    ///
    /// `op` 为 `None` 时不发送任何数据，只等待下一个响应包。
    /// 返回 `(value, data)`；`wait_response` 为 false 时返回 `(0, [])`。
    pub fn command(
        &mut self,
        op: Option<Opcode>,
        payload: &[u8],
        chk: u32,
        wait_response: bool,
        timeout: Duration,
    ) -> Result<(u32, Vec<u8>)> {
        if let Some(op) = op {
            tracing::debug!(
                "command: {} ({} bytes, chk 0x{:02X})",
                op,
                payload.len(),
                chk
            );
            let packet = command::build_request(op, payload, chk);
            self.write_frame(&packet)?;
        }

        if !wait_response {
            return Ok((0, Vec::new()));
        }
        self.read_packet(op, timeout)
    }

    /// 等待与 `op` 匹配的响应包
    pub fn read_packet(&mut self, op: Option<Opcode>, timeout: Duration) -> Result<(u32, Vec<u8>)> {
        for _ in 0..MAX_READ_PACKETS {
            let frame = self.read_frame(timeout)?;
            // 空帧（连续两个 C0）同样在这里被丢弃，并占用一次读取次数
            let Some(packet) = ResponsePacket::parse(&frame) else {
                tracing::trace!("Skipping short frame of {} bytes", frame.len());
                continue;
            };
            if packet.direction != DIRECTION_RESPONSE {
                continue;
            }

            match op {
                None => return Ok((packet.value, packet.data)),
                Some(op) if packet.op == op as u8 => return Ok((packet.value, packet.data)),
                Some(op) => {
                    if packet.is_invalid_message() {
                        self.flush_input()?;
                        return Err(Error::UnsupportedCommand(op.to_string()));
                    }
                    tracing::debug!(
                        "Discarding response to 0x{:02X} while waiting for {}",
                        packet.op,
                        op
                    );
                }
            }
        }

        let description = op.map_or_else(|| "any command".to_string(), |op| op.to_string());
        Err(Error::InvalidResponse(description, MAX_READ_PACKETS))
    }

    /// 发送命令并检查状态字节
    ///
    /// 负载超过 4 字节时返回负载（包含状态字节），否则返回 value 字段。
    pub fn check_command(
        &mut self,
        description: &str,
        op: Opcode,
        payload: &[u8],
        chk: u32,
        timeout: Duration,
    ) -> Result<CommandResult> {
        tracing::debug!("check_command: {}", description);
        let (value, data) = self.command(Some(op), payload, chk, true, timeout)?;

        if data.len() >= self.status_len {
            let status = &data[data.len() - self.status_len..];
            if status[0] != 0 {
                return Err(Error::protocol(format!(
                    "failed to {}: status 0x{:02X}, error 0x{:02X}",
                    description, status[0], status[1]
                )));
            }
        }

        if data.len() > 4 {
            Ok(CommandResult::Data(data))
        } else {
            Ok(CommandResult::Value(value))
        }
    }

    /// 发送一次 SYNC
    ///
    /// 返回 true 表示设备上已经运行着 stub（所有响应的 value 均为 0）。
    pub fn sync(&mut self) -> Result<bool> {
        let (value, _) = self.command(
            Some(Opcode::Sync),
            &command::sync_payload(),
            0,
            true,
            SYNC_TIMEOUT,
        )?;
        let mut stub_detected = value == 0;

        for _ in 0..EXTRA_SYNC_RESPONSES {
            match self.command(None, &[], 0, true, SYNC_TIMEOUT) {
                Ok((value, _)) => stub_detected &= value == 0,
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e),
            }
        }

        Ok(stub_detected)
    }

    pub fn read_reg(&mut self, addr: u32) -> Result<u32> {
        self.read_reg_timeout(addr, DEFAULT_TIMEOUT)
    }

    pub fn read_reg_timeout(&mut self, addr: u32, timeout: Duration) -> Result<u32> {
        let result = self.check_command(
            "read target memory",
            Opcode::ReadReg,
            &addr.to_le_bytes(),
            0,
            timeout,
        )?;
        result
            .value()
            .ok_or_else(|| Error::protocol(format!("unexpected READ_REG payload for 0x{:08X}", addr)))
    }

    pub fn write_reg(&mut self, addr: u32, value: u32, mask: u32, delay_us: u32) -> Result<()> {
        let payload = command::pack_u32(&[addr, value, mask, delay_us]);
        self.check_command(
            "write target memory",
            Opcode::WriteReg,
            &payload,
            0,
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }
}
