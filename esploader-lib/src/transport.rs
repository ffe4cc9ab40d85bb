//! 串口传输抽象
//!
//! 协议引擎只通过 [`SerialLink`] 访问底层字节通道，便于在测试中替换为模拟设备。

use crate::{Error, Result};
use serialport::{SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// 字节透明的双工通道，外加 DTR/RTS 控制线
pub trait SerialLink {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// 读取当前可用的字节；在 `timeout` 内没有任何数据时返回 [`Error::Timeout`]
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    fn set_dtr(&mut self, level: bool) -> Result<()>;

    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// 以指定波特率（重新）打开通道
    fn connect(&mut self, baud: u32) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;

    fn baud_rate(&self) -> u32;

    /// USB 转串口设备的 PID，非 USB 设备返回 `None`
    fn product_id(&self) -> Option<u16>;

    /// 丢弃输入缓冲区中尚未读取的数据
    fn clear_input(&mut self) -> Result<()>;
}

/// 基于 `serialport` 的真实串口实现
pub struct SerialPortLink {
    port_name: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
    product_id: Option<u16>,
}

impl SerialPortLink {
    pub fn new(port_name: impl Into<String>) -> Self {
        let port_name = port_name.into();
        let product_id = serialport::available_ports()
            .ok()
            .and_then(|ports| ports.into_iter().find(|p| p.port_name == port_name))
            .and_then(|p| match p.port_type {
                SerialPortType::UsbPort(info) => Some(info.pid),
                _ => None,
            });
        tracing::debug!("Serial port {} product id: {:?}", port_name, product_id);

        Self {
            port_name,
            baud: 0,
            port: None,
            product_id,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::protocol(format!("serial port {} is not open", self.port_name)))
    }
}

impl SerialLink for SerialPortLink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let port = self.port()?;
        port.set_timeout(timeout)?;
        let mut buffer = [0u8; 4096];
        match port.read(&mut buffer) {
            Ok(0) => Err(Error::timeout("reading from serial port")),
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                Err(Error::timeout("reading from serial port"))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.port()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.port()?.write_request_to_send(level)?;
        Ok(())
    }

    fn connect(&mut self, baud: u32) -> Result<()> {
        self.port = None;
        let port = serialport::new(&self.port_name, baud)
            .timeout(Duration::from_millis(100))
            .open()?;
        self.port = Some(port);
        self.baud = baud;
        tracing::debug!("Opened {} at {} baud", self.port_name, baud);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(port) = self.port.take() {
            drop(port);
            tracing::debug!("Closed {}", self.port_name);
        }
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn product_id(&self) -> Option<u16> {
        self.product_id
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port()?.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}
