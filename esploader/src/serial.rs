use anyhow::{Result, anyhow, bail};
use serialport::SerialPortType;

/// 规范化用户给出的串口名
///
/// macOS 上 /dev/tty.* 会等待 DCD 信号，统一换成对应的 /dev/cu.*。
pub fn normalize_port_name(port_name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        if let Some(rest) = port_name.strip_prefix("/dev/tty.") {
            return format!("/dev/cu.{}", rest);
        }
    }
    port_name.to_string()
}

fn describe(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        SerialPortType::UsbPort(usb) => format!(
            "{} ({:04x}:{:04x})",
            port.port_name, usb.vid, usb.pid
        ),
        _ => port.port_name.clone(),
    }
}

/// 确认串口存在，不存在时列出可用串口
///
/// 系统无法枚举到的路径（例如 /dev/serial/by-id 下的链接）只要文件存在也放行。
pub fn check_port_available(port_name: &str) -> Result<()> {
    let ports = serialport::available_ports()
        .map_err(|e| anyhow!("Failed to get available ports list: {}", e))?;

    let ports: Vec<_> = ports
        .into_iter()
        .filter(|port| !(cfg!(target_os = "macos") && port.port_name.starts_with("/dev/tty.")))
        .collect();

    if ports.iter().any(|p| p.port_name == port_name) {
        return Ok(());
    }
    if cfg!(unix) && std::path::Path::new(port_name).exists() {
        return Ok(());
    }

    let available: Vec<String> = ports.iter().map(describe).collect();
    bail!(
        "The specified port '{}' does not exist. Available ports: {}",
        port_name,
        if available.is_empty() {
            "No available ports".to_string()
        } else {
            available.join(", ")
        }
    )
}
