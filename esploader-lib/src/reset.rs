//! 通过 DTR/RTS 控制线让芯片进入下载模式
//!
//! 各序列中的时序是针对开发板实测得到的，保持原样。

use crate::transport::SerialLink;
use crate::{Error, Result};
use std::time::Duration;

pub const DEFAULT_RESET_DELAY_MS: u64 = 50;

/// ESP32 rev0 需要额外的延时
pub const ESP32R0_EXTRA_DELAY_MS: u64 = 2000;

pub const DEFAULT_RESET_SEQUENCE: &str = "D0|R1|W100|D1|R0|W50|D0";
pub const ESP32R0_RESET_SEQUENCE: &str = "D0|R1|W100|W2000|D1|R0|W50|D0";

/// USB-Serial/JTAG 外设的 USB PID
pub const USB_JTAG_SERIAL_PID: u16 = 0x1001;

/// 复位序列中的单个步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStep {
    Dtr(bool),
    Rts(bool),
    Wait(u64),
}

/// 解析形如 `D0|R1|W100` 的复位序列，任何一个 token 非法都返回 `None`
pub fn parse_reset_sequence(sequence: &str) -> Option<Vec<ResetStep>> {
    sequence
        .split('|')
        .map(|token| {
            let mut chars = token.chars();
            let op = chars.next()?;
            let arg = chars.as_str();
            match op {
                'D' => parse_level(arg).map(ResetStep::Dtr),
                'R' => parse_level(arg).map(ResetStep::Rts),
                'W' => {
                    if !arg.bytes().all(|b| b.is_ascii_digit()) {
                        return None;
                    }
                    let ms = arg.parse::<u64>().ok()?;
                    (ms > 0).then_some(ResetStep::Wait(ms))
                }
                _ => None,
            }
        })
        .collect()
}

fn parse_level(arg: &str) -> Option<bool> {
    match arg {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// 只检查序列是否合法，不操作任何控制线
pub fn validate_custom_reset_sequence(sequence: &str) -> bool {
    parse_reset_sequence(sequence).is_some()
}

fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// 复位序列实现
pub struct ResetSequencer;

impl ResetSequencer {
    /// 经典的 DTR/RTS 自动下载电路复位
    pub fn classic_reset<L>(link: &mut L, reset_delay_ms: u64) -> Result<()>
    where
        L: SerialLink + ?Sized,
    {
        tracing::debug!("classic reset, delay {} ms", reset_delay_ms);
        link.set_dtr(false)?;
        link.set_rts(true)?;
        sleep_ms(100);
        link.set_dtr(true)?;
        link.set_rts(false)?;
        sleep_ms(reset_delay_ms);
        link.set_dtr(false)?;
        Ok(())
    }

    /// 内置 USB-Serial/JTAG 外设使用的复位序列
    pub fn usb_jtag_serial_reset<L>(link: &mut L) -> Result<()>
    where
        L: SerialLink + ?Sized,
    {
        tracing::debug!("USB-JTAG-Serial reset");
        link.set_rts(false)?;
        link.set_dtr(false)?;
        sleep_ms(100);
        link.set_dtr(true)?;
        link.set_rts(false)?;
        sleep_ms(100);
        link.set_rts(true)?;
        link.set_dtr(false)?;
        link.set_rts(true)?;
        sleep_ms(100);
        link.set_rts(false)?;
        link.set_dtr(false)?;
        Ok(())
    }

    /// 只拉低 RTS，让芯片从 flash 启动
    pub fn hard_reset<L>(link: &mut L, using_usb_otg: bool) -> Result<()>
    where
        L: SerialLink + ?Sized,
    {
        tracing::debug!("hard reset (usb otg: {})", using_usb_otg);
        if using_usb_otg {
            sleep_ms(200);
            link.set_rts(false)?;
            sleep_ms(200);
        } else {
            sleep_ms(100);
            link.set_rts(false)?;
        }
        Ok(())
    }

    /// 执行自定义复位序列，序列非法时不会触碰任何控制线
    pub fn custom_reset<L>(link: &mut L, sequence: &str) -> Result<()>
    where
        L: SerialLink + ?Sized,
    {
        let steps = parse_reset_sequence(sequence)
            .ok_or_else(|| Error::InvalidResetSequence(sequence.to_string()))?;
        tracing::debug!("custom reset: {}", sequence);

        for step in steps {
            let res = match step {
                ResetStep::Dtr(level) => link.set_dtr(level),
                ResetStep::Rts(level) => link.set_rts(level),
                ResetStep::Wait(ms) => {
                    sleep_ms(ms);
                    Ok(())
                }
            };
            res.map_err(|e| Error::InvalidResetSequence(format!("{}: {}", sequence, e)))?;
        }
        Ok(())
    }
}

/// 按复位延时生成默认序列
pub fn default_reset_sequence(reset_delay_ms: u64) -> String {
    format!("D0|R1|W100|D1|R0|W{}|D0", reset_delay_ms)
}

/// 按复位延时生成 ESP32 rev0 序列
pub fn esp32r0_reset_sequence(reset_delay_ms: u64) -> String {
    format!(
        "D0|R1|W100|W{}|D1|R0|W{}|D0",
        ESP32R0_EXTRA_DELAY_MS, reset_delay_ms
    )
}
