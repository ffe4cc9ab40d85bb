//! SLIP 帧编解码
//!
//! 每个数据包以 `0xC0` 开始并以 `0xC0` 结束，包内的 `0xC0` 与 `0xDB`
//! 分别转义为 `0xDB 0xDC` 与 `0xDB 0xDD`。

use crate::transport::SerialLink;
use crate::{Error, Result};
use std::time::{Duration, Instant};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// 对负载进行转义并加上首尾定界符
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            b => out.push(b),
        }
    }
    out.push(END);
    out
}

/// 从字节流中取出第一个完整的帧
///
/// 返回 `(帧, 剩余字节)`。没有完整帧时返回 `None`，并把整个输入作为剩余字节，
/// 由调用者拼接到下一次读取的数据之前。首个定界符之前的字节会被丢弃。
pub fn decode(stream: &[u8]) -> (Option<Vec<u8>>, Vec<u8>) {
    let Some(start) = find_end(stream, 0) else {
        return (None, stream.to_vec());
    };
    let Some(stop) = find_end(stream, start + 1) else {
        return (None, stream.to_vec());
    };

    // 空帧的结束符可能同时是下一帧的开始符，保留在剩余字节中
    if stop == start + 1 {
        return (Some(Vec::new()), stream[stop..].to_vec());
    }

    let frame = unescape(&stream[start + 1..stop]);
    (Some(frame), stream[stop + 1..].to_vec())
}

fn find_end(stream: &[u8], from: usize) -> Option<usize> {
    stream
        .get(from..)?
        .iter()
        .position(|&b| b == END)
        .map(|pos| pos + from)
}

fn unescape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(byte) = iter.next() {
        if byte != ESC {
            out.push(byte);
            continue;
        }
        match iter.next() {
            Some(ESC_END) => out.push(END),
            Some(ESC_ESC) => out.push(ESC),
            Some(other) => {
                tracing::trace!("Invalid SLIP escape 0xDB 0x{:02X}", other);
                out.push(other);
            }
            None => {}
        }
    }
    out
}

/// 带剩余字节缓存的帧读取器
#[derive(Debug, Default)]
pub struct SlipReader {
    leftover: Vec<u8>,
}

impl SlipReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取一个完整的帧，`timeout` 是整个读取过程的时限
    pub fn read_frame<L>(&mut self, link: &mut L, timeout: Duration) -> Result<Vec<u8>>
    where
        L: SerialLink + ?Sized,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let (frame, rest) = decode(&self.leftover);
            self.leftover = rest;
            if let Some(frame) = frame {
                tracing::trace!("frame <- {:02X?}", frame);
                return Ok(frame);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout("waiting for a SLIP frame"));
            }
            let chunk = link.read(remaining)?;
            self.leftover.extend_from_slice(&chunk);
        }
    }

    /// 读取未经 SLIP 解码的原始字节，优先返回缓存中的剩余数据
    pub fn read_raw<L>(&mut self, link: &mut L, timeout: Duration) -> Result<Vec<u8>>
    where
        L: SerialLink + ?Sized,
    {
        if !self.leftover.is_empty() {
            return Ok(std::mem::take(&mut self.leftover));
        }
        link.read(timeout)
    }

    pub fn clear(&mut self) {
        self.leftover.clear();
    }

    pub fn pending(&self) -> &[u8] {
        &self.leftover
    }
}
