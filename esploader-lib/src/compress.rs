//! zlib 压缩与流式解压
//!
//! 压缩数据在发送前一次性生成；解压只用于统计每个数据块对应的原始字节数，
//! 以计算进度与 ROM 模式下的块超时。

use crate::{Error, Result};
use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use std::io::Write;

pub trait Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// 基于 flate2 的 zlib 压缩器
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: u32,
}

impl ZlibCompressor {
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self { level: 9 }
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }
}

/// 丢弃解压结果，只把每段输出的长度交给回调
struct CountingSink<F: FnMut(usize)> {
    on_chunk: F,
}

impl<F: FnMut(usize)> Write for CountingSink<F> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !buf.is_empty() {
            (self.on_chunk)(buf.len());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// 流式 zlib 解压器
pub struct Inflater<F: FnMut(usize)> {
    decoder: ZlibDecoder<CountingSink<F>>,
}

impl<F: FnMut(usize)> Inflater<F> {
    pub fn new(on_chunk: F) -> Self {
        Self {
            decoder: ZlibDecoder::new(CountingSink { on_chunk }),
        }
    }

    /// 推入一段压缩数据；`is_last` 为 true 时冲刷剩余输出
    pub fn push(&mut self, chunk: &[u8], is_last: bool) -> Result<()> {
        self.decoder
            .write_all(chunk)
            .map_err(|e| Error::Compression(e.to_string()))?;
        if is_last {
            self.decoder
                .try_finish()
                .map_err(|e| Error::Compression(e.to_string()))?;
        } else {
            self.decoder
                .flush()
                .map_err(|e| Error::Compression(e.to_string()))?;
        }
        Ok(())
    }
}
