use crate::read_flash::ReadFlashFile;
use crate::write_flash::FlashFile;
use crate::{Error, Result};
use md5::{Digest, Md5};
use std::num::ParseIntError;
use std::path::Path;

/// HEX 文件中相邻数据之间不超过该间隔时合并为同一段，并以 0xFF 填充
const HEX_MERGE_GAP: u32 = 0x1000;

pub struct Utils;
impl Utils {
    pub fn str_to_u32(s: &str) -> std::result::Result<u32, ParseIntError> {
        let s = s.trim();

        let (num_str, multiplier) = match s.chars().last() {
            Some('k') | Some('K') => (&s[..s.len() - 1], 1_000u32),
            Some('m') | Some('M') => (&s[..s.len() - 1], 1_000_000u32),
            Some('g') | Some('G') => (&s[..s.len() - 1], 1_000_000_000u32),
            _ => (s, 1),
        };

        let unsigned: u32 = if let Some(hex) = num_str.strip_prefix("0x") {
            u32::from_str_radix(hex, 16)?
        } else if let Some(bin) = num_str.strip_prefix("0b") {
            u32::from_str_radix(bin, 2)?
        } else if let Some(oct) = num_str.strip_prefix("0o") {
            u32::from_str_radix(oct, 8)?
        } else {
            num_str.parse()?
        };

        Ok(unsigned.wrapping_mul(multiplier))
    }

    pub fn md5_digest(data: &[u8]) -> [u8; 16] {
        Md5::digest(data).into()
    }

    pub fn hex_string(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// 解析 `<filename@address>`；HEX 文件自带地址，`@address` 可省略
    pub fn parse_file_info(file_spec: &str) -> Result<Vec<FlashFile>> {
        match file_spec.rsplit_once('@') {
            Some((path, addr)) => {
                let address = Self::str_to_u32(addr)?;
                Self::parse_write_file(path, Some(address))
            }
            None => Self::parse_write_file(file_spec, None),
        }
    }

    /// 读取待写入的文件
    ///
    /// `.hex` 文件按记录中的地址拆分为若干段，此时 `address` 会被忽略；
    /// 其它文件按原始二进制处理，必须提供地址。
    pub fn parse_write_file(path: &str, address: Option<u32>) -> Result<Vec<FlashFile>> {
        let is_hex = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("hex"));

        if is_hex {
            if address.is_some() {
                tracing::warn!("Ignoring @address for Intel HEX file {}", path);
            }
            return Self::hex_to_flash_files(Path::new(path));
        }

        let address = address.ok_or_else(|| {
            Error::invalid_input(format!(
                "binary file {} requires an address (format: <filename@address>)",
                path
            ))
        })?;
        let data = std::fs::read(path)?;
        tracing::debug!("Loaded {} ({} bytes) for 0x{:08X}", path, data.len(), address);
        Ok(vec![FlashFile { address, data }])
    }

    /// 把 Intel HEX 文件转换为按地址排序的连续数据段
    pub fn hex_to_flash_files(path: &Path) -> Result<Vec<FlashFile>> {
        let content = std::fs::read_to_string(path)?;
        let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut base: u32 = 0;

        for record in ihex::Reader::new(&content) {
            match record? {
                ihex::Record::Data { offset, value } => {
                    chunks.push((base.wrapping_add(u32::from(offset)), value));
                }
                ihex::Record::ExtendedLinearAddress(upper) => base = u32::from(upper) << 16,
                ihex::Record::ExtendedSegmentAddress(segment) => base = u32::from(segment) << 4,
                ihex::Record::EndOfFile => break,
                _ => {}
            }
        }

        chunks.sort_by_key(|(addr, _)| *addr);

        let mut files: Vec<FlashFile> = Vec::new();
        for (addr, value) in chunks {
            if let Some(last) = files.last_mut() {
                let end = last.address + last.data.len() as u32;
                if addr < end {
                    return Err(Error::invalid_input(format!(
                        "overlapping data at 0x{:08X} in {}",
                        addr,
                        path.display()
                    )));
                }
                if addr - end <= HEX_MERGE_GAP {
                    last.data.resize((addr - last.address) as usize, 0xFF);
                    last.data.extend_from_slice(&value);
                    continue;
                }
            }
            files.push(FlashFile {
                address: addr,
                data: value,
            });
        }

        Ok(files)
    }

    /// 解析 `<filename@address:size>`
    pub fn parse_read_file_info(file_spec: &str) -> Result<ReadFlashFile> {
        let (file_path, region) = file_spec.rsplit_once('@').ok_or_else(|| {
            Error::invalid_input(format!(
                "invalid read spec {} (format: <filename@address:size>)",
                file_spec
            ))
        })?;
        let (address, size) = region.split_once(':').ok_or_else(|| {
            Error::invalid_input(format!("missing size in read spec {}", file_spec))
        })?;

        Ok(ReadFlashFile {
            file_path: file_path.to_string(),
            address: Self::str_to_u32(address)?,
            size: Self::str_to_u32(size)?,
        })
    }
}
