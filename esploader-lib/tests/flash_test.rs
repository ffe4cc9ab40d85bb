mod common;

use common::{FakeEsp, TimedLink};
use esploader_lib::command::{self, DEFAULT_TIMEOUT, ERASE_WRITE_TIMEOUT_PER_MB, Opcode};
use esploader_lib::compress::{Compressor, Inflater, ZlibCompressor};
use esploader_lib::image::{self, FlashMode, FlashSettings};
use esploader_lib::ram_stub::StubSegment;
use esploader_lib::{
    BeforeOperation, ChipType, EraseFlashTrait, Error, EspLoader, EspLoaderBase, FlashFile,
    FlashJob, ReadFlashTrait, SerialLink, StubImage, WriteFlashTrait,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn no_reset() -> EspLoaderBase {
    EspLoaderBase {
        before: BeforeOperation::NoReset,
        ..Default::default()
    }
}

fn stub_loader<L: SerialLink>(device: L) -> EspLoader<L> {
    let stub = StubImage::new(
        0x4008_0000,
        vec![StubSegment {
            address: 0x4008_0000,
            data: vec![0; 64],
        }],
    );
    let mut loader = EspLoader::new(device, no_reset());
    loader.prepare(Some(&stub)).unwrap();
    loader
}

fn rom_loader<L: SerialLink>(device: L) -> EspLoader<L> {
    let mut loader = EspLoader::new(device, no_reset());
    loader.prepare(None).unwrap();
    loader
}

fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7) % 251) as u8).collect()
}

/// 大段 0 中夹杂少量变化字节，压缩率足够让单块解压后超过默认超时对应的大小
fn sparse_image(len: usize) -> Vec<u8> {
    let mut seed = 0x1234_5678u32;
    (0..len)
        .map(|i| {
            if i % 64 == 0 {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (seed >> 16) as u8
            } else {
                0
            }
        })
        .collect()
}

/// 每个压缩块按其解压后大小计算的写入超时
fn block_timeouts(image: &[u8], write_size: usize) -> Vec<Duration> {
    let compressed = ZlibCompressor::default().compress(image).unwrap();
    let block_count = compressed.len().div_ceil(write_size);
    let inflated = Cell::new(0u64);
    let mut inflater = Inflater::new(|n| inflated.set(inflated.get() + n as u64));
    let mut last = 0u64;
    let mut timeouts = Vec::new();
    for (seq, block) in compressed.chunks(write_size).enumerate() {
        inflater.push(block, seq + 1 == block_count).unwrap();
        let size = inflated.get() - last;
        last = inflated.get();
        timeouts.push(command::timeout_per_mb(ERASE_WRITE_TIMEOUT_PER_MB, size as u32));
    }
    timeouts
}

/// 读取时传入的是剩余时间，只会比命令超时略短
fn assert_wait(actual: Duration, expected: Duration) {
    assert!(
        actual <= expected && expected - actual < Duration::from_millis(500),
        "waited {:?}, expected about {:?}",
        actual,
        expected
    );
}

fn zero_digest(_: &[u8]) -> [u8; 16] {
    [0; 16]
}

#[test]
fn test_defl_begin_block_counts() {
    let mut loader = stub_loader(FakeEsp::esp32());
    assert_eq!(loader.flash_defl_begin(10_000, 4_100, 0x10000).unwrap(), 1);

    let mut loader = rom_loader(FakeEsp::esp32s3());
    assert_eq!(loader.flash_defl_begin(10_000, 4_100, 0x10000).unwrap(), 5);
    let device = loader.into_link();
    let begin = &device.requests_for(Opcode::FlashDeflBegin)[0];
    assert_eq!(begin.word(0), 10_240);
    assert_eq!(begin.word(1), 5);
    assert_eq!(begin.word(2), 0x400);
    assert_eq!(begin.word(3), 0x10000);
    // ROM 额外携带加密标志字段
    assert_eq!(begin.payload.len(), 20);
}

#[test]
fn test_compressed_write_verifies() {
    let image = test_image(10_000);
    let mut loader = stub_loader(FakeEsp::esp32());

    let progress = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&progress);
    let job = FlashJob::new(vec![FlashFile {
        address: 0x10000,
        data: image.clone(),
    }])
    .with_progress(move |index, written, total| sink.borrow_mut().push((index, written, total)));
    loader.write_flash(job).unwrap();

    let device = loader.into_link();
    assert_eq!(&device.flash[0x10000..0x10000 + image.len()], &image[..]);
    assert_eq!(device.requests_for(Opcode::FlashDeflBegin).len(), 1);
    assert_eq!(device.requests_for(Opcode::SpiFlashMd5).len(), 1);

    // stub 写入结束后离开写入状态但不重启
    let begins = device.requests_for(Opcode::FlashBegin);
    assert_eq!(begins.last().unwrap().word(0), 0);
    assert_eq!(device.requests_for(Opcode::FlashDeflEnd)[0].word(0), 1);

    assert_eq!(progress.borrow().last(), Some(&(0, 10_000, 10_000)));
}

#[test]
fn test_md5_mismatch_is_not_retried() {
    let mut loader = stub_loader(FakeEsp::esp32());
    let mut job = FlashJob::new(vec![FlashFile {
        address: 0x10000,
        data: test_image(10_000),
    }]);
    job.digest = Some(zero_digest);

    match loader.write_flash(job) {
        Err(Error::Md5Mismatch { expected, .. }) => {
            assert_eq!(expected, "00000000000000000000000000000000");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    let device = loader.into_link();
    assert_eq!(device.requests_for(Opcode::FlashDeflBegin).len(), 1);
    assert!(device.requests_for(Opcode::FlashDeflEnd).is_empty());
}

#[test]
fn test_device_md5_mismatch() {
    let mut device = FakeEsp::esp32();
    device.corrupt_md5 = true;
    let mut loader = rom_loader(device);
    let job = FlashJob::new(vec![FlashFile {
        address: 0x8000,
        data: test_image(64),
    }]);
    assert!(matches!(
        loader.write_flash(job),
        Err(Error::Md5Mismatch { .. })
    ));
}

#[test]
fn test_uncompressed_rom_write() {
    let image = test_image(0x500);
    let mut loader = rom_loader(FakeEsp::esp32());
    let mut job = FlashJob::new(vec![FlashFile {
        address: 0x8000,
        data: image.clone(),
    }]);
    job.compress = false;
    loader.write_flash(job).unwrap();

    let device = loader.into_link();
    let begin = &device.requests_for(Opcode::FlashBegin)[0];
    assert_eq!(begin.word(0), 0x500);
    assert_eq!(begin.word(1), 2);
    assert_eq!(begin.payload.len(), 16);

    let blocks = device.requests_for(Opcode::FlashData);
    assert_eq!(blocks.len(), 2);
    assert!(blocks.iter().all(|b| b.payload.len() == 16 + 0x400));
    assert_eq!(&device.flash[0x8000..0x8500], &image[..]);
    // 最后一块以 0xFF 补齐
    assert!(device.flash[0x8500..0x8800].iter().all(|&b| b == 0xFF));
    assert!(device.requests_for(Opcode::FlashEnd).is_empty());
}

#[test]
fn test_image_header_is_patched_at_bootloader_offset() {
    let mut image = vec![0xE9, 0x03, 0x00, 0x00];
    image.extend(test_image(60));
    let mut loader = stub_loader(FakeEsp::esp32());
    let mut job = FlashJob::new(vec![FlashFile {
        address: 0x1000,
        data: image,
    }]);
    job.settings = FlashSettings {
        mode: Some(FlashMode::Dio),
        freq: Some("80m".to_string()),
        size: Some("4MB".to_string()),
    };
    loader.write_flash(job).unwrap();

    let device = loader.into_link();
    assert_eq!(device.flash[0x1002], 0x02);
    assert_eq!(device.flash[0x1003], 0x2f);
}

#[test]
fn test_detected_flash_size_is_applied() {
    let mut device = FakeEsp::esp32();
    device.flash_id = 0x0018_40EF;
    let mut loader = stub_loader(device);
    assert_eq!(loader.read_flash_id().unwrap(), 0x0018_40EF);
    assert_eq!(loader.detect_flash_size().unwrap(), Some("16MB"));

    let mut image = vec![0xE9, 0x03, 0x02, 0x0f];
    image.extend(test_image(12));
    let mut job = FlashJob::new(vec![FlashFile {
        address: 0x1000,
        data: image,
    }]);
    job.settings.size = Some(image::DETECT.to_string());
    loader.write_flash(job).unwrap();

    let device = loader.into_link();
    assert_eq!(device.flash[0x1003], 0x4f);
}

#[test]
fn test_flash_fit_checked_before_io() {
    let mut loader = stub_loader(FakeEsp::esp32());
    let before = loader.connection().link().requests.len();

    let mut job = FlashJob::new(vec![
        FlashFile {
            address: 0,
            data: vec![0; 16],
        },
        FlashFile {
            address: 0x1F_FFF0,
            data: vec![0; 0x20],
        },
    ]);
    job.settings.size = Some("2MB".to_string());
    match loader.write_flash(job) {
        Err(Error::FlashFit { index, .. }) => assert_eq!(index, 1),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(loader.connection().link().requests.len(), before);
}

#[test]
fn test_stub_only_commands_in_rom() {
    let mut loader = rom_loader(FakeEsp::esp32());
    assert!(matches!(loader.erase_flash(), Err(Error::StubRequired(_))));
    assert!(matches!(
        loader.read_flash(0, 0x100),
        Err(Error::StubRequired(_))
    ));
    assert!(
        loader
            .into_link()
            .requests_for(Opcode::EraseFlash)
            .is_empty()
    );
}

#[test]
fn test_erase_all_before_write() {
    let mut device = FakeEsp::esp32();
    device.flash[0x20000..0x20010].fill(0);
    let mut loader = stub_loader(device);

    let mut job = FlashJob::new(vec![FlashFile {
        address: 0x8000,
        data: test_image(32),
    }]);
    job.erase_all = true;
    loader.write_flash(job).unwrap();

    let device = loader.into_link();
    assert_eq!(device.requests_for(Opcode::EraseFlash).len(), 1);
    assert!(device.flash[0x20000..0x20010].iter().all(|&b| b == 0xFF));
}

#[test]
fn test_read_flash_with_acks() {
    let mut device = FakeEsp::esp32();
    let pattern = test_image(0x1800);
    device.flash[0x2000..0x3800].copy_from_slice(&pattern);
    let mut loader = stub_loader(device);

    let data = loader.read_flash(0x2000, 0x1800).unwrap();
    assert_eq!(data, pattern);

    let device = loader.into_link();
    let read = &device.requests_for(Opcode::ReadFlash)[0];
    assert_eq!(read.word(0), 0x2000);
    assert_eq!(read.word(1), 0x1800);
    assert_eq!(read.word(2), 0x1000);
    assert_eq!(read.word(3), 64);
}

#[test]
fn test_read_flash_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.bin");
    let mut loader = stub_loader(FakeEsp::esp32());

    let files = vec![esploader_lib::ReadFlashFile {
        file_path: path.display().to_string(),
        address: 0,
        size: 0x100,
    }];
    loader.read_flash_to_files(&files).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), vec![0xFF; 0x100]);
}

#[test]
fn test_header_untouched_elsewhere() {
    let profile = ChipType::Esp32.profile();
    let settings = FlashSettings {
        mode: Some(FlashMode::Dout),
        freq: None,
        size: Some("keep".to_string()),
    };

    let mut app = vec![0xE9, 0x03, 0x00, 0x20, 0, 0, 0, 0];
    image::update_image_flash_params(profile, 0x10000, &settings, &mut app).unwrap();
    assert_eq!(app[2], 0x00);

    let mut boot = app.clone();
    image::update_image_flash_params(profile, 0x1000, &settings, &mut boot).unwrap();
    assert_eq!(boot[2], 0x03);
    assert_eq!(boot[3], 0x20);

    let mut raw = vec![0x00; 8];
    image::update_image_flash_params(profile, 0x1000, &settings, &mut raw).unwrap();
    assert_eq!(raw, vec![0x00; 8]);

    let detect = FlashSettings {
        size: Some("detect".to_string()),
        ..Default::default()
    };
    assert!(image::update_image_flash_params(profile, 0x1000, &detect, &mut boot).is_err());
}

#[test]
fn test_pad_to_alignment() {
    let mut data = vec![1, 2, 3, 4, 5];
    image::pad_to_alignment(&mut data, 4);
    assert_eq!(data, vec![1, 2, 3, 4, 5, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn test_flash_begin_block_counts_in_stub() {
    let mut loader = stub_loader(FakeEsp::esp32());
    for (size, blocks) in [(0, 0), (1, 1), (0x4000, 1), (0x4001, 2), (0x8000, 2)] {
        assert_eq!(loader.flash_begin(size, 0x10000).unwrap(), blocks, "size {:#x}", size);
    }

    let device = loader.into_link();
    let begins = device.requests_for(Opcode::FlashBegin);
    assert_eq!(begins.len(), 5);
    for begin in &begins {
        // stub 不附加加密字段
        assert_eq!(begin.word(2), 0x4000);
        assert_eq!(begin.payload.len(), 16);
    }
    let sizes: Vec<u32> = begins.iter().map(|b| b.word(0)).collect();
    assert_eq!(sizes, vec![0, 1, 0x4000, 0x4001, 0x8000]);
}

#[test]
fn test_esp8266_erase_size_adjusted_only_in_rom() {
    let mut loader = rom_loader(FakeEsp::new(ChipType::Esp8266, 0xfff0_c101));
    loader.flash_begin(0x10000, 0).unwrap();
    let device = loader.into_link();
    assert_eq!(device.requests_for(Opcode::FlashBegin)[1].word(0), 0x8000);

    let mut loader = stub_loader(FakeEsp::new(ChipType::Esp8266, 0xfff0_c101));
    loader.flash_begin(0x10000, 0).unwrap();
    let device = loader.into_link();
    assert_eq!(device.requests_for(Opcode::FlashBegin)[0].word(0), 0x10000);
}

#[test]
fn test_stub_defl_blocks_wait_with_previous_block_timeout() {
    let image = sparse_image(0x10_0000);
    let expected = block_timeouts(&image, 0x4000);
    assert!(expected.len() > 1);
    assert!(expected.iter().any(|&t| t > DEFAULT_TIMEOUT));

    let mut loader = stub_loader(TimedLink::new(FakeEsp::esp32()));
    let mut job = FlashJob::new(vec![FlashFile {
        address: 0,
        data: image.clone(),
    }]);
    job.digest = None;
    loader.write_flash(job).unwrap();

    let link = loader.into_link();
    let waits = link.waits_from(Opcode::FlashDeflData);
    let blocks: Vec<Duration> = waits
        .iter()
        .take_while(|(op, _)| *op == Opcode::FlashDeflData as u8)
        .map(|&(_, t)| t)
        .collect();
    assert_eq!(blocks.len(), expected.len());

    assert_wait(blocks[0], DEFAULT_TIMEOUT);
    for seq in 1..blocks.len() {
        assert_wait(blocks[seq], expected[seq - 1]);
    }

    // 最后一块之后读寄存器，等待最后一块的写入时间
    let (op, barrier) = waits[blocks.len()];
    assert_eq!(op, Opcode::ReadReg as u8);
    assert_wait(barrier, expected[expected.len() - 1]);

    assert_eq!(&link.device.flash[..image.len()], &image[..]);
}

#[test]
fn test_rom_defl_blocks_wait_with_own_timeout() {
    let image = sparse_image(0x4_0000);
    let expected = block_timeouts(&image, 0x400);
    assert!(expected.len() > 1);

    let mut loader = rom_loader(TimedLink::new(FakeEsp::esp32()));
    let mut job = FlashJob::new(vec![FlashFile {
        address: 0,
        data: image.clone(),
    }]);
    job.digest = None;
    loader.write_flash(job).unwrap();

    let link = loader.into_link();
    let waits = link.waits_from(Opcode::FlashDeflData);
    assert_eq!(waits.len(), expected.len());
    for (&(op, actual), &timeout) in waits.iter().zip(&expected) {
        assert_eq!(op, Opcode::FlashDeflData as u8);
        assert_wait(actual, timeout);
    }
    assert!(waits.iter().all(|(op, _)| *op != Opcode::ReadReg as u8));
}
