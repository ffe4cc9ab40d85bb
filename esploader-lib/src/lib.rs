pub mod chip;
pub mod command;
pub mod compress;
pub mod connection;
pub mod erase_flash;
mod error;
pub mod image;
pub mod progress;
pub mod ram_stub;
pub mod read_flash;
pub mod reset;
pub mod slip;
pub mod speed;
pub mod spi_flash;
pub mod transport;
pub mod utils;
pub mod write_flash;

pub use chip::{ChipProfile, ChipType};
pub use command::{CommandResult, Opcode};
pub use connection::Connection;
pub use error::{Error, Result};
pub use image::{FlashMode, FlashSettings};
pub use ram_stub::{DownloadStub, StubImage};
pub use read_flash::{ReadFlashFile, ReadFlashTrait};
pub use erase_flash::EraseFlashTrait;
pub use speed::SpeedTrait;
pub use transport::{SerialLink, SerialPortLink};
pub use write_flash::{FlashFile, FlashJob, WriteFlashTrait};

use crate::command::{CHIP_DETECT_MAGIC_REG_ADDR, STUB_FLASH_WRITE_SIZE};
use crate::progress::{
    ProgressCallbackArc, ProgressHelper, ProgressOperation, ProgressStatus,
    no_op_progress_callback,
};
use crate::reset::{ResetSequencer, USB_JTAG_SERIAL_PID};
use std::time::Duration;

/// ROM 引导程序的默认波特率
pub const ROM_BAUD: u32 = 115_200;

const SYNC_ATTEMPTS: usize = 7;
const SYNC_SPACING: Duration = Duration::from_millis(50);
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(50);
const DRAIN_MAX_READS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum BeforeOperation {
    /// 使用 DTR/RTS 复位序列
    #[cfg_attr(feature = "cli", clap(name = "default_reset"))]
    DefaultReset,
    /// 经典复位，第二次尝试附加 ESP32 rev0 延时
    #[cfg_attr(feature = "cli", clap(name = "classic_reset"))]
    ClassicReset,
    /// 强制使用 USB-Serial/JTAG 复位序列
    #[cfg_attr(feature = "cli", clap(name = "usb_reset"))]
    UsbReset,
    #[cfg_attr(feature = "cli", clap(name = "no_reset"))]
    NoReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum AfterOperation {
    #[cfg_attr(feature = "cli", clap(name = "hard_reset"))]
    HardReset,
    #[cfg_attr(feature = "cli", clap(name = "soft_reset"))]
    SoftReset,
    #[cfg_attr(feature = "cli", clap(name = "no_reset"))]
    NoReset,
}

/// 当前与之通信的程序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderMode {
    Rom,
    Stub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resetting,
    Syncing,
    Synced,
    Detected,
    StubUploading,
    StubActive,
    Ready,
    Failed,
}

#[derive(Clone)]
pub struct EspLoaderBase {
    pub before: BeforeOperation,
    pub after: AfterOperation,
    /// 连接 ROM 时使用的波特率
    pub rom_baud: u32,
    /// 连接成功后切换到的波特率
    pub baud: u32,
    pub connect_attempts: u32,
    pub reset_delay_ms: u64,
    /// 自定义 DTR/RTS 复位序列，设置后替代内置序列
    pub reset_sequence: Option<String>,
    /// 期望的芯片类型，与检测结果不符时连接失败
    pub chip: Option<ChipType>,
    /// SPI_ATTACH 的引脚配置，0 表示默认 SPI 引脚
    pub spi_pins: u32,
    pub quiet: bool,
    pub progress_callback: ProgressCallbackArc,
}

impl Default for EspLoaderBase {
    fn default() -> Self {
        Self {
            before: BeforeOperation::DefaultReset,
            after: AfterOperation::HardReset,
            rom_baud: ROM_BAUD,
            baud: ROM_BAUD,
            connect_attempts: 7,
            reset_delay_ms: reset::DEFAULT_RESET_DELAY_MS,
            reset_sequence: None,
            chip: None,
            spi_pins: 0,
            quiet: false,
            progress_callback: no_op_progress_callback(),
        }
    }
}

/// 一次与引导程序的会话
pub struct EspLoader<L: SerialLink> {
    pub(crate) connection: Connection<L>,
    pub(crate) base: EspLoaderBase,
    pub(crate) state: ConnectionState,
    pub(crate) mode: LoaderMode,
    pub(crate) chip: Option<&'static ChipProfile>,
    pub(crate) flash_write_size: u32,
    pub(crate) sync_stub_detected: bool,
    /// stub 占用的 RAM 区间 `[start, end)`
    pub(crate) resident_stub: Vec<(u32, u32)>,
    pub(crate) progress: ProgressHelper,
}

impl<L: SerialLink> EspLoader<L> {
    pub fn new(link: L, base: EspLoaderBase) -> Self {
        let callback = if base.quiet {
            no_op_progress_callback()
        } else {
            base.progress_callback.clone()
        };
        Self {
            connection: Connection::new(link),
            base,
            state: ConnectionState::Disconnected,
            mode: LoaderMode::Rom,
            chip: None,
            flash_write_size: 0x400,
            sync_stub_detected: false,
            resident_stub: Vec::new(),
            progress: ProgressHelper::new(callback, 0),
        }
    }

    pub fn base(&self) -> &EspLoaderBase {
        &self.base
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mode(&self) -> LoaderMode {
        self.mode
    }

    pub fn is_stub(&self) -> bool {
        self.mode == LoaderMode::Stub
    }

    pub fn chip(&self) -> Option<&'static ChipProfile> {
        self.chip
    }

    pub fn flash_write_size(&self) -> u32 {
        self.flash_write_size
    }

    /// 同步时发现设备上已经运行着 stub
    pub fn sync_stub_detected(&self) -> bool {
        self.sync_stub_detected
    }

    pub fn connection(&mut self) -> &mut Connection<L> {
        &mut self.connection
    }

    pub fn progress(&self) -> &ProgressHelper {
        &self.progress
    }

    pub fn into_link(self) -> L {
        self.connection.into_link()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!("connection state: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// 已识别的芯片参数
    pub fn profile(&self) -> Result<&'static ChipProfile> {
        self.chip
            .ok_or_else(|| Error::protocol("chip has not been detected yet"))
    }

    pub(crate) fn require_stub(&self, op: Opcode) -> Result<()> {
        if op.stub_only() && !self.is_stub() {
            return Err(Error::StubRequired(command_name(op)));
        }
        Ok(())
    }

    pub fn read_reg(&mut self, addr: u32) -> Result<u32> {
        self.connection.read_reg(addr)
    }

    pub fn write_reg(&mut self, addr: u32, value: u32, mask: u32, delay_us: u32) -> Result<()> {
        self.connection.write_reg(addr, value, mask, delay_us)
    }

    /// 复位芯片并与引导程序同步，随后识别芯片类型
    pub fn connect(&mut self) -> Result<&'static ChipProfile> {
        if let Some(sequence) = &self.base.reset_sequence
            && !reset::validate_custom_reset_sequence(sequence)
        {
            return Err(Error::InvalidResetSequence(sequence.clone()));
        }

        let spinner = self.progress.create_spinner(ProgressOperation::Connect);
        self.connection.link_mut().connect(self.base.rom_baud)?;

        let attempts = self.base.connect_attempts.max(1);
        let mut synced = None;
        'attempts: for attempt in 0..attempts {
            for esp32r0 in [false, true] {
                match self.connect_attempt(esp32r0) {
                    Ok(stub_detected) => {
                        synced = Some(stub_detected);
                        break 'attempts;
                    }
                    Err(e @ Error::InvalidResetSequence(_)) => {
                        self.set_state(ConnectionState::Failed);
                        spinner.finish(ProgressStatus::Failed);
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::debug!(
                            "connect attempt {} (esp32r0: {}) failed: {}",
                            attempt + 1,
                            esp32r0,
                            e
                        );
                    }
                }
            }
        }

        let Some(stub_detected) = synced else {
            self.set_state(ConnectionState::Failed);
            spinner.finish(ProgressStatus::Failed);
            return Err(Error::SyncFailed { attempts });
        };

        self.sync_stub_detected = stub_detected;
        self.set_state(ConnectionState::Synced);
        spinner.finish(ProgressStatus::Success);

        self.detect_chip()
    }

    fn connect_attempt(&mut self, esp32r0: bool) -> Result<bool> {
        self.set_state(ConnectionState::Resetting);
        self.reset_into_bootloader(esp32r0)?;
        self.drain_input()?;

        self.set_state(ConnectionState::Syncing);
        let mut last_error = None;
        for _ in 0..SYNC_ATTEMPTS {
            match self.connection.sync() {
                Ok(stub_detected) => return Ok(stub_detected),
                Err(e) => {
                    tracing::trace!("sync failed: {}", e);
                    last_error = Some(e);
                    std::thread::sleep(SYNC_SPACING);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::timeout("syncing with the bootloader")))
    }

    fn reset_into_bootloader(&mut self, esp32r0: bool) -> Result<()> {
        let delay = self.base.reset_delay_ms;
        let usb_jtag = self.connection.link().product_id() == Some(USB_JTAG_SERIAL_PID);
        let link = self.connection.link_mut();

        match self.base.before {
            BeforeOperation::NoReset => Ok(()),
            _ if self.base.reset_sequence.is_some() => {
                let sequence = self.base.reset_sequence.as_deref().unwrap_or_default();
                ResetSequencer::custom_reset(link, sequence)
            }
            BeforeOperation::UsbReset => ResetSequencer::usb_jtag_serial_reset(link),
            _ if usb_jtag => ResetSequencer::usb_jtag_serial_reset(link),
            BeforeOperation::DefaultReset => {
                let sequence = if esp32r0 {
                    reset::esp32r0_reset_sequence(delay)
                } else {
                    reset::default_reset_sequence(delay)
                };
                ResetSequencer::custom_reset(link, &sequence)
            }
            BeforeOperation::ClassicReset => {
                let delay = if esp32r0 {
                    delay + reset::ESP32R0_EXTRA_DELAY_MS
                } else {
                    delay
                };
                ResetSequencer::classic_reset(link, delay)
            }
        }
    }

    /// 丢弃复位后芯片输出的启动日志
    fn drain_input(&mut self) -> Result<()> {
        for _ in 0..DRAIN_MAX_READS {
            match self.connection.read_raw(DRAIN_READ_TIMEOUT) {
                Ok(bytes) => tracing::trace!("drained {} bytes", bytes.len()),
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e),
            }
        }
        self.connection.flush_input()
    }

    /// 读取魔数寄存器并查表识别芯片
    pub fn detect_chip(&mut self) -> Result<&'static ChipProfile> {
        let spinner = self.progress.create_spinner(ProgressOperation::DetectChip);
        let result = self
            .connection
            .read_reg(CHIP_DETECT_MAGIC_REG_ADDR)
            .and_then(ChipProfile::from_magic);

        let profile = match result {
            Ok(profile) => profile,
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                spinner.finish(ProgressStatus::Failed);
                return Err(e);
            }
        };
        tracing::info!("Detected chip: {}", profile.name);

        if let Some(expected) = self.base.chip
            && expected != profile.chip
        {
            self.set_state(ConnectionState::Failed);
            spinner.finish(ProgressStatus::Failed);
            return Err(Error::ChipMismatch {
                expected: expected.profile().name.to_string(),
                detected: profile.name.to_string(),
            });
        }

        self.chip = Some(profile);
        if !self.is_stub() {
            self.flash_write_size = profile.rom_flash_write_size;
            self.connection.set_status_len(profile.rom_status_len);
        }
        self.set_state(ConnectionState::Detected);
        spinner.finish(ProgressStatus::Success);
        Ok(profile)
    }

    pub(crate) fn enter_stub_mode(&mut self) {
        self.mode = LoaderMode::Stub;
        self.flash_write_size = STUB_FLASH_WRITE_SIZE;
        self.connection.set_status_len(2);
        self.set_state(ConnectionState::StubActive);
    }

    /// 完整的准备流程：连接、加载 stub、切换波特率、挂载 SPI flash
    pub fn prepare(&mut self, stub: Option<&StubImage>) -> Result<&'static ChipProfile> {
        let profile = self.connect()?;
        self.setup(stub)?;
        Ok(profile)
    }

    /// 连接成功后的准备工作
    ///
    /// 传入 `None` 时继续使用 ROM，除非同步时已经发现 stub 在运行。
    pub fn setup(&mut self, stub: Option<&StubImage>) -> Result<()> {
        match stub {
            Some(stub) => self.run_stub(stub)?,
            None if self.sync_stub_detected => {
                tracing::info!("Stub is already running, no upload is necessary");
                self.enter_stub_mode();
            }
            None => tracing::info!("Continuing with the ROM bootloader"),
        }

        if self.base.baud != self.base.rom_baud {
            self.change_baud(self.base.baud)?;
        }

        self.flash_spi_attach(self.base.spi_pins)?;
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    /// 拉低 EN 后释放，让芯片从 flash 启动
    pub fn hard_reset(&mut self) -> Result<()> {
        let spinner = self.progress.create_spinner(ProgressOperation::HardReset);
        let using_usb_otg = self.uses_usb_otg();
        self.connection.link_mut().set_rts(true)?;
        ResetSequencer::hard_reset(self.connection.link_mut(), using_usb_otg)?;
        spinner.finish(ProgressStatus::Success);
        Ok(())
    }

    fn uses_usb_otg(&mut self) -> bool {
        let Some((reg, otg_value)) = self.chip.and_then(|profile| profile.uart_dev_buf_no) else {
            return false;
        };
        match self.connection.read_reg(reg) {
            Ok(value) => (value & 0xFF) == otg_value,
            Err(e) => {
                tracing::debug!("unable to read UART buffer number: {}", e);
                false
            }
        }
    }

    /// 通过命令离开引导程序并运行用户程序
    pub fn soft_reset(&mut self) -> Result<()> {
        let spinner = self.progress.create_spinner(ProgressOperation::SoftReset);
        if !self.is_stub() {
            // ROM 在 FLASH_END 后跳转到用户程序
            self.flash_begin(0, 0)?;
            self.flash_finish(false)?;
        } else if self.profile()?.chip != ChipType::Esp8266 {
            spinner.finish(ProgressStatus::Failed);
            return Err(Error::UnsupportedChip(
                "soft resetting from the stub is only supported on ESP8266".to_string(),
            ));
        } else {
            self.connection.command(
                Some(Opcode::RunUserCode),
                &[],
                0,
                false,
                command::DEFAULT_TIMEOUT,
            )?;
        }
        spinner.finish(ProgressStatus::Success);
        Ok(())
    }

    /// 执行 `after` 配置指定的收尾操作
    pub fn run_after_operation(&mut self) -> Result<()> {
        match self.base.after {
            AfterOperation::HardReset => self.hard_reset(),
            AfterOperation::SoftReset => self.soft_reset(),
            AfterOperation::NoReset => {
                tracing::info!("Staying in bootloader");
                Ok(())
            }
        }
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.connection.link_mut().disconnect()?;
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }
}

fn command_name(op: Opcode) -> &'static str {
    match op {
        Opcode::EraseFlash => "ERASE_FLASH",
        Opcode::ReadFlash => "READ_FLASH",
        Opcode::RunUserCode => "RUN_USER_CODE",
        _ => "this command",
    }
}
