//! 进度条回调系统
//!
//! 这个模块定义了进度条的抽象接口，允许用户在不同环境（CLI、GUI等）中
//! 自定义进度条的显示方式。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

/// 进度条类型
#[derive(Debug, Clone)]
pub enum ProgressType {
    /// 旋转进度条，用于不确定时长的操作
    Spinner,
    /// 条形进度条，用于有明确进度的操作
    Bar { total: u64 },
}

/// 进度条状态
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub progress_type: ProgressType,
    /// 步骤前缀（通常是十六进制步骤号）
    pub prefix: String,
    pub message: String,
    /// 当前进度（仅对 Bar 类型有效）
    pub current: Option<u64>,
}

/// 进度回调 trait
///
/// 实现此 trait 以自定义进度条的显示方式
pub trait ProgressCallback: Send + Sync {
    /// 开始一个新的进度条，返回用于后续更新的 ID
    fn start(&self, info: ProgressInfo) -> ProgressId;

    fn update_message(&self, id: ProgressId, message: String);

    /// 增加进度（仅对 Bar 类型有效）
    fn increment(&self, id: ProgressId, delta: u64);

    fn finish(&self, id: ProgressId, final_message: String);
}

/// 进度条 ID 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressId(pub u64);

/// 不产生任何输出的进度回调
#[derive(Debug, Default)]
pub struct NoOpProgressCallback;

impl ProgressCallback for NoOpProgressCallback {
    fn start(&self, _info: ProgressInfo) -> ProgressId {
        ProgressId(0)
    }

    fn update_message(&self, _id: ProgressId, _message: String) {}

    fn increment(&self, _id: ProgressId, _delta: u64) {}

    fn finish(&self, _id: ProgressId, _final_message: String) {}
}

pub type ProgressCallbackArc = Arc<dyn ProgressCallback>;

pub fn no_op_progress_callback() -> ProgressCallbackArc {
    Arc::new(NoOpProgressCallback)
}

/// 需要显示进度的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressOperation {
    Connect,
    DetectChip,
    DownloadStub,
    ChangeBaud { baud: u32 },
    DetectFlashSize,
    EraseFlash,
    WriteFlash { address: u32, size: u64 },
    Verify { address: u32, len: u32 },
    ReadFlash { address: u32, size: u32 },
    HardReset,
    SoftReset,
}

impl fmt::Display for ProgressOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressOperation::Connect => write!(f, "Connecting to chip..."),
            ProgressOperation::DetectChip => write!(f, "Detecting chip type..."),
            ProgressOperation::DownloadStub => write!(f, "Uploading stub..."),
            ProgressOperation::ChangeBaud { baud } => {
                write!(f, "Changing baud rate to {}...", baud)
            }
            ProgressOperation::DetectFlashSize => write!(f, "Detecting flash size..."),
            ProgressOperation::EraseFlash => write!(f, "Erasing entire flash..."),
            ProgressOperation::WriteFlash { address, size } => {
                write!(f, "Writing {} bytes at 0x{:08X}", size, address)
            }
            ProgressOperation::Verify { address, len } => write!(
                f,
                "Verifying 0x{:08X}..0x{:08X}...",
                address,
                address.saturating_add(len.saturating_sub(1))
            ),
            ProgressOperation::ReadFlash { address, size } => {
                write!(f, "Reading {} bytes at 0x{:08X}", size, address)
            }
            ProgressOperation::HardReset => write!(f, "Hard resetting via RTS pin..."),
            ProgressOperation::SoftReset => write!(f, "Soft resetting..."),
        }
    }
}

/// 操作结束时的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressStatus::Success => write!(f, "Done"),
            ProgressStatus::Failed => write!(f, "Failed"),
            ProgressStatus::Skipped => write!(f, "Skipped"),
        }
    }
}

/// 进度条助手结构体
///
/// 提供便捷的方法来创建和管理进度条
#[derive(Clone)]
pub struct ProgressHelper {
    callback: ProgressCallbackArc,
    step_counter: Arc<AtomicI32>,
}

impl ProgressHelper {
    /// 创建新的进度助手，从指定的初始步骤开始
    pub fn new(callback: ProgressCallbackArc, initial_step: i32) -> Self {
        Self {
            callback,
            step_counter: Arc::new(AtomicI32::new(initial_step)),
        }
    }

    fn next_step(&self) -> i32 {
        self.step_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn create_spinner(&self, operation: ProgressOperation) -> ProgressHandler {
        self.start(ProgressType::Spinner, operation, None)
    }

    pub fn create_bar(&self, total: u64, operation: ProgressOperation) -> ProgressHandler {
        self.start(ProgressType::Bar { total }, operation, Some(0))
    }

    fn start(
        &self,
        progress_type: ProgressType,
        operation: ProgressOperation,
        current: Option<u64>,
    ) -> ProgressHandler {
        let step = self.next_step();
        let info = ProgressInfo {
            progress_type,
            prefix: format!("0x{:02X}", step),
            message: operation.to_string(),
            current,
        };
        let id = self.callback.start(info);
        ProgressHandler {
            callback: Arc::clone(&self.callback),
            id,
            operation,
        }
    }

    /// 获取当前步骤号（不递增）
    pub fn current_step(&self) -> i32 {
        self.step_counter.load(Ordering::SeqCst)
    }
}

/// 单个进度条实例
pub struct ProgressHandler {
    callback: ProgressCallbackArc,
    id: ProgressId,
    operation: ProgressOperation,
}

impl ProgressHandler {
    pub fn set_operation(&mut self, operation: ProgressOperation) {
        self.callback.update_message(self.id, operation.to_string());
        self.operation = operation;
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.callback.update_message(self.id, message.into());
    }

    pub fn inc(&self, delta: u64) {
        self.callback.increment(self.id, delta);
    }

    pub fn finish(self, status: ProgressStatus) {
        self.callback
            .finish(self.id, format!("{} {}", self.operation, status));
    }
}
