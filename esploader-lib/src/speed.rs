use crate::command::{self, DEFAULT_TIMEOUT, Opcode};
use crate::progress::{ProgressOperation, ProgressStatus};
use crate::transport::SerialLink;
use crate::{EspLoader, Result};
use std::time::Duration;

const RESYNC_ATTEMPTS: usize = 64;
const RESYNC_SPACING: Duration = Duration::from_millis(10);

pub trait SpeedTrait {
    /// 切换串口波特率
    ///
    /// 重新同步失败只记录警告，不视为错误。
    fn change_baud(&mut self, baud: u32) -> Result<()>;
}

impl<L: SerialLink> SpeedTrait for EspLoader<L> {
    fn change_baud(&mut self, baud: u32) -> Result<()> {
        let spinner = self
            .progress
            .create_spinner(ProgressOperation::ChangeBaud { baud });

        // stub 需要知道旧波特率来计算分频，ROM 忽略该字段
        let prior = if self.is_stub() {
            self.connection.link().baud_rate()
        } else {
            0
        };
        let payload = command::pack_u32(&[baud, prior]);
        if let Err(e) = self.connection.check_command(
            "change baud rate",
            Opcode::ChangeBaudrate,
            &payload,
            0,
            DEFAULT_TIMEOUT,
        ) {
            spinner.finish(ProgressStatus::Failed);
            return Err(e);
        }

        let link = self.connection.link_mut();
        link.disconnect()?;
        std::thread::sleep(Duration::from_millis(50));
        link.connect(baud)?;
        self.connection.flush_input()?;

        let mut synced = false;
        for _ in 0..RESYNC_ATTEMPTS {
            if self.connection.sync().is_ok() {
                synced = true;
                break;
            }
            std::thread::sleep(RESYNC_SPACING);
        }

        if synced {
            spinner.finish(ProgressStatus::Success);
        } else {
            tracing::warn!("Unable to resync after changing baud rate to {}", baud);
            spinner.finish(ProgressStatus::Skipped);
        }
        Ok(())
    }
}
