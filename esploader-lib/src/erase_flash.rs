use crate::command::{CHIP_ERASE_TIMEOUT, Opcode};
use crate::progress::{ProgressOperation, ProgressStatus};
use crate::transport::SerialLink;
use crate::{EspLoader, Result};

pub trait EraseFlashTrait {
    /// 擦除整片 flash，仅 stub 支持
    fn erase_flash(&mut self) -> Result<()>;
}

impl<L: SerialLink> EraseFlashTrait for EspLoader<L> {
    fn erase_flash(&mut self) -> Result<()> {
        self.require_stub(Opcode::EraseFlash)?;

        let spinner = self.progress.create_spinner(ProgressOperation::EraseFlash);
        let result = self.connection.check_command(
            "erase flash",
            Opcode::EraseFlash,
            &[],
            0,
            CHIP_ERASE_TIMEOUT,
        );
        match result {
            Ok(_) => {
                spinner.finish(ProgressStatus::Success);
                Ok(())
            }
            Err(e) => {
                spinner.finish(ProgressStatus::Failed);
                Err(e)
            }
        }
    }
}
