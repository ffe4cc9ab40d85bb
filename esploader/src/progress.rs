//! 终端进度显示
//!
//! 交互式终端下使用 indicatif 多进度条；输出被重定向时退化为逐行打印，
//! 便于在 CI 日志中查看。

use esploader_lib::progress::{ProgressCallback, ProgressId, ProgressInfo, ProgressType};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 每前进多少个百分点打印一行
const PLAIN_PERCENT_STEP: u64 = 10;

struct PlainEntry {
    prefix: String,
    total: Option<u64>,
    current: u64,
    printed_percent: u64,
}

/// 非终端环境下的逐行进度输出
#[derive(Default)]
pub struct PlainProgressCallback {
    entries: Mutex<HashMap<u64, PlainEntry>>,
    next_id: AtomicU64,
}

impl PlainProgressCallback {
    pub fn new() -> Self {
        Self::default()
    }

    fn print_line(line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }

    fn percent(current: u64, total: u64) -> u64 {
        if total == 0 {
            return 100;
        }
        (current.saturating_mul(100) / total).min(100)
    }
}

impl ProgressCallback for PlainProgressCallback {
    fn start(&self, info: ProgressInfo) -> ProgressId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total = match info.progress_type {
            ProgressType::Spinner => None,
            ProgressType::Bar { total } => Some(total),
        };
        Self::print_line(&format!("[{}] {}", info.prefix, info.message));

        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                id,
                PlainEntry {
                    prefix: info.prefix,
                    total,
                    current: info.current.unwrap_or(0),
                    printed_percent: 0,
                },
            );
        }
        ProgressId(id)
    }

    fn update_message(&self, _id: ProgressId, _message: String) {}

    fn increment(&self, id: ProgressId, delta: u64) {
        let mut line = None;
        if let Ok(mut entries) = self.entries.lock()
            && let Some(entry) = entries.get_mut(&id.0)
            && let Some(total) = entry.total
        {
            entry.current = entry.current.saturating_add(delta);
            let percent = Self::percent(entry.current, total);
            if percent >= entry.printed_percent + PLAIN_PERCENT_STEP && percent < 100 {
                entry.printed_percent = percent - percent % PLAIN_PERCENT_STEP;
                line = Some(format!("[{}] {}%", entry.prefix, entry.printed_percent));
            }
        }
        if let Some(line) = line {
            Self::print_line(&line);
        }
    }

    fn finish(&self, id: ProgressId, final_message: String) {
        let prefix = self
            .entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.remove(&id.0))
            .map(|entry| entry.prefix);
        if let Some(prefix) = prefix {
            Self::print_line(&format!("[{}] {}", prefix, final_message));
        }
    }
}

/// 基于 indicatif 的进度回调
pub struct IndicatifProgressCallback {
    multi_progress: MultiProgress,
    bars: Mutex<HashMap<u64, ProgressBar>>,
    next_id: AtomicU64,
}

impl IndicatifProgressCallback {
    pub fn new() -> Self {
        Self {
            multi_progress: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn spinner(&self, info: &ProgressInfo) -> ProgressBar {
        let spinner = self.multi_progress.add(ProgressBar::new_spinner());
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_style(
            ProgressStyle::with_template(&format!("[{}] {{spinner}} {{msg}}", info.prefix))
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner
    }

    fn bar(&self, info: &ProgressInfo, total: u64) -> ProgressBar {
        let bar = self.multi_progress.add(ProgressBar::new(total));
        bar.set_style(
            ProgressStyle::with_template(&format!(
                "[{}] {{msg}} {{wide_bar}} {{bytes}}/{{total_bytes}} {{bytes_per_sec}}",
                info.prefix
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        if let Some(current) = info.current {
            bar.set_position(current);
        }
        bar
    }
}

impl Default for IndicatifProgressCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCallback for IndicatifProgressCallback {
    fn start(&self, info: ProgressInfo) -> ProgressId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bar = match info.progress_type {
            ProgressType::Spinner => self.spinner(&info),
            ProgressType::Bar { total } => self.bar(&info, total),
        };
        bar.set_message(info.message);

        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(id, bar);
        }
        ProgressId(id)
    }

    fn update_message(&self, id: ProgressId, message: String) {
        if let Ok(bars) = self.bars.lock()
            && let Some(bar) = bars.get(&id.0)
        {
            bar.set_message(message);
        }
    }

    fn increment(&self, id: ProgressId, delta: u64) {
        if let Ok(bars) = self.bars.lock()
            && let Some(bar) = bars.get(&id.0)
        {
            bar.inc(delta);
        }
    }

    fn finish(&self, id: ProgressId, final_message: String) {
        if let Ok(mut bars) = self.bars.lock()
            && let Some(bar) = bars.remove(&id.0)
        {
            bar.finish_with_message(final_message);
        }
    }
}

/// 按 stdout 是否为终端选择进度实现
pub fn create_progress_callback() -> Arc<dyn ProgressCallback> {
    if io::stdout().is_terminal() {
        Arc::new(IndicatifProgressCallback::new())
    } else {
        Arc::new(PlainProgressCallback::new())
    }
}
