//! worker 事件汇总与 CLI 进度条。

use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// worker 通过 channel 上报给协调线程的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Claimed { report_id: String, title: String },
    Bytes(u64),
    Downloaded { report_id: String, size: u64 },
    /// 文件已在位且校验通过，未重新下载
    Skipped { report_id: String },
    Failed { report_id: String, error: String },
    NoDownloadUrl { report_id: String },
    Released { report_id: String },
    Abandoned { report_id: String },
    Extracted { report_id: String, files: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub claimed: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_url: usize,
    pub released: usize,
    pub abandoned: usize,
    pub extracted: usize,
    pub bytes: u64,
}

impl RunSummary {
    pub fn apply(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::Claimed { .. } => self.claimed += 1,
            WorkerEvent::Bytes(n) => self.bytes += n,
            WorkerEvent::Downloaded { .. } => self.downloaded += 1,
            WorkerEvent::Skipped { .. } => self.skipped += 1,
            WorkerEvent::Failed { .. } => self.failed += 1,
            WorkerEvent::NoDownloadUrl { .. } => self.no_url += 1,
            WorkerEvent::Released { .. } => self.released += 1,
            WorkerEvent::Abandoned { .. } => self.abandoned += 1,
            WorkerEvent::Extracted { .. } => self.extracted += 1,
        }
    }

    /// 本轮已有结论的报告数（不含归还的领取）。
    pub fn settled(&self) -> usize {
        self.downloaded + self.skipped + self.failed + self.no_url
    }
}

pub(crate) struct ProgressReporter {
    summary: RunSummary,
    bar: ProgressBar,
}

impl ProgressReporter {
    pub(crate) fn new(show: bool, total: u64) -> Self {
        let bar = if show {
            let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template(
                "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
            bar.set_style(style);
            bar.set_prefix("报告下载");
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            summary: RunSummary::default(),
            bar,
        }
    }

    pub(crate) fn handle(&mut self, event: WorkerEvent) {
        self.summary.apply(&event);
        match &event {
            WorkerEvent::Bytes(_) => {
                self.bar.set_message(HumanBytes(self.summary.bytes).to_string());
            }
            WorkerEvent::Claimed { title, .. } => {
                self.bar.set_message(format!("{} | {}", HumanBytes(self.summary.bytes), title));
            }
            WorkerEvent::Downloaded { .. }
            | WorkerEvent::Skipped { .. }
            | WorkerEvent::Failed { .. }
            | WorkerEvent::NoDownloadUrl { .. } => {
                self.bar.set_position(self.summary.settled() as u64);
            }
            WorkerEvent::Released { .. } | WorkerEvent::Abandoned { .. } | WorkerEvent::Extracted { .. } => {}
        }
        if let WorkerEvent::Failed { report_id, error } = &event {
            self.bar.println(format!("下载失败 {report_id}: {error}"));
        }
    }

    pub(crate) fn finish(self) -> RunSummary {
        self.bar.finish_and_clear();
        self.summary
    }
}
