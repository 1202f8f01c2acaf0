//! 持久化数据模型与状态迁移表。

use std::fmt;
use std::path::PathBuf;

/// 报告状态。合法迁移见 [`ReportStatus::can_transition_to`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReportStatus {
    Pending,
    Ready,
    Downloading,
    Downloaded,
    Failed,
    NoDownloadUrl,
}

impl ReportStatus {
    pub const ALL: [ReportStatus; 6] = [
        ReportStatus::Pending,
        ReportStatus::Ready,
        ReportStatus::Downloading,
        ReportStatus::Downloaded,
        ReportStatus::Failed,
        ReportStatus::NoDownloadUrl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Ready => "ready",
            ReportStatus::Downloading => "downloading",
            ReportStatus::Downloaded => "downloaded",
            ReportStatus::Failed => "failed",
            ReportStatus::NoDownloadUrl => "no_download_url",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    pub fn can_transition_to(self, next: ReportStatus) -> bool {
        use ReportStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, NoDownloadUrl)
                | (Ready, Ready)
                | (Ready, Downloading)
                | (Ready, NoDownloadUrl)
                | (Downloading, Downloaded)
                | (Downloading, Failed)
                | (Downloading, Ready)
                | (Downloading, NoDownloadUrl)
                | (Downloaded, Ready)
                | (Failed, Ready)
                | (Failed, NoDownloadUrl)
                | (NoDownloadUrl, Ready)
        )
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub list_url: String,
}

/// 爬虫发现的报告条目；`id` 缺省时由来源页面 URL 派生。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    pub id: Option<String>,
    pub category_id: String,
    pub title: String,
    pub source_page_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub id: String,
    pub category_id: String,
    pub title: String,
    pub source_page_url: String,
    pub download_url: Option<String>,
    pub status: ReportStatus,
    pub expected_file_path: PathBuf,
    pub file_size_bytes: Option<u64>,
    pub expected_checksum: Option<String>,
    pub content_checksum: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    InProgress,
    Succeeded,
    FailedNetwork,
    FailedVerification,
    Abandoned,
}

impl AttemptOutcome {
    const ALL: [AttemptOutcome; 5] = [
        AttemptOutcome::InProgress,
        AttemptOutcome::Succeeded,
        AttemptOutcome::FailedNetwork,
        AttemptOutcome::FailedVerification,
        AttemptOutcome::Abandoned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::InProgress => "in_progress",
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::FailedNetwork => "failed_network",
            AttemptOutcome::FailedVerification => "failed_verification",
            AttemptOutcome::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.as_str() == raw)
    }

    pub fn is_terminal(self) -> bool {
        self != AttemptOutcome::InProgress
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadAttempt {
    pub report_id: String,
    pub attempt_number: u32,
    pub proxy_node_id: Option<String>,
    pub bytes_at_resume: u64,
    pub started_at: i64,
    pub outcome: AttemptOutcome,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRecord {
    pub report_id: String,
    pub extracted_at: i64,
    pub output_dir: PathBuf,
    pub file_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub categories: u64,
    pub by_status: Vec<(ReportStatus, u64)>,
    pub attempts: u64,
    pub extractions: u64,
}

impl StoreStats {
    pub fn count(&self, status: ReportStatus) -> u64 {
        self.by_status
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn total_reports(&self) -> u64 {
        self.by_status.iter().map(|(_, n)| n).sum()
    }
}
