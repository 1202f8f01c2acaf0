//! 下载完成后的解压。
//!
//! 子模块：
//! - `archive`：ZIP 解压与文档重命名

pub mod archive;

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::store::{ExtractionRecord, Report, StateStore, StoreError};

pub use archive::ZipExtractor;

/// 已有解压结果时的处理方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractPolicy {
    #[default]
    Overwrite,
    Skip,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("archive error: {0}")]
    Zip(#[from] ::zip::result::ZipError),
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExtractError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ExtractError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub file_count: usize,
    pub files: Vec<PathBuf>,
}

pub trait Extractor: Send + Sync {
    fn supports(&self, archive: &Path) -> bool;
    fn extract(&self, archive: &Path, output_dir: &Path) -> Result<ExtractionSummary, ExtractError>;
}

/// 把报告文件解压到其所在目录并记录结果。
///
/// 文件格式不支持，或策略为 `skip` 且已有解压结果时返回 `Ok(None)`。
pub fn extract_report(
    store: &StateStore,
    extractor: &dyn Extractor,
    report: &Report,
    policy: ExtractPolicy,
) -> Result<Option<ExtractionRecord>, ExtractError> {
    let archive = &report.expected_file_path;
    if !extractor.supports(archive) {
        debug!(target: "extract", "{} 不是压缩包，跳过解压", archive.display());
        return Ok(None);
    }
    let output_dir = archive
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if policy == ExtractPolicy::Skip
        && let Some(previous) = store.extraction_for(&report.id)?
        && previous.output_dir.is_dir()
    {
        debug!(target: "extract", "{} 已解压过，按策略跳过", report.id);
        return Ok(None);
    }

    let summary = extractor.extract(archive, &output_dir)?;
    let record = ExtractionRecord {
        report_id: report.id.clone(),
        extracted_at: OffsetDateTime::now_utc().unix_timestamp(),
        output_dir,
        file_count: summary.file_count,
    };
    store.record_extraction(&record)?;
    info!(
        target: "extract",
        "解压完成：{}（{} 个文件）",
        report.title, record.file_count
    );
    Ok(Some(record))
}
