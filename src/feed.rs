//! 爬虫输出（JSON Lines）导入状态库。
//!
//! 每行一个对象，按 `kind` 区分：
//! ```text
//! {"kind":"category","id":"34","name":"经济报告","list_url":"https://site/tags-34.html"}
//! {"kind":"report","id":"26028","category_id":"34","title":"…","source_page_url":"https://site/post/26028.html"}
//! {"kind":"resolution","id":"26028","download_url":"https://x/a.zip","file_size":123,"checksum":null}
//! ```

use std::io::{self, BufRead};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{Category, ReportRecord, ReportStatus, StateStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FeedEntry {
    Category {
        id: String,
        name: String,
        #[serde(default)]
        list_url: String,
    },
    Report {
        id: Option<String>,
        category_id: String,
        title: String,
        source_page_url: String,
    },
    Resolution {
        id: String,
        download_url: Option<String>,
        file_size: Option<u64>,
        checksum: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("read feed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub categories: usize,
    pub reports: usize,
    pub resolved: usize,
    pub no_url: usize,
    /// 已下载或下载中的报告，解析结果不覆盖
    pub unchanged: usize,
    /// 状态不允许或报告不存在
    pub rejected: usize,
    /// 无法解析的行
    pub malformed: usize,
}

/// 逐行导入；`max_resolutions` 限制本次应用的解析结果条数。
pub fn ingest_feed<R: BufRead>(
    store: &StateStore,
    reader: R,
    max_resolutions: Option<usize>,
) -> Result<IngestSummary, FeedError> {
    let mut summary = IngestSummary::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let entry: FeedEntry = match serde_json::from_str(trimmed) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(target: "store", "第 {} 行无法解析，已跳过: {}", index + 1, e);
                summary.malformed += 1;
                continue;
            }
        };
        if matches!(entry, FeedEntry::Resolution { .. })
            && max_resolutions.is_some_and(|max| summary.resolved + summary.no_url >= max)
        {
            continue;
        }
        match apply(store, entry, &mut summary) {
            Ok(()) => {}
            Err(StoreError::InvalidTransition { id, from, to }) => {
                warn!(target: "store", "报告 {} 当前为 {}，不能改为 {}", id, from, to);
                summary.rejected += 1;
            }
            Err(StoreError::NotFound(id)) => {
                warn!(target: "store", "解析结果对应的报告 {} 不存在", id);
                summary.rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(
        target: "store",
        "导入完成：分类 {}，报告 {}，地址 {}，无地址 {}，未变 {}，拒绝 {}，坏行 {}",
        summary.categories,
        summary.reports,
        summary.resolved,
        summary.no_url,
        summary.unchanged,
        summary.rejected,
        summary.malformed
    );
    Ok(summary)
}

fn apply(store: &StateStore, entry: FeedEntry, summary: &mut IngestSummary) -> Result<(), StoreError> {
    match entry {
        FeedEntry::Category { id, name, list_url } => {
            store.upsert_category(&Category { id, name, list_url })?;
            summary.categories += 1;
        }
        FeedEntry::Report {
            id,
            category_id,
            title,
            source_page_url,
        } => {
            let id = store.upsert_report(&ReportRecord {
                id,
                category_id,
                title,
                source_page_url,
            })?;
            debug!(target: "store", "报告 {} 已入库", id);
            summary.reports += 1;
        }
        FeedEntry::Resolution {
            id,
            download_url,
            file_size,
            checksum,
        } => {
            let report = store
                .report(&id)?
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if matches!(report.status, ReportStatus::Downloaded | ReportStatus::Downloading) {
                summary.unchanged += 1;
                return Ok(());
            }
            match download_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
                Some(url) => {
                    store.set_download_url(&id, url, file_size, checksum.as_deref())?;
                    summary.resolved += 1;
                }
                None => {
                    store.mark_no_download_url(&id)?;
                    summary.no_url += 1;
                }
            }
        }
    }
    Ok(())
}
