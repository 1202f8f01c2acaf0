//! SQLite 状态库。
//!
//! 所有状态变更都在 `BEGIN IMMEDIATE` 事务里做“读当前状态 → 校验迁移表 →
//! 条件更新”，因此同一进程内的多个线程、以及共用同一数据库文件的多个进程
//! 之间都不会重复领取同一条报告。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::layout::{ReportLayout, derive_report_id};
use super::models::{
    AttemptOutcome, Category, DownloadAttempt, ExtractionRecord, Report, ReportRecord,
    ReportStatus, StoreStats,
};

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    list_url TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS reports (
    id TEXT PRIMARY KEY,
    category_id TEXT NOT NULL,
    title TEXT NOT NULL,
    source_page_url TEXT NOT NULL,
    download_url TEXT,
    status TEXT NOT NULL,
    expected_file_path TEXT NOT NULL,
    file_size_bytes INTEGER,
    expected_checksum TEXT,
    content_checksum TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    claimed_by TEXT,
    heartbeat_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status, category_id);
CREATE TABLE IF NOT EXISTS download_attempts (
    report_id TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    proxy_node_id TEXT,
    bytes_at_resume INTEGER NOT NULL,
    started_at INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    finished_at INTEGER,
    error TEXT,
    PRIMARY KEY (report_id, attempt_number)
);
CREATE TABLE IF NOT EXISTS extractions (
    report_id TEXT PRIMARY KEY,
    extracted_at INTEGER NOT NULL,
    output_dir TEXT NOT NULL,
    file_count INTEGER NOT NULL
);
";

const REPORT_COLUMNS: &str = "id, category_id, title, source_page_url, download_url, status, \
     expected_file_path, file_size_bytes, expected_checksum, content_checksum, attempt_count, \
     last_error, claimed_by, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("database busy: {0}")]
    Conflict(String),
    #[error("report {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ReportStatus,
        to: ReportStatus,
    },
    #[error("report not found: {0}")]
    NotFound(String),
    #[error("attempt {attempt_number} of report {report_id} is not in progress")]
    AttemptClosed {
        report_id: String,
        attempt_number: u32,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("unsupported schema version {found} (supported: {supported})")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Conflict(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub struct StateStore {
    conn: Mutex<Connection>,
    layout: ReportLayout,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>, layout: ReportLayout) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let store = Self {
            conn: Mutex::new(conn),
            layout,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn layout(&self) -> &ReportLayout {
        &self.layout
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        if current < 1 {
            tx.execute_batch(SCHEMA_V1)?;
            tx.execute_batch("PRAGMA user_version = 1")?;
            debug!(target: "store", "schema migrated to v1");
        }
        tx.commit()?;
        Ok(())
    }

    // ── 爬虫侧写入 ──────────────────────────────────────────────

    pub fn upsert_category(&self, category: &Category) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT OR IGNORE INTO categories (id, name, list_url, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![category.id, category.name, category.list_url, unix_now()],
        )?;
        Ok(())
    }

    pub fn category(&self, id: &str) -> Result<Option<Category>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, list_url FROM categories WHERE id = ?1",
                [id],
                |row| {
                    Ok(Category {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        list_url: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// 新报告以 `pending` 入库；已存在的报告只在仍为 `pending` 时刷新标题与路径。
    /// 返回报告 id。
    pub fn upsert_report(&self, record: &ReportRecord) -> Result<String, StoreError> {
        let id = record
            .id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| derive_report_id(&record.source_page_url));

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let category_name = category_name(&tx, &record.category_id)?;
        let path = self.layout.expected_file_path(
            &record.category_id,
            category_name.as_deref(),
            &record.title,
            None,
        );
        let now = unix_now();
        tx.execute(
            "INSERT INTO reports (id, category_id, title, source_page_url, status,
                                  expected_file_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 category_id = excluded.category_id,
                 title = excluded.title,
                 source_page_url = excluded.source_page_url,
                 expected_file_path = excluded.expected_file_path,
                 updated_at = excluded.updated_at
             WHERE reports.status = ?5",
            params![
                id,
                record.category_id,
                record.title,
                record.source_page_url,
                ReportStatus::Pending.as_str(),
                path_to_sql(&path),
                now,
            ],
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// 记录解析出的下载地址并置为 `ready`，同时按地址扩展名重算目标路径。
    pub fn set_download_url(
        &self,
        id: &str,
        url: &str,
        file_size: Option<u64>,
        checksum: Option<&str>,
    ) -> Result<(), StoreError> {
        let layout = &self.layout;
        self.transition(id, ReportStatus::Ready, |tx, report| {
            let category_name = category_name(tx, &report.category_id)?;
            let path = layout.expected_file_path(
                &report.category_id,
                category_name.as_deref(),
                &report.title,
                Some(url),
            );
            tx.execute(
                "UPDATE reports SET download_url = ?2, file_size_bytes = ?3,
                        expected_checksum = ?4, expected_file_path = ?5, last_error = NULL
                 WHERE id = ?1",
                params![
                    id,
                    url,
                    file_size.map(to_sql_u64),
                    checksum.map(|c| c.trim().to_ascii_lowercase()),
                    path_to_sql(&path),
                ],
            )?;
            Ok(())
        })
    }

    pub fn mark_no_download_url(&self, id: &str) -> Result<(), StoreError> {
        self.transition(id, ReportStatus::NoDownloadUrl, |tx, _| {
            tx.execute(
                "UPDATE reports SET download_url = NULL, claimed_by = NULL, heartbeat_at = NULL
                 WHERE id = ?1",
                [id],
            )?;
            Ok(())
        })
    }

    // ── 下载侧操作 ──────────────────────────────────────────────

    /// 原子地把至多 `limit` 条 `ready` 报告置为 `downloading` 并记录领取者。
    pub fn claim_next_ready(
        &self,
        limit: usize,
        owner: &str,
        category: Option<&str>,
    ) -> Result<Vec<Report>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM reports
                 WHERE status = ?1 AND (?2 IS NULL OR category_id = ?2)
                 ORDER BY updated_at ASC, id ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![
                    ReportStatus::Ready.as_str(),
                    category,
                    i64::try_from(limit).unwrap_or(i64::MAX)
                ],
                |row| row.get(0),
            )?;
            rows.collect::<Result<_, _>>()?
        };

        let now = unix_now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let changes = tx.execute(
                "UPDATE reports
                 SET status = ?2, claimed_by = ?3, heartbeat_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND status = ?5",
                params![
                    id,
                    ReportStatus::Downloading.as_str(),
                    owner,
                    now,
                    ReportStatus::Ready.as_str(),
                ],
            )?;
            if changes == 1
                && let Some(report) = load_report(&tx, &id)?
            {
                claimed.push(report);
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// 强制重新下载：原子地把一条 `downloaded` 报告直接置为 `downloading`
    /// （等价于 `downloaded → ready → downloading`）。报告已不是 `downloaded`
    /// 时返回 `None`。已记录的大小与校验和保留，供中途归还时还原。
    pub fn claim_downloaded(&self, id: &str, owner: &str) -> Result<Option<Report>, StoreError> {
        debug_assert!(
            ReportStatus::Downloaded.can_transition_to(ReportStatus::Ready)
                && ReportStatus::Ready.can_transition_to(ReportStatus::Downloading)
        );
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = unix_now();
        let changes = tx.execute(
            "UPDATE reports
             SET status = ?2, claimed_by = ?3, heartbeat_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status = ?5",
            params![
                id,
                ReportStatus::Downloading.as_str(),
                owner,
                now,
                ReportStatus::Downloaded.as_str(),
            ],
        )?;
        if changes != 1 {
            return Ok(None);
        }
        let report = load_report(&tx, id)?;
        tx.commit()?;
        debug!(target: "store", "report {} downloaded -> downloading (forced)", id);
        Ok(report)
    }

    /// 刷新领取心跳；报告已不属于 `owner` 时返回 `false`。
    pub fn heartbeat(&self, id: &str, owner: &str) -> Result<bool, StoreError> {
        let changes = self.lock().execute(
            "UPDATE reports SET heartbeat_at = ?3
             WHERE id = ?1 AND claimed_by = ?2 AND status = ?4",
            params![id, owner, unix_now(), ReportStatus::Downloading.as_str()],
        )?;
        Ok(changes == 1)
    }

    pub fn mark_downloaded(&self, id: &str, size: u64, checksum: &str) -> Result<(), StoreError> {
        self.transition(id, ReportStatus::Downloaded, |tx, _| {
            tx.execute(
                "UPDATE reports SET file_size_bytes = ?2, content_checksum = ?3, last_error = NULL,
                        claimed_by = NULL, heartbeat_at = NULL
                 WHERE id = ?1",
                params![id, to_sql_u64(size), checksum],
            )?;
            Ok(())
        })
    }

    pub fn mark_failed(&self, id: &str, error: &str) -> Result<(), StoreError> {
        self.transition(id, ReportStatus::Failed, |tx, _| {
            tx.execute(
                "UPDATE reports SET attempt_count = attempt_count + 1, last_error = ?2,
                        claimed_by = NULL, heartbeat_at = NULL
                 WHERE id = ?1",
                params![id, error],
            )?;
            Ok(())
        })
    }

    /// 归还领取（取消、节点池耗尽时使用）：`downloading → ready`。
    pub fn release_claim(&self, id: &str) -> Result<(), StoreError> {
        self.transition(id, ReportStatus::Ready, |tx, report| {
            if report.status != ReportStatus::Downloading {
                return Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: report.status,
                    to: ReportStatus::Ready,
                });
            }
            tx.execute(
                "UPDATE reports SET claimed_by = NULL, heartbeat_at = NULL WHERE id = ?1",
                [id],
            )?;
            Ok(())
        })
    }

    /// 把失败的报告重新排队，返回受影响条数。
    pub fn requeue_failed(&self, category: Option<&str>) -> Result<usize, StoreError> {
        let changes = self.lock().execute(
            "UPDATE reports SET status = ?1, updated_at = ?3
             WHERE status = ?2 AND (?4 IS NULL OR category_id = ?4)",
            params![
                ReportStatus::Ready.as_str(),
                ReportStatus::Failed.as_str(),
                unix_now(),
                category,
            ],
        )?;
        if changes > 0 {
            info!(target: "store", "重新排队 {} 个失败报告", changes);
        }
        Ok(changes)
    }

    /// 对账用：`downloaded → ready`。
    pub fn reset_to_ready(&self, id: &str) -> Result<(), StoreError> {
        self.transition(id, ReportStatus::Ready, |tx, report| {
            if report.status != ReportStatus::Downloaded {
                return Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: report.status,
                    to: ReportStatus::Ready,
                });
            }
            tx.execute(
                "UPDATE reports SET content_checksum = NULL WHERE id = ?1",
                [id],
            )?;
            Ok(())
        })
    }

    /// 状态为 `downloaded`，且目标文件存在、大小与记录一致。
    pub fn exists_completed_and_verified(&self, id: &str) -> Result<bool, StoreError> {
        let Some(report) = self.report(id)? else {
            return Ok(false);
        };
        if report.status != ReportStatus::Downloaded {
            return Ok(false);
        }
        let Some(expected) = report.file_size_bytes else {
            return Ok(false);
        };
        Ok(fs::metadata(&report.expected_file_path)
            .map(|meta| meta.is_file() && meta.len() == expected)
            .unwrap_or(false))
    }

    /// 回收心跳超时的领取：报告回到 `ready`，进行中的尝试记为 `abandoned`。
    pub fn recover_stale_claims(&self, older_than: Duration) -> Result<usize, StoreError> {
        let now = unix_now();
        let cutoff = now.saturating_sub(i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX));
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM reports
                 WHERE status = ?1 AND (heartbeat_at IS NULL OR heartbeat_at <= ?2)",
            )?;
            let rows = stmt.query_map(
                params![ReportStatus::Downloading.as_str(), cutoff],
                |row| row.get(0),
            )?;
            rows.collect::<Result<_, _>>()?
        };
        for id in &stale {
            tx.execute(
                "UPDATE download_attempts SET outcome = ?2, finished_at = ?3,
                        error = COALESCE(error, 'claim expired')
                 WHERE report_id = ?1 AND outcome = ?4",
                params![
                    id,
                    AttemptOutcome::Abandoned.as_str(),
                    now,
                    AttemptOutcome::InProgress.as_str(),
                ],
            )?;
            tx.execute(
                "UPDATE reports SET status = ?2, claimed_by = NULL, heartbeat_at = NULL,
                        updated_at = ?3
                 WHERE id = ?1",
                params![id, ReportStatus::Ready.as_str(), now],
            )?;
        }
        tx.commit()?;
        if !stale.is_empty() {
            info!(target: "store", "回收 {} 个遗留的下载中任务", stale.len());
        }
        Ok(stale.len())
    }

    // ── 下载尝试 ────────────────────────────────────────────────

    /// 追加一条进行中的尝试记录，返回尝试序号（从 1 开始）。
    pub fn begin_attempt(
        &self,
        report_id: &str,
        proxy_node_id: Option<&str>,
        bytes_at_resume: u64,
    ) -> Result<u32, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let last: Option<i64> = tx.query_row(
            "SELECT MAX(attempt_number) FROM download_attempts WHERE report_id = ?1",
            [report_id],
            |row| row.get(0),
        )?;
        let number = last.unwrap_or(0) + 1;
        tx.execute(
            "INSERT INTO download_attempts
                 (report_id, attempt_number, proxy_node_id, bytes_at_resume, started_at, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report_id,
                number,
                proxy_node_id,
                to_sql_u64(bytes_at_resume),
                unix_now(),
                AttemptOutcome::InProgress.as_str(),
            ],
        )?;
        tx.commit()?;
        u32::try_from(number).map_err(|_| StoreError::Corrupt(format!("attempt number {number}")))
    }

    /// 结束一次尝试；只有 `in_progress` 的尝试可以被结束。
    pub fn finish_attempt(
        &self,
        report_id: &str,
        attempt_number: u32,
        outcome: AttemptOutcome,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let closed = || StoreError::AttemptClosed {
            report_id: report_id.to_string(),
            attempt_number,
        };
        if !outcome.is_terminal() {
            return Err(closed());
        }
        let changes = self.lock().execute(
            "UPDATE download_attempts SET outcome = ?3, finished_at = ?4, error = ?5
             WHERE report_id = ?1 AND attempt_number = ?2 AND outcome = ?6",
            params![
                report_id,
                attempt_number,
                outcome.as_str(),
                unix_now(),
                error,
                AttemptOutcome::InProgress.as_str(),
            ],
        )?;
        if changes == 0 {
            return Err(closed());
        }
        Ok(())
    }

    pub fn attempts_for(&self, report_id: &str) -> Result<Vec<DownloadAttempt>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT report_id, attempt_number, proxy_node_id, bytes_at_resume, started_at,
                    outcome, finished_at, error
             FROM download_attempts WHERE report_id = ?1 ORDER BY attempt_number ASC",
        )?;
        let rows = stmt.query_map([report_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut attempts = Vec::new();
        for row in rows {
            let (report_id, attempt_number, proxy_node_id, bytes, started_at, outcome, finished_at, error) =
                row?;
            let outcome = AttemptOutcome::parse(&outcome)
                .ok_or_else(|| StoreError::Corrupt(format!("attempt outcome '{outcome}'")))?;
            attempts.push(DownloadAttempt {
                report_id,
                attempt_number,
                proxy_node_id,
                bytes_at_resume: from_sql_u64(bytes)?,
                started_at,
                outcome,
                finished_at,
                error,
            });
        }
        Ok(attempts)
    }

    // ── 解压记录 ────────────────────────────────────────────────

    /// 每个报告只保留一条记录，重复解压时替换。
    pub fn record_extraction(&self, record: &ExtractionRecord) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT OR REPLACE INTO extractions (report_id, extracted_at, output_dir, file_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.report_id,
                record.extracted_at,
                path_to_sql(&record.output_dir),
                i64::try_from(record.file_count).unwrap_or(i64::MAX),
            ],
        )?;
        Ok(())
    }

    pub fn extraction_for(&self, report_id: &str) -> Result<Option<ExtractionRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT report_id, extracted_at, output_dir, file_count
                 FROM extractions WHERE report_id = ?1",
                [report_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(report_id, extracted_at, output_dir, file_count)| -> Result<_, StoreError> {
                Ok(ExtractionRecord {
                report_id,
                extracted_at,
                output_dir: PathBuf::from(output_dir),
                    file_count: usize::try_from(file_count)
                        .map_err(|_| StoreError::Corrupt(format!("file_count {file_count}")))?,
                })
            },
        )
        .transpose()
    }

    // ── 查询 ────────────────────────────────────────────────────

    pub fn report(&self, id: &str) -> Result<Option<Report>, StoreError> {
        let conn = self.lock();
        load_report(&conn, id)
    }

    pub fn reports_with_status(
        &self,
        status: ReportStatus,
        category: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Report>, StoreError> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM reports
             WHERE status = ?1 AND (?2 IS NULL OR category_id = ?2)
             ORDER BY updated_at ASC, id ASC
             LIMIT ?3"
        );
        let limit = limit
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str(), category, limit], read_report_row)?;
        let mut reports = Vec::new();
        for row in rows {
            reports.push(row?.into_report()?);
        }
        Ok(reports)
    }

    pub fn count_with_status(
        &self,
        status: ReportStatus,
        category: Option<&str>,
    ) -> Result<u64, StoreError> {
        let n: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM reports WHERE status = ?1 AND (?2 IS NULL OR category_id = ?2)",
            params![status.as_str(), category],
            |row| row.get(0),
        )?;
        from_sql_u64(n)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock();
        let count = |sql: &str| -> Result<u64, StoreError> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            from_sql_u64(n)
        };
        let categories = count("SELECT COUNT(*) FROM categories")?;
        let attempts = count("SELECT COUNT(*) FROM download_attempts")?;
        let extractions = count("SELECT COUNT(*) FROM extractions")?;

        let mut by_status: Vec<(ReportStatus, u64)> =
            ReportStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM reports GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (raw, n) = row?;
            let status = ReportStatus::parse(&raw)
                .ok_or_else(|| StoreError::Corrupt(format!("report status '{raw}'")))?;
            if let Some(slot) = by_status.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = from_sql_u64(n)?;
            }
        }

        Ok(StoreStats {
            categories,
            by_status,
            attempts,
            extractions,
        })
    }

    /// 在一个 IMMEDIATE 事务中完成“校验迁移 → 条件更新状态 → 附加更新”。
    fn transition<F>(&self, id: &str, to: ReportStatus, extra: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Transaction<'_>, &Report) -> Result<(), StoreError>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report = load_report(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !report.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: report.status,
                to,
            });
        }
        extra(&tx, &report)?;
        let changes = tx.execute(
            "UPDATE reports SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
            params![id, to.as_str(), unix_now(), report.status.as_str()],
        )?;
        if changes != 1 {
            return Err(StoreError::Conflict(format!(
                "report {id} changed during transition"
            )));
        }
        tx.commit()?;
        debug!(target: "store", "report {} {} -> {}", id, report.status, to);
        Ok(())
    }
}

struct RawReport {
    id: String,
    category_id: String,
    title: String,
    source_page_url: String,
    download_url: Option<String>,
    status: String,
    expected_file_path: String,
    file_size_bytes: Option<i64>,
    expected_checksum: Option<String>,
    content_checksum: Option<String>,
    attempt_count: u32,
    last_error: Option<String>,
    claimed_by: Option<String>,
    updated_at: i64,
}

impl RawReport {
    fn into_report(self) -> Result<Report, StoreError> {
        let status = ReportStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("report status '{}'", self.status)))?;
        Ok(Report {
            id: self.id,
            category_id: self.category_id,
            title: self.title,
            source_page_url: self.source_page_url,
            download_url: self.download_url,
            status,
            expected_file_path: PathBuf::from(self.expected_file_path),
            file_size_bytes: self.file_size_bytes.map(from_sql_u64).transpose()?,
            expected_checksum: self.expected_checksum,
            content_checksum: self.content_checksum,
            attempt_count: self.attempt_count,
            last_error: self.last_error,
            claimed_by: self.claimed_by,
            updated_at: self.updated_at,
        })
    }
}

fn read_report_row(row: &Row<'_>) -> rusqlite::Result<RawReport> {
    Ok(RawReport {
        id: row.get(0)?,
        category_id: row.get(1)?,
        title: row.get(2)?,
        source_page_url: row.get(3)?,
        download_url: row.get(4)?,
        status: row.get(5)?,
        expected_file_path: row.get(6)?,
        file_size_bytes: row.get(7)?,
        expected_checksum: row.get(8)?,
        content_checksum: row.get(9)?,
        attempt_count: row.get(10)?,
        last_error: row.get(11)?,
        claimed_by: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn load_report(conn: &Connection, id: &str) -> Result<Option<Report>, StoreError> {
    let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?1");
    conn.query_row(&sql, [id], read_report_row)
        .optional()?
        .map(RawReport::into_report)
        .transpose()
}

fn category_name(conn: &Connection, category_id: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT name FROM categories WHERE id = ?1",
            [category_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn path_to_sql(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn to_sql_u64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql_u64(v: i64) -> Result<u64, StoreError> {
    u64::try_from(v).map_err(|_| StoreError::Corrupt(format!("negative value {v}")))
}
