//! 可续传的单文件传输：`.part` 暂存、Range 续传、校验、重命名发布。

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use super::checksum::{checksum_matches, sha256_file};
use super::error::TransferError;
use super::transport::{FetchRequest, FetchResponse, Transport};
use crate::proxy::selector::Route;
use crate::store::Report;
use crate::store::layout::staging_path;

/// 一次传输所需的全部信息，由报告记录生成。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub report_id: String,
    pub url: String,
    pub referer: Option<String>,
    pub final_path: PathBuf,
    pub expected_size: Option<u64>,
    pub expected_checksum: Option<String>,
    pub force_restart: bool,
}

impl TransferJob {
    pub fn from_report(report: &Report, send_referer: bool) -> Result<Self, TransferError> {
        let url = report
            .download_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or(TransferError::NoDownloadUrl)?;
        Ok(Self {
            report_id: report.id.clone(),
            url,
            referer: send_referer.then(|| report.source_page_url.clone()),
            final_path: report.expected_file_path.clone(),
            expected_size: report.file_size_bytes,
            expected_checksum: report.expected_checksum.clone(),
            force_restart: false,
        })
    }

    pub fn staging_path(&self) -> PathBuf {
        staging_path(&self.final_path)
    }

    fn expects_html(&self) -> bool {
        self.final_path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
    }
}

/// 已打开的传输：暂存文件写入位置与响应体。
pub struct TransferHandle {
    staging: PathBuf,
    file: File,
    /// `None` 表示暂存文件已完整，无需再请求
    body: Option<Box<dyn Read + Send>>,
    declared_total: Option<u64>,
    resumed_from: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub resumed_from: u64,
}

pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    chunk_size: usize,
    cancel: Arc<AtomicBool>,
}

impl TransferEngine {
    pub fn new(transport: Arc<dyn Transport>, chunk_size: usize, cancel: Arc<AtomicBool>) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
            cancel,
        }
    }

    /// 下一次尝试将从哪个偏移量开始。
    pub fn resume_offset(&self, job: &TransferJob) -> u64 {
        if job.force_restart {
            return 0;
        }
        fs::metadata(job.staging_path())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// 打开/续传 -> 流式写入 -> 校验发布。
    pub fn transfer(
        &self,
        job: &TransferJob,
        route: &Route,
        progress: &mut dyn FnMut(u64),
    ) -> Result<TransferOutcome, TransferError> {
        let mut handle = self.begin_or_resume(job, route)?;
        self.stream(&mut handle, progress)?;
        self.finish(job, handle)
    }

    pub fn begin_or_resume(&self, job: &TransferJob, route: &Route) -> Result<TransferHandle, TransferError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(TransferError::Cancelled);
        }
        let staging = job.staging_path();
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
        }
        if job.force_restart {
            remove_staging(&staging)?;
        }

        let mut offset = fs::metadata(&staging).map(|m| m.len()).unwrap_or(0);
        if let Some(expected) = job.expected_size {
            if offset > expected {
                warn!(target: "download", "暂存文件 {} 超过预期大小（{} > {}），重新下载", staging.display(), offset, expected);
                remove_staging(&staging)?;
                offset = 0;
            } else if offset == expected && offset > 0 {
                debug!(target: "download", "暂存文件已完整：{}", staging.display());
                let file = open_append(&staging)?;
                return Ok(TransferHandle {
                    staging,
                    file,
                    body: None,
                    declared_total: Some(expected),
                    resumed_from: offset,
                });
            }
        }

        if offset > 0 {
            let resp = self.fetch(job, route, Some(offset))?;
            match resp.status {
                206 if resp.content_range.map(|r| r.start) == Some(offset) => {
                    info!(target: "download", "续传 {}，从 {} 字节开始", job.report_id, offset);
                    let declared_total = resp
                        .content_range
                        .and_then(|r| r.total)
                        .or_else(|| resp.content_length.map(|len| offset + len));
                    let file = open_append(&staging)?;
                    return Ok(TransferHandle {
                        staging,
                        file,
                        body: Some(resp.body),
                        declared_total,
                        resumed_from: offset,
                    });
                }
                200 => {
                    info!(target: "download", "服务器忽略了 Range 请求，{} 从头下载", job.report_id);
                    let file = create_truncated(&staging)?;
                    return Ok(TransferHandle {
                        staging,
                        file,
                        body: Some(resp.body),
                        declared_total: resp.content_length,
                        resumed_from: 0,
                    });
                }
                status => {
                    warn!(
                        target: "download",
                        "续传 {} 失败（HTTP {}，Content-Range {:?}），丢弃暂存文件",
                        job.report_id, status, resp.content_range
                    );
                    remove_staging(&staging)?;
                }
            }
        }

        let resp = self.fetch(job, route, None)?;
        if resp.status != 200 {
            return Err(TransferError::Network(format!(
                "unexpected HTTP {} for full request",
                resp.status
            )));
        }
        let file = create_truncated(&staging)?;
        Ok(TransferHandle {
            staging,
            file,
            body: Some(resp.body),
            declared_total: resp.content_length,
            resumed_from: 0,
        })
    }

    /// 按块读取响应体写入暂存文件；中途退出时把已写入部分落盘以便续传。
    pub fn stream(&self, handle: &mut TransferHandle, progress: &mut dyn FnMut(u64)) -> Result<(), TransferError> {
        let Some(body) = handle.body.as_mut() else {
            return Ok(());
        };
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                keep_partial(handle);
                return Err(TransferError::Cancelled);
            }
            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    keep_partial(handle);
                    return Err(TransferError::Network(format!("read body: {e}")));
                }
            };
            handle
                .file
                .write_all(&buf[..n])
                .map_err(|e| TransferError::io(&handle.staging, e))?;
            progress(n as u64);
        }
        handle
            .file
            .sync_all()
            .map_err(|e| TransferError::io(&handle.staging, e))
    }

    /// 校验暂存文件并通过重命名发布。
    pub fn finish(&self, job: &TransferJob, handle: TransferHandle) -> Result<TransferOutcome, TransferError> {
        let TransferHandle {
            staging,
            file,
            declared_total,
            resumed_from,
            ..
        } = handle;
        drop(file);

        let size = fs::metadata(&staging)
            .map_err(|e| TransferError::io(&staging, e))?
            .len();
        if let Some(total) = declared_total
            && size < total
        {
            return Err(TransferError::Network(format!(
                "connection closed early: {size}/{total} bytes"
            )));
        }

        let reject = |reason: String| -> Result<TransferOutcome, TransferError> {
            warn!(target: "download", "{} 校验失败：{}，删除暂存文件", job.report_id, reason);
            remove_staging(&staging)?;
            Err(TransferError::Verification(reason))
        };

        if let Some(total) = declared_total
            && size > total
        {
            return reject(format!("received {size} bytes, server declared {total}"));
        }
        if let Some(expected) = job.expected_size
            && size != expected
        {
            return reject(format!("size {size} != expected {expected}"));
        }
        let checksum = sha256_file(&staging).map_err(|e| TransferError::io(&staging, e))?;
        if let Some(expected) = job.expected_checksum.as_deref()
            && !checksum_matches(&checksum, expected)
        {
            return reject(format!("sha256 {checksum} != expected {}", expected.trim()));
        }

        fs::rename(&staging, &job.final_path).map_err(|e| TransferError::io(&job.final_path, e))?;
        info!(target: "download", "已保存 {}（{} 字节）", job.final_path.display(), size);
        Ok(TransferOutcome {
            path: job.final_path.clone(),
            size,
            checksum,
            resumed_from,
        })
    }

    fn fetch(&self, job: &TransferJob, route: &Route, range_start: Option<u64>) -> Result<FetchResponse, TransferError> {
        let resp = self.transport.fetch(
            route,
            &FetchRequest {
                url: &job.url,
                range_start,
                referer: job.referer.as_deref(),
            },
        )?;
        match resp.status {
            403 => Err(TransferError::Blocked { status: 403 }),
            404 | 410 => Err(TransferError::Gone { status: resp.status }),
            200 | 206
                if !job.expects_html()
                    && resp
                        .content_type
                        .as_deref()
                        .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/html")) =>
            {
                // 防盗链页面通常以 200 + HTML 返回
                Err(TransferError::Blocked { status: resp.status })
            }
            200 | 206 | 416 => Ok(resp),
            status => Err(TransferError::Network(format!("unexpected HTTP {status}"))),
        }
    }
}

fn open_append(path: &Path) -> Result<File, TransferError> {
    OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| TransferError::io(path, e))
}

fn create_truncated(path: &Path) -> Result<File, TransferError> {
    File::create(path).map_err(|e| TransferError::io(path, e))
}

fn keep_partial(handle: &TransferHandle) {
    if let Err(e) = handle.file.sync_data() {
        warn!(target: "download", "暂存文件落盘失败 {}: {}", handle.staging.display(), e);
    }
}

fn remove_staging(path: &Path) -> Result<(), TransferError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransferError::io(path, e)),
    }
}
