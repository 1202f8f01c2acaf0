//! 下载错误分类。

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::proxy::selector::PoolExhausted;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),
    #[error("blocked by upstream (HTTP {status})")]
    Blocked { status: u16 },
    #[error("download url is gone (HTTP {status})")]
    Gone { status: u16 },
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("report has no download url")]
    NoDownloadUrl,
    #[error(transparent)]
    PoolExhausted(#[from] PoolExhausted),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 决定重试策略的错误类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Network,
    Verification,
    NoDownloadUrl,
    PoolExhausted,
    StoreConflict,
    Cancelled,
    Local,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Network => "network",
            FailureClass::Verification => "verification",
            FailureClass::NoDownloadUrl => "no_download_url",
            FailureClass::PoolExhausted => "pool_exhausted",
            FailureClass::StoreConflict => "store_conflict",
            FailureClass::Cancelled => "cancelled",
            FailureClass::Local => "local",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransferError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            TransferError::Network(_) | TransferError::Blocked { .. } => FailureClass::Network,
            TransferError::Verification(_) => FailureClass::Verification,
            TransferError::Gone { .. } | TransferError::NoDownloadUrl => FailureClass::NoDownloadUrl,
            TransferError::PoolExhausted(_) => FailureClass::PoolExhausted,
            TransferError::Cancelled => FailureClass::Cancelled,
            TransferError::Store(err) if err.is_conflict() => FailureClass::StoreConflict,
            TransferError::Io { .. } | TransferError::Store(_) => FailureClass::Local,
        }
    }

    /// 是否应计入所用节点的失败次数。
    pub fn blames_route(&self) -> bool {
        matches!(self, TransferError::Network(_) | TransferError::Blocked { .. })
    }

    /// 写入 `last_error` 的文本：`<类别>: <详情>`。
    pub fn summary(&self) -> String {
        format!("{}: {}", self.class(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert_eq!(TransferError::Blocked { status: 403 }.class(), FailureClass::Network);
        assert_eq!(TransferError::Gone { status: 410 }.class(), FailureClass::NoDownloadUrl);
        assert_eq!(
            TransferError::Store(StoreError::Conflict("busy".into())).class(),
            FailureClass::StoreConflict
        );
        assert_eq!(
            TransferError::Store(StoreError::NotFound("x".into())).class(),
            FailureClass::Local
        );
        assert!(TransferError::Network("reset".into()).blames_route());
        assert!(!TransferError::Verification("size".into()).blames_route());
    }

    #[test]
    fn summary_prefixes_class() {
        let err = TransferError::Network("connection reset".into());
        assert_eq!(err.summary(), "network: network error: connection reset");
    }
}
