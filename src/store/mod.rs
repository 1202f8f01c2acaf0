//! 持久化状态：报告、下载尝试、解压记录。
//!
//! 子模块：
//! - `models`：数据模型与状态迁移表
//! - `layout`：磁盘布局与文件名清理
//! - `state_store`：SQLite 状态库

pub mod layout;
pub mod models;
pub mod state_store;

pub use layout::ReportLayout;
pub use models::{
    AttemptOutcome, Category, ExtractionRecord, Report, ReportRecord, ReportStatus, StoreStats,
};
pub use state_store::{StateStore, StoreError};
