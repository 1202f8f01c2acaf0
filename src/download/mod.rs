//! 下载流程模块入口。
//!
//! 子模块：
//! - `error`：传输错误与失败类别
//! - `checksum`：SHA-256 校验
//! - `transport`：HTTP 请求（直连或经代理）
//! - `transfer`：可续传的单文件传输
//! - `retry`：单个报告的重试状态机
//! - `progress`：worker 事件汇总与进度条
//! - `orchestrator`：多线程下载编排

pub mod checksum;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod transfer;
pub mod transport;

pub use error::TransferError;
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunParams};
pub use progress::RunSummary;
