//! 基础设施模块。
//!
//! 子模块：
//! - `config`：YAML 配置加载与带注释的默认配置生成
//! - `context`：全局配置结构与默认值
//! - `logging`：控制台/文件日志与退出时归档
//! - `clock`：可替换时钟（测试用手动时钟）
//! - `backoff`：重试等待时间计算

pub mod backoff;
pub mod clock;
pub mod config;
pub mod context;
pub mod logging;
