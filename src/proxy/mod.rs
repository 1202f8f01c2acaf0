//! 代理节点池与传输路径选择。
//!
//! 子模块：
//! - `node`：节点定义、配置与 Clash 导入
//! - `dialer`：节点延迟探测
//! - `pool`：节点健康度、黑名单与选择
//! - `selector`：代理 / 直连路由与回退策略

pub mod dialer;
pub mod node;
pub mod pool;
pub mod selector;
