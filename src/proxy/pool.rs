//! 代理节点池：延迟、健康度与黑名单窗口。
//!
//! 节点永远不会被移除，只会被临时拉黑。每个节点的计数器放在各自的锁里，
//! 多个下载线程可以同时上报不同节点的结果。
//!
//! ```text
//! healthy --[连续失败达到阈值]--> blacklisted(until = now + min(base*2^(n-阈值), max))
//! blacklisted --[窗口到期]--> 可被选中（连续失败数保留，再失败则窗口翻倍）
//! 任意状态 --[report_success]--> healthy（计数清零）
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::dialer::Dialer;
use super::node::ProxyNode;
use crate::base_system::backoff::exponential;
use crate::base_system::clock::Clock;
use crate::base_system::context::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub failure_threshold: u32,
    pub blacklist_base: Duration,
    pub blacklist_max: Duration,
    /// 节点名关键字（不区分大小写），为空表示不限地区
    pub region: Option<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            blacklist_base: Duration::from_secs(30),
            blacklist_max: Duration::from_secs(600),
            region: None,
        }
    }
}

impl PoolSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let base = Duration::from_secs(cfg.proxy_blacklist_base_secs.max(1));
        Self {
            failure_threshold: cfg.proxy_failure_threshold.max(1),
            blacklist_base: base,
            blacklist_max: Duration::from_secs(cfg.proxy_blacklist_max_secs).max(base),
            region: Some(cfg.proxy_region.trim().to_lowercase()).filter(|r| !r.is_empty()),
        }
    }
}

#[derive(Debug, Default)]
struct NodeHealth {
    latency: Option<Duration>,
    consecutive_failures: u32,
    blacklisted_until: Option<Instant>,
}

impl NodeHealth {
    fn is_blacklisted(&self, now: Instant) -> bool {
        self.blacklisted_until.is_some_and(|until| until > now)
    }
}

struct NodeSlot {
    node: ProxyNode,
    health: Mutex<NodeHealth>,
}

impl NodeSlot {
    fn health(&self) -> MutexGuard<'_, NodeHealth> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> ProxyNode {
        let health = self.health();
        ProxyNode {
            latency: health.latency,
            consecutive_failures: health.consecutive_failures,
            ..self.node.clone()
        }
    }
}

/// 节点状态报告，供 `probe` 命令展示。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node: ProxyNode,
    pub blacklisted_for: Option<Duration>,
}

pub struct ProxyPool {
    slots: Vec<NodeSlot>,
    settings: PoolSettings,
    /// 名称匹配地区关键字的节点下标；无匹配时为全部节点
    candidates: Vec<usize>,
    clock: Arc<dyn Clock>,
}

impl ProxyPool {
    pub fn new(nodes: Vec<ProxyNode>, mut settings: PoolSettings, clock: Arc<dyn Clock>) -> Self {
        let slots: Vec<NodeSlot> = nodes
            .into_iter()
            .map(|node| NodeSlot {
                health: Mutex::new(NodeHealth {
                    latency: node.latency,
                    consecutive_failures: node.consecutive_failures,
                    blacklisted_until: None,
                }),
                node,
            })
            .collect();
        settings.region = settings
            .region
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty());
        let candidates = region_candidates(&slots, settings.region.as_deref());
        Self {
            slots,
            settings,
            candidates,
            clock,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// 并发测量所有节点延迟，失败或超时记为无穷大。返回可达节点数。
    pub fn measure_all(&self, dialer: &dyn Dialer, timeout: Duration) -> usize {
        let indices: Vec<usize> = (0..self.slots.len()).collect();
        self.probe_slots(&indices, dialer, timeout)
    }

    /// 重新测量黑名单窗口已到期的节点。返回重新测量的节点数。
    pub fn remeasure_expired(&self, dialer: &dyn Dialer, timeout: Duration) -> usize {
        let now = self.clock.now();
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.health()
                    .blacklisted_until
                    .is_some_and(|until| until <= now)
            })
            .map(|(idx, _)| idx)
            .collect();
        if expired.is_empty() {
            return 0;
        }
        self.probe_slots(&expired, dialer, timeout);
        expired.len()
    }

    fn probe_slots(&self, indices: &[usize], dialer: &dyn Dialer, timeout: Duration) -> usize {
        let results: Vec<(usize, Option<Duration>)> = thread::scope(|scope| {
            let handles: Vec<_> = indices
                .iter()
                .map(|&idx| {
                    let node = &self.slots[idx].node;
                    scope.spawn(move || (idx, dialer.probe(node, timeout).ok()))
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok())
                .collect()
        });

        let mut reachable = 0;
        for (idx, latency) in results {
            let slot = &self.slots[idx];
            match latency {
                Some(latency) => {
                    reachable += 1;
                    let mut health = slot.health();
                    health.latency = Some(latency);
                    health.blacklisted_until = None;
                    debug!(target: "proxy", "节点 {} 延迟 {}ms", slot.node.id, latency.as_millis());
                }
                None => {
                    slot.health().latency = None;
                    debug!(target: "proxy", "节点 {} 不可达", slot.node.id);
                }
            }
        }
        info!(target: "proxy", "节点测速完成: {}/{} 可达", reachable, indices.len());
        reachable
    }

    /// 选出延迟最低的可用节点：只在地区候选中挑选，跳过黑名单和 `excluding`
    /// 中的节点；延迟相同时比较连续失败数，再按加入顺序。
    pub fn select_node(&self, excluding: &HashSet<String>) -> Option<ProxyNode> {
        let now = self.clock.now();
        self.candidates
            .iter()
            .map(|&idx| (idx, &self.slots[idx]))
            .filter(|(_, slot)| !excluding.contains(&slot.node.id))
            .filter_map(|(idx, slot)| {
                let health = slot.health();
                if health.is_blacklisted(now) {
                    return None;
                }
                // None 排在所有有限延迟之后
                let key = (
                    health.latency.is_none(),
                    health.latency.unwrap_or(Duration::MAX),
                    health.consecutive_failures,
                    idx,
                );
                Some((key, slot))
            })
            .min_by_key(|(key, _)| *key)
            .map(|(_, slot)| slot.snapshot())
    }

    pub fn report_failure(&self, node_id: &str) {
        let Some(slot) = self.slot(node_id) else {
            return;
        };
        let now = self.clock.now();
        let mut health = slot.health();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        let failures = health.consecutive_failures;
        if failures >= self.settings.failure_threshold {
            let window = exponential(
                self.settings.blacklist_base,
                self.settings.blacklist_max,
                failures - self.settings.failure_threshold,
            );
            health.blacklisted_until = Some(now + window);
            warn!(
                target: "proxy",
                "节点 {} 连续失败 {} 次，拉黑 {}s",
                node_id,
                failures,
                window.as_secs()
            );
        }
    }

    pub fn report_success(&self, node_id: &str) {
        if let Some(slot) = self.slot(node_id) {
            let mut health = slot.health();
            health.consecutive_failures = 0;
            health.blacklisted_until = None;
        }
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        let now = self.clock.now();
        self.slots
            .iter()
            .map(|slot| {
                let until = slot.health().blacklisted_until;
                NodeStatus {
                    node: slot.snapshot(),
                    blacklisted_for: until.and_then(|u| u.checked_duration_since(now)),
                }
            })
            .collect()
    }

    fn slot(&self, node_id: &str) -> Option<&NodeSlot> {
        self.slots.iter().find(|s| s.node.id == node_id)
    }
}

fn region_candidates(slots: &[NodeSlot], region: Option<&str>) -> Vec<usize> {
    let all: Vec<usize> = (0..slots.len()).collect();
    let Some(region) = region else {
        return all;
    };
    let matched: Vec<usize> = all
        .iter()
        .copied()
        .filter(|&idx| slots[idx].node.id.to_lowercase().contains(region))
        .collect();
    if matched.is_empty() {
        if !slots.is_empty() {
            warn!(target: "proxy", "未找到地区 '{}' 的节点，使用所有节点", region);
        }
        all
    } else {
        info!(target: "proxy", "地区 '{}' 匹配 {}/{} 个节点", region, matched.len(), slots.len());
        matched
    }
}
