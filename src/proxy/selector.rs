//! 传输路径选择：代理节点或直连。

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::node::ProxyNode;
use super::pool::ProxyPool;

/// 节点池耗尽时的处理方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    #[default]
    Direct,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Node(ProxyNode),
}

impl Route {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Route::Direct => None,
            Route::Node(node) => Some(&node.id),
        }
    }

    pub fn label(&self) -> &str {
        self.node_id().unwrap_or("direct")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("所有代理节点均不可用")]
pub struct PoolExhausted;

pub struct TransportSelector {
    pool: Arc<ProxyPool>,
    fallback: FallbackPolicy,
}

impl TransportSelector {
    pub fn new(pool: Arc<ProxyPool>, fallback: FallbackPolicy) -> Self {
        Self { pool, fallback }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// 没有配置节点时总是直连；排除集合覆盖了全部可用节点时，
    /// 先忽略排除集合再选一次，仍无结果才按回退策略处理。
    pub fn select(&self, excluding: &HashSet<String>) -> Result<Route, PoolExhausted> {
        if self.pool.is_empty() {
            return Ok(Route::Direct);
        }
        if let Some(node) = self.pool.select_node(excluding) {
            return Ok(Route::Node(node));
        }
        if !excluding.is_empty()
            && let Some(node) = self.pool.select_node(&HashSet::new())
        {
            debug!(target: "proxy", "排除列表已覆盖全部节点，重新使用 {}", node.id);
            return Ok(Route::Node(node));
        }
        match self.fallback {
            FallbackPolicy::Direct => {
                debug!(target: "proxy", "节点池耗尽，回退直连");
                Ok(Route::Direct)
            }
            FallbackPolicy::Fail => Err(PoolExhausted),
        }
    }

    pub fn report_success(&self, route: &Route) {
        if let Route::Node(node) = route {
            self.pool.report_success(&node.id);
        }
    }

    pub fn report_failure(&self, route: &Route) {
        if let Route::Node(node) = route {
            self.pool.report_failure(&node.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::clock::ManualClock;
    use crate::proxy::pool::PoolSettings;
    use crate::proxy::pool::tests::{FakeDialer, nodes};
    use std::time::Duration;

    fn selector(ids: &[&str], fallback: FallbackPolicy) -> (TransportSelector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let pool = ProxyPool::new(nodes(ids), PoolSettings::default(), clock.clone());
        (TransportSelector::new(Arc::new(pool), fallback), clock)
    }

    #[test]
    fn empty_pool_always_goes_direct() {
        let (sel, _) = selector(&[], FallbackPolicy::Fail);
        assert_eq!(sel.select(&HashSet::new()), Ok(Route::Direct));
    }

    #[test]
    fn exclusion_covering_everything_is_ignored() {
        let (sel, _) = selector(&["a", "b"], FallbackPolicy::Fail);
        let excluding: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let route = sel.select(&excluding).unwrap();
        assert_eq!(route.node_id(), Some("a"));
    }

    #[test]
    fn exhausted_pool_follows_fallback_policy() {
        let (fail, _) = selector(&["a"], FallbackPolicy::Fail);
        let (direct, _) = selector(&["a"], FallbackPolicy::Direct);
        for _ in 0..3 {
            fail.pool().report_failure("a");
            direct.pool().report_failure("a");
        }
        assert_eq!(fail.select(&HashSet::new()), Err(PoolExhausted));
        assert_eq!(direct.select(&HashSet::new()), Ok(Route::Direct));
    }

    #[test]
    fn rotates_away_from_failing_node_over_simulated_time() {
        let (sel, clock) = selector(&["fast", "slow"], FallbackPolicy::Fail);
        sel.pool().measure_all(
            &FakeDialer::new(&[("fast", 20), ("slow", 200)]),
            Duration::from_secs(1),
        );

        let first = sel.select(&HashSet::new()).unwrap();
        assert_eq!(first.label(), "fast");
        for _ in 0..3 {
            sel.report_failure(&first);
        }
        assert_eq!(sel.select(&HashSet::new()).unwrap().label(), "slow");

        clock.advance(Duration::from_secs(30));
        let back = sel.select(&HashSet::new()).unwrap();
        assert_eq!(back.label(), "fast");
        sel.report_success(&back);
        sel.report_failure(&back);
        // 成功后计数已清零，单次失败不再拉黑
        assert_eq!(sel.select(&HashSet::new()).unwrap().label(), "fast");
    }
}
