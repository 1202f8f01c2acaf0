//! 单个报告的重试状态机。

use std::collections::HashSet;
use std::time::{Duration, Instant};

use super::error::{FailureClass, TransferError};
use crate::base_system::backoff::retry_delay;
use crate::base_system::context::Config;
use crate::proxy::selector::Route;
use crate::store::AttemptOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_wait_ms: 1000,
            max_wait_ms: 8000,
        }
    }
}

impl RetrySettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.max_retries,
            min_wait_ms: cfg.min_wait_time,
            max_wait_ms: cfg.max_wait_time,
        }
    }
}

/// 放弃重试时对报告采取的动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalAction {
    MarkFailed,
    MarkNoDownloadUrl,
    /// 归还领取，报告回到 `ready`
    ReleaseClaim,
    /// 取消：归还领取并让 worker 退出
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { after: Duration },
    Terminal(TerminalAction),
}

#[derive(Debug, Clone, Default)]
pub struct AttemptPlan {
    attempt: u32,
    network_retries: u32,
    verification_retry_used: bool,
    excluded: HashSet<String>,
    force_restart: bool,
    next_eligible: Option<Instant>,
    last_error: Option<String>,
}

impl AttemptPlan {
    pub fn new(force_restart: bool) -> Self {
        Self {
            force_restart,
            ..Self::default()
        }
    }

    /// 已开始的尝试次数。
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn excluded(&self) -> &HashSet<String> {
        &self.excluded
    }

    pub fn next_eligible(&self) -> Option<Instant> {
        self.next_eligible
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// 至少尝试过一次且网络重试额度已用完：节点池耗尽时不再为它等待。
    pub fn retries_exhausted(&self, settings: &RetrySettings) -> bool {
        self.attempt > 0 && self.network_retries >= settings.max_retries
    }

    /// 归还后重新领取时继续使用：保留重试计数，清空本轮排除的节点，
    /// 由黑名单决定节点是否可用。
    pub fn resume(&mut self) {
        self.excluded.clear();
        self.next_eligible = None;
    }

    /// 开始下一次尝试，返回本次是否需要从零开始。
    pub fn start_attempt(&mut self) -> bool {
        self.attempt += 1;
        self.next_eligible = None;
        std::mem::take(&mut self.force_restart)
    }

    pub fn on_failure(
        &mut self,
        err: &TransferError,
        route: &Route,
        settings: &RetrySettings,
        now: Instant,
    ) -> Decision {
        self.last_error = Some(err.summary());
        match err.class() {
            FailureClass::Network => {
                if let Some(id) = route.node_id() {
                    self.excluded.insert(id.to_string());
                }
                if self.network_retries >= settings.max_retries {
                    return Decision::Terminal(TerminalAction::MarkFailed);
                }
                let after = match err {
                    TransferError::Blocked { .. } => Duration::ZERO,
                    _ => retry_delay(settings.min_wait_ms, settings.max_wait_ms, self.network_retries),
                };
                self.network_retries += 1;
                self.next_eligible = Some(now + after);
                Decision::Retry { after }
            }
            FailureClass::Verification => {
                if self.verification_retry_used {
                    return Decision::Terminal(TerminalAction::MarkFailed);
                }
                self.verification_retry_used = true;
                self.force_restart = true;
                self.next_eligible = Some(now);
                Decision::Retry { after: Duration::ZERO }
            }
            FailureClass::NoDownloadUrl => Decision::Terminal(TerminalAction::MarkNoDownloadUrl),
            FailureClass::PoolExhausted | FailureClass::StoreConflict => {
                Decision::Terminal(TerminalAction::ReleaseClaim)
            }
            FailureClass::Cancelled => Decision::Terminal(TerminalAction::Abandon),
            FailureClass::Local => Decision::Terminal(TerminalAction::MarkFailed),
        }
    }
}

/// 失败尝试在 `download_attempts` 中的结果。
pub fn attempt_outcome(err: &TransferError) -> AttemptOutcome {
    match err.class() {
        FailureClass::Verification => AttemptOutcome::FailedVerification,
        FailureClass::Cancelled => AttemptOutcome::Abandoned,
        _ => AttemptOutcome::FailedNetwork,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::node::ProxyNode;

    fn node_route(id: &str) -> Route {
        Route::Node(ProxyNode::parse(id, "http://127.0.0.1:7890").unwrap())
    }

    fn settings() -> RetrySettings {
        RetrySettings {
            max_retries: 3,
            min_wait_ms: 100,
            max_wait_ms: 300,
        }
    }

    #[test]
    fn network_failures_back_off_and_exclude_nodes() {
        let now = Instant::now();
        let mut plan = AttemptPlan::new(false);
        let err = TransferError::Network("reset".into());
        let mut delays = Vec::new();
        for id in ["a", "b", "c"] {
            plan.start_attempt();
            match plan.on_failure(&err, &node_route(id), &settings(), now) {
                Decision::Retry { after } => delays.push(after.as_millis()),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(delays, vec![100, 200, 300]);
        assert_eq!(plan.next_eligible(), Some(now + Duration::from_millis(300)));
        assert_eq!(plan.excluded().len(), 3);

        plan.start_attempt();
        assert_eq!(
            plan.on_failure(&err, &Route::Direct, &settings(), now),
            Decision::Terminal(TerminalAction::MarkFailed)
        );
        assert_eq!(plan.attempt(), 4);
    }

    #[test]
    fn resumed_plan_keeps_retry_count_but_forgets_exclusions() {
        let now = Instant::now();
        let mut plan = AttemptPlan::new(false);
        let no_retries = RetrySettings {
            max_retries: 0,
            ..settings()
        };
        assert!(!plan.retries_exhausted(&no_retries));
        let err = TransferError::Network("HTTP 503".into());
        for _ in 0..3 {
            plan.start_attempt();
            assert!(!plan.retries_exhausted(&settings()));
            plan.on_failure(&err, &node_route("only"), &settings(), now);
            assert!(plan.excluded().contains("only"));
            plan.resume();
            assert!(plan.excluded().is_empty());
            assert_eq!(plan.next_eligible(), None);
        }
        assert!(plan.retries_exhausted(&settings()));
        assert_eq!(plan.attempt(), 3);
        assert_eq!(plan.last_error(), Some(err.summary().as_str()));
    }

    #[test]
    fn blocked_retries_immediately() {
        let mut plan = AttemptPlan::new(false);
        let decision = plan.on_failure(
            &TransferError::Blocked { status: 403 },
            &node_route("a"),
            &settings(),
            Instant::now(),
        );
        assert_eq!(decision, Decision::Retry { after: Duration::ZERO });
        assert!(plan.excluded().contains("a"));
    }

    #[test]
    fn verification_gets_one_forced_restart() {
        let mut plan = AttemptPlan::new(false);
        assert!(!plan.start_attempt());
        let err = TransferError::Verification("size".into());
        assert_eq!(
            plan.on_failure(&err, &Route::Direct, &settings(), Instant::now()),
            Decision::Retry { after: Duration::ZERO }
        );
        assert!(plan.start_attempt());
        assert_eq!(
            plan.on_failure(&err, &Route::Direct, &settings(), Instant::now()),
            Decision::Terminal(TerminalAction::MarkFailed)
        );
    }

    #[test]
    fn terminal_classes() {
        let mut plan = AttemptPlan::new(true);
        assert!(plan.start_attempt());
        let now = Instant::now();
        let cases = [
            (TransferError::Gone { status: 404 }, TerminalAction::MarkNoDownloadUrl),
            (TransferError::NoDownloadUrl, TerminalAction::MarkNoDownloadUrl),
            (
                TransferError::PoolExhausted(crate::proxy::selector::PoolExhausted),
                TerminalAction::ReleaseClaim,
            ),
            (TransferError::Cancelled, TerminalAction::Abandon),
            (
                TransferError::io("/tmp/x", std::io::Error::other("disk full")),
                TerminalAction::MarkFailed,
            ),
        ];
        for (err, action) in cases {
            assert_eq!(
                plan.on_failure(&err, &Route::Direct, &settings(), now),
                Decision::Terminal(action)
            );
        }
    }

    #[test]
    fn maps_attempt_outcomes() {
        assert_eq!(
            attempt_outcome(&TransferError::Verification("x".into())),
            AttemptOutcome::FailedVerification
        );
        assert_eq!(attempt_outcome(&TransferError::Cancelled), AttemptOutcome::Abandoned);
        assert_eq!(
            attempt_outcome(&TransferError::Blocked { status: 403 }),
            AttemptOutcome::FailedNetwork
        );
    }
}
