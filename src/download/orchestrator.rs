//! 下载编排：固定数量的 worker 各自领取报告、选择路由、传输、更新状态库。
//!
//! 每个 worker 一次只领取一个报告，所以本轮处于 `downloading` 的报告数
//! 不会超过 worker 数。worker 的事件通过 channel 汇总到协调线程。
//!
//! `force` 时 worker 领完 `ready` 后逐个领取本轮未处理过的 `downloaded` 报告，
//! 中途归还则把原文件完好的报告还原为 `downloaded`。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::checksum::{checksum_matches, sha256_file};
use super::error::TransferError;
use super::progress::{ProgressReporter, RunSummary, WorkerEvent};
use super::retry::{AttemptPlan, Decision, RetrySettings, TerminalAction, attempt_outcome};
use super::transfer::{TransferEngine, TransferJob};
use crate::base_system::backoff::exponential;
use crate::base_system::clock::{Clock, sleep_cancellable};
use crate::base_system::context::Config;
use crate::extract::{ExtractPolicy, Extractor, extract_report};
use crate::proxy::dialer::Dialer;
use crate::proxy::selector::TransportSelector;
use crate::store::{AttemptOutcome, Report, ReportStatus, StateStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParams {
    pub max_reports: Option<usize>,
    pub concurrency: usize,
    pub category: Option<String>,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetrySettings,
    pub pool_exhausted_pause: Duration,
    pub stale_claim: Duration,
    pub send_referer: bool,
    pub auto_extract: bool,
    pub extract_policy: ExtractPolicy,
    /// 领取者标识前缀，worker 在其后追加序号
    pub run_id: String,
    pub show_progress: bool,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config, show_progress: bool) -> Self {
        Self {
            retry: RetrySettings::from_config(cfg),
            pool_exhausted_pause: Duration::from_millis(cfg.pool_exhausted_pause_ms),
            stale_claim: Duration::from_secs(cfg.stale_claim_secs),
            send_referer: cfg.send_referer,
            auto_extract: cfg.auto_extract,
            extract_policy: cfg.extract_policy,
            run_id: format!(
                "run-{}-{}",
                std::process::id(),
                OffsetDateTime::now_utc().unix_timestamp()
            ),
            show_progress,
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.stale_claim / 4).max(Duration::from_secs(1))
    }
}

/// 领取后状态库写冲突的最多重试次数。
const STORE_CONFLICT_RETRIES: u32 = 5;

/// 单个报告处理完后 worker 的去向。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// 领取已归还，额度退回
    Released,
    Stop,
}

/// worker 领到的报告。`forced` 表示它是从 `downloaded` 强制领取的。
struct Claim {
    report: Report,
    forced: bool,
}

/// 一轮运行内 worker 共享的状态。
struct RunState {
    budget: AtomicUsize,
    /// 本轮领取过的报告，强制重下时每个报告只领一次
    seen: Mutex<HashSet<String>>,
    /// 归还领取时留下的重试计划，重新领取后接着用
    parked: Mutex<HashMap<String, AttemptPlan>>,
}

impl RunState {
    fn new(budget: usize) -> Self {
        Self {
            budget: AtomicUsize::new(budget),
            seen: Mutex::new(HashSet::new()),
            parked: Mutex::new(HashMap::new()),
        }
    }

    fn seen(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn parked(&self) -> MutexGuard<'_, HashMap<String, AttemptPlan>> {
        self.parked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_budget(&self) -> bool {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn refund_budget(&self) {
        self.budget.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    store: Arc<StateStore>,
    selector: Arc<TransportSelector>,
    engine: Arc<TransferEngine>,
    extractor: Option<Arc<dyn Extractor>>,
    /// 节点池耗尽、暂停结束后用来复测黑名单已到期的节点
    remeasure: Option<(Arc<dyn Dialer>, Duration)>,
    clock: Arc<dyn Clock>,
    cancel: Arc<AtomicBool>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        selector: Arc<TransportSelector>,
        engine: Arc<TransferEngine>,
        clock: Arc<dyn Clock>,
        cancel: Arc<AtomicBool>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            selector,
            engine,
            extractor: None,
            remeasure: None,
            clock,
            cancel,
            settings,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_remeasure(mut self, dialer: Arc<dyn Dialer>, timeout: Duration) -> Self {
        self.remeasure = Some((dialer, timeout));
        self
    }

    pub fn run(&self, params: &RunParams) -> Result<RunSummary, StoreError> {
        let category = params.category.as_deref();
        let recovered = self.store.recover_stale_claims(self.settings.stale_claim)?;
        if recovered > 0 {
            info!(target: "download", "已回收 {} 个超时领取", recovered);
        }
        self.reconcile(category)?;

        let mut pending = self.store.count_with_status(ReportStatus::Ready, category)?;
        if params.force {
            pending += self.store.count_with_status(ReportStatus::Downloaded, category)?;
        }
        let total = match params.max_reports {
            Some(max) => pending.min(max as u64),
            None => pending,
        };
        if total == 0 {
            info!(target: "download", "没有待下载的报告");
            return Ok(RunSummary::default());
        }

        let workers = params.concurrency.max(1);
        info!(target: "download", "开始下载：{} 个报告，{} 个线程", total, workers);
        let state = RunState::new(params.max_reports.unwrap_or(usize::MAX));
        let (tx, rx) = channel::unbounded::<WorkerEvent>();
        let mut reporter = ProgressReporter::new(self.settings.show_progress, total);

        thread::scope(|scope| {
            for i in 0..workers {
                let tx = tx.clone();
                let state = &state;
                let owner = format!("{}#{}", self.settings.run_id, i);
                let spawned = thread::Builder::new()
                    .name(format!("download-{i}"))
                    .spawn_scoped(scope, move || {
                        if let Err(e) = self.worker_loop(&owner, params, state, &tx) {
                            error!(target: "download", "worker {} 因状态库错误退出: {}", owner, e);
                        }
                    });
                if let Err(e) = spawned {
                    error!(target: "download", "无法启动下载线程: {}", e);
                }
            }
            drop(tx);

            loop {
                match rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(event) => reporter.handle(event),
                    Err(channel::RecvTimeoutError::Timeout) => continue,
                    Err(channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        let summary = reporter.finish();
        info!(
            target: "download",
            "本轮结束：下载 {}，跳过 {}，失败 {}，无地址 {}，中止 {}，解压 {}",
            summary.downloaded,
            summary.skipped,
            summary.failed,
            summary.no_url,
            summary.abandoned,
            summary.extracted
        );
        Ok(summary)
    }

    /// 不在磁盘上或校验不过的 `downloaded` 报告退回 `ready`。
    /// `force` 不在这里处理，而是由 worker 逐个领取已下载的报告。
    fn reconcile(&self, category: Option<&str>) -> Result<usize, StoreError> {
        let mut reset = 0;
        for report in self
            .store
            .reports_with_status(ReportStatus::Downloaded, category, None)?
        {
            if !self.store.exists_completed_and_verified(&report.id)? {
                debug!(target: "download", "重置 {} 为 ready", report.id);
                self.store.reset_to_ready(&report.id)?;
                reset += 1;
            }
        }
        if reset > 0 {
            info!(target: "download", "对账：{} 个已下载报告需要重新下载", reset);
        }
        Ok(reset)
    }

    fn worker_loop(
        &self,
        owner: &str,
        params: &RunParams,
        state: &RunState,
        tx: &channel::Sender<WorkerEvent>,
    ) -> Result<(), StoreError> {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            if !state.take_budget() {
                return Ok(());
            }
            let claim = match self.claim(owner, params, state) {
                Ok(Some(claim)) => claim,
                Ok(None) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    debug!(target: "download", "领取冲突，重试: {}", e);
                    state.refund_budget();
                    continue;
                }
                Err(e) => return Err(e),
            };
            let _ = tx.send(WorkerEvent::Claimed {
                report_id: claim.report.id.clone(),
                title: claim.report.title.clone(),
            });

            let flow = match self.process(&claim, owner, params.force, state, tx) {
                Ok(flow) => flow,
                Err(e) if e.is_conflict() => {
                    warn!(
                        target: "download",
                        "{} 状态更新持续冲突，留给超时回收: {}",
                        claim.report.id, e
                    );
                    Flow::Continue
                }
                Err(e) => return Err(e),
            };
            match flow {
                Flow::Continue => {}
                Flow::Released => {
                    state.refund_budget();
                    state.seen().remove(&claim.report.id);
                }
                Flow::Stop => return Ok(()),
            }
        }
    }

    /// 先领 `ready`；`force` 时再逐个领取本轮还没处理过的 `downloaded` 报告。
    fn claim(&self, owner: &str, params: &RunParams, state: &RunState) -> Result<Option<Claim>, StoreError> {
        let category = params.category.as_deref();
        if let Some(report) = self.store.claim_next_ready(1, owner, category)?.into_iter().next() {
            state.seen().insert(report.id.clone());
            return Ok(Some(Claim { report, forced: false }));
        }
        if !params.force {
            return Ok(None);
        }
        for candidate in self
            .store
            .reports_with_status(ReportStatus::Downloaded, category, None)?
        {
            if !state.seen().insert(candidate.id.clone()) {
                continue;
            }
            match self.store.claim_downloaded(&candidate.id, owner) {
                Ok(Some(report)) => return Ok(Some(Claim { report, forced: true })),
                Ok(None) => {}
                Err(e) => {
                    state.seen().remove(&candidate.id);
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    fn process(
        &self,
        claim: &Claim,
        owner: &str,
        force: bool,
        state: &RunState,
        tx: &channel::Sender<WorkerEvent>,
    ) -> Result<Flow, StoreError> {
        let store = &*self.store;
        let report = &claim.report;
        if !force && let Some((size, checksum)) = self.already_published(report) {
            info!(target: "download", "文件已存在且校验通过，跳过下载：{}", report.title);
            self.store_retry(|| store.mark_downloaded(&report.id, size, &checksum))?;
            let _ = tx.send(WorkerEvent::Skipped {
                report_id: report.id.clone(),
            });
            self.extract_after_download(&report.id, tx);
            return Ok(Flow::Continue);
        }

        let mut job = match TransferJob::from_report(report, self.settings.send_referer) {
            Ok(job) => job,
            Err(_) => {
                warn!(target: "download", "{} 没有下载地址", report.id);
                self.store_retry(|| store.mark_no_download_url(&report.id))?;
                let _ = tx.send(WorkerEvent::NoDownloadUrl {
                    report_id: report.id.clone(),
                });
                return Ok(Flow::Continue);
            }
        };

        let parked = state.parked().remove(&report.id);
        let mut plan = match parked {
            Some(mut plan) => {
                plan.resume();
                plan
            }
            None => AttemptPlan::new(force),
        };
        loop {
            let route = match self.selector.select(plan.excluded()) {
                Ok(route) => route,
                Err(exhausted) if plan.retries_exhausted(&self.settings.retry) => {
                    let error = plan
                        .last_error()
                        .map(str::to_string)
                        .unwrap_or_else(|| exhausted.to_string());
                    warn!(
                        target: "download",
                        "{}：{}，重试次数已用完，标记失败",
                        report.id, exhausted
                    );
                    self.store_retry(|| store.mark_failed(&report.id, &error))?;
                    let _ = tx.send(WorkerEvent::Failed {
                        report_id: report.id.clone(),
                        error,
                    });
                    return Ok(Flow::Continue);
                }
                Err(exhausted) => {
                    warn!(
                        target: "download",
                        "{}：{}，归还领取并暂停 {:?}",
                        report.id, exhausted, self.settings.pool_exhausted_pause
                    );
                    state.parked().insert(report.id.clone(), plan);
                    self.give_back(claim)?;
                    let _ = tx.send(WorkerEvent::Released {
                        report_id: report.id.clone(),
                    });
                    if !sleep_cancellable(&*self.clock, self.settings.pool_exhausted_pause, &self.cancel) {
                        return Ok(Flow::Stop);
                    }
                    if let Some((dialer, timeout)) = &self.remeasure {
                        let recovered = self.selector.pool().remeasure_expired(dialer.as_ref(), *timeout);
                        debug!(target: "proxy", "复测后 {} 个节点恢复可用", recovered);
                    }
                    return Ok(Flow::Released);
                }
            };

            job.force_restart = plan.start_attempt();
            let offset = self.engine.resume_offset(&job);
            let attempt = self.store_retry(|| store.begin_attempt(&report.id, route.node_id(), offset))?;
            debug!(
                target: "download",
                "{} 第 {} 次尝试，路由 {}，偏移 {}",
                report.id,
                plan.attempt(),
                route.label(),
                offset
            );

            let mut last_beat = self.clock.now();
            let interval = self.settings.heartbeat_interval();
            let result = self.engine.transfer(&job, &route, &mut |n| {
                let _ = tx.send(WorkerEvent::Bytes(n));
                let now = self.clock.now();
                if now.saturating_duration_since(last_beat) >= interval {
                    last_beat = now;
                    if let Err(e) = store.heartbeat(&report.id, owner) {
                        debug!(target: "download", "刷新心跳失败: {}", e);
                    }
                }
            });

            let err = match result {
                Ok(outcome) => {
                    self.store_retry(|| {
                        store.finish_attempt(&report.id, attempt, AttemptOutcome::Succeeded, None)
                    })?;
                    self.selector.report_success(&route);
                    self.store_retry(|| store.mark_downloaded(&report.id, outcome.size, &outcome.checksum))?;
                    let _ = tx.send(WorkerEvent::Downloaded {
                        report_id: report.id.clone(),
                        size: outcome.size,
                    });
                    self.extract_after_download(&report.id, tx);
                    return Ok(Flow::Continue);
                }
                Err(err) => err,
            };

            let summary = err.summary();
            self.store_retry(|| {
                store.finish_attempt(&report.id, attempt, attempt_outcome(&err), Some(&summary))
            })?;
            if err.blames_route() {
                self.selector.report_failure(&route);
            }

            match plan.on_failure(&err, &route, &self.settings.retry, self.clock.now()) {
                Decision::Retry { after } => {
                    info!(
                        target: "download",
                        "{} 下载失败（{}），{:?} 后重试",
                        report.id, summary, after
                    );
                    if !after.is_zero() && !sleep_cancellable(&*self.clock, after, &self.cancel) {
                        self.give_back(claim)?;
                        let _ = tx.send(WorkerEvent::Abandoned {
                            report_id: report.id.clone(),
                        });
                        return Ok(Flow::Stop);
                    }
                }
                Decision::Terminal(action) => {
                    if action == TerminalAction::ReleaseClaim {
                        state.parked().insert(report.id.clone(), plan);
                    }
                    return self.settle(claim, action, &err, tx);
                }
            }
        }
    }

    fn settle(
        &self,
        claim: &Claim,
        action: TerminalAction,
        err: &TransferError,
        tx: &channel::Sender<WorkerEvent>,
    ) -> Result<Flow, StoreError> {
        let report = &claim.report;
        let report_id = report.id.clone();
        match action {
            TerminalAction::MarkFailed => {
                warn!(target: "download", "{} 下载失败：{}", report.id, err);
                self.store_retry(|| self.store.mark_failed(&report.id, &err.summary()))?;
                let _ = tx.send(WorkerEvent::Failed {
                    report_id,
                    error: err.summary(),
                });
                Ok(Flow::Continue)
            }
            TerminalAction::MarkNoDownloadUrl => {
                warn!(target: "download", "{} 下载地址失效：{}", report.id, err);
                self.store_retry(|| self.store.mark_no_download_url(&report.id))?;
                let _ = tx.send(WorkerEvent::NoDownloadUrl { report_id });
                Ok(Flow::Continue)
            }
            TerminalAction::ReleaseClaim => {
                warn!(target: "download", "{} 归还领取：{}", report.id, err);
                self.give_back(claim)?;
                let _ = tx.send(WorkerEvent::Released { report_id });
                Ok(Flow::Released)
            }
            TerminalAction::Abandon => {
                info!(target: "download", "{} 已取消，保留部分文件", report.id);
                self.give_back(claim)?;
                let _ = tx.send(WorkerEvent::Abandoned { report_id });
                Ok(Flow::Stop)
            }
        }
    }

    /// 归还领取。强制重下的报告原文件仍完好时还原为 `downloaded`，否则回到 `ready`。
    fn give_back(&self, claim: &Claim) -> Result<(), StoreError> {
        let id = &claim.report.id;
        if claim.forced
            && let Some((size, checksum)) = self.already_published(&claim.report)
        {
            debug!(target: "download", "{} 原文件完好，还原为 downloaded", id);
            return self.store_retry(|| self.store.mark_downloaded(id, size, &checksum));
        }
        self.store_retry(|| self.store.release_claim(id))
    }

    fn store_retry<T>(&self, op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
        retry_on_conflict(&*self.clock, op)
    }

    /// 目标文件已在位，且与已知的大小/校验和一致时返回 `(大小, sha256)`。
    /// 大小与校验和都未知时无法确认，返回 `None`。
    fn already_published(&self, report: &Report) -> Option<(u64, String)> {
        if report.file_size_bytes.is_none() && report.expected_checksum.is_none() {
            return None;
        }
        let meta = std::fs::metadata(&report.expected_file_path).ok()?;
        if !meta.is_file() {
            return None;
        }
        if let Some(expected) = report.file_size_bytes
            && meta.len() != expected
        {
            return None;
        }
        let checksum = sha256_file(&report.expected_file_path).ok()?;
        if let Some(expected) = report.expected_checksum.as_deref()
            && !checksum_matches(&checksum, expected)
        {
            return None;
        }
        Some((meta.len(), checksum))
    }

    fn extract_after_download(&self, report_id: &str, tx: &channel::Sender<WorkerEvent>) {
        if !self.settings.auto_extract {
            return;
        }
        let Some(extractor) = self.extractor.as_deref() else {
            return;
        };
        let report = match self.store.report(report_id) {
            Ok(Some(report)) => report,
            Ok(None) => return,
            Err(e) => {
                warn!(target: "extract", "读取报告 {} 失败: {}", report_id, e);
                return;
            }
        };
        match extract_report(&self.store, extractor, &report, self.settings.extract_policy) {
            Ok(Some(record)) => {
                let _ = tx.send(WorkerEvent::Extracted {
                    report_id: report.id.clone(),
                    files: record.file_count,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(target: "extract", "解压 {} 失败: {}", report.title, e),
        }
    }
}

/// 状态库写冲突时退避重试，至多 `STORE_CONFLICT_RETRIES` 次；其他错误直接返回。
fn retry_on_conflict<T>(
    clock: &dyn Clock,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut tries = 0;
    loop {
        match op() {
            Err(e) if e.is_conflict() && tries < STORE_CONFLICT_RETRIES => {
                let wait = exponential(Duration::from_millis(50), Duration::from_secs(1), tries);
                tries += 1;
                debug!(target: "download", "状态库冲突，{:?} 后第 {} 次重试: {}", wait, tries, e);
                clock.sleep(wait);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::clock::ManualClock;
    use crate::download::transport::fake::{FakeTransport, Scripted};
    use crate::download::transport::{FetchRequest, FetchResponse, Transport};
    use crate::extract::ZipExtractor;
    use crate::extract::archive::tests::zip_bytes;
    use crate::proxy::pool::tests::{FakeDialer, nodes};
    use crate::proxy::pool::{PoolSettings, ProxyPool};
    use crate::proxy::selector::{FallbackPolicy, Route};
    use crate::store::state_store::tests::{open_store, seed_ready};
    use std::fs;
    use std::io::Read;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        store: Arc<StateStore>,
        clock: Arc<ManualClock>,
        cancel: Arc<AtomicBool>,
    }

    impl Harness {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let store = Arc::new(open_store(&temp));
            Self {
                _temp: temp,
                store,
                clock: Arc::new(ManualClock::new()),
                cancel: Arc::new(AtomicBool::new(false)),
            }
        }

        fn pool(&self, ids: &[&str], fallback: FallbackPolicy) -> Arc<TransportSelector> {
            let pool = ProxyPool::new(nodes(ids), PoolSettings::default(), self.clock.clone());
            Arc::new(TransportSelector::new(Arc::new(pool), fallback))
        }

        fn orchestrator(&self, transport: Arc<dyn Transport>, selector: Arc<TransportSelector>) -> Orchestrator {
            self.orchestrator_retrying(transport, selector, 2)
        }

        fn orchestrator_retrying(
            &self,
            transport: Arc<dyn Transport>,
            selector: Arc<TransportSelector>,
            max_retries: u32,
        ) -> Orchestrator {
            let engine = Arc::new(TransferEngine::new(transport, 7, self.cancel.clone()));
            let settings = OrchestratorSettings {
                retry: RetrySettings {
                    max_retries,
                    min_wait_ms: 100,
                    max_wait_ms: 400,
                },
                pool_exhausted_pause: Duration::from_secs(10),
                stale_claim: Duration::from_secs(600),
                send_referer: true,
                auto_extract: true,
                extract_policy: ExtractPolicy::Overwrite,
                run_id: "test".to_string(),
                show_progress: false,
            };
            Orchestrator::new(
                self.store.clone(),
                selector,
                engine,
                self.clock.clone(),
                self.cancel.clone(),
                settings,
            )
            .with_extractor(Arc::new(ZipExtractor::new(false)))
        }
    }

    fn params(concurrency: usize) -> RunParams {
        RunParams {
            max_reports: None,
            concurrency,
            category: None,
            force: false,
        }
    }

    fn archive() -> Vec<u8> {
        zip_bytes(&[("summary.txt", "quarterly numbers"), ("tables/q1.csv", "1,2,3")])
    }

    #[test]
    fn ready_report_is_downloaded_and_extracted() {
        let h = Harness::new();
        let bytes = archive();
        let id = seed_ready(&h.store, "r1", "https://files/r1.zip", Some(bytes.len() as u64));
        let transport = Arc::new(FakeTransport::new(&bytes));
        let orch = h.orchestrator(transport.clone(), h.pool(&[], FallbackPolicy::Direct));

        let summary = orch.run(&params(2)).unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.extracted, 1);
        assert_eq!(summary.bytes, bytes.len() as u64);

        let report = h.store.report(&id).unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Downloaded);
        assert_eq!(fs::read(&report.expected_file_path).unwrap(), bytes);
        assert!(h.store.exists_completed_and_verified(&id).unwrap());

        let dir = report.expected_file_path.parent().unwrap();
        let record = h.store.extraction_for(&id).unwrap().unwrap();
        assert_eq!(record.output_dir, dir);
        assert_eq!(record.file_count, 2);
        assert!(dir.join("tables").join("q1.csv").exists());

        let attempts = h.store.attempts_for(&id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Succeeded);
        assert_eq!(transport.seen()[0].referer.as_deref(), Some("https://site/post/r1.html"));
    }

    #[test]
    fn second_run_downloads_nothing() {
        let h = Harness::new();
        let bytes = archive();
        seed_ready(&h.store, "r1", "https://files/r1.zip", Some(bytes.len() as u64));
        let transport = Arc::new(FakeTransport::new(&bytes));
        let orch = h.orchestrator(transport.clone(), h.pool(&[], FallbackPolicy::Direct));

        orch.run(&params(1)).unwrap();
        let again = orch.run(&params(1)).unwrap();
        assert_eq!(again, RunSummary::default());
        assert_eq!(transport.seen().len(), 1);
    }

    #[test]
    fn reconciles_missing_files_and_skips_present_ones() {
        let h = Harness::new();
        let bytes = archive();
        let gone = seed_ready(&h.store, "gone", "https://files/gone.zip", Some(bytes.len() as u64));
        let kept = seed_ready(&h.store, "kept", "https://files/kept.zip", Some(bytes.len() as u64));
        let transport = Arc::new(FakeTransport::new(&bytes));
        let orch = h.orchestrator(transport.clone(), h.pool(&[], FallbackPolicy::Direct));
        assert_eq!(orch.run(&params(1)).unwrap().downloaded, 2);
        assert_eq!(transport.seen().len(), 2);

        // 已下载但文件被删除：只重新下载这一个
        let path = h.store.report(&gone).unwrap().unwrap().expected_file_path;
        fs::remove_file(&path).unwrap();
        let summary = orch.run(&params(1)).unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.claimed, 1);
        assert_eq!(transport.seen().len(), 3);
        assert!(path.exists());
        assert_eq!(h.store.attempts_for(&gone).unwrap().len(), 2);

        let untouched = h.store.report(&kept).unwrap().unwrap();
        assert_eq!(untouched.status, ReportStatus::Downloaded);
        assert_eq!(h.store.attempts_for(&kept).unwrap().len(), 1);

        // 仍是 ready 但文件已在位：不发请求直接标记
        let present = seed_ready(&h.store, "present", "https://files/present.zip", Some(bytes.len() as u64));
        let target = h.store.report(&present).unwrap().unwrap().expected_file_path;
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, &bytes).unwrap();
        let summary = orch.run(&params(1)).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(transport.seen().len(), 3);
        assert_eq!(
            h.store.report(&present).unwrap().unwrap().status,
            ReportStatus::Downloaded
        );
    }

    #[test]
    fn network_failure_rotates_to_next_node() {
        let h = Harness::new();
        let bytes = archive();
        let id = seed_ready(&h.store, "r1", "https://files/r1.zip", Some(bytes.len() as u64));
        let selector = h.pool(&["fast", "slow"], FallbackPolicy::Direct);
        selector.pool().measure_all(
            &FakeDialer::new(&[("fast", 10), ("slow", 80)]),
            Duration::from_secs(1),
        );
        let transport = Arc::new(FakeTransport::new(&bytes).then(Scripted::NetworkError));
        let orch = h.orchestrator(transport.clone(), selector);

        let summary = orch.run(&params(1)).unwrap();
        assert_eq!(summary.downloaded, 1);
        let routes: Vec<_> = transport.seen().into_iter().map(|r| r.route).collect();
        assert_eq!(routes, vec!["fast", "slow"]);

        let attempts = h.store.attempts_for(&id).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::FailedNetwork);
        assert_eq!(attempts[0].proxy_node_id.as_deref(), Some("fast"));
        assert_eq!(attempts[1].proxy_node_id.as_deref(), Some("slow"));
        assert!(h.clock.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn exhausted_network_retries_mark_failed() {
        let h = Harness::new();
        let id = seed_ready(&h.store, "r1", "https://files/r1.zip", Some(10));
        let transport = Arc::new(
            FakeTransport::new(b"0123456789")
                .then(Scripted::Status(503))
                .then(Scripted::Status(503))
                .then(Scripted::Status(503)),
        );
        let orch = h.orchestrator(transport.clone(), h.pool(&[], FallbackPolicy::Direct));

        let summary = orch.run(&params(1)).unwrap();
        assert_eq!(summary.failed, 1);
        let report = h.store.report(&id).unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.attempt_count, 1);
        assert!(report.last_error.unwrap().starts_with("network:"));
        assert_eq!(transport.seen().len(), 3);
        assert_eq!(h.clock.elapsed(), Duration::from_millis(100 + 200));
    }

    #[test]
    fn verification_failure_restarts_once_then_fails() {
        let h = Harness::new();
        let id = seed_ready(&h.store, "r1", "https://files/r1.zip", Some(10));
        let transport = Arc::new(
            FakeTransport::new(b"0123456789")
                .then(Scripted::Serve(b"short".to_vec()))
                .then(Scripted::Serve(b"also short!".to_vec())),
        );
        let orch = h.orchestrator(transport.clone(), h.pool(&[], FallbackPolicy::Direct));

        let summary = orch.run(&params(1)).unwrap();
        assert_eq!(summary.failed, 1);
        let report = h.store.report(&id).unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        assert!(report.last_error.unwrap().starts_with("verification:"));
        assert!(!crate::store::layout::staging_path(&report.expected_file_path).exists());

        let outcomes: Vec<_> = h
            .store
            .attempts_for(&id)
            .unwrap()
            .into_iter()
            .map(|a| a.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::FailedVerification, AttemptOutcome::FailedVerification]
        );
        let ranges: Vec<_> = transport.seen().into_iter().map(|r| r.range_start).collect();
        assert_eq!(ranges, vec![None, None]);
    }

    #[test]
    fn gone_url_marks_no_download_url() {
        let h = Harness::new();
        let id = seed_ready(&h.store, "r1", "https://files/r1.zip", None);
        let transport = Arc::new(FakeTransport::new(b"x").then(Scripted::Status(404)));
        let orch = h.orchestrator(transport, h.pool(&[], FallbackPolicy::Direct));

        let summary = orch.run(&params(1)).unwrap();
        assert_eq!(summary.no_url, 1);
        assert_eq!(
            h.store.report(&id).unwrap().unwrap().status,
            ReportStatus::NoDownloadUrl
        );
    }

    #[test]
    fn exhausted_pool_releases_and_waits_for_blacklist_to_expire() {
        let h = Harness::new();
        let bytes = archive();
        let id = seed_ready(&h.store, "r1", "https://files/r1.zip", Some(bytes.len() as u64));
        let selector = h.pool(&["only"], FallbackPolicy::Fail);
        for _ in 0..3 {
            selector.pool().report_failure("only");
        }
        let transport = Arc::new(FakeTransport::new(&bytes));
        let orch = h.orchestrator(transport.clone(), selector);

        let summary = orch.run(&params(1)).unwrap();
        assert!(summary.released >= 1);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(transport.seen()[0].route, "only");
        assert!(h.clock.elapsed() >= Duration::from_secs(30));
        assert_eq!(
            h.store.report(&id).unwrap().unwrap().status,
            ReportStatus::Downloaded
        );
    }

    #[test]
    fn single_failing_node_is_marked_failed_once_retries_run_out() {
        let h = Harness::new();
        let id = seed_ready(&h.store, "r1", "https://files/r1.zip", Some(10));
        let mut transport = FakeTransport::new(b"0123456789");
        for _ in 0..10 {
            transport = transport.then(Scripted::Status(503));
        }
        let transport = Arc::new(transport);
        let orch = h.orchestrator_retrying(transport.clone(), h.pool(&["only"], FallbackPolicy::Fail), 3);

        let summary = orch.run(&params(1)).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.downloaded, 0);
        // 第三次失败后节点被拉黑，重试额度也已用完：直接标记失败，不再归还等待
        assert_eq!(summary.released, 0);
        assert_eq!(transport.seen().len(), 3);

        let report = h.store.report(&id).unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        assert!(report.last_error.unwrap().starts_with("network:"));
        let outcomes: Vec<_> = h
            .store
            .attempts_for(&id)
            .unwrap()
            .into_iter()
            .map(|a| a.outcome)
            .collect();
        assert_eq!(outcomes, vec![AttemptOutcome::FailedNetwork; 3]);
    }

    #[test]
    fn retry_count_survives_release_and_reclaim() {
        let h = Harness::new();
        let id = seed_ready(&h.store, "r1", "https://files/r1.zip", Some(10));
        let selector = h.pool(&["only"], FallbackPolicy::Fail);
        for _ in 0..2 {
            selector.pool().report_failure("only");
        }
        let mut transport = FakeTransport::new(b"0123456789");
        for _ in 0..10 {
            transport = transport.then(Scripted::Status(503));
        }
        let transport = Arc::new(transport);
        let orch = h.orchestrator_retrying(transport.clone(), selector, 3);

        let summary = orch.run(&params(1)).unwrap();
        // 每次失败都会把节点拉黑，报告在等待窗口期间被反复归还、重新领取
        assert!(summary.released >= 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(transport.seen().len(), 3);
        assert_eq!(h.store.attempts_for(&id).unwrap().len(), 3);
        assert_eq!(
            h.store.report(&id).unwrap().unwrap().status,
            ReportStatus::Failed
        );
    }

    /// 读到第一块数据后触发取消。
    struct CancellingTransport {
        inner: FakeTransport,
        cancel: Arc<AtomicBool>,
    }

    struct CancelOnRead {
        inner: Box<dyn Read + Send>,
        cancel: Arc<AtomicBool>,
    }

    impl Read for CancelOnRead {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.cancel.store(true, Ordering::Relaxed);
            Ok(n)
        }
    }

    impl Transport for CancellingTransport {
        fn fetch(&self, route: &Route, request: &FetchRequest<'_>) -> Result<FetchResponse, TransferError> {
            let mut resp = self.inner.fetch(route, request)?;
            resp.body = Box::new(CancelOnRead {
                inner: resp.body,
                cancel: self.cancel.clone(),
            });
            Ok(resp)
        }
    }

    #[test]
    fn cancellation_keeps_partial_and_abandons_attempt() {
        let h = Harness::new();
        let bytes = archive();
        let id = seed_ready(&h.store, "r1", "https://files/r1.zip", Some(bytes.len() as u64));
        let transport = Arc::new(CancellingTransport {
            inner: FakeTransport::new(&bytes),
            cancel: h.cancel.clone(),
        });
        let orch = h.orchestrator(transport, h.pool(&[], FallbackPolicy::Direct));

        let summary = orch.run(&params(1)).unwrap();
        assert_eq!(summary.abandoned, 1);
        let report = h.store.report(&id).unwrap().unwrap();
        assert_eq!(report.status, ReportStatus::Ready);
        assert_eq!(report.claimed_by, None);
        let partial = crate::store::layout::staging_path(&report.expected_file_path);
        assert_eq!(fs::read(&partial).unwrap(), &bytes[..7]);
        let attempts = h.store.attempts_for(&id).unwrap();
        assert_eq!(attempts[0].outcome, AttemptOutcome::Abandoned);
        assert_eq!(attempts[0].bytes_at_resume, 0);
    }

    /// 每次请求时记录状态库里 `downloading` 的数量。
    struct CountingTransport {
        inner: FakeTransport,
        store: Arc<StateStore>,
        peak: Mutex<u64>,
    }

    impl Transport for CountingTransport {
        fn fetch(&self, route: &Route, request: &FetchRequest<'_>) -> Result<FetchResponse, TransferError> {
            let downloading = self
                .store
                .count_with_status(ReportStatus::Downloading, None)
                .unwrap();
            let mut peak = self.peak.lock().unwrap();
            *peak = (*peak).max(downloading);
            drop(peak);
            self.inner.fetch(route, request)
        }
    }

    #[test]
    fn downloading_never_exceeds_worker_count() {
        let h = Harness::new();
        let bytes = archive();
        for i in 0..6 {
            seed_ready(&h.store, &format!("r{i}"), &format!("https://files/r{i}.zip"), Some(bytes.len() as u64));
        }
        let transport = Arc::new(CountingTransport {
            inner: FakeTransport::new(&bytes),
            store: h.store.clone(),
            peak: Mutex::new(0),
        });
        let orch = h.orchestrator(transport.clone(), h.pool(&[], FallbackPolicy::Direct));

        let summary = orch.run(&params(2)).unwrap();
        assert_eq!(summary.downloaded, 6);
        assert!(*transport.peak.lock().unwrap() <= 2);
        assert_eq!(h.store.count_with_status(ReportStatus::Downloaded, None).unwrap(), 6);
    }

    #[test]
    fn max_reports_limits_claims() {
        let h = Harness::new();
        let bytes = archive();
        for i in 0..4 {
            seed_ready(&h.store, &format!("r{i}"), &format!("https://files/r{i}.zip"), Some(bytes.len() as u64));
        }
        let orch = h.orchestrator(Arc::new(FakeTransport::new(&bytes)), h.pool(&[], FallbackPolicy::Direct));
        let summary = orch
            .run(&RunParams {
                max_reports: Some(3),
                ..params(2)
            })
            .unwrap();
        assert_eq!(summary.downloaded, 3);
        assert_eq!(h.store.count_with_status(ReportStatus::Ready, None).unwrap(), 1);
    }

    fn seed_downloaded(h: &Harness, transport: Arc<FakeTransport>, count: usize) -> Vec<String> {
        let bytes = archive();
        let ids = (0..count)
            .map(|i| seed_ready(&h.store, &format!("r{i}"), &format!("https://files/r{i}.zip"), Some(bytes.len() as u64)))
            .collect();
        let orch = h.orchestrator(transport, h.pool(&[], FallbackPolicy::Direct));
        assert_eq!(orch.run(&params(2)).unwrap().downloaded, count);
        ids
    }

    fn forced(max_reports: Option<usize>) -> RunParams {
        RunParams {
            max_reports,
            force: true,
            ..params(2)
        }
    }

    #[test]
    fn force_with_limit_redownloads_only_claimed_reports() {
        let h = Harness::new();
        let transport = Arc::new(FakeTransport::new(&archive()));
        seed_downloaded(&h, transport.clone(), 4);
        let orch = h.orchestrator(transport.clone(), h.pool(&[], FallbackPolicy::Direct));

        let summary = orch.run(&forced(Some(1))).unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(transport.seen().len(), 5);
        assert_eq!(h.store.count_with_status(ReportStatus::Downloaded, None).unwrap(), 4);
        assert_eq!(h.store.count_with_status(ReportStatus::Ready, None).unwrap(), 0);
    }

    #[test]
    fn force_redownloads_each_report_exactly_once() {
        let h = Harness::new();
        let transport = Arc::new(FakeTransport::new(&archive()));
        let ids = seed_downloaded(&h, transport.clone(), 3);
        let orch = h.orchestrator(transport.clone(), h.pool(&[], FallbackPolicy::Direct));

        let summary = orch.run(&forced(None)).unwrap();
        assert_eq!(summary.downloaded, 3);
        assert_eq!(transport.seen().len(), 6);
        for id in &ids {
            let attempts = h.store.attempts_for(id).unwrap();
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[1].bytes_at_resume, 0);
        }
    }

    #[test]
    fn cancelled_force_run_keeps_reports_downloaded() {
        let h = Harness::new();
        let bytes = archive();
        let ids = seed_downloaded(&h, Arc::new(FakeTransport::new(&bytes)), 2);
        let transport = Arc::new(CancellingTransport {
            inner: FakeTransport::new(&bytes),
            cancel: h.cancel.clone(),
        });
        let orch = h.orchestrator(transport, h.pool(&[], FallbackPolicy::Direct));

        let summary = orch.run(&RunParams {
            concurrency: 1,
            ..forced(None)
        })
        .unwrap();
        assert_eq!(summary.abandoned, 1);
        assert_eq!(h.store.count_with_status(ReportStatus::Downloaded, None).unwrap(), 2);
        for id in &ids {
            let report = h.store.report(id).unwrap().unwrap();
            assert_eq!(fs::read(&report.expected_file_path).unwrap(), bytes);
            assert!(h.store.exists_completed_and_verified(id).unwrap());
        }
    }

    #[test]
    fn store_conflicts_are_retried_with_backoff() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let result = retry_on_conflict(&clock, || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::Conflict("busy".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(clock.elapsed(), Duration::from_millis(50 + 100));
    }

    #[test]
    fn persistent_conflict_gives_up_after_bounded_retries() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let result: Result<(), StoreError> = retry_on_conflict(&clock, || {
            calls += 1;
            Err(StoreError::Conflict("busy".into()))
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, STORE_CONFLICT_RETRIES + 1);
    }

    #[test]
    fn other_store_errors_are_not_retried() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let result: Result<(), StoreError> = retry_on_conflict(&clock, || {
            calls += 1;
            Err(StoreError::NotFound("r1".into()))
        });
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(calls, 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
