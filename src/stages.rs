//! 命令行各阶段的入口：导入解析结果、下载、解压、重试、统计、测速。
//!
//! 每个阶段都可以单独重跑；状态以数据库为准。

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::base_system::clock::SystemClock;
use crate::base_system::context::Config;
use crate::download::transfer::TransferEngine;
use crate::download::transport::{HttpSettings, HttpTransport};
use crate::download::{Orchestrator, OrchestratorSettings, RunParams, RunSummary};
use crate::extract::{ZipExtractor, extract_report};
use crate::feed::{IngestSummary, ingest_feed};
use crate::proxy::dialer::TcpDialer;
use crate::proxy::node::{load_clash_nodes, load_nodes};
use crate::proxy::pool::{NodeStatus, PoolSettings, ProxyPool};
use crate::proxy::selector::TransportSelector;
use crate::store::models::DownloadAttempt;
use crate::store::{Report, ReportLayout, ReportStatus, StateStore, StoreStats};

/// 阶段运行所需的共享上下文。
pub struct StageContext {
    pub config: Config,
    pub data_dir: Option<PathBuf>,
    pub cancel: Arc<AtomicBool>,
    pub show_progress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    pub max_reports: Option<usize>,
    pub concurrency: Option<usize>,
    pub category: Option<String>,
    pub force: bool,
}

impl StageContext {
    pub fn new(config: Config, data_dir: Option<&Path>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            config,
            data_dir: data_dir.map(Path::to_path_buf),
            cancel,
            show_progress: true,
        }
    }

    fn base(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn open_store(&self) -> Result<StateStore> {
        let db = self.config.database_file(self.base());
        let layout = ReportLayout::new(self.config.default_save_dir(self.base()));
        StateStore::open(&db, layout).with_context(|| format!("打开状态库 {}", db.display()))
    }

    /// 读取配置与 Clash 文件中的节点并测速。
    pub fn build_pool(&self) -> Result<Arc<ProxyPool>> {
        let mut configs = self.config.proxy_nodes.clone();
        if let Some(path) = self.config.clash_config(self.base()) {
            let clash = load_clash_nodes(&path)
                .with_context(|| format!("读取 Clash 配置 {}", path.display()))?;
            info!(target: "proxy", "从 Clash 配置读取 {} 个节点", clash.len());
            configs.extend(clash);
        }
        let nodes = load_nodes(&configs).context("解析代理节点")?;
        let pool = ProxyPool::new(nodes, PoolSettings::from_config(&self.config), Arc::new(SystemClock));
        if pool.is_empty() {
            info!(target: "proxy", "未配置代理节点，全部直连");
        } else {
            pool.measure_all(&TcpDialer, self.config.probe_timeout());
        }
        Ok(Arc::new(pool))
    }
}

pub fn resolve_urls(ctx: &StageContext, feed: &Path, max_reports: Option<usize>) -> Result<IngestSummary> {
    let store = ctx.open_store()?;
    let file = File::open(feed).with_context(|| format!("打开解析结果 {}", feed.display()))?;
    let summary = ingest_feed(&store, BufReader::new(file), max_reports)
        .with_context(|| format!("导入 {}", feed.display()))?;
    println!(
        "导入完成：分类 {}，报告 {}，可下载 {}，无下载地址 {}，未变 {}，拒绝 {}，坏行 {}",
        summary.categories,
        summary.reports,
        summary.resolved,
        summary.no_url,
        summary.unchanged,
        summary.rejected,
        summary.malformed
    );
    Ok(summary)
}

pub fn download(ctx: &StageContext, options: &DownloadOptions) -> Result<RunSummary> {
    let store = Arc::new(ctx.open_store()?);
    let pool = ctx.build_pool()?;
    let selector = Arc::new(TransportSelector::new(pool, ctx.config.pool_exhausted_fallback));
    let transport = Arc::new(HttpTransport::new(HttpSettings::from_config(&ctx.config)));
    let engine = Arc::new(TransferEngine::new(
        transport,
        ctx.config.chunk_size,
        ctx.cancel.clone(),
    ));
    let orchestrator = Orchestrator::new(
        store,
        selector,
        engine,
        Arc::new(SystemClock),
        ctx.cancel.clone(),
        OrchestratorSettings::from_config(&ctx.config, ctx.show_progress),
    )
    .with_extractor(Arc::new(ZipExtractor::new(ctx.config.rename_documents)))
    .with_remeasure(Arc::new(TcpDialer), ctx.config.probe_timeout());

    let params = RunParams {
        max_reports: options.max_reports,
        concurrency: options.concurrency.unwrap_or(ctx.config.max_workers).max(1),
        category: options.category.clone(),
        force: options.force,
    };
    let summary = orchestrator.run(&params).context("下载阶段")?;
    println!(
        "下载结束：成功 {}，已存在 {}，失败 {}，无下载地址 {}，归还 {}，中断 {}，解压 {}，共 {} 字节",
        summary.downloaded,
        summary.skipped,
        summary.failed,
        summary.no_url,
        summary.released,
        summary.abandoned,
        summary.extracted,
        summary.bytes
    );
    Ok(summary)
}

/// 对已下载且校验通过的报告补做解压。返回解压成功的数量。
pub fn extract(ctx: &StageContext, category: Option<&str>, max_reports: Option<usize>) -> Result<usize> {
    let store = ctx.open_store()?;
    let extractor = ZipExtractor::new(ctx.config.rename_documents);
    let reports = store.reports_with_status(ReportStatus::Downloaded, category, None)?;

    let mut extracted = 0;
    let mut failed = 0;
    for report in reports {
        if max_reports.is_some_and(|max| extracted + failed >= max) {
            break;
        }
        if !store.exists_completed_and_verified(&report.id)? {
            warn!(target: "extract", "{} 的文件缺失或校验不符，跳过", report.id);
            continue;
        }
        match extract_report(&store, &extractor, &report, ctx.config.extract_policy) {
            Ok(Some(_)) => extracted += 1,
            Ok(None) => {}
            Err(e) => {
                warn!(target: "extract", "解压 {} 失败: {}", report.title, e);
                failed += 1;
            }
        }
    }
    println!("解压结束：成功 {}，失败 {}", extracted, failed);
    Ok(extracted)
}

/// 把失败的报告重新排队；`run` 为真时紧接着执行下载。
pub fn retry(ctx: &StageContext, category: Option<&str>, run: bool) -> Result<usize> {
    let requeued = ctx.open_store()?.requeue_failed(category)?;
    println!("重新排队 {} 个失败报告", requeued);
    if run && requeued > 0 {
        download(
            ctx,
            &DownloadOptions {
                category: category.map(str::to_string),
                ..DownloadOptions::default()
            },
        )?;
    }
    Ok(requeued)
}

/// 输出各状态数量；指定 `report` 时额外列出该报告的下载记录。
pub fn stats(ctx: &StageContext, report: Option<&str>) -> Result<StoreStats> {
    let store = ctx.open_store()?;
    let stats = store.stats()?;
    println!("状态库版本 v{}", store.schema_version()?);
    print!("{}", format_stats(&stats));

    if let Some(id) = report {
        let found = store
            .report(id)?
            .with_context(|| format!("报告 {id} 不存在"))?;
        print!("{}", format_history(&found, &store.attempts_for(id)?));
    }
    Ok(stats)
}

pub fn probe(ctx: &StageContext) -> Result<Vec<NodeStatus>> {
    let statuses = ctx.build_pool()?.statuses();
    if statuses.is_empty() {
        println!("未配置代理节点");
    }
    for line in statuses.iter().map(format_node_status) {
        println!("{line}");
    }
    Ok(statuses)
}

fn format_stats(stats: &StoreStats) -> String {
    let mut out = format!(
        "分类 {}，报告 {}，下载记录 {}，解压记录 {}\n",
        stats.categories,
        stats.total_reports(),
        stats.attempts,
        stats.extractions
    );
    for (status, count) in &stats.by_status {
        out.push_str(&format!("  {:<16}{}\n", status.as_str(), count));
    }
    out
}

fn format_history(report: &Report, attempts: &[DownloadAttempt]) -> String {
    let mut out = format!(
        "{} [{}] 尝试 {} 次 {}\n",
        report.title,
        report.status,
        report.attempt_count,
        report.last_error.as_deref().unwrap_or("")
    );
    for attempt in attempts {
        out.push_str(&format!(
            "  #{:<3} {:<20} 起点 {:<10} {:<20} {}\n",
            attempt.attempt_number,
            attempt.proxy_node_id.as_deref().unwrap_or("direct"),
            attempt.bytes_at_resume,
            attempt.outcome.as_str(),
            attempt.error.as_deref().unwrap_or("")
        ));
    }
    out
}

fn format_node_status(status: &NodeStatus) -> String {
    let latency = status
        .node
        .latency
        .map(|l| format!("{}ms", l.as_millis()))
        .unwrap_or_else(|| "不可达".to_string());
    let state = match status.blacklisted_for {
        Some(left) => format!("黑名单剩余 {}s", left.as_secs()),
        None => "可用".to_string(),
    };
    format!(
        "{:<20} {:<10} 连续失败 {:<3} {}  {}",
        status.node.id, latency, status.node.consecutive_failures, state, status.node.endpoint
    )
}
