//! 研报批量下载器：把爬虫解析出的下载地址落到本地，可断点续传、可中断重跑。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/时钟/退避等基础设施
//! - `proxy`：代理节点池与线路选择
//! - `store`：SQLite 状态库与磁盘布局
//! - `download`：可续传传输、重试状态机与多线程编排
//! - `extract`：下载后解压与文档重命名
//! - `feed`：爬虫输出导入
//! - `stages`：各命令阶段入口

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

mod base_system;
mod download;
mod extract;
mod feed;
mod proxy;
mod stages;
mod store;

use base_system::config::load_or_create_with_base;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use stages::{DownloadOptions, StageContext};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "report-downloader", version)]
#[command(about = "Resumable batch downloader for crawled report archives")]
struct Cli {
    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 数据目录路径（用于存放 config.yml、状态库和 logs 等文件）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 指定配置文件路径（默认为数据目录下的 config.yml）
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    stage: Stage,
}

#[derive(Debug, Subcommand)]
enum Stage {
    /// 导入爬虫输出（JSON Lines）中的分类、报告与下载地址
    ResolveUrls {
        #[arg(long)]
        feed: PathBuf,
        /// 本次最多应用的解析结果数
        #[arg(long)]
        max_reports: Option<usize>,
    },
    /// 下载所有待下载报告
    Download {
        #[arg(long)]
        max_reports: Option<usize>,
        /// 并发线程数（默认取配置中的 max_workers）
        #[arg(long)]
        concurrency: Option<usize>,
        /// 只处理该分类
        #[arg(long)]
        category: Option<String>,
        /// 忽略已有文件，全部重新下载
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// 对已下载的报告补做解压
    Extract {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        max_reports: Option<usize>,
    },
    /// 把失败的报告重新排队
    Retry {
        #[arg(long)]
        category: Option<String>,
        /// 排队后立即下载
        #[arg(long, default_value_t = false)]
        run: bool,
    },
    /// 输出各状态的报告数量
    Stats {
        /// 同时列出该报告的下载记录
        #[arg(long)]
        report: Option<String>,
    },
    /// 测量代理节点延迟
    Probe,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.as_deref();
    let log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "report-downloader v{}", VERSION);

    let config = load_or_create_with_base::<Config>(cli.config.as_deref(), data_dir)
        .map_err(|e| anyhow!(e))?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            if cancel.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
            eprintln!("收到中断信号，等待当前分块写完后退出（再按一次强制退出）");
        }) {
            warn!(target: "startup", "注册 Ctrl-C 处理失败: {}", e);
        }
    }
    {
        let cancel = cancel.clone();
        log.add_exit_hook(move || cancel.store(true, Ordering::SeqCst));
    }

    let ctx = StageContext::new(config, data_dir, cancel);
    let result = run_stage(&ctx, cli.stage);
    if let Err(e) = &result {
        error!(target: "startup", "{:#}", e);
    }
    log.safe_exit();
    result
}

fn run_stage(ctx: &StageContext, stage: Stage) -> Result<()> {
    match stage {
        Stage::ResolveUrls { feed, max_reports } => {
            stages::resolve_urls(ctx, &feed, max_reports)?;
        }
        Stage::Download {
            max_reports,
            concurrency,
            category,
            force,
        } => {
            stages::download(
                ctx,
                &DownloadOptions {
                    max_reports,
                    concurrency,
                    category,
                    force,
                },
            )?;
        }
        Stage::Extract {
            category,
            max_reports,
        } => {
            stages::extract(ctx, category.as_deref(), max_reports)?;
        }
        Stage::Retry { category, run } => {
            stages::retry(ctx, category.as_deref(), run)?;
        }
        Stage::Stats { report } => {
            stages::stats(ctx, report.as_deref())?;
        }
        Stage::Probe => {
            stages::probe(ctx)?;
        }
    }
    Ok(())
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}
