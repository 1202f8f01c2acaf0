//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。配置在启动时加载一次，
//! 运行期间只读。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};
use crate::extract::ExtractPolicy;
use crate::proxy::node::ProxyNodeConfig;
use crate::proxy::selector::FallbackPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 路径配置
    #[serde(default = "default_save_path")]
    pub save_path: String,
    #[serde(default)]
    pub database_path: String,

    // 网络配置
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_min_connect_timeout")]
    pub min_connect_timeout: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_wait_time")]
    pub min_wait_time: u64,
    #[serde(default = "default_max_wait_time")]
    pub max_wait_time: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_true")]
    pub send_referer: bool,

    // 代理配置
    #[serde(default)]
    pub proxy_nodes: Vec<ProxyNodeConfig>,
    #[serde(default)]
    pub clash_config_path: String,
    #[serde(default)]
    pub proxy_region: String,
    #[serde(default = "default_proxy_probe_timeout")]
    pub proxy_probe_timeout: f64,
    #[serde(default = "default_proxy_failure_threshold")]
    pub proxy_failure_threshold: u32,
    #[serde(default = "default_proxy_blacklist_base_secs")]
    pub proxy_blacklist_base_secs: u64,
    #[serde(default = "default_proxy_blacklist_max_secs")]
    pub proxy_blacklist_max_secs: u64,
    #[serde(default)]
    pub pool_exhausted_fallback: FallbackPolicy,
    #[serde(default = "default_pool_exhausted_pause_ms")]
    pub pool_exhausted_pause_ms: u64,

    // 任务状态
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,

    // 解压配置
    #[serde(default = "default_true")]
    pub auto_extract: bool,
    #[serde(default)]
    pub extract_policy: ExtractPolicy,
    #[serde(default = "default_true")]
    pub rename_documents: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save_path: default_save_path(),
            database_path: String::new(),
            max_workers: default_max_workers(),
            request_timeout: default_request_timeout(),
            min_connect_timeout: default_min_connect_timeout(),
            max_retries: default_max_retries(),
            min_wait_time: default_min_wait_time(),
            max_wait_time: default_max_wait_time(),
            chunk_size: default_chunk_size(),
            user_agent: default_user_agent(),
            send_referer: default_true(),
            proxy_nodes: Vec::new(),
            clash_config_path: String::new(),
            proxy_region: String::new(),
            proxy_probe_timeout: default_proxy_probe_timeout(),
            proxy_failure_threshold: default_proxy_failure_threshold(),
            proxy_blacklist_base_secs: default_proxy_blacklist_base_secs(),
            proxy_blacklist_max_secs: default_proxy_blacklist_max_secs(),
            pool_exhausted_fallback: FallbackPolicy::default(),
            pool_exhausted_pause_ms: default_pool_exhausted_pause_ms(),
            stale_claim_secs: default_stale_claim_secs(),
            auto_extract: default_true(),
            extract_policy: ExtractPolicy::default(),
            rename_documents: default_true(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 24] = [
            FieldMeta {
                name: "save_path",
                description: "下载保存根目录，按 <分类>/<标题>/ 分层存放",
            },
            FieldMeta {
                name: "database_path",
                description: "状态数据库路径（留空表示数据目录下的 reports.db）",
            },
            FieldMeta {
                name: "max_workers",
                description: "最大并发下载线程数",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求读超时时间（秒）",
            },
            FieldMeta {
                name: "min_connect_timeout",
                description: "连接超时时间（秒）",
            },
            FieldMeta {
                name: "max_retries",
                description: "网络错误最大重试次数",
            },
            FieldMeta {
                name: "min_wait_time",
                description: "最小重试等待时间, 单位ms",
            },
            FieldMeta {
                name: "max_wait_time",
                description: "最大重试等待时间, 单位ms",
            },
            FieldMeta {
                name: "chunk_size",
                description: "写盘分块大小（字节），每块写入后落盘",
            },
            FieldMeta {
                name: "user_agent",
                description: "下载请求使用的 User-Agent",
            },
            FieldMeta {
                name: "send_referer",
                description: "下载时携带来源页面作为 Referer（防盗链）",
            },
            FieldMeta {
                name: "proxy_nodes",
                description: "代理节点列表，每项包含 name 与 endpoint（如 socks5h://127.0.0.1:7891）",
            },
            FieldMeta {
                name: "clash_config_path",
                description: "Clash 配置文件路径，读取其中 http/socks5 类型的 proxies（留空不读取）",
            },
            FieldMeta {
                name: "proxy_region",
                description: "优先使用名称包含该关键字的节点（如 香港），无匹配时使用全部节点",
            },
            FieldMeta {
                name: "proxy_probe_timeout",
                description: "节点延迟测试超时时间（秒）",
            },
            FieldMeta {
                name: "proxy_failure_threshold",
                description: "节点连续失败多少次后进入黑名单",
            },
            FieldMeta {
                name: "proxy_blacklist_base_secs",
                description: "黑名单初始时长（秒），之后每次失败翻倍",
            },
            FieldMeta {
                name: "proxy_blacklist_max_secs",
                description: "黑名单最长时长（秒）",
            },
            FieldMeta {
                name: "pool_exhausted_fallback",
                description: "所有节点不可用时的处理方式, 可选: [direct, fail]",
            },
            FieldMeta {
                name: "pool_exhausted_pause_ms",
                description: "节点池耗尽后工作线程暂停时长, 单位ms",
            },
            FieldMeta {
                name: "stale_claim_secs",
                description: "下载中任务超过该秒数没有心跳则视为遗留任务并重新排队",
            },
            FieldMeta {
                name: "auto_extract",
                description: "下载完成后自动解压",
            },
            FieldMeta {
                name: "extract_policy",
                description: "重复解压时的处理方式, 可选: [overwrite, skip]",
            },
            FieldMeta {
                name: "rename_documents",
                description: "解压后按 日期+标题 重命名文档文件（pdf/doc/ppt/xls 等）",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Validation(
                "max_workers 必须大于 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Validation("chunk_size 必须大于 0".to_string()));
        }
        if self.min_wait_time > self.max_wait_time {
            return Err(ConfigError::Validation(format!(
                "min_wait_time ({}) 不能大于 max_wait_time ({})",
                self.min_wait_time, self.max_wait_time
            )));
        }
        if self.proxy_failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "proxy_failure_threshold 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn default_save_dir(&self, base_dir: Option<&Path>) -> PathBuf {
        let raw = self.save_path.trim();
        let path = if raw.is_empty() {
            PathBuf::from(default_save_path())
        } else {
            PathBuf::from(raw)
        };
        resolve_against(path, base_dir)
    }

    pub fn database_file(&self, base_dir: Option<&Path>) -> PathBuf {
        let raw = self.database_path.trim();
        let path = if raw.is_empty() {
            PathBuf::from("reports.db")
        } else {
            PathBuf::from(raw)
        };
        resolve_against(path, base_dir)
    }

    pub fn clash_config(&self, base_dir: Option<&Path>) -> Option<PathBuf> {
        let raw = self.clash_config_path.trim();
        (!raw.is_empty()).then(|| resolve_against(PathBuf::from(raw), base_dir))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        secs_f64(self.min_connect_timeout)
    }

    pub fn probe_timeout(&self) -> Duration {
        secs_f64(self.proxy_probe_timeout).unwrap_or(Duration::from_secs(3))
    }
}

fn resolve_against(path: PathBuf, base_dir: Option<&Path>) -> PathBuf {
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

fn secs_f64(v: f64) -> Option<Duration> {
    if !v.is_finite() || v <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(v))
}

fn default_true() -> bool {
    true
}

fn default_save_path() -> String {
    "downloads".to_string()
}

fn default_max_workers() -> usize {
    3
}

fn default_request_timeout() -> u64 {
    60
}

fn default_min_connect_timeout() -> f64 {
    3.05
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_wait_time() -> u64 {
    1000
}

fn default_max_wait_time() -> u64 {
    8000
}

fn default_chunk_size() -> usize {
    8192
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_proxy_probe_timeout() -> f64 {
    3.0
}

fn default_proxy_failure_threshold() -> u32 {
    3
}

fn default_proxy_blacklist_base_secs() -> u64 {
    30
}

fn default_proxy_blacklist_max_secs() -> u64 {
    600
}

fn default_pool_exhausted_pause_ms() -> u64 {
    5000
}

fn default_stale_claim_secs() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::config::{generate_yaml_with_comments, load_or_create_with_base};
    use tempfile::TempDir;

    #[test]
    fn field_list_covers_every_serialized_key() {
        let value = serde_yaml::to_value(Config::default()).unwrap();
        let serde_yaml::Value::Mapping(map) = value else {
            panic!("config should serialize to a mapping");
        };
        assert_eq!(map.len(), Config::fields().len());
        for field in Config::fields() {
            assert!(
                map.contains_key(serde_yaml::Value::String(field.name.to_string())),
                "missing field meta for {}",
                field.name
            );
        }
    }

    #[test]
    fn generated_yaml_round_trips_through_loader() {
        let temp = TempDir::new().unwrap();
        let yaml = generate_yaml_with_comments(&Config::default()).unwrap();
        std::fs::write(temp.path().join("config.yml"), yaml).unwrap();

        let cfg: Config = load_or_create_with_base(None, Some(temp.path())).unwrap();
        assert_eq!(cfg.max_workers, 3);
        assert_eq!(cfg.pool_exhausted_fallback, FallbackPolicy::Direct);
        assert_eq!(cfg.extract_policy, ExtractPolicy::Overwrite);
    }

    #[test]
    fn proxy_nodes_and_policies_parse_from_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.yml"),
            "proxy_nodes:\n  - name: hk\n    endpoint: socks5h://127.0.0.1:7891\nproxy_region: 香港\npool_exhausted_fallback: fail\nextract_policy: skip\n",
        )
        .unwrap();

        let cfg: Config = load_or_create_with_base(None, Some(temp.path())).unwrap();
        assert_eq!(cfg.proxy_nodes.len(), 1);
        assert_eq!(cfg.proxy_nodes[0].name, "hk");
        assert_eq!(cfg.proxy_region, "香港");
        assert_eq!(cfg.pool_exhausted_fallback, FallbackPolicy::Fail);
        assert_eq!(cfg.extract_policy, ExtractPolicy::Skip);
    }

    #[test]
    fn rejects_inverted_wait_bounds() {
        let cfg = Config {
            min_wait_time: 5000,
            max_wait_time: 10,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn relative_paths_resolve_against_data_dir() {
        let cfg = Config::default();
        let base = Path::new("/data");
        assert_eq!(cfg.database_file(Some(base)), PathBuf::from("/data/reports.db"));
        assert_eq!(cfg.default_save_dir(Some(base)), PathBuf::from("/data/downloads"));
        assert_eq!(cfg.clash_config(Some(base)), None);
        assert_eq!(cfg.connect_timeout(), Some(Duration::from_secs_f64(3.05)));
    }
}
