//! 代理节点定义与加载。
//!
//! 节点来源有两种：`config.yml` 中的 `proxy_nodes`，以及 Clash 配置里的 `proxies` 列表。
//! 这里只做解析与校验，不发起任何网络请求。

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "socks5", "socks5h"];

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid endpoint for node {id}: {reason}")]
    InvalidEndpoint { id: String, reason: String },
    #[error("duplicate proxy node id: {0}")]
    DuplicateId(String),
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid clash config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// 配置文件中的一条节点声明。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyNodeConfig {
    pub name: String,
    pub endpoint: String,
}

/// 某一时刻的节点快照。`latency` 为 `None` 表示未测或不可达（视为无穷大）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyNode {
    pub id: String,
    pub endpoint: String,
    pub host: String,
    pub port: u16,
    pub latency: Option<Duration>,
    pub consecutive_failures: u32,
}

impl ProxyNode {
    pub fn parse(id: &str, endpoint: &str) -> Result<Self, NodeError> {
        let invalid = |reason: String| NodeError::InvalidEndpoint {
            id: id.to_string(),
            reason,
        };
        let url = Url::parse(endpoint.trim()).map_err(|e| invalid(e.to_string()))?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .or_else(|| url.scheme().starts_with("socks5").then_some(1080))
            .ok_or_else(|| invalid("missing port".to_string()))?;

        Ok(Self {
            id: id.to_string(),
            endpoint: endpoint.trim().to_string(),
            host,
            port,
            latency: None,
            consecutive_failures: 0,
        })
    }

    pub fn address(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

/// 把声明式配置转换为节点列表。节点 id 不允许重复，空 id 会被拒绝。
pub fn load_nodes(configs: &[ProxyNodeConfig]) -> Result<Vec<ProxyNode>, NodeError> {
    let mut seen = HashSet::new();
    let mut nodes = Vec::with_capacity(configs.len());
    for cfg in configs {
        let id = cfg.name.trim();
        if id.is_empty() {
            return Err(NodeError::InvalidEndpoint {
                id: cfg.endpoint.clone(),
                reason: "empty node name".to_string(),
            });
        }
        if !seen.insert(id.to_string()) {
            return Err(NodeError::DuplicateId(id.to_string()));
        }
        nodes.push(ProxyNode::parse(id, &cfg.endpoint)?);
    }
    debug!(target: "proxy", "loaded {} proxy nodes", nodes.len());
    Ok(nodes)
}

#[derive(Debug, Deserialize)]
struct ClashFile {
    #[serde(default)]
    proxies: Vec<ClashProxy>,
}

#[derive(Debug, Deserialize)]
struct ClashProxy {
    name: String,
    server: String,
    port: u16,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    tls: bool,
}

/// 读取 Clash 风格配置中的 `proxies`。
///
/// 只有 `http` / `socks5` 类型可以直接作为 HTTP 客户端代理使用；
/// 其它协议（ss、vmess、trojan 等）需要外部隧道进程，这里跳过并记录警告。
pub fn load_clash_nodes(path: &Path) -> Result<Vec<ProxyNodeConfig>, NodeError> {
    let raw = fs::read_to_string(path).map_err(|source| NodeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ClashFile = serde_yaml::from_str(&raw).map_err(|source| NodeError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut out = Vec::new();
    for proxy in file.proxies {
        let scheme = match proxy.kind.to_ascii_lowercase().as_str() {
            "http" if proxy.tls => "https",
            "http" => "http",
            "socks5" => "socks5h",
            other => {
                warn!(target: "proxy", "跳过不支持的节点类型 {}: {}", other, proxy.name);
                continue;
            }
        };
        let host = if proxy.server.contains(':') && !proxy.server.starts_with('[') {
            format!("[{}]", proxy.server)
        } else {
            proxy.server.clone()
        };
        out.push(ProxyNodeConfig {
            name: proxy.name,
            endpoint: format!("{scheme}://{host}:{}", proxy.port),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cfg(name: &str, endpoint: &str) -> ProxyNodeConfig {
        ProxyNodeConfig {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    #[test]
    fn parses_supported_endpoints() {
        let nodes = load_nodes(&[
            cfg("a", "http://10.0.0.1:8080"),
            cfg("b", "socks5h://proxy.local:7891"),
            cfg("c", "socks5://127.0.0.1"),
        ])
        .unwrap();
        assert_eq!(nodes[0].address(), ("10.0.0.1", 8080));
        assert_eq!(nodes[1].address(), ("proxy.local", 7891));
        assert_eq!(nodes[2].port, 1080);
        assert!(nodes.iter().all(|n| n.latency.is_none()));
    }

    #[test]
    fn rejects_duplicates_and_bad_schemes() {
        let dup = load_nodes(&[cfg("a", "http://h:1"), cfg("a", "http://h:2")]);
        assert!(matches!(dup, Err(NodeError::DuplicateId(id)) if id == "a"));

        let bad = load_nodes(&[cfg("x", "ftp://h:21")]);
        assert!(matches!(bad, Err(NodeError::InvalidEndpoint { .. })));

        let garbage = load_nodes(&[cfg("y", "not a url")]);
        assert!(matches!(garbage, Err(NodeError::InvalidEndpoint { .. })));
    }

    #[test]
    fn clash_import_keeps_http_and_socks_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("clash.yaml");
        fs::write(
            &path,
            r#"
port: 7890
proxies:
  - { name: "香港01", type: ss, server: hk.example.com, port: 8388, cipher: aes-256-gcm, password: x }
  - { name: "日本02", type: socks5, server: 127.0.0.1, port: 7891 }
  - { name: "美国03", type: http, server: us.example.com, port: 443, tls: true }
"#,
        )
        .unwrap();

        let nodes = load_clash_nodes(&path).unwrap();
        assert_eq!(
            nodes,
            vec![
                cfg("日本02", "socks5h://127.0.0.1:7891"),
                cfg("美国03", "https://us.example.com:443"),
            ]
        );
        assert!(load_nodes(&nodes).is_ok());
    }

    #[test]
    fn clash_file_without_proxies_is_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("clash.yaml");
        fs::write(&path, "mode: rule\n").unwrap();
        assert!(load_clash_nodes(&path).unwrap().is_empty());
    }
}
