//! HTTP 传输层：经由代理节点或直连发起（可带 Range 的）GET 请求。

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_RANGE, CONTENT_TYPE, RANGE, REFERER};
use tracing::debug;

use super::error::TransferError;
use crate::base_system::context::Config;
use crate::proxy::selector::Route;

#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    /// `Some(k)` 时发送 `Range: bytes=k-`
    pub range_start: Option<u64>,
    pub referer: Option<&'a str>,
}

/// `Content-Range: bytes <start>-<end>/<total|*>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(raw: &str) -> Option<Self> {
        let spec = raw.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = spec.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
            total,
        })
    }
}

pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    pub content_type: Option<String>,
    pub body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync {
    fn fetch(&self, route: &Route, request: &FetchRequest<'_>) -> Result<FetchResponse, TransferError>;
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Option<Duration>,
    pub user_agent: String,
}

impl HttpSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout: cfg.request_timeout(),
            connect_timeout: cfg.connect_timeout(),
            user_agent: cfg.user_agent.clone(),
        }
    }
}

/// 基于 reqwest 阻塞客户端的传输实现，每条路由缓存一个客户端。
pub struct HttpTransport {
    settings: HttpSettings,
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpTransport {
    pub fn new(settings: HttpSettings) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, route: &Route) -> Result<Client, TransferError> {
        let key = route.label().to_string();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .user_agent(self.settings.user_agent.as_str())
            .timeout(self.settings.timeout);
        if let Some(connect) = self.settings.connect_timeout {
            builder = builder.connect_timeout(connect);
        }
        if let Route::Node(node) = route {
            let proxy = reqwest::Proxy::all(node.endpoint.as_str())
                .map_err(|e| TransferError::Network(format!("proxy {}: {e}", node.id)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| TransferError::Network(format!("client for {key}: {e}")))?;
        debug!(target: "download", "created http client for route {}", key);
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, route: &Route, request: &FetchRequest<'_>) -> Result<FetchResponse, TransferError> {
        let client = self.client_for(route)?;
        let mut req = client.get(request.url).header(ACCEPT, "*/*");
        if let Some(start) = request.range_start {
            req = req.header(RANGE, format!("bytes={start}-"));
        }
        if let Some(referer) = request.referer {
            req = req.header(REFERER, referer);
        }

        let resp = req.send().map_err(|e| {
            if e.is_timeout() {
                TransferError::Network(format!("timeout via {}: {e}", route.label()))
            } else {
                TransferError::Network(format!("request via {} failed: {e}", route.label()))
            }
        })?;

        let header = |name| {
            resp.headers()
                .get(name)
                .and_then(|v: &reqwest::header::HeaderValue| v.to_str().ok())
                .map(str::to_string)
        };
        let content_range = header(CONTENT_RANGE).as_deref().and_then(ContentRange::parse);
        let content_type = header(CONTENT_TYPE);

        Ok(FetchResponse {
            status: resp.status().as_u16(),
            content_length: resp.content_length(),
            content_range,
            content_type,
            body: Box::new(resp),
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! 内存中的假传输，按预设脚本返回响应。

    use super::*;
    use std::collections::VecDeque;
    use std::io::{self, Cursor};

    #[derive(Debug, Clone)]
    pub(crate) enum Scripted {
        Status(u16),
        NetworkError,
        /// 正常响应，但读取 n 字节后连接中断
        CutAfter(usize),
        /// 返回另一份内容（完整 200）
        Serve(Vec<u8>),
        Html,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct SeenRequest {
        pub(crate) route: String,
        pub(crate) range_start: Option<u64>,
        pub(crate) referer: Option<String>,
    }

    pub(crate) struct FakeTransport {
        content: Vec<u8>,
        ignore_range: bool,
        script: Mutex<VecDeque<Scripted>>,
        seen: Mutex<Vec<SeenRequest>>,
    }

    impl FakeTransport {
        pub(crate) fn new(content: &[u8]) -> Self {
            Self {
                content: content.to_vec(),
                ignore_range: false,
                script: Mutex::new(VecDeque::new()),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn ignoring_range(mut self) -> Self {
            self.ignore_range = true;
            self
        }

        pub(crate) fn then(self, step: Scripted) -> Self {
            self.script.lock().unwrap().push_back(step);
            self
        }

        pub(crate) fn seen(&self) -> Vec<SeenRequest> {
            self.seen.lock().unwrap().clone()
        }

        fn serve(&self, data: &[u8], range_start: Option<u64>, cut: Option<usize>) -> FetchResponse {
            let len = data.len() as u64;
            let (status, start, content_range) = match range_start {
                Some(k) if !self.ignore_range && k >= len => {
                    return FetchResponse {
                        status: 416,
                        content_length: Some(0),
                        content_range: None,
                        content_type: None,
                        body: Box::new(io::empty()),
                    };
                }
                Some(k) if !self.ignore_range => (
                    206,
                    k,
                    Some(ContentRange {
                        start: k,
                        end: len - 1,
                        total: Some(len),
                    }),
                ),
                _ => (200, 0, None),
            };
            let part = data[start as usize..].to_vec();
            let body: Box<dyn Read + Send> = match cut {
                Some(n) => Box::new(CutReader {
                    inner: Cursor::new(part.clone()),
                    remaining: n,
                }),
                None => Box::new(Cursor::new(part.clone())),
            };
            FetchResponse {
                status,
                content_length: Some(part.len() as u64),
                content_range,
                content_type: Some("application/zip".to_string()),
                body,
            }
        }
    }

    impl Transport for FakeTransport {
        fn fetch(&self, route: &Route, request: &FetchRequest<'_>) -> Result<FetchResponse, TransferError> {
            self.seen.lock().unwrap().push(SeenRequest {
                route: route.label().to_string(),
                range_start: request.range_start,
                referer: request.referer.map(str::to_string),
            });
            let step = self.script.lock().unwrap().pop_front();
            match step {
                None => Ok(self.serve(&self.content, request.range_start, None)),
                Some(Scripted::Status(status)) => Ok(FetchResponse {
                    status,
                    content_length: Some(0),
                    content_range: None,
                    content_type: None,
                    body: Box::new(io::empty()),
                }),
                Some(Scripted::NetworkError) => {
                    Err(TransferError::Network("connection refused".to_string()))
                }
                Some(Scripted::CutAfter(n)) => Ok(self.serve(&self.content, request.range_start, Some(n))),
                Some(Scripted::Serve(other)) => Ok(self.serve(&other, None, None)),
                Some(Scripted::Html) => {
                    let mut resp = self.serve(b"<html>denied</html>", None, None);
                    resp.content_type = Some("text/html; charset=utf-8".to_string());
                    Ok(resp)
                }
            }
        }
    }

    struct CutReader {
        inner: Cursor<Vec<u8>>,
        remaining: usize,
    }

    impl Read for CutReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
            }
            let max = buf.len().min(self.remaining);
            let n = self.inner.read(&mut buf[..max])?;
            self.remaining -= n;
            Ok(n)
        }
    }
}
