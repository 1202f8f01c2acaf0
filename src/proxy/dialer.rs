//! 节点连通性探测。

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use super::node::ProxyNode;

/// 探测节点往返延迟的能力。
pub trait Dialer: Send + Sync {
    fn probe(&self, node: &ProxyNode, timeout: Duration) -> io::Result<Duration>;
}

/// 以 TCP 建连耗时作为节点延迟。
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl TcpDialer {
    pub fn connect(&self, node: &ProxyNode, timeout: Duration) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in node.address().to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", node.host))
        }))
    }
}

impl Dialer for TcpDialer {
    fn probe(&self, node: &ProxyNode, timeout: Duration) -> io::Result<Duration> {
        let started = Instant::now();
        let stream = self.connect(node, timeout)?;
        let elapsed = started.elapsed();
        drop(stream);
        Ok(elapsed)
    }
}
