//! Liveness probes
//!
//! A probe opens a connection (directly, or through an upstream proxy),
//! sends the smallest payload the target scheme will answer, and counts
//! any response byte as success. It establishes liveness, not correctness.
//!
//! Also hosts the global online flag: while the periodic direct probe
//! fails, per-destination stats are not updated, since the failures say
//! more about us than about the destinations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::conn::{self, ConnError, DialError, Endpoint, Scheme};

/// Interval between online probes.
pub const ONLINE_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// A bare TLS alert record (type 21, version 3.3, length 1): the shortest
/// write an HTTPS endpoint reliably answers.
const TLS_PROBE: &[u8] = b"\x15\x03\x03\x00\x01\x00";

/// Probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error("unknown probe scheme: {0}")]
    UnknownScheme(String),

    #[error("probe URL is invalid: {0}")]
    BadUrl(String),

    #[error("no response")]
    NoResponse,
}

/// Checks one URL, directly or through an outer proxy.
#[derive(Debug, Clone)]
pub struct Checker {
    /// What gets dialed: the probe URL itself, or the proxy in front of it.
    url: Endpoint,
    /// When probing through a proxy, the URL to CONNECT onward to.
    target: Option<Endpoint>,
    timeout: Duration,
}

impl Checker {
    pub fn new(url: &str, timeout: Duration, proxied: Option<&str>) -> Result<Self, ProbeError> {
        if url.is_empty() {
            return Err(ProbeError::BadUrl("empty URL".to_string()));
        }
        let url = Endpoint::parse(url).map_err(|e| ProbeError::BadUrl(e.to_string()))?;
        let target = match proxied {
            Some(p) => {
                Some(Endpoint::parse(p).map_err(|e| ProbeError::BadUrl(e.to_string()))?)
            }
            None => None,
        };
        Ok(Self {
            url,
            target,
            timeout,
        })
    }

    /// Probe through a proxy endpoint toward `target`.
    pub fn via_proxy(proxy: Endpoint, target: Endpoint, timeout: Duration) -> Self {
        Self {
            url: proxy,
            target: Some(target),
            timeout,
        }
    }

    /// Run one probe round: dial, bond if proxied, transfer, read a byte.
    pub async fn check(&self) -> Result<(), ProbeError> {
        let mut conn = conn::dial_endpoint(&self.url, self.timeout).await?;
        let result = self.transfer(&mut conn).await;
        conn.shutdown().await;
        result
    }

    async fn transfer(&self, conn: &mut conn::BufConn) -> Result<(), ProbeError> {
        if let Some(target) = &self.target {
            // http and https outer URLs both bond with plain CONNECT
            let scheme = match self.url.scheme.as_str() {
                "http" | "https" => Scheme::Http,
                s => s
                    .parse::<Scheme>()
                    .map_err(|_| ProbeError::UnknownScheme(s.to_string()))?,
            };
            conn::bond(conn, scheme, "CONNECT", &target.host, target.port, self.timeout)
                .await?;
        }

        let probed = self.target.as_ref().unwrap_or(&self.url);
        match probed.scheme.as_str() {
            "https" => conn.write_all(TLS_PROBE).await?,
            "http" => {
                let head = format!("HEAD / HTTP/1.1\r\nHost: {}\r\n\r\n", probed.host);
                conn.write_all(head.as_bytes()).await?;
            }
            s => return Err(ProbeError::UnknownScheme(s.to_string())),
        }

        match tokio::time::timeout(self.timeout, conn.read_byte()).await {
            Ok(Ok(_)) => {
                // any byte is enough; drop the rest of the burst
                let _ = conn.read_data();
                Ok(())
            }
            _ => Err(ProbeError::NoResponse),
        }
    }
}

/// Coarse-grained online flag. Starts optimistic.
#[derive(Debug)]
pub struct Online {
    flag: AtomicBool,
}

impl Default for Online {
    fn default() -> Self {
        Self::new()
    }
}

impl Online {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn set(&self, online: bool) {
        self.flag.store(online, Ordering::Relaxed);
    }
}

/// Keep probing the given URL directly and maintain the online flag.
/// With no usable probe URL the flag stays permanently optimistic.
pub fn start_probe_direct(url: &str, timeout: Duration) -> Arc<Online> {
    let online = Arc::new(Online::new());
    match Checker::new(url, timeout, None) {
        Ok(checker) => {
            let flag = Arc::clone(&online);
            tokio::spawn(async move {
                loop {
                    let up = checker.check().await.is_ok();
                    if up != flag.is_online() {
                        info!("we are {}", if up { "online" } else { "offline" });
                    }
                    flag.set(up);
                    tokio::time::sleep(ONLINE_PROBE_INTERVAL).await;
                }
            });
        }
        Err(e) => {
            warn!("{}; no probing URL available, always acting as online", e);
        }
    }
    online
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_http_probe_any_byte_is_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"HEAD / HTTP/1.1\r\n"));
            socket.write_all(b"x").await.unwrap();
        });

        let checker = Checker::new(
            &format!("http://{}", addr),
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        checker.check().await.unwrap();
    }

    #[tokio::test]
    async fn test_https_probe_sends_tls_alert() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"\x15\x03\x03\x00\x01\x00");
            socket.write_all(b"\x15").await.unwrap();
        });

        // parse as https needs the right default port, so spell it out
        let checker = Checker::new(
            &format!("https://{}:{}", addr.ip(), addr.port()),
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        checker.check().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_is_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let checker = Checker::new(
            &format!("http://{}", addr),
            Duration::from_millis(100),
            None,
        )
        .unwrap();
        assert!(matches!(
            checker.check().await.unwrap_err(),
            ProbeError::NoResponse
        ));
    }

    #[test]
    fn test_online_flag_defaults_true() {
        let online = Online::new();
        assert!(online.is_online());
        online.set(false);
        assert!(!online.is_online());
    }
}
