//! # Waypoint
//!
//! A local multi-protocol proxy dispatcher. Waypoint accepts HTTP (including
//! CONNECT), SOCKS4a and SOCKS5 clients on the same listening port and, per
//! connection, decides whether to reach the destination directly or through a
//! ranked pool of upstream proxies.
//!
//! ## Features
//!
//! - **Adaptive routing** driven by a per-destination EWMA success score
//! - **Static rules** for hosts that must always go direct or always proxied
//! - **Latency-ranked upstream pools** for http / socks5 / socks4a proxies
//! - **Parallel per-IP dialing** racing every resolved address
//! - **TLS-aware relaying** that distinguishes handshake failure from
//!   application-phase failure, with SNI-straddling segmented writes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Front-ends                        │
//! │       (first-byte demux: HTTP, SOCKS4a, SOCKS5)     │
//! ├─────────────────────────────────────────────────────┤
//! │                    Dispatcher                        │
//! │   (static rules, host stats, retry budgets, racing) │
//! ├─────────────────────────────────────────────────────┤
//! │              Relay / Request replay                  │
//! │      (TLS phase tracking, ClientHello re-send)      │
//! ├─────────────────────────────────────────────────────┤
//! │           Upstream pools & liveness probes           │
//! │      (per-scheme ranking, periodic re-probing)      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod conn;
pub mod dispatch;
pub mod pool;
pub mod probe;
pub mod relay;
pub mod request;
pub mod rules;
pub mod server;
pub mod stats;

pub use config::Config;
pub use dispatch::AppContext;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listening address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:6699";

/// Default upstream dial/handshake timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Conn(#[from] conn::ConnError),

    #[error("Request error: {0}")]
    Request(#[from] request::RequestError),

    #[error("Probe error: {0}")]
    Probe(#[from] probe::ProbeError),

    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Configuration error: {0}")]
    Config(String),
}
