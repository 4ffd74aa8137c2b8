//! Client request parsing and upstream replay
//!
//! Three request flavors share one capability surface: HTTP (including
//! CONNECT), SOCKS4a and SOCKS5. Each variant owns its parser, its
//! protocol acknowledgement, and its upstream replay. The replay path is
//! where the cached TLS ClientHello gets re-sent, optionally as a
//! segmented write that straddles the SNI name.

mod http;
mod socks;
mod socks4a;
mod socks5;

pub use http::{HttpRequest, RequestRewriter, TargetUrl};
pub use socks4a::Socks4aRequest;
pub use socks5::{authorize, Socks5Request};

use async_trait::async_trait;
use thiserror::Error;

use crate::conn::BufConn;
use crate::relay::{Forwarder, TunnelVerdict};

/// SOCKS request commands as defined in rfc1928.
pub const CMD_CONNECT: u8 = 1;
pub const CMD_BIND: u8 = 2;
pub const CMD_UDP_ASSOCIATE: u8 = 3;

/// Request parsing errors
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed HTTP request: {0}")]
    MalformedHttp(&'static str),

    #[error("not SOCKS4a")]
    NotSocks4a,

    #[error("not SOCKS5")]
    NotSocks5,

    #[error("illegal SOCKS packet")]
    ShortPacket,

    #[error("invalid SOCKS5 address type: {0}")]
    InvalidAddrType(u8),
}

/// The polymorphic request surface the dispatcher works against.
#[async_trait]
pub trait Requester: Send {
    /// The request command: "CONNECT", "GET", "BIND", ...
    fn command(&self) -> &str;

    /// The raw request target as the client spelled it.
    fn target(&self) -> String;

    /// Destination as `host:port`.
    fn host(&self) -> String;

    /// Destination host only.
    fn hostname(&self) -> &str;

    /// Destination port.
    fn port(&self) -> u16;

    /// Send the protocol acknowledgement and cache the client's first
    /// data packet, typically a TLS ClientHello. Idempotent: only the
    /// first call acks.
    async fn get_request(&mut self, client: &mut BufConn) -> std::io::Result<()>;

    /// Replay the request upstream and relay until both halves finish.
    /// `via_proxy` selects absolute-form request targets for HTTP;
    /// `segment` straddles the SNI name across two writes.
    async fn send(
        &mut self,
        fw: Forwarder<'_>,
        via_proxy: bool,
        segment: bool,
    ) -> TunnelVerdict;
}

/// Split point for an SNI-straddling write: the middle of the hostname as
/// found inside the cached ClientHello. A middlebox matching the name
/// against single-read windows loses it across the boundary.
pub(crate) fn sni_split_at(data: &[u8], host: &str) -> usize {
    if host.is_empty() {
        return 0;
    }
    match data
        .windows(host.len())
        .position(|w| w == host.as_bytes())
    {
        Some(i) => i + host.len() / 2,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sni_split_lands_mid_host() {
        let mut hello = b"\x16\x03\x01----".to_vec();
        hello.extend_from_slice(b"example.com");
        hello.extend_from_slice(b"....");
        let at = sni_split_at(&hello, "example.com");
        assert_eq!(at, 7 + 11 / 2);
        // the split leaves half the name on each side
        assert!(at > 7 && at < 7 + 11);
    }

    #[test]
    fn test_sni_split_absent_host_disables() {
        assert_eq!(sni_split_at(b"\x16\x03\x01", "example.com"), 0);
        assert_eq!(sni_split_at(b"anything", ""), 0);
    }
}
