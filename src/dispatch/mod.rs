//! The dispatcher
//!
//! Decides, per request, whether the client is served directly or by an
//! upstream proxy, how many tries each path deserves, and feeds the
//! outcome back into the per-destination stats. Strategy comes from three
//! sources in priority order: "not an Internet host" always goes direct,
//! static rules override everything else, and otherwise the stats decide
//! the direct-try budget.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::conn::{self, BufConn, DialError, Scheme};
use crate::pool::{PoolError, PoolSet, Proxy, ProxyPool};
use crate::probe::Online;
use crate::relay::{Forwarder, TunnelVerdict};
use crate::request::{Requester, RequestRewriter};
use crate::rules::{host_is_ip, StaticHosts, Strategy};
use crate::stats::{HostStat, HostStats, EWMA_WINDOW};

/// Synthetic TLS alert for a CONNECT whose destination failed DNS.
const TLS_DNS_ALERT: &[u8] = b"\x15\x03\x03\x00\x02\x02\x00";

/// Synthetic HTTP status for a plain request whose destination failed DNS.
const HTTP_DNS_ERROR: &[u8] = b"HTTP/1.1 569 DNS Orz\r\n\r\n";

/// Everything the dispatcher consults, passed explicitly instead of
/// living in globals.
#[derive(Debug)]
pub struct AppContext {
    pub rules: StaticHosts,
    pub stats: Arc<HostStats>,
    pub pools: Arc<PoolSet>,
    pub online: Arc<Online>,
    /// Base dial/handshake timeout.
    pub timeout: Duration,
    pub parallel_dial: bool,
}

/// One dispatch, serving one client request.
pub struct Dispatcher<'a> {
    ctx: &'a AppContext,
    server_type: Scheme,
    client: &'a mut BufConn,
    dest_host: String,
    dest_port: u16,
    timeout: Duration,
    // per-request state
    max_tries: u32,
    tried: u32,
    direct_wave: f64,
    max_proxy_tries: u32,
    proxy_tried: u32,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        ctx: &'a AppContext,
        server_type: Scheme,
        client: &'a mut BufConn,
        dest_host: String,
        dest_port: u16,
    ) -> Self {
        let timeout = ctx.timeout;
        Self {
            ctx,
            server_type,
            client,
            dest_host,
            dest_port,
            timeout,
            max_tries: 0,
            tried: 0,
            direct_wave: 1.0,
            max_proxy_tries: 0,
            proxy_tried: 0,
        }
    }

    /// Serve the request: direct tries, then proxy tries, then the
    /// blocked-but-no-proxy fallback. Returns whether anything worked.
    pub async fn dispatch<R: Requester>(&mut self, req: &mut R) -> bool {
        let strategy;
        if not_internet_host(&self.dest_host) {
            debug!("{} isn't an Internet host, won't go proxied", self.dest_host);
            strategy = Strategy::Direct;
            self.max_tries = 3;
            self.max_proxy_tries = 0;
        } else {
            self.max_proxy_tries = 3;
            strategy = self.ctx.rules.get_strategy(&self.dest_host);
            match strategy {
                Strategy::Direct => {
                    self.max_tries = 3;
                    self.max_proxy_tries = 0;
                }
                Strategy::Blocked => {
                    self.max_tries = 0;
                }
                Strategy::Nil => {
                    let stat = self.ctx.stats.get_stat(&self.stat_key());
                    let (tries, wave) = direct_try_budget(&stat);
                    self.max_tries = tries;
                    self.direct_wave = wave;
                }
            }
        }

        let log_pre = format!(
            "[{}] {} {} <- {}",
            self.server_type,
            req.command(),
            req.host(),
            self.client.peer_addr()
        );
        info!("{} [type:{}]", log_pre, strategy);

        let key = self.stat_key();
        self.tried = 0;
        while self.tried < self.max_tries {
            let verdict = self.serve_direct(req).await;
            let ok = verdict.error.is_none();
            let sample = if ok { 1.0 } else { 0.0 };
            if self.ctx.online.is_online() && strategy == Strategy::Nil {
                self.ctx.stats.update(&key, sample);
                if verdict.restart {
                    // count twice so a recovered host climbs back fast
                    self.ctx.stats.update(&key, sample);
                }
            }
            if ok || verdict.restart {
                return ok;
            }
            // dialing or receiving ServerHello failed; next try
            self.tried += 1;
        }

        self.proxy_tried = 0;
        while self.proxy_tried < self.max_proxy_tries {
            let verdict = self.serve_proxied(req).await;
            if verdict.error.is_none() {
                return true;
            }
            if verdict.restart {
                return false;
            }
            self.proxy_tried += 1;
        }

        // a blocked host with no working proxy still deserves one direct shot
        if self.max_tries == 0 {
            info!("{} <= no proxy succeeded, try direct once", log_pre);
            self.max_tries = 1;
            self.tried = 0;
            let verdict = self.serve_direct(req).await;
            let ok = verdict.error.is_none();
            if self.ctx.online.is_online() && strategy == Strategy::Nil {
                self.ctx.stats.update(&key, if ok { 1.0 } else { 0.0 });
            }
            return ok;
        }
        false
    }

    fn stat_key(&self) -> String {
        format!("{}:{}", self.dest_host, self.dest_port)
    }

    /// One direct attempt.
    async fn serve_direct<R: Requester>(&mut self, req: &mut R) -> TunnelVerdict {
        let log_pre = format!(
            "[{}] direct:{}/{} {} {}",
            self.server_type,
            self.tried + 1,
            self.max_tries,
            req.command(),
            req.host()
        );

        if req.command() == "CONNECT" {
            match timeout(2 * self.timeout, req.get_request(self.client)).await {
                Ok(Ok(())) => {}
                _ => {
                    warn!("{} <= TLS: no ClientHello, drop it", log_pre);
                    return TunnelVerdict {
                        restart: true,
                        error: Some(no_client_hello()),
                    };
                }
            }
        }

        match self.dispatch_ip().await {
            Ok(right) => {
                debug!(
                    "{} => {} <-> {} <-> {}",
                    log_pre,
                    self.client.peer_addr(),
                    right.local_addr(),
                    right.peer_addr()
                );
                let mut wave = self.direct_wave;
                if self.max_tries > 1 && self.tried < 1 {
                    wave = 1.0;
                }
                let segment = self.tried == self.max_tries / 2;
                let mut fw = Forwarder::new(
                    self.client,
                    right,
                    self.timeout,
                    wave.clamp(0.1, 1.0),
                );
                if req.command() != "CONNECT" {
                    fw = fw.with_transform(Box::new(RequestRewriter { via_proxy: false }));
                }
                let verdict = req.send(fw, false, segment).await;
                if let Some(e) = &verdict.error {
                    info!("{} <= {}", log_pre, e);
                }
                verdict
            }
            Err(DialError::Dns(e)) => {
                // Trust the configured DNS: a blocked name will not start
                // resolving on a second try. Tell the client and stop.
                info!("{} <= DNS: {}", log_pre, e);
                let reply = if req.command() == "CONNECT" {
                    TLS_DNS_ALERT
                } else {
                    HTTP_DNS_ERROR
                };
                let error = self.client.write_all(reply).await.err();
                TunnelVerdict {
                    restart: false,
                    error,
                }
            }
            Err(DialError::Connect(e)) => {
                info!("{} <= {}", log_pre, e);
                TunnelVerdict {
                    restart: false,
                    error: Some(e),
                }
            }
        }
    }

    /// One proxied attempt.
    async fn serve_proxied<R: Requester>(&mut self, req: &mut R) -> TunnelVerdict {
        let log_pre = format!(
            "[{}] proxy:{}/{} {} {}",
            self.server_type,
            self.proxy_tried + 1,
            self.max_proxy_tries,
            req.command(),
            req.host()
        );

        if req.command() == "CONNECT" {
            match timeout(2 * self.timeout, req.get_request(self.client)).await {
                Ok(Ok(())) => {}
                _ => {
                    warn!("{} <= TLS: no ClientHello, drop it", log_pre);
                    return TunnelVerdict {
                        restart: true,
                        error: Some(no_client_hello()),
                    };
                }
            }
        }

        let (pool, proxy) = match self.pick_proxy() {
            Ok(pair) => pair,
            Err(e) => {
                info!("{} <= {}", log_pre, e);
                return TunnelVerdict {
                    restart: false,
                    error: Some(other_error(&e.to_string())),
                };
            }
        };

        let verdict = if proxy.has_auth() {
            // rejected, but it was still selected: the penalty below must
            // push it down the ranking like any other failure
            let e = PoolError::AuthUnsupported;
            info!("{} <= {}", log_pre, e);
            TunnelVerdict {
                restart: false,
                error: Some(other_error(&e.to_string())),
            }
        } else {
            self.relay_via(req, &pool, &proxy, &log_pre).await
        };
        if verdict.error.is_some() && self.ctx.online.is_online() {
            pool.penalize(&proxy.url, 3 * pool.timeout);
        }
        verdict
    }

    fn pick_proxy(&self) -> Result<(Arc<ProxyPool>, Proxy), PoolError> {
        let pool = self
            .ctx
            .pools
            .get(self.server_type)
            .ok_or(PoolError::NoProxy)?;
        let proxy = pool
            .get_proxy(self.proxy_tried as usize)
            .ok_or(PoolError::NoProxy)?;
        Ok((pool, proxy))
    }

    async fn relay_via<R: Requester>(
        &mut self,
        req: &mut R,
        pool: &ProxyPool,
        proxy: &Proxy,
        log_pre: &str,
    ) -> TunnelVerdict {
        let mut right = match conn::dial_endpoint(&proxy.url, pool.timeout).await {
            Ok(c) => c,
            Err(e) => {
                info!("{} <= {}", log_pre, e);
                return TunnelVerdict {
                    restart: false,
                    error: Some(other_error(&e.to_string())),
                };
            }
        };
        debug!(
            "{} => {} <-> {} <-> {}",
            log_pre,
            self.client.peer_addr(),
            right.local_addr(),
            proxy.url
        );
        if let Err(e) = conn::bond(
            &mut right,
            self.server_type,
            req.command(),
            req.hostname(),
            req.port(),
            pool.timeout,
        )
        .await
        {
            info!("{} <= {}", log_pre, e);
            return TunnelVerdict {
                restart: false,
                error: Some(other_error(&e.to_string())),
            };
        }
        let fw = Forwarder::new(self.client, right, self.timeout, 1.0);
        let verdict = req.send(fw, true, false).await;
        if let Some(e) = &verdict.error {
            info!("{} <= {}", log_pre, e);
        }
        verdict
    }

    /// Get an upstream connection, racing every resolved IP when allowed.
    /// Racing is skipped on the first try of a multi-try sequence (one
    /// serial attempt first) and for IP-literal hosts.
    async fn dispatch_ip(&self) -> Result<BufConn, DialError> {
        if !self.ctx.parallel_dial
            || (self.tried < 1 && self.max_tries > 1)
            || host_is_ip(&self.dest_host)
        {
            return conn::dial(&self.dest_host, self.dest_port, self.timeout).await;
        }
        race_dial(&self.dest_host, self.dest_port, self.timeout).await
    }
}

/// Resolve the host and dial every address concurrently. The first
/// established connection wins; the rest are dropped as they finish. If
/// nothing connects, the last error is reported.
pub(crate) async fn race_dial(
    host: &str,
    port: u16,
    dial_timeout: Duration,
) -> Result<BufConn, DialError> {
    // DNS or host filtering may map a name to 0.0.0.0 or 127.0.0.1; we
    // trust the resolver's answer either way.
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(DialError::Dns)?
        .collect();
    if addrs.is_empty() {
        return Err(DialError::Dns(other_error("no addresses resolved")));
    }

    let mut dials = JoinSet::new();
    for addr in addrs {
        dials.spawn(async move { conn::dial_addr(addr, dial_timeout).await });
    }

    let mut last_err = None;
    while let Some(joined) = dials.join_next().await {
        match joined {
            Ok(Ok(conn)) => {
                // late winners get dropped (closed) as their tasks end
                dials.abort_all();
                return Ok(conn);
            }
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {}
        }
    }
    Err(DialError::Connect(
        last_err.unwrap_or_else(|| other_error("dial race failed")),
    ))
}

/// The direct-try budget a destination's history earns, plus the wave
/// factor for TLS keepalive scaling.
pub(crate) fn direct_try_budget(stat: &HostStat) -> (u32, f64) {
    let v = if stat.count == 0 { 1.0 } else { stat.value };
    let tries = if v > 0.8 {
        3
    } else if v > 0.6 {
        2
    } else if v > 0.4 || stat.count <= EWMA_WINDOW {
        1
    } else {
        let age = stat
            .age()
            .unwrap_or_else(chrono::Duration::zero)
            .num_minutes();
        if v > 0.3 && age > 5 {
            1
        } else if v > 0.2 && age > 7 {
            1
        } else if v > 0.1 && age > 13 {
            1
        } else if age > 31 {
            1
        } else {
            0
        }
    };
    (tries, v)
}

/// Loopback, private, unspecified, or unqualified destinations never go
/// through a proxy.
pub fn not_internet_host(host: &str) -> bool {
    if host_is_ip(host) {
        return match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                ip.is_loopback()
                    || ip.is_unspecified()
                    || ip.is_private()
                    || ip.is_link_local()
                    || ip.is_broadcast()
                    || ip.is_multicast()
            }
            Ok(IpAddr::V6(ip)) => {
                let seg0 = ip.segments()[0];
                ip.is_loopback()
                    || ip.is_unspecified()
                    || ip.is_multicast()
                    || (seg0 & 0xfe00) == 0xfc00 // unique local
                    || (seg0 & 0xffc0) == 0xfe80 // link local
            }
            Err(_) => true,
        };
    }
    !host.contains('.')
}

fn other_error(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, msg.to_string())
}

fn no_client_hello() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no ClientHello")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stat(value: f64, count: u32, age_mins: i64) -> HostStat {
        HostStat::with(
            value,
            count,
            Some(Utc::now() - chrono::Duration::minutes(age_mins)),
        )
    }

    #[test]
    fn test_budget_fresh_host_gets_three() {
        let (tries, wave) = direct_try_budget(&HostStat::default());
        assert_eq!(tries, 3);
        assert!((wave - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_budget_by_value() {
        assert_eq!(direct_try_budget(&stat(0.9, 20, 0)).0, 3);
        assert_eq!(direct_try_budget(&stat(0.7, 20, 0)).0, 2);
        assert_eq!(direct_try_budget(&stat(0.5, 20, 0)).0, 1);
        // a warming-up stat always gets one shot
        assert_eq!(direct_try_budget(&stat(0.1, 5, 0)).0, 1);
    }

    #[test]
    fn test_budget_age_tiers() {
        assert_eq!(direct_try_budget(&stat(0.35, 20, 6)).0, 1);
        assert_eq!(direct_try_budget(&stat(0.35, 20, 3)).0, 0);
        assert_eq!(direct_try_budget(&stat(0.25, 20, 8)).0, 1);
        assert_eq!(direct_try_budget(&stat(0.25, 20, 6)).0, 0);
        assert_eq!(direct_try_budget(&stat(0.15, 20, 14)).0, 1);
        assert_eq!(direct_try_budget(&stat(0.05, 20, 32)).0, 1);
        assert_eq!(direct_try_budget(&stat(0.05, 20, 20)).0, 0);
    }

    #[test]
    fn test_not_internet_host() {
        assert!(not_internet_host("127.0.0.1"));
        assert!(not_internet_host("0.0.0.0"));
        assert!(not_internet_host("10.1.2.3"));
        assert!(not_internet_host("192.168.0.1"));
        assert!(not_internet_host("169.254.1.1"));
        assert!(not_internet_host("::1"));
        assert!(not_internet_host("fe80::1"));
        assert!(not_internet_host("fd00::1"));
        assert!(not_internet_host("localhost"));
        assert!(not_internet_host("nas"));
        assert!(!not_internet_host("example.com"));
        assert!(!not_internet_host("93.184.216.34"));
        assert!(!not_internet_host("2606:2800:220:1::1"));
    }

    #[tokio::test]
    async fn test_race_dial_first_reachable_wins() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        // localhost resolves to both loopback families on most hosts;
        // whichever address listens is the one that must win
        let conn = race_dial("localhost", port, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(conn.peer_addr().port(), port);
    }

    #[tokio::test]
    async fn test_race_dial_all_fail_reports_error() {
        // bind then drop to find a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = race_dial("localhost", port, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Connect(_)));
    }
}
