//! Upstream proxy pools
//!
//! One ranked list of proxies per scheme. Every pool is re-probed on a
//! timer: each proxy's measured round-trip feeds an EWMA, failures are
//! charged a `3 × timeout` penalty, and the pool re-sorts ascending so
//! `get_proxy(0)` is always the best current choice. A proxy that fails a
//! live request is penalized the same way without waiting for the next
//! probe round.
//!
//! A proxy URL without a scheme fans out into one entry per supported
//! scheme; the user rarely knows what the remote speaks, and probing
//! settles it empirically since broken schemes sink to the bottom.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::conn::{Endpoint, Scheme};
use crate::probe::Checker;
use crate::stats::Ewma;

/// The latency EWMA window size.
const EWMA_WINDOW: u32 = 10;

/// Interval between pool-wide probe rounds.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no valid proxy")]
    NoProxy,

    #[error("proxy authentication is not implemented")]
    AuthUnsupported,
}

/// One upstream proxy endpoint with its observed latency.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub url: Endpoint,
    ewma: Ewma,
}

impl Proxy {
    pub fn new(url: Endpoint) -> Self {
        Self {
            url,
            ewma: Ewma::new(EWMA_WINDOW),
        }
    }

    /// Smoothed observed latency.
    pub fn latency(&self) -> Duration {
        Duration::from_secs_f64(self.ewma.value().max(0.0))
    }

    pub fn has_auth(&self) -> bool {
        self.url.user.is_some()
    }
}

/// A ranked list of proxies for one scheme.
#[derive(Debug)]
pub struct ProxyPool {
    proxies: RwLock<Vec<Proxy>>,
    probe_url: Endpoint,
    pub timeout: Duration,
}

impl ProxyPool {
    pub fn new(proxies: Vec<Proxy>, probe_url: Endpoint, timeout: Duration) -> Self {
        Self {
            proxies: RwLock::new(proxies),
            probe_url,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `i mod n`-th best proxy, or `None` for an empty pool.
    pub fn get_proxy(&self, i: usize) -> Option<Proxy> {
        let proxies = self.proxies.read().unwrap();
        if proxies.is_empty() {
            return None;
        }
        Some(proxies[i % proxies.len()].clone())
    }

    /// Current ranking snapshot.
    pub fn ranked(&self) -> Vec<Proxy> {
        self.proxies.read().unwrap().clone()
    }

    /// Probe every proxy concurrently, feed the EWMAs, re-sort.
    pub async fn update(&self) {
        let snapshot: Vec<Endpoint> = {
            let proxies = self.proxies.read().unwrap();
            proxies.iter().map(|p| p.url.clone()).collect()
        };
        if snapshot.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for url in snapshot {
            let checker = Checker::via_proxy(url.clone(), self.probe_url.clone(), self.timeout);
            let penalty = 3 * self.timeout;
            probes.spawn(async move {
                let start = Instant::now();
                // dial -> handshake -> transfer
                let sample = match checker.check().await {
                    Ok(()) => start.elapsed(),
                    Err(_) => penalty,
                };
                (url, sample)
            });
        }

        let mut samples = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(sample) = joined {
                samples.push(sample);
            }
        }

        let mut proxies = self.proxies.write().unwrap();
        for (url, sample) in samples {
            if let Some(p) = proxies.iter_mut().find(|p| p.url == url) {
                p.ewma.add(sample.as_secs_f64());
            }
        }
        sort_by_latency(&mut proxies);
        debug!("sorted latencies:");
        for p in proxies.iter() {
            debug!("  {:?} {}://{}", p.latency(), p.url.scheme, p.url.host_port());
        }
    }

    /// Charge a proxy for a failed live request and re-rank immediately.
    pub fn penalize(&self, url: &Endpoint, penalty: Duration) {
        let mut proxies = self.proxies.write().unwrap();
        if let Some(p) = proxies.iter_mut().find(|p| p.url == *url) {
            p.ewma.add(penalty.as_secs_f64());
        }
        sort_by_latency(&mut proxies);
    }
}

fn sort_by_latency(proxies: &mut [Proxy]) {
    proxies.sort_by(|a, b| {
        a.ewma
            .value()
            .partial_cmp(&b.ewma.value())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// All pools, one per scheme the configuration produced.
#[derive(Debug, Default)]
pub struct PoolSet {
    pools: HashMap<Scheme, Arc<ProxyPool>>,
}

impl PoolSet {
    pub fn get(&self, scheme: Scheme) -> Option<Arc<ProxyPool>> {
        self.pools.get(&scheme).cloned()
    }

    pub fn insert(&mut self, scheme: Scheme, pool: Arc<ProxyPool>) {
        self.pools.insert(scheme, pool);
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Parse the comma-separated proxy list into per-scheme entries.
/// Schemeless entries are duplicated across every supported scheme.
fn parse_proxies(list: &str) -> HashMap<Scheme, Vec<Proxy>> {
    let mut by_scheme: HashMap<Scheme, Vec<Proxy>> = HashMap::new();
    for raw in list.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let url = match Endpoint::parse(raw) {
            Ok(u) => u,
            Err(e) => {
                warn!("proxy {}: {}", raw, e);
                continue;
            }
        };
        if url.scheme.is_empty() {
            for scheme in Scheme::ALL {
                let mut dup = url.clone();
                dup.scheme = scheme.as_str().to_string();
                by_scheme.entry(scheme).or_default().push(Proxy::new(dup));
            }
        } else {
            match url.scheme.parse::<Scheme>() {
                Ok(scheme) => by_scheme.entry(scheme).or_default().push(Proxy::new(url)),
                Err(()) => warn!("unsupported proxy: {}", raw),
            }
        }
    }
    by_scheme
}

/// Build the pools from configuration and start one update loop per pool.
/// The first update runs before the first sleep, so a freshly started
/// process ranks its proxies right away.
pub fn init_proxy_pools(proxies: &str, probe_url: &str, timeout: Duration) -> Arc<PoolSet> {
    let probe = match Endpoint::parse(probe_url) {
        Ok(u) => u,
        Err(e) => {
            warn!("proxy probe URL {}: {}", probe_url, e);
            return Arc::new(PoolSet::default());
        }
    };

    let by_scheme = parse_proxies(proxies);
    if by_scheme.is_empty() {
        info!("no upstream proxy configured");
        return Arc::new(PoolSet::default());
    }

    let mut set = PoolSet::default();
    for (scheme, entries) in by_scheme {
        let pool = Arc::new(ProxyPool::new(entries, probe.clone(), timeout));
        set.pools.insert(scheme, Arc::clone(&pool));
        tokio::spawn(async move {
            loop {
                info!("{} pool updating ...", scheme);
                pool.update().await;
                tokio::time::sleep(UPDATE_INTERVAL).await;
            }
        });
    }
    Arc::new(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(urls: &[&str]) -> ProxyPool {
        let proxies = urls
            .iter()
            .map(|u| Proxy::new(Endpoint::parse(u).unwrap()))
            .collect();
        ProxyPool::new(
            proxies,
            Endpoint::parse("https://example.com").unwrap(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_get_proxy_wraps_modulo() {
        let pool = pool_of(&[
            "http://a.example:8080",
            "http://b.example:8080",
            "http://c.example:8080",
        ]);
        let first = pool.get_proxy(0).unwrap();
        let wrapped = pool.get_proxy(3).unwrap();
        assert_eq!(first.url, wrapped.url);
        assert_eq!(pool.get_proxy(4).unwrap().url.host, "b.example");
    }

    #[test]
    fn test_empty_pool_yields_none() {
        let pool = pool_of(&[]);
        assert!(pool.get_proxy(0).is_none());
        assert!(pool.get_proxy(7).is_none());
    }

    #[test]
    fn test_penalize_reranks() {
        let pool = pool_of(&["http://slow.example:8080", "http://fast.example:8080"]);
        let slow = Endpoint::parse("http://slow.example:8080").unwrap();
        pool.penalize(&slow, Duration::from_secs(15));
        let best = pool.get_proxy(0).unwrap();
        assert_eq!(best.url.host, "fast.example");
        let worst = pool.get_proxy(1).unwrap();
        assert_eq!(worst.url.host, "slow.example");
        assert!(worst.latency() > best.latency());
    }

    #[test]
    fn test_schemeless_fans_out() {
        let by_scheme = parse_proxies("example-proxy:1080");
        assert_eq!(by_scheme.len(), 3);
        for scheme in Scheme::ALL {
            let entries = by_scheme.get(&scheme).unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].url.scheme, scheme.as_str());
            assert_eq!(entries[0].url.host_port(), "example-proxy:1080");
        }
    }

    #[test]
    fn test_explicit_scheme_goes_to_one_pool() {
        let by_scheme = parse_proxies("socks5://127.0.0.1:1080, , bogus://x:1");
        assert_eq!(by_scheme.len(), 1);
        assert!(by_scheme.contains_key(&Scheme::Socks5));
    }

    #[test]
    fn test_auth_flagged() {
        let p = Proxy::new(Endpoint::parse("http://u:p@proxy.example:3128").unwrap());
        assert!(p.has_auth());
        let p = Proxy::new(Endpoint::parse("http://proxy.example:3128").unwrap());
        assert!(!p.has_auth());
    }
}
