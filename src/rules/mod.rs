//! Static host rules
//!
//! A host (ip) matching model: a flat map from rule keys to strategies.
//! Hostname keys match by suffix, IP keys match by prefix (`192.168.*`),
//! `=host` keys match exactly.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use tracing::warn;

/// How a destination host should be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// No rule matched; let the dispatcher decide from stats.
    #[default]
    Nil,
    /// Always connect directly, never through a proxy.
    Direct,
    /// Assume direct connections are interfered with; go proxied.
    Blocked,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Nil => write!(f, "nil"),
            Strategy::Direct => write!(f, "direct"),
            Strategy::Blocked => write!(f, "blocked"),
        }
    }
}

/// Static host rule set.
///
/// Later inserts win, so loading the direct file after the blocked file
/// gives `Direct` priority over `Blocked` for keys present in both.
#[derive(Debug, Default)]
pub struct StaticHosts {
    rules: HashMap<String, Strategy>,
}

impl StaticHosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loaded rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Load rule keys from a file. A missing or unreadable file is not
    /// fatal: the rule set simply stays as it was.
    pub fn load<P: AsRef<Path>>(&mut self, path: P, strategy: Strategy) {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => self.upsert(&text, strategy),
            Err(e) => warn!("rules file {}: {}", path.display(), e),
        }
    }

    /// Update/insert rules from line-oriented text: one key per line, the
    /// first whitespace-delimited field counts, `#` starts a comment.
    pub fn upsert(&mut self, text: &str, strategy: Strategy) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let key = match line.split_whitespace().next() {
                Some(k) => k,
                None => continue,
            };
            if key.starts_with('#') {
                continue;
            }
            self.rules.insert(key.to_string(), strategy);
        }
    }

    /// Get the strategy of a hostname. Tries every suffix after a dot
    /// separator, longest first, then the root, then the exact `=host` key.
    fn host_strategy(&self, host: &str) -> Strategy {
        let mut start = 0;
        loop {
            let s = self.lookup(&host[start..]);
            if s != Strategy::Nil {
                return s;
            }
            match host[start..].find('.') {
                Some(i) => start += i + 1,
                None => break,
            }
        }
        // root suffix
        let s = self.lookup("");
        if s != Strategy::Nil {
            return s;
        }
        self.lookup(&format!("={}", host))
    }

    /// Get the strategy of an IP. Tries each prefix plus `*`, left to
    /// right, then the exact address.
    ///
    /// Key syntax: `a.b.c.d`, `127.0.0.*`, `192.168.*`, or `10.*`; the `*`
    /// is required since IPv6 text omits zero groups.
    fn ip_strategy(&self, ip: &str) -> Strategy {
        // "::ffff:192.0.2.1" counts as IPv4 for splitting
        let sep = if ip.rfind('.').map_or(false, |i| i > 0) {
            '.'
        } else {
            ':'
        };
        for (i, c) in ip.char_indices() {
            if c != sep {
                continue;
            }
            let s = self.lookup(&format!("{}*", &ip[..=i]));
            if s != Strategy::Nil {
                return s;
            }
        }
        self.lookup(ip)
    }

    /// Get the strategy for a host or IP.
    pub fn get_strategy(&self, query: &str) -> Strategy {
        if host_is_ip(query) {
            self.ip_strategy(query)
        } else {
            self.host_strategy(query)
        }
    }

    fn lookup(&self, key: &str) -> Strategy {
        self.rules.get(key).copied().unwrap_or(Strategy::Nil)
    }
}

/// Syntactic test for an IP literal: ends with a digit (IPv4) or contains
/// a colon (IPv6).
pub fn host_is_ip(host: &str) -> bool {
    match host.as_bytes().last() {
        Some(b) => b.is_ascii_digit() || host.contains(':'),
        None => false,
    }
}

/// Load both rules files. Direct wins over Blocked for duplicate keys.
pub fn map_static_files<P: AsRef<Path>>(blocked: P, direct: P) -> StaticHosts {
    let mut hosts = StaticHosts::new();
    hosts.load(blocked, Strategy::Blocked);
    hosts.load(direct, Strategy::Direct);
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StaticHosts {
        let mut sh = StaticHosts::new();
        sh.upsert("golang.org\ncn.github.com\t # cn", Strategy::Direct);
        sh.upsert("1.1.*", Strategy::Blocked);
        sh
    }

    #[test]
    fn test_host_suffix_match() {
        let sh = sample();
        assert_eq!(sh.get_strategy("github.com"), Strategy::Nil);
        assert_eq!(sh.get_strategy("play.golang.org"), Strategy::Direct);
        assert_eq!(sh.get_strategy("golang.org"), Strategy::Direct);
        assert_eq!(sh.get_strategy("cn.github.com"), Strategy::Direct);
        // a suffix key must match whole labels, not substrings
        assert_eq!(sh.get_strategy("notgolang.org"), Strategy::Nil);
    }

    #[test]
    fn test_ip_prefix_match() {
        let sh = sample();
        assert_eq!(sh.get_strategy("1.1.0.1"), Strategy::Blocked);
        assert_eq!(sh.get_strategy("127.0.0.1"), Strategy::Nil);
    }

    #[test]
    fn test_exact_match() {
        let mut sh = StaticHosts::new();
        sh.upsert("=ads.example.com", Strategy::Blocked);
        assert_eq!(sh.get_strategy("ads.example.com"), Strategy::Blocked);
        assert_eq!(sh.get_strategy("sub.ads.example.com"), Strategy::Nil);
    }

    #[test]
    fn test_direct_overrides_blocked() {
        let mut sh = StaticHosts::new();
        sh.upsert("example.com", Strategy::Blocked);
        sh.upsert("example.com", Strategy::Direct);
        assert_eq!(sh.get_strategy("example.com"), Strategy::Direct);
    }

    #[test]
    fn test_empty_rules() {
        let sh = StaticHosts::new();
        assert_eq!(sh.get_strategy("anything.example"), Strategy::Nil);
        assert_eq!(sh.get_strategy("10.0.0.1"), Strategy::Nil);
    }

    #[test]
    fn test_ipv6_prefix() {
        let mut sh = StaticHosts::new();
        sh.upsert("fe80:*", Strategy::Direct);
        assert_eq!(sh.get_strategy("fe80::1"), Strategy::Direct);
        assert_eq!(sh.get_strategy("2001:db8::1"), Strategy::Nil);
    }

    #[test]
    fn test_host_is_ip() {
        assert!(host_is_ip("192.168.1.2"));
        assert!(host_is_ip("::1"));
        assert!(host_is_ip("2001:db8::1"));
        assert!(!host_is_ip("example.com"));
        assert!(!host_is_ip(""));
        // quirky but per the syntactic rule: ends with a digit
        assert!(host_is_ip("host2"));
    }
}
