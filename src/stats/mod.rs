//! Per-destination connection quality
//!
//! Records a rolling success score per `host:port` using an exponentially
//! weighted moving average, persisted as JSON:
//!
//! ```json
//! {
//!     "github.com:443": {
//!         "v": 0.7,
//!         "n": 10,
//!         "t": "2021-08-18T21:46:05Z"
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The EWMA window size.
pub const EWMA_WINDOW: u32 = 10;

/// Interval between background saves of the stats file.
pub const BACKUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Moving average over a fixed window: plain mean for the first `window`
/// samples, then `v += 2/(window+1) * (x - v)`.
#[derive(Debug, Clone)]
pub struct Ewma {
    window: u32,
    count: u32,
    value: f64,
}

impl Ewma {
    pub fn new(window: u32) -> Self {
        Self {
            window,
            count: 0,
            value: 0.0,
        }
    }

    /// Force the average to a known value, as if the window were already
    /// full.
    pub fn set(&mut self, value: f64) {
        self.value = value;
        self.count = self.window;
    }

    pub fn add(&mut self, sample: f64) {
        if self.count < self.window {
            // arithmetic mean while warming up
            self.count += 1;
            self.value += (sample - self.value) / self.count as f64;
        } else {
            let alpha = 2.0 / (self.window as f64 + 1.0);
            self.value += alpha * (sample - self.value);
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// A single destination's stat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostStat {
    #[serde(rename = "v")]
    pub value: f64,
    #[serde(rename = "n")]
    pub count: u32,
    #[serde(rename = "t")]
    pub time: Option<DateTime<Utc>>,
    #[serde(skip)]
    ewma: Option<Ewma>,
}

impl HostStat {
    /// Build a snapshot with a known score, as if loaded from disk.
    pub fn with(value: f64, count: u32, time: Option<DateTime<Utc>>) -> Self {
        Self {
            value,
            count,
            time,
            ewma: None,
        }
    }

    /// Age of the last update; `None` if never updated.
    pub fn age(&self) -> Option<chrono::Duration> {
        self.time.map(|t| Utc::now() - t)
    }
}

/// The whole stats store, shared behind a readers-writer lock.
#[derive(Debug)]
pub struct HostStats {
    inner: RwLock<Inner>,
    /// Time after which a stale stat is reset on next update.
    validity: chrono::Duration,
}

#[derive(Debug, Default)]
struct Inner {
    stats: HashMap<String, HostStat>,
    last_recount: Option<DateTime<Utc>>,
}

impl HostStats {
    pub fn new(validity: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                stats: HashMap::new(),
                last_recount: Some(Utc::now()),
            }),
            validity: chrono::Duration::from_std(validity)
                .unwrap_or_else(|_| chrono::Duration::hours(168)),
        }
    }

    /// Snapshot of a destination's stat. An absent key yields the zero
    /// stat (count 0, value 0, no timestamp).
    pub fn get_stat(&self, key: &str) -> HostStat {
        let inner = self.inner.read().unwrap();
        inner.stats.get(key).cloned().unwrap_or_default()
    }

    /// Number of tracked destinations.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed one success (1.0) or failure (0.0) sample for a destination.
    pub fn update(&self, key: &str, sample: f64) {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();
        let stat = inner.stats.entry(key.to_string()).or_default();
        if let Some(t) = stat.time {
            if now - t > self.validity {
                stat.count = 0;
                stat.value = 0.0;
                stat.ewma = None;
            }
        }
        let (count, value) = (stat.count, stat.value);
        let ewma = stat.ewma.get_or_insert_with(|| {
            let mut e = Ewma::new(EWMA_WINDOW);
            // A loaded stat carries a value but no accumulator; trust it
            // only once it was built from a full window.
            if count > EWMA_WINDOW {
                e.set(value);
            }
            e
        });
        ewma.add(sample);
        stat.value = ewma.value();
        stat.count += 1;
        stat.time = Some(now);
    }

    /// Drop expired entries. Once a full validity period has passed since
    /// startup, clamp counts above the window to `window + 1` on every
    /// pass, so fresh failures can swing long-lived scores quickly again.
    /// The recount clock is set at construction and load time only.
    pub fn cleanup(&self) {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();
        let validity = self.validity;
        let recount = match inner.last_recount {
            Some(t) => now - t > validity,
            None => false,
        };
        inner.stats.retain(|_, stat| match stat.time {
            Some(t) => now - t <= validity,
            None => false,
        });
        if recount {
            for stat in inner.stats.values_mut() {
                if stat.count > EWMA_WINDOW {
                    stat.count = EWMA_WINDOW + 1;
                }
            }
        }
    }

    /// Load the stats map from a JSON file. Errors log and leave the map
    /// empty; a fresh deployment has no file yet.
    pub fn load<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(d) if !d.is_empty() => d,
            Ok(_) => "{}".to_string(),
            Err(e) => {
                warn!("stats file {}: {}", path.display(), e);
                "{}".to_string()
            }
        };
        match serde_json::from_str::<HashMap<String, HostStat>>(&data) {
            Ok(stats) => {
                let mut inner = self.inner.write().unwrap();
                inner.stats = stats;
                inner.last_recount = Some(Utc::now());
            }
            Err(e) => warn!("stats file {}: {}", path.display(), e),
        }
        self.cleanup();
    }

    /// Save the stats map to a JSON file, pretty-printed.
    pub fn save<P: AsRef<Path>>(&self, path: P) {
        self.cleanup();
        let path = path.as_ref();
        let data = {
            let inner = self.inner.read().unwrap();
            serde_json::to_string_pretty(&inner.stats)
                .unwrap_or_else(|_| "{}".to_string())
        };
        if let Err(e) = std::fs::write(path, data) {
            warn!("stats file {}: {}", path.display(), e);
        }
    }
}

/// Load the stats from a file and keep saving back periodically.
pub fn map_stats_file(path: PathBuf, validity: Duration) -> Arc<HostStats> {
    let stats = Arc::new(HostStats::new(validity));
    stats.load(&path);
    let background = Arc::clone(&stats);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(BACKUP_INTERVAL).await;
            debug!("saving stats: {}", path.display());
            background.save(&path);
        }
    });
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_warmup_mean() {
        let mut e = Ewma::new(10);
        for _ in 0..10 {
            e.add(1.0);
        }
        assert!((e.value() - 1.0).abs() < f64::EPSILON);

        let mut e = Ewma::new(4);
        e.add(0.0);
        e.add(1.0);
        assert!((e.value() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ewma_converges() {
        let mut e = Ewma::new(10);
        for _ in 0..10 {
            e.add(0.0);
        }
        for _ in 0..50 {
            e.add(1.0);
        }
        assert!(e.value() > 0.99);
    }

    #[test]
    fn test_update_counts_and_values() {
        let hs = HostStats::new(Duration::from_secs(3600));
        let key = "github.com:443";
        for i in 1..=10u32 {
            hs.update(key, 1.0);
            let stat = hs.get_stat(key);
            assert_eq!(stat.count, i);
            assert!((stat.value - 1.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_update_tracks_recent_average() {
        let hs = HostStats::new(Duration::from_secs(3600));
        let key = "example.com:80";
        for _ in 0..10 {
            hs.update(key, 0.0);
        }
        // alternate; after the window fills the value should sit near the
        // recent mean, within one window-step of tolerance
        let samples = [1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0];
        for v in samples {
            hs.update(key, v);
        }
        let mean: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        let stat = hs.get_stat(key);
        assert!((stat.value - mean).abs() <= 1.0 / samples.len() as f64 + 0.2);
    }

    #[test]
    fn test_absent_key_is_zero() {
        let hs = HostStats::new(Duration::from_secs(3600));
        let stat = hs.get_stat("nowhere:1");
        assert_eq!(stat.count, 0);
        assert_eq!(stat.value, 0.0);
        assert!(stat.time.is_none());
    }

    #[test]
    fn test_validity_reset() {
        let hs = HostStats::new(Duration::from_millis(1));
        let key = "stale.example:443";
        hs.update(key, 1.0);
        std::thread::sleep(Duration::from_millis(5));
        hs.update(key, 0.0);
        let stat = hs.get_stat(key);
        assert_eq!(stat.count, 1);
        assert_eq!(stat.value, 0.0);
    }

    #[test]
    fn test_cleanup_keeps_clamping_counts() {
        let hs = HostStats::new(Duration::from_millis(200));
        let key = "clamp.example:443";
        for _ in 0..13 {
            hs.update(key, 1.0);
        }
        // keep the stat itself fresh while the recount clock runs out
        std::thread::sleep(Duration::from_millis(100));
        hs.update(key, 1.0);
        std::thread::sleep(Duration::from_millis(150));
        hs.cleanup();
        assert_eq!(hs.get_stat(key).count, EWMA_WINDOW + 1);

        // the clock is not reset by a clamp: every later pass clamps too
        hs.update(key, 1.0);
        hs.cleanup();
        assert_eq!(hs.get_stat(key).count, EWMA_WINDOW + 1);
    }

    #[test]
    fn test_cleanup_drops_expired() {
        let hs = HostStats::new(Duration::from_millis(1));
        hs.update("a.example:80", 1.0);
        std::thread::sleep(Duration::from_millis(5));
        hs.cleanup();
        assert!(hs.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stat.json");
        let hs = HostStats::new(Duration::from_secs(3600));
        hs.update("github.com:443", 1.0);
        hs.update("github.com:443", 0.0);
        hs.save(&file);

        let loaded = HostStats::new(Duration::from_secs(3600));
        loaded.load(&file);
        let a = hs.get_stat("github.com:443");
        let b = loaded.get_stat("github.com:443");
        assert_eq!(a.count, b.count);
        assert!((a.value - b.value).abs() < f64::EPSILON);
        assert_eq!(a.time, b.time);
    }

    #[test]
    fn test_loaded_value_seeds_full_window() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stat.json");
        let hs = HostStats::new(Duration::from_secs(3600));
        for _ in 0..12 {
            hs.update("seed.example:443", 1.0);
        }
        hs.save(&file);

        let loaded = HostStats::new(Duration::from_secs(3600));
        loaded.load(&file);
        loaded.update("seed.example:443", 0.0);
        let stat = loaded.get_stat("seed.example:443");
        // seeded from the stored value, one failure moves it by alpha
        assert_eq!(stat.count, 13);
        assert!(stat.value > 0.7 && stat.value < 1.0);
    }
}
