//! Waypoint CLI
//!
//! Loads configuration, builds the shared context (rules, stats, pools,
//! online probe), starts one listener per address, and keeps running
//! until interrupted. The stats file is written back on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use waypoint::dispatch::AppContext;
use waypoint::pool::init_proxy_pools;
use waypoint::probe::start_probe_direct;
use waypoint::rules::map_static_files;
use waypoint::server::Listener;
use waypoint::stats::map_stats_file;
use waypoint::Config;

/// Waypoint - a local proxy dispatcher
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(about = "A local multi-protocol proxy dispatcher")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen addresses: [host]:port[,[host]:port]...
    #[arg(short, long)]
    listens: Option<String>,

    /// Lookup/dial/handshake timeout in seconds, 3-7 recommended
    #[arg(long)]
    upstream_timeout: Option<u64>,

    /// URL probed to tell offline periods apart from host failures
    #[arg(long)]
    net_probe_url: Option<String>,

    /// Race all resolved IPs of a destination
    #[arg(long)]
    parallel_dial: Option<bool>,

    /// Upstream proxies: [scheme://]host:port[,...]; a schemeless entry
    /// adopts all supported schemes (http, socks5, socks4a)
    #[arg(long)]
    proxies: Option<String>,

    /// URL probed through each proxy for ranking
    #[arg(long)]
    proxy_probe_url: Option<String>,

    /// PAC file to serve
    #[arg(long)]
    pac: Option<String>,

    /// File recording direct connection quality
    #[arg(long)]
    stat_file: Option<String>,

    /// Validity of a stat in hours
    #[arg(long)]
    stat_validity: Option<u64>,

    /// File of blocked domains (suffix) or IPs (prefix)
    #[arg(long)]
    blocked: Option<String>,

    /// File of direct domains (suffix) or IPs (prefix)
    #[arg(long)]
    direct: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path).context("failed to load configuration")?,
            None => Config::default(),
        };
        if let Some(listens) = self.listens {
            config.listens = listens.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(secs) = self.upstream_timeout {
            config.upstream_timeout = secs;
        }
        if let Some(url) = self.net_probe_url {
            config.net_probe_url = url;
        }
        if let Some(flag) = self.parallel_dial {
            config.parallel_dial = flag;
        }
        if let Some(proxies) = self.proxies {
            config.proxies = proxies;
        }
        if let Some(url) = self.proxy_probe_url {
            config.proxy_probe_url = url;
        }
        if let Some(pac) = self.pac {
            config.pac_file = Some(pac);
        }
        if let Some(file) = self.stat_file {
            config.stat_file = file;
        }
        if let Some(hours) = self.stat_validity {
            config.stat_validity = hours;
        }
        if let Some(file) = self.blocked {
            config.blocked_rules = file;
        }
        if let Some(file) = self.direct {
            config.direct_rules = file;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let config = args.into_config()?;
    info!("waypoint v{} - a local proxy dispatcher", waypoint::VERSION);

    let rules = map_static_files(&config.blocked_rules, &config.direct_rules);
    info!("{} static host rules", rules.len());

    let stat_path = PathBuf::from(&config.stat_file);
    let stats = map_stats_file(stat_path.clone(), config.validity());
    info!("{} host stats loaded", stats.len());

    let online = start_probe_direct(&config.net_probe_url, config.timeout());
    let pools = init_proxy_pools(&config.proxies, &config.proxy_probe_url, config.timeout());

    let ctx = Arc::new(AppContext {
        rules,
        stats: Arc::clone(&stats),
        pools,
        online,
        timeout: config.timeout(),
        parallel_dial: config.parallel_dial,
    });

    let pac_file = config.pac_file.as_ref().map(PathBuf::from);
    for addr in &config.listens {
        let listener = Listener::new(addr.clone(), Arc::clone(&ctx), pac_file.clone());
        tokio::spawn(listener.listen_and_serve());
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutting down, saving stats");
    stats.save(&stat_path);

    Ok(())
}
