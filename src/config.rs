use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root of the on-disk store (`narinfo/`, `nar/`, `tmp/`).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Socket address for the cache listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Expose `GET /lock`, which pauses every cache fill while a client keeps
    /// the connection open.  Anyone who can reach the listener can use it.
    #[serde(default)]
    pub enable_lock_route: bool,
    /// Log a `tick` line every second after probing the fetch gate.
    #[serde(default)]
    pub log_ticks: bool,
    /// Upstream binary caches, tried in order.
    #[serde(default)]
    pub upstreams: Vec<String>,
    /// Deadline (seconds) for iterating the upstreams for one key, body
    /// download included.  It also caps the size of archive that can be
    /// cached: at least the largest expected NAR divided by the slowest
    /// upstream throughput.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// TCP connect timeout (seconds) for upstream requests.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Longest silence (seconds) tolerated between reads from an upstream.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Optional dedicated listener for `GET /metrics`.
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            listen: default_listen(),
            enable_lock_route: false,
            log_ticks: false,
            upstreams: Vec::new(),
            fetch_timeout_secs: default_fetch_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            metrics_listen: None,
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/tmp/lrucache")
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_fetch_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

impl Config {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_listen(&self.listen).context("invalid listen address")
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics_listen
            .as_deref()
            .map(|addr| parse_listen(addr).context("invalid metrics_listen address"))
            .transpose()
    }

    /// Upstream base URLs with any trailing `/` removed.
    pub fn upstream_bases(&self) -> Vec<String> {
        self.upstreams
            .iter()
            .map(|u| u.trim_end_matches('/').to_string())
            .collect()
    }
}

/// Accepts `host:port` and the bare `:port` shorthand.
fn parse_listen(addr: &str) -> Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    addr.parse::<SocketAddr>()
        .with_context(|| format!("not a socket address: {addr}"))
}

// ---------------------------------------------------------------------------
// CLI overrides
// ---------------------------------------------------------------------------

/// Values given on the command line; each `Some` replaces the file value.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub state_dir: Option<PathBuf>,
    pub listen: Option<String>,
    pub enable_lock_route: bool,
    pub log_ticks: bool,
    pub upstreams: Vec<String>,
    pub fetch_timeout_secs: Option<u64>,
    pub metrics_listen: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(dir) = self.state_dir {
            config.state_dir = dir;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        config.enable_lock_route |= self.enable_lock_route;
        config.log_ticks |= self.log_ticks;
        if !self.upstreams.is_empty() {
            config.upstreams = self.upstreams;
        }
        if let Some(secs) = self.fetch_timeout_secs {
            config.fetch_timeout_secs = secs;
        }
        if let Some(addr) = self.metrics_listen {
            config.metrics_listen = Some(addr);
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from an optional YAML file, apply CLI overrides and
/// validate the result.
pub fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            parse_config(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    overrides.apply(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config> {
    Ok(serde_yaml::from_str(contents)?)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    config.listen_addr()?;
    config.metrics_addr()?;
    anyhow::ensure!(
        config.fetch_timeout_secs > 0,
        "fetch_timeout_secs must be greater than zero"
    );
    anyhow::ensure!(
        config.connect_timeout_secs > 0,
        "connect_timeout_secs must be greater than zero"
    );
    anyhow::ensure!(
        config.read_timeout_secs > 0,
        "read_timeout_secs must be greater than zero"
    );
    for upstream in &config.upstreams {
        let url =
            Url::parse(upstream).with_context(|| format!("invalid upstream URL: {upstream}"))?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "upstream URL must use http or https: {upstream}"
        );
        anyhow::ensure!(
            url.query().is_none() && url.fragment().is_none(),
            "upstream URL must not carry a query or fragment: {upstream}"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
