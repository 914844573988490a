//! provisor.toml configuration parser.
//!
//! Every field is optional; accessors fall back to the defaults below.
//!
//! ```toml
//! [server]
//! port = 8600
//! data_dir = "/var/lib/provisor"
//!
//! [nodes]
//! suspect_after = "30s"
//! dead_after = "5m"
//! sweep_interval = "10s"
//!
//! [commands]
//! node_timeout = "2s"
//! max_attempts = 3
//! initial_backoff = "200ms"
//! max_backoff = "5s"
//!
//! [placement]
//! strategy = "available_memory"
//! wait = "0s"
//!
//! [reconcile]
//! interval = "30s"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

pub const DEFAULT_PORT: u16 = 8600;
pub const DEFAULT_DATA_DIR: &str = "/var/lib/provisor";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub nodes: NodesConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodesConfig {
    pub suspect_after: Option<String>,
    pub dead_after: Option<String>,
    pub sweep_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsConfig {
    pub node_timeout: Option<String>,
    pub max_attempts: Option<u32>,
    pub initial_backoff: Option<String>,
    pub max_backoff: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// `available_memory`, `fewest_instances` or `weighted`.
    pub strategy: Option<String>,
    /// Attribute weights for the `weighted` strategy.
    pub weights: Option<BTreeMap<String, f64>>,
    /// How long a provision waits for capacity to appear.
    pub wait: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub interval: Option<String>,
}

impl ProvisorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: ProvisorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject malformed durations and unknown strategies up front.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.suspect_after()?;
        self.dead_after()?;
        self.sweep_interval()?;
        self.node_timeout()?;
        self.initial_backoff()?;
        self.max_backoff()?;
        self.placement_wait()?;
        self.reconcile_interval()?;
        if self.suspect_after()? > self.dead_after()? {
            anyhow::bail!("nodes.suspect_after must not exceed nodes.dead_after");
        }
        match self.strategy_name() {
            "available_memory" | "fewest_instances" => {}
            "weighted" if self.placement.weights.as_ref().is_some_and(|w| !w.is_empty()) => {}
            "weighted" => anyhow::bail!("placement.strategy \"weighted\" requires placement.weights"),
            other => anyhow::bail!("unknown placement strategy {other:?}"),
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.server.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.server
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn suspect_after(&self) -> anyhow::Result<Duration> {
        duration_or(&self.nodes.suspect_after, Duration::from_secs(30))
    }

    pub fn dead_after(&self) -> anyhow::Result<Duration> {
        duration_or(&self.nodes.dead_after, Duration::from_secs(300))
    }

    pub fn sweep_interval(&self) -> anyhow::Result<Duration> {
        duration_or(&self.nodes.sweep_interval, Duration::from_secs(10))
    }

    pub fn node_timeout(&self) -> anyhow::Result<Duration> {
        duration_or(&self.commands.node_timeout, Duration::from_secs(2))
    }

    pub fn max_attempts(&self) -> u32 {
        self.commands.max_attempts.unwrap_or(3).max(1)
    }

    pub fn initial_backoff(&self) -> anyhow::Result<Duration> {
        duration_or(&self.commands.initial_backoff, Duration::from_millis(200))
    }

    pub fn max_backoff(&self) -> anyhow::Result<Duration> {
        duration_or(&self.commands.max_backoff, Duration::from_secs(5))
    }

    pub fn strategy_name(&self) -> &str {
        self.placement.strategy.as_deref().unwrap_or("available_memory")
    }

    pub fn strategy_weights(&self) -> BTreeMap<String, f64> {
        self.placement.weights.clone().unwrap_or_default()
    }

    pub fn placement_wait(&self) -> anyhow::Result<Duration> {
        duration_or(&self.placement.wait, Duration::ZERO)
    }

    pub fn reconcile_interval(&self) -> anyhow::Result<Duration> {
        duration_or(&self.reconcile.interval, Duration::from_secs(30))
    }
}

fn duration_or(value: &Option<String>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        Some(s) => Ok(parse_duration(s)?),
        None => Ok(default),
    }
}
