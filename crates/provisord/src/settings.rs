//! Effective daemon settings: `provisor.toml` resolved into the types the
//! subsystems take, with command-line overrides applied.

use std::path::PathBuf;
use std::time::Duration;

use provisor_core::ProvisorConfig;
use provisor_orchestrator::{OrchestratorConfig, RetryPolicy};
use provisor_placement::StrategyKind;
use provisor_registry::RegistryConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub data_dir: PathBuf,
    pub registry: RegistryConfig,
    pub orchestrator: OrchestratorConfig,
    pub sweep_interval: Duration,
    pub reconcile_interval: Duration,
}

impl Settings {
    pub fn from_config(config: &ProvisorConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let retry = RetryPolicy {
            max_attempts: config.max_attempts(),
            initial_backoff: config.initial_backoff()?,
            max_backoff: config.max_backoff()?,
        };
        let orchestrator = OrchestratorConfig::default()
            .with_node_timeout(config.node_timeout()?)
            .with_retry(retry)
            .with_placement_wait(config.placement_wait()?)
            .with_strategy(strategy_kind(config)?);

        Ok(Self {
            port: config.port(),
            data_dir: config.data_dir(),
            registry: RegistryConfig {
                suspect_after: config.suspect_after()?,
                dead_after: config.dead_after()?,
            },
            orchestrator,
            sweep_interval: config.sweep_interval()?,
            reconcile_interval: config.reconcile_interval()?,
        })
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    pub fn with_data_dir(mut self, data_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        self
    }
}

fn strategy_kind(config: &ProvisorConfig) -> anyhow::Result<StrategyKind> {
    match config.strategy_name() {
        "available_memory" => Ok(StrategyKind::AvailableMemory),
        "fewest_instances" => Ok(StrategyKind::FewestInstances),
        "weighted" => Ok(StrategyKind::Weighted(config.strategy_weights())),
        other => anyhow::bail!("unknown placement strategy {other:?}"),
    }
}
