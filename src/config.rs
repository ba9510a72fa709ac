//! Process-wide configuration: CLI flags over `LAYERPEEK_*` environment
//! variables over built-in defaults.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::inspector::engine::Strategy;
use crate::inspector::relay::RelayConfig;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Container engine CLI binary.
    pub engine: String,
    pub strategy: Strategy,
    pub relay: RelayConfig,
    /// Upper bound on layers decompressed at once.
    pub max_parallel_layers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            strategy: Strategy::Save,
            relay: RelayConfig::default(),
            max_parallel_layers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Flags given on the command line; `None`/`false` defer to the environment.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub engine: Option<String>,
    pub relay: bool,
    pub jobs: Option<usize>,
}

impl AppConfig {
    /// Build a config from an environment lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(engine) = lookup("LAYERPEEK_ENGINE") {
            cfg.engine = engine;
        }
        if let Some(strategy) = lookup("LAYERPEEK_STRATEGY") {
            cfg.strategy = strategy
                .parse()
                .map_err(anyhow::Error::msg)
                .context("invalid LAYERPEEK_STRATEGY")?;
        }
        if let Some(tool) = lookup("LAYERPEEK_REGISTRY_TOOL") {
            cfg.relay.tool = PathBuf::from(tool);
        }
        if let Some(secs) = lookup("LAYERPEEK_READY_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("invalid LAYERPEEK_READY_TIMEOUT_SECS '{secs}'"))?;
            cfg.relay.ready_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = lookup("LAYERPEEK_TMPDIR") {
            cfg.relay.temp_root = Some(PathBuf::from(dir));
        }
        if let Some(jobs) = lookup("LAYERPEEK_JOBS") {
            cfg.max_parallel_layers = parse_jobs(&jobs)
                .with_context(|| format!("invalid LAYERPEEK_JOBS '{jobs}'"))?;
        }
        Ok(cfg)
    }

    /// Apply command-line flags on top.
    pub fn apply(&mut self, cli: CliOverrides) {
        if let Some(engine) = cli.engine {
            self.engine = engine;
        }
        if cli.relay {
            self.strategy = Strategy::Relay;
        }
        if let Some(jobs) = cli.jobs {
            self.max_parallel_layers = jobs.max(1);
        }
    }
}

fn parse_jobs(value: &str) -> Result<usize> {
    let jobs: usize = value.trim().parse()?;
    anyhow::ensure!(jobs > 0, "must be at least 1");
    Ok(jobs)
}

/// Resolve the config from the process environment and `cli`, and store it.
pub fn init_from_cli(cli: CliOverrides) -> Result<()> {
    let mut cfg = AppConfig::from_lookup(|key| std::env::var(key).ok())?;
    cfg.apply(cli);
    CONFIG
        .set(cfg)
        .map_err(|_| anyhow::anyhow!("configuration already initialised"))
}

/// The stored config, or defaults if [`init_from_cli`] never ran.
pub fn get() -> &'static AppConfig {
    CONFIG.get_or_init(AppConfig::default)
}
