//! `kvctl` configuration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! `KVCTL_*` environment variables (`__` separates nested keys, so
//! `KVCTL_QUORUM__W=3` sets `quorum.w`), then command-line flags.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use replication::{AntiEntropyConfig, HandoffConfig, QuorumConfig};
use serde::{Deserialize, Serialize};
use storage::SyncMode;

pub const ENV_PREFIX: &str = "KVCTL_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvctlConfig {
    /// Root directory; node `i` keeps its log and snapshot in `node-<i>`.
    pub data_dir: PathBuf,
    /// Cluster size. Node ids run from 1 to `nodes`.
    pub nodes: u64,
    /// Virtual nodes per physical node.
    pub vnodes: usize,
    pub sync_mode: SyncMode,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub quorum: QuorumConfig,
    pub handoff: HandoffConfig,
    pub anti_entropy: AntiEntropyConfig,
}

impl Default for KvctlConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("kvdata"),
            nodes: 3,
            vnodes: 128,
            sync_mode: SyncMode::Data,
            log_level: "warn".to_string(),
            quorum: QuorumConfig::default(),
            handoff: HandoffConfig::default(),
            anti_entropy: AntiEntropyConfig::default(),
        }
    }
}

impl KvctlConfig {
    /// Defaults, then `file` if given, then the environment.
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        Self::from_figment(Self::figment(file))
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.nodes > 0, "nodes must be at least 1");
        ensure!(self.vnodes > 0, "vnodes must be at least 1");
        self.quorum.validate()?;
        Ok(())
    }

    pub fn node_dir(&self, id: u64) -> PathBuf {
        self.data_dir.join(format!("node-{id}"))
    }
}
