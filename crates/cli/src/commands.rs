//! `kvctl` command line.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use corelib::NodeId;

use crate::cluster::LocalCluster;
use crate::config::KvctlConfig;

#[derive(Parser, Debug)]
#[command(name = "kvctl", version, about = "Operate a replicated key-value store")]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides `data_dir` from the configuration.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Treat a node as offline for this command. Repeatable.
    #[arg(long = "down", value_name = "NODE_ID", global = true)]
    pub down: Vec<u64>,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a value.
    Put {
        key: String,
        value: String,
        /// Expire the key after this many milliseconds.
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    /// Read a value at quorum R.
    Get { key: String },
    /// Delete a key. The tombstone replicates like a write.
    Delete { key: String },
    /// Whether a key holds a live value.
    Exists { key: String },
    /// List live keys matching a glob pattern.
    Keys {
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Snapshot every reachable node and checkpoint its log.
    Snapshot,
    /// Replay hints and run one anti-entropy round.
    Repair,
    /// Show cluster membership, quorum settings and counters.
    Status,
}

impl Cli {
    /// Load the layered configuration and apply flag overrides.
    pub fn load_config(&self) -> anyhow::Result<KvctlConfig> {
        let mut config = KvctlConfig::load(self.config.as_deref())?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        Ok(config)
    }
}

/// Run one command against a freshly opened cluster and render its output.
pub async fn run(command: &Command, config: &KvctlConfig, down: &[u64], json: bool) -> anyhow::Result<String> {
    let cluster = LocalCluster::open(config)?;
    for id in down {
        cluster.mark_down(NodeId(*id))?;
    }
    let output = execute(&cluster, command, json).await;
    cluster.close();
    output
}

pub async fn execute(cluster: &LocalCluster, command: &Command, json: bool) -> anyhow::Result<String> {
    let coordinator = cluster.coordinator();
    let output = match command {
        Command::Put { key, value, ttl_ms } => {
            let ttl = ttl_ms.map(Duration::from_millis);
            coordinator.put(key, Bytes::from(value.clone()), ttl).await?;
            cluster.settle(key).await;
            "OK".to_string()
        }
        Command::Get { key } => {
            let value = coordinator.get(key).await?;
            if json {
                let value = value.map(|v| String::from_utf8_lossy(&v).into_owned());
                serde_json::to_string(&serde_json::json!({ "key": key, "value": value }))?
            } else {
                match value {
                    Some(v) => String::from_utf8_lossy(&v).into_owned(),
                    None => "(not found)".to_string(),
                }
            }
        }
        Command::Delete { key } => {
            coordinator.delete(key).await?;
            cluster.settle(key).await;
            "OK".to_string()
        }
        Command::Exists { key } => {
            let exists = coordinator.exists(key).await?;
            if json {
                serde_json::to_string(&serde_json::json!({ "key": key, "exists": exists }))?
            } else {
                exists.to_string()
            }
        }
        Command::Keys { pattern } => {
            let keys = cluster.keys(pattern);
            if json {
                serde_json::to_string(&keys)?
            } else {
                keys.into_iter().collect::<Vec<_>>().join("\n")
            }
        }
        Command::Snapshot => {
            let taken = cluster.snapshot()?;
            if json {
                let taken: Vec<_> = taken
                    .iter()
                    .map(|(id, seq)| serde_json::json!({ "node": id.0, "seq": seq }))
                    .collect();
                serde_json::to_string(&taken)?
            } else {
                taken
                    .iter()
                    .map(|(id, seq)| format!("node {id}: snapshot at seq {seq}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Command::Repair => {
            let round = cluster.repair().await;
            if json {
                serde_json::to_string(&round)?
            } else {
                format!(
                    "pairs synced: {}, in sync: {}, failed: {}, keys pushed: {}",
                    round.pairs_synced, round.pairs_in_sync, round.pairs_failed, round.keys_pushed
                )
            }
        }
        Command::Status => serde_json::to_string_pretty(&cluster.status())?,
    };
    Ok(output)
}
