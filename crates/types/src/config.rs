//! Service configuration and shard topology resolution.
//!
//! Configuration is a single JSON document deserialized into
//! [`TesseraConfig`]; every field has a default so an empty document is a
//! valid single-node setup. Shard replica sets come from a separate
//! topology file mapping shard ids to replica addresses; this process finds
//! its own replica id by matching its address against that list.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::ReplicaId;

/// Environment variable naming this process's replica address.
pub const SELF_ADDRESS_ENV: &str = "TESSERA_SELF_ADDRESS";

/// Environment variable carrying the shared proof MAC key.
pub const PROOF_KEY_ENV: &str = "TESSERA_PROOF_KEY";

/// Base tick length for consensus timers.
///
/// `heartbeat_tick` and `election_tick` are multiples of this duration.
const RAFT_TICK: Duration = Duration::from_millis(100);

/// Errors raised while loading or validating configuration.
#[derive(Debug, Snafu)]
pub enum TopologyError {
    /// The topology or config file could not be read.
    #[snafu(display("failed to read {}: {source}", path.display()))]
    Read {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file contents were not valid JSON for the expected shape.
    #[snafu(display("failed to parse {}: {source}", path.display()))]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// A configuration value is out of range.
    #[snafu(display("invalid configuration: {message}"))]
    Validation {
        /// Description of the violated rule.
        message: String,
    },
}

// ============================================================================
// Circuit breaker settings
// ============================================================================

/// Circuit breaker tuning for the cross-peer control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_breaker_threshold")]
    #[builder(default = default_breaker_threshold())]
    pub threshold: u32,
    /// Time an open circuit stays open before permitting a probe.
    #[serde(default = "default_breaker_timeout", with = "humantime_serde")]
    #[builder(default = default_breaker_timeout())]
    pub open_timeout: Duration,
    /// Probe attempts per health-check cycle.
    #[serde(default = "default_breaker_retries")]
    #[builder(default = default_breaker_retries())]
    pub max_retries: u32,
    /// Delay between probe attempts.
    #[serde(default = "default_breaker_retry_interval", with = "humantime_serde")]
    #[builder(default = default_breaker_retry_interval())]
    pub retry_interval: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            open_timeout: default_breaker_timeout(),
            max_retries: default_breaker_retries(),
            retry_interval: default_breaker_retry_interval(),
        }
    }
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_breaker_retries() -> u32 {
    3
}

fn default_breaker_retry_interval() -> Duration {
    Duration::from_secs(5)
}

// ============================================================================
// Service configuration
// ============================================================================

/// Top-level configuration for a Tessera node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct TesseraConfig {
    /// Maximum age of the oldest pending request before a batch flush.
    #[serde(default = "default_batch_timeout", with = "humantime_serde")]
    #[builder(default = default_batch_timeout())]
    pub batch_timeout: Duration,

    /// Maximum requests per consensus proposal.
    #[serde(default = "default_batch_max_size")]
    #[builder(default = default_batch_max_size())]
    pub batch_max_size: usize,

    /// Shared deadline for the endorser-side prepare fan-out.
    #[serde(default = "default_prepare_timeout", with = "humantime_serde")]
    #[builder(default = default_prepare_timeout())]
    pub prepare_timeout: Duration,

    /// Time-to-live for dependency map entries.
    #[serde(default = "default_expiry_duration", with = "humantime_serde")]
    #[builder(default = default_expiry_duration())]
    pub expiry_duration: Duration,

    /// Cadence of the expired-entry sweep.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    #[builder(default = default_sweep_interval())]
    pub sweep_interval: Duration,

    /// Election timeout in base ticks (100 ms each).
    #[serde(default = "default_election_tick")]
    #[builder(default = default_election_tick())]
    pub election_tick: u64,

    /// Heartbeat interval in base ticks (100 ms each).
    #[serde(default = "default_heartbeat_tick")]
    #[builder(default = default_heartbeat_tick())]
    pub heartbeat_tick: u64,

    /// Replication pipelining bound.
    #[serde(default = "default_max_inflight_msgs")]
    #[builder(default = default_max_inflight_msgs())]
    pub max_inflight_msgs: u64,

    /// Upper bound on one encoded log record or RPC message, in bytes.
    #[serde(default = "default_max_msg_size")]
    #[builder(default = default_max_msg_size())]
    pub max_msg_size: usize,

    /// Circuit breaker settings for upstream peer probes.
    #[serde(default)]
    #[builder(default)]
    pub circuit_breaker: BreakerSettings,

    /// Path to the JSON shard topology file.
    #[serde(default)]
    pub shard_topology_file: Option<PathBuf>,

    /// This process's replica address; the `TESSERA_SELF_ADDRESS`
    /// environment variable takes precedence.
    #[serde(default)]
    pub self_address: Option<String>,

    /// Optional upstream peer probed by the health monitor.
    #[serde(default)]
    pub upstream_peer: Option<String>,

    /// Shared key for prepare-proof MACs; the `TESSERA_PROOF_KEY`
    /// environment variable takes precedence.
    #[serde(default)]
    pub proof_key: Option<String>,
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            batch_timeout: default_batch_timeout(),
            batch_max_size: default_batch_max_size(),
            prepare_timeout: default_prepare_timeout(),
            expiry_duration: default_expiry_duration(),
            sweep_interval: default_sweep_interval(),
            election_tick: default_election_tick(),
            heartbeat_tick: default_heartbeat_tick(),
            max_inflight_msgs: default_max_inflight_msgs(),
            max_msg_size: default_max_msg_size(),
            circuit_breaker: BreakerSettings::default(),
            shard_topology_file: None,
            self_address: None,
            upstream_peer: None,
            proof_key: None,
        }
    }
}

impl TesseraConfig {
    /// Loads configuration from a JSON file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        let config: Self = serde_json::from_str(&raw).context(ParseSnafu { path })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.batch_max_size == 0 {
            return Err(TopologyError::Validation {
                message: "batch_max_size must be > 0".to_string(),
            });
        }
        if self.heartbeat_tick == 0 || self.election_tick == 0 {
            return Err(TopologyError::Validation {
                message: "heartbeat_tick and election_tick must be > 0".to_string(),
            });
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(TopologyError::Validation {
                message: format!(
                    "election_tick ({}) must be greater than heartbeat_tick ({})",
                    self.election_tick, self.heartbeat_tick
                ),
            });
        }
        if self.max_msg_size == 0 {
            return Err(TopologyError::Validation {
                message: "max_msg_size must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves this process's replica address.
    ///
    /// The environment variable wins over the config file; the fallback is
    /// a loopback address suitable for single-node development.
    pub fn resolved_self_address(&self) -> String {
        std::env::var(SELF_ADDRESS_ENV)
            .ok()
            .filter(|addr| !addr.is_empty())
            .or_else(|| self.self_address.clone())
            .unwrap_or_else(|| "127.0.0.1:7251".to_string())
    }

    /// Resolves the shared proof MAC key.
    ///
    /// The environment variable wins over the config file; the fallback is
    /// a development key suitable only for single-process setups.
    pub fn resolved_proof_key(&self) -> String {
        std::env::var(PROOF_KEY_ENV)
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.proof_key.clone())
            .unwrap_or_else(|| "tessera-dev-proof-key".to_string())
    }

    /// Heartbeat interval derived from `heartbeat_tick`.
    pub fn heartbeat_interval(&self) -> Duration {
        RAFT_TICK * self.heartbeat_tick as u32
    }

    /// Lower bound of the randomized election timeout.
    pub fn election_timeout_min(&self) -> Duration {
        RAFT_TICK * self.election_tick as u32
    }

    /// Upper bound of the randomized election timeout.
    pub fn election_timeout_max(&self) -> Duration {
        self.election_timeout_min() * 2
    }
}

fn default_batch_timeout() -> Duration {
    Duration::from_millis(300)
}

fn default_batch_max_size() -> usize {
    20
}

fn default_prepare_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_expiry_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_election_tick() -> u64 {
    10
}

fn default_heartbeat_tick() -> u64 {
    1
}

fn default_max_inflight_msgs() -> u64 {
    256
}

fn default_max_msg_size() -> usize {
    1024 * 1024
}

// ============================================================================
// Shard topology
// ============================================================================

/// Replica endpoints for one shard group, plus this process's position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Shard identifier (namespace).
    pub shard_id: String,
    /// Replica addresses in topology order.
    pub replica_nodes: Vec<String>,
    /// This process's 1-based index into `replica_nodes`.
    pub replica_id: ReplicaId,
}

impl ShardConfig {
    /// Membership map keyed by replica id, as consensus bootstrap input.
    pub fn members(&self) -> BTreeMap<ReplicaId, String> {
        self.replica_nodes
            .iter()
            .enumerate()
            .map(|(i, addr)| (i as u64 + 1, addr.clone()))
            .collect()
    }
}

/// Mapping from shard id to replica addresses.
///
/// The on-disk shape is the bare JSON object
/// `{"fabcar": ["10.0.0.2:7251", "10.0.0.3:7251"]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardTopology {
    shards: HashMap<String, Vec<String>>,
}

impl ShardTopology {
    /// Loads a topology file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        serde_json::from_str(&raw).context(ParseSnafu { path })
    }

    /// Builds a topology from an in-memory map.
    pub fn from_map(shards: HashMap<String, Vec<String>>) -> Self {
        Self { shards }
    }

    /// Number of configured shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the topology is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Resolves the replica set for a shard.
    ///
    /// A shard absent from the topology gets a single-replica group made of
    /// this process alone, so lazily created shards are live immediately.
    /// When the shard is listed but this address is not among its replicas,
    /// the first position is assumed.
    pub fn shard_config(&self, shard_id: &str, self_address: &str) -> ShardConfig {
        match self.shards.get(shard_id) {
            Some(replicas) if !replicas.is_empty() => {
                let replica_id = replicas
                    .iter()
                    .position(|addr| addr == self_address)
                    .map(|i| i as u64 + 1)
                    .unwrap_or(1);
                ShardConfig {
                    shard_id: shard_id.to_string(),
                    replica_nodes: replicas.clone(),
                    replica_id,
                }
            },
            _ => ShardConfig {
                shard_id: shard_id.to_string(),
                replica_nodes: vec![self_address.to_string()],
                replica_id: 1,
            },
        }
    }
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
