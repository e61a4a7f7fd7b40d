use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use crate::assignment::PlacementConfig;
use crate::backpressure::BackpressureConfig;
use crate::coordinator::CoordinatorConfig;
use crate::node::NodeConfig;
use crate::shedding::SheddingConfig;
use crate::state_sync::StateConfig;
use crate::work_queue::StealConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeSettings,
    #[serde(default)]
    pub coordination: CoordinationSettings,
    #[serde(default)]
    pub ring: RingSettings,
    #[serde(default)]
    pub placement: PlacementSettings,
    #[serde(default)]
    pub backpressure: BackpressureSettings,
    #[serde(default)]
    pub shedding: SheddingSettings,
    #[serde(default)]
    pub stealing: StealingSettings,
    #[serde(default)]
    pub state: StateSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NodeSettings {
    /// Defaults to the hostname, else a random UUID
    pub node_id: Option<String>,
    /// Maximum number of keys this node accepts
    pub capacity: usize,
    /// Defaults to the available parallelism
    pub workers: Option<usize>,
    /// Queue depth counted as 100% for the load score
    pub queue_capacity: usize,
    pub max_consecutive_panics: u32,
    pub max_retries: u32,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            capacity: 1000,
            workers: None,
            queue_capacity: 10_000,
            max_consecutive_panics: 3,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    #[default]
    Memory,
    Etcd,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinationSettings {
    pub backend: CoordinationBackend,
    pub etcd_endpoints: Vec<String>,
    pub cluster_prefix: String,
    pub leader_lease_ttl_ms: u64,
    pub presence_ttl_ms: u64,
    pub store_timeout_ms: u64,
    pub cycle_interval_ms: u64,
    pub metrics_report_interval_ms: u64,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Memory,
            etcd_endpoints: Vec::new(),
            cluster_prefix: "shoal".to_string(),
            leader_lease_ttl_ms: 5_000,
            presence_ttl_ms: 10_000,
            store_timeout_ms: 1_000,
            cycle_interval_ms: 1_000,
            metrics_report_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RingSettings {
    pub virtual_nodes: u32,
}

impl Default for RingSettings {
    fn default() -> Self {
        Self {
            virtual_nodes: crate::ring::DEFAULT_VIRTUAL_NODES,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PlacementSettings {
    pub replica_candidates: usize,
    pub saturation_ratio: f64,
    pub rebalance_threshold: f64,
    pub migration_timeout_ms: u64,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            replica_candidates: 3,
            saturation_ratio: 0.9,
            rebalance_threshold: 0.3,
            migration_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackpressureSettings {
    pub min_nodes: usize,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self { min_nodes: 1 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SheddingSettings {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    pub important_boost: f64,
    pub seed: Option<u64>,
    /// Keys that get the raised admission threshold
    pub important_keys: Vec<String>,
}

impl Default for SheddingSettings {
    fn default() -> Self {
        Self {
            high: 0.9,
            medium: 0.7,
            low: 0.5,
            important_boost: 0.1,
            seed: None,
            important_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StealingSettings {
    pub max_attempts: usize,
    pub backoff_us: u64,
    pub seed: Option<u64>,
}

impl Default for StealingSettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_us: 50,
            seed: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StateSettings {
    pub ttl_secs: u64,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MetricsSettings {
    /// Serve `/metrics` here when set, e.g. "0.0.0.0:9090"
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                let cfg: Self = toml::from_str(&data)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    /// Configured node id, else the hostname, else a random UUID.
    pub fn node_id(&self) -> String {
        self.node
            .node_id
            .clone()
            .or_else(crate::coordination::get_hostname)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn workers(&self) -> usize {
        self.node
            .workers
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1)
    }

    pub fn coordinator_config(&self, node_id: &str) -> CoordinatorConfig {
        let c = &self.coordination;
        CoordinatorConfig {
            node_id: node_id.to_string(),
            capacity: self.node.capacity,
            cluster_prefix: c.cluster_prefix.clone(),
            leader_lease_ttl: Duration::from_millis(c.leader_lease_ttl_ms),
            presence_ttl: Duration::from_millis(c.presence_ttl_ms),
            store_timeout: Duration::from_millis(c.store_timeout_ms),
            cycle_interval: Duration::from_millis(c.cycle_interval_ms),
            metrics_report_interval: Duration::from_millis(c.metrics_report_interval_ms),
        }
    }

    pub fn placement_config(&self) -> PlacementConfig {
        let p = &self.placement;
        PlacementConfig {
            replica_candidates: p.replica_candidates.max(1),
            saturation_ratio: p.saturation_ratio,
            rebalance_threshold: p.rebalance_threshold,
            migration_timeout: Duration::from_millis(p.migration_timeout_ms),
            virtual_nodes: self.ring.virtual_nodes,
        }
    }

    pub fn backpressure_config(&self) -> BackpressureConfig {
        BackpressureConfig {
            min_nodes: self.backpressure.min_nodes,
        }
    }

    pub fn shedding_config(&self) -> SheddingConfig {
        let s = &self.shedding;
        SheddingConfig {
            high: s.high,
            medium: s.medium,
            low: s.low,
            important_boost: s.important_boost,
            seed: s.seed,
        }
    }

    pub fn steal_config(&self) -> StealConfig {
        let s = &self.stealing;
        StealConfig {
            max_attempts: s.max_attempts,
            backoff: Duration::from_micros(s.backoff_us),
            seed: s.seed,
        }
    }

    pub fn state_config(&self) -> StateConfig {
        StateConfig {
            ttl: Duration::from_secs(self.state.ttl_secs),
            op_timeout: Duration::from_millis(self.coordination.store_timeout_ms),
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            max_retries: self.node.max_retries,
            max_consecutive_panics: self.node.max_consecutive_panics.max(1),
            shedding: self.shedding_config(),
            ..NodeConfig::default()
        }
    }
}
