//! Composite per-node backpressure and cluster scaling recommendations.
//!
//! Every node reports [`NodeMetrics`]; the monitor turns each report into a
//! [`BackpressureSample`] that supersedes the node's previous one. The leader
//! reads the latest samples to decide whether the cluster should grow or shrink.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

const QUEUE_WEIGHT: f64 = 0.4;
const CPU_WEIGHT: f64 = 0.3;
const MEM_WEIGHT: f64 = 0.2;
const LATENCY_WEIGHT: f64 = 0.1;

/// Raw load metrics reported by a node. CPU and memory are percentages (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub queue_depth: u64,
    pub queue_capacity: u64,
    pub p99_latency_ms: f64,
    pub target_latency_ms: f64,
}

impl NodeMetrics {
    pub fn queue_ratio(&self) -> f64 {
        if self.queue_capacity == 0 {
            return if self.queue_depth > 0 { 1.0 } else { 0.0 };
        }
        unit(self.queue_depth as f64 / self.queue_capacity as f64)
    }

    pub fn latency_ratio(&self) -> f64 {
        if self.target_latency_ms <= 0.0 {
            return if self.p99_latency_ms > 0.0 { 1.0 } else { 0.0 };
        }
        unit(self.p99_latency_ms / self.target_latency_ms)
    }

    /// Weighted composite in `[0, 1]`. Non-decreasing in every input.
    pub fn composite_score(&self) -> f64 {
        QUEUE_WEIGHT * self.queue_ratio()
            + CPU_WEIGHT * unit(self.cpu_pct / 100.0)
            + MEM_WEIGHT * unit(self.mem_pct / 100.0)
            + LATENCY_WEIGHT * self.latency_ratio()
    }
}

/// Supplies this node's current [`NodeMetrics`] for periodic reporting.
///
/// CPU, memory and latency come from outside the core; implementations
/// usually combine them with the local queue depth.
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> NodeMetrics;
}

impl<F> MetricsSource for F
where
    F: Fn() -> NodeMetrics + Send + Sync,
{
    fn sample(&self) -> NodeMetrics {
        self()
    }
}

fn unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackpressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl BackpressureLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 0.5 {
            BackpressureLevel::Low
        } else if score < 0.7 {
            BackpressureLevel::Medium
        } else if score < 0.85 {
            BackpressureLevel::High
        } else {
            BackpressureLevel::Critical
        }
    }

    /// Numeric form for gauges (0 = Low .. 3 = Critical).
    pub fn as_index(&self) -> u8 {
        match self {
            BackpressureLevel::Low => 0,
            BackpressureLevel::Medium => 1,
            BackpressureLevel::High => 2,
            BackpressureLevel::Critical => 3,
        }
    }
}

impl fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackpressureLevel::Low => write!(f, "LOW"),
            BackpressureLevel::Medium => write!(f, "MEDIUM"),
            BackpressureLevel::High => write!(f, "HIGH"),
            BackpressureLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Latest computed load for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureSample {
    pub node_id: String,
    pub score: f64,
    pub level: BackpressureLevel,
    /// Epoch millis when the sample was computed
    pub sampled_at_ms: i64,
}

impl BackpressureSample {
    pub fn from_metrics(node_id: impl Into<String>, metrics: &NodeMetrics) -> Self {
        let score = metrics.composite_score();
        Self {
            node_id: node_id.into(),
            score,
            level: BackpressureLevel::from_score(score),
            sampled_at_ms: crate::now_epoch_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleUrgency {
    Immediate,
    Normal,
}

/// Advice for the external control plane. The core never provisions nodes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScalingRecommendation {
    #[default]
    None,
    ScaleUp { nodes: usize, urgency: ScaleUrgency },
    ScaleDown { nodes: usize },
}

impl ScalingRecommendation {
    /// Signed node delta: positive to add, negative to remove.
    pub fn delta(&self) -> i64 {
        match self {
            ScalingRecommendation::None => 0,
            ScalingRecommendation::ScaleUp { nodes, .. } => *nodes as i64,
            ScalingRecommendation::ScaleDown { nodes } => -(*nodes as i64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Never recommend shrinking to or below this many nodes.
    pub min_nodes: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { min_nodes: 1 }
    }
}

/// Holds the latest sample per node. Any node writes its own; the leader reads all.
pub struct BackpressureMonitor {
    config: BackpressureConfig,
    samples: RwLock<HashMap<String, BackpressureSample>>,
}

impl BackpressureMonitor {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            samples: RwLock::new(HashMap::new()),
        }
    }

    /// Recompute and store the sample for `node_id`, replacing any older one.
    pub fn update(&self, node_id: &str, metrics: &NodeMetrics) -> BackpressureSample {
        let sample = BackpressureSample::from_metrics(node_id, metrics);
        debug!(node_id = %node_id, score = sample.score, level = %sample.level, "backpressure sample");
        self.samples
            .write()
            .insert(node_id.to_string(), sample.clone());
        sample
    }

    pub fn remove_node(&self, node_id: &str) -> Option<BackpressureSample> {
        self.samples.write().remove(node_id)
    }

    /// Drop samples for nodes not in `live`.
    pub fn retain_nodes<'a>(&self, live: impl IntoIterator<Item = &'a str>) {
        let live: std::collections::HashSet<&str> = live.into_iter().collect();
        self.samples.write().retain(|id, _| live.contains(id.as_str()));
    }

    pub fn sample(&self, node_id: &str) -> Option<BackpressureSample> {
        self.samples.read().get(node_id).cloned()
    }

    /// All current samples, sorted by node id.
    pub fn samples(&self) -> Vec<BackpressureSample> {
        let mut v: Vec<BackpressureSample> = self.samples.read().values().cloned().collect();
        v.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        v
    }

    pub fn recommendation(&self) -> ScalingRecommendation {
        let samples = self.samples();
        recommend(&samples, self.config.min_nodes)
    }
}

/// Cluster scaling rule over the latest per-node samples.
///
/// - more than 30% CRITICAL: scale up now by `max(2, ceil(n/2))`
/// - more than 50% at HIGH or worse: scale up by `max(1, ceil(0.3n))`
/// - no CRITICAL, under 10% HIGH, over 80% LOW and `n > min_nodes`: scale down by 1
pub fn recommend(samples: &[BackpressureSample], min_nodes: usize) -> ScalingRecommendation {
    let n = samples.len();
    if n == 0 {
        return ScalingRecommendation::None;
    }
    let count = |pred: fn(BackpressureLevel) -> bool| samples.iter().filter(|s| pred(s.level)).count();
    let critical = count(|l| l == BackpressureLevel::Critical);
    let high_or_worse = count(|l| l >= BackpressureLevel::High);
    let high = count(|l| l == BackpressureLevel::High);
    let low = count(|l| l == BackpressureLevel::Low);
    let frac = |c: usize| c as f64 / n as f64;

    if frac(critical) > 0.3 {
        return ScalingRecommendation::ScaleUp {
            nodes: n.div_ceil(2).max(2),
            urgency: ScaleUrgency::Immediate,
        };
    }
    if frac(high_or_worse) > 0.5 {
        return ScalingRecommendation::ScaleUp {
            nodes: ((n as f64 * 0.3).ceil() as usize).max(1),
            urgency: ScaleUrgency::Normal,
        };
    }
    if critical == 0 && frac(high) < 0.1 && frac(low) > 0.8 && n > min_nodes {
        return ScalingRecommendation::ScaleDown { nodes: 1 };
    }
    ScalingRecommendation::None
}
