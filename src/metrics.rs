//! Prometheus metrics for shoal.
//!
//! This module provides:
//! - Pre-defined metric instruments for placement, backpressure and admission
//! - An HTTP server for the `/metrics` endpoint
//!
//! # Usage
//!
//! Initialize metrics once at startup:
//! ```ignore
//! let metrics = shoal::metrics::init()?;
//! ```
//!
//! Then start the metrics server:
//! ```ignore
//! shoal::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx).await;
//! ```

use std::net::SocketAddr;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, IntCounter, Opts, Registry, TextEncoder,
    core::Collector,
};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::backpressure::{BackpressureSample, ScalingRecommendation};

/// Metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Backpressure / scaling
    backpressure_score: GaugeVec,
    backpressure_level: GaugeVec,
    scaling_recommendation: Gauge,

    // Coordination
    is_leader: Gauge,
    registry_degraded: Gauge,

    // Placement
    keys_assigned: GaugeVec,
    rebalance_keys_moved: IntCounter,
    migration_timeouts: IntCounter,

    // Node runtime
    requests_shed: CounterVec,
    work_steals: Counter,
    work_items_processed: CounterVec,
}

impl Metrics {
    /// Get the prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export the latest backpressure sample for a node.
    pub fn record_backpressure(&self, sample: &BackpressureSample) {
        let node = sample.node_id.as_str();
        self.backpressure_score
            .with_label_values(&[node])
            .set(sample.score);
        self.backpressure_level
            .with_label_values(&[node])
            .set(sample.level.as_index() as f64);
    }

    /// Forget gauges for a node that left the cluster.
    pub fn remove_node(&self, node: &str) {
        let _ = self.backpressure_score.remove_label_values(&[node]);
        let _ = self.backpressure_level.remove_label_values(&[node]);
        let _ = self.keys_assigned.remove_label_values(&[node]);
    }

    /// Export the current scaling recommendation as a signed node delta.
    pub fn set_scaling_recommendation(&self, rec: &ScalingRecommendation) {
        self.scaling_recommendation.set(rec.delta() as f64);
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.set(if leader { 1.0 } else { 0.0 });
    }

    pub fn set_registry_degraded(&self, degraded: bool) {
        self.registry_degraded.set(if degraded { 1.0 } else { 0.0 });
    }

    pub fn set_keys_assigned(&self, node: &str, count: usize) {
        self.keys_assigned
            .with_label_values(&[node])
            .set(count as f64);
    }

    pub fn record_keys_moved(&self, count: usize) {
        self.rebalance_keys_moved.inc_by(count as u64);
    }

    pub fn record_migration_timeout(&self) {
        self.migration_timeouts.inc();
    }

    pub fn record_shed(&self, priority: &str) {
        self.requests_shed.with_label_values(&[priority]).inc();
    }

    pub fn record_steals(&self, count: u64) {
        self.work_steals.inc_by(count as f64);
    }

    /// `outcome` is one of "ok", "retried", "failed", "abandoned", "panicked".
    pub fn record_processed(&self, outcome: &str) {
        self.work_items_processed
            .with_label_values(&[outcome])
            .inc();
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // Log but don't fail - metric may already be registered
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a fresh Prometheus registry.
///
/// Returns a `Metrics` handle that can be cloned and passed to components.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let backpressure_score = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "shoal_backpressure_score",
                "Composite backpressure score (0-1) per node",
            ),
            &["node"],
        )?,
    );

    let backpressure_level = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "shoal_backpressure_level",
                "Backpressure level per node (0=LOW, 1=MEDIUM, 2=HIGH, 3=CRITICAL)",
            ),
            &["node"],
        )?,
    );

    let scaling_recommendation = register(
        &registry,
        Gauge::new(
            "shoal_scaling_recommendation",
            "Recommended node delta (positive = add nodes, negative = remove)",
        )?,
    );

    let is_leader = register(
        &registry,
        Gauge::new("shoal_is_leader", "1 if this node currently holds the leader lease")?,
    );

    let registry_degraded = register(
        &registry,
        Gauge::new(
            "shoal_registry_degraded",
            "1 while the coordination store is unreachable and the last snapshot is served",
        )?,
    );

    let keys_assigned = register(
        &registry,
        GaugeVec::new(
            Opts::new("shoal_keys_assigned", "Number of work keys assigned per node"),
            &["node"],
        )?,
    );

    let rebalance_keys_moved = register(
        &registry,
        IntCounter::new(
            "shoal_rebalance_keys_moved_total",
            "Total number of keys moved between nodes by rebalancing",
        )?,
    );

    let migration_timeouts = register(
        &registry,
        IntCounter::new(
            "shoal_migration_timeouts_total",
            "Total number of state migrations aborted on deadline",
        )?,
    );

    let requests_shed = register(
        &registry,
        CounterVec::new(
            Opts::new("shoal_requests_shed_total", "Total number of requests shed"),
            &["priority"],
        )?,
    );

    let work_steals = register(
        &registry,
        Counter::new(
            "shoal_work_steals_total",
            "Total number of work items stolen between workers",
        )?,
    );

    let work_items_processed = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "shoal_work_items_processed_total",
                "Total number of work items dequeued by workers, by outcome",
            ),
            &["outcome"],
        )?,
    );

    Ok(Metrics {
        registry,
        backpressure_score,
        backpressure_level,
        scaling_recommendation,
        is_leader,
        registry_degraded,
        keys_assigned,
        rebalance_keys_moved,
        migration_timeouts,
        requests_shed,
        work_steals,
        work_items_processed,
    })
}

/// Render all registered metrics in the Prometheus text format.
pub fn render(metrics: &Metrics) -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    match render(&metrics) {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Router serving `/metrics`.
pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Run the Prometheus metrics HTTP server.
///
/// Listens on the given address and serves metrics at `/metrics`.
/// Shuts down gracefully when the shutdown flag flips to true.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
