use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, info};

use shoal::assignment::PodAssignmentManager;
use shoal::backpressure::{BackpressureMonitor, MetricsSource, NodeMetrics};
use shoal::coordination::{CoordinationStore, EtcdStore, MemoryStore};
use shoal::coordinator::DistributedCoordinator;
use shoal::node::{LocalLoad, Node, NodeParts, NoopEngine};
use shoal::settings::{AppConfig, CoordinationBackend};
use shoal::shedding::{KeyClassifier, StaticKeyClassifier};
use shoal::state_sync::{MemoryStateStore, StateStore, StateSynchronizer};
use shoal::work_queue::WorkStealingQueue;

#[derive(Parser, Debug)]
#[command(version, about)]
/// Application CLI arguments
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = AppConfig::load(args.config.as_deref())?;
    shoal::trace::init(cfg.logging.format)?;
    if args.verbose {
        info!(config = ?cfg, "loaded configuration");
    }

    let metrics = shoal::metrics::init()?;
    let node_id = cfg.node_id();

    let store: Arc<dyn CoordinationStore> = match cfg.coordination.backend {
        CoordinationBackend::Memory => Arc::new(MemoryStore::new()),
        CoordinationBackend::Etcd => Arc::new(
            EtcdStore::connect(
                &cfg.coordination.etcd_endpoints,
                cfg.coordinator_config(&node_id).store_timeout,
            )
            .await
            .context("failed to connect to etcd")?,
        ),
    };
    let state_store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let state = StateSynchronizer::new(node_id.clone(), state_store, cfg.state_config());

    let assignments = Arc::new(
        PodAssignmentManager::new(cfg.placement_config())
            .with_state_sync(state.clone())
            .with_metrics(metrics.clone()),
    );
    let monitor = Arc::new(BackpressureMonitor::new(cfg.backpressure_config()));
    let queue = WorkStealingQueue::new(cfg.workers(), cfg.steal_config());
    // CPU, memory and latency are reported by the host; none is wired here.
    let external: Arc<dyn MetricsSource> = Arc::new(NodeMetrics::default);
    let load = Arc::new(LocalLoad::new(queue.clone(), cfg.node.queue_capacity, external));

    let (coordinator, coordinator_task) = DistributedCoordinator::start(
        cfg.coordinator_config(&node_id),
        store,
        assignments,
        monitor,
        load.clone(),
        Some(metrics.clone()),
    )
    .await
    .context("failed to join cluster")?;

    let classifier: Arc<dyn KeyClassifier> =
        Arc::new(StaticKeyClassifier::new(cfg.shedding.important_keys.clone()));
    let (node, mut results) = Node::start(
        cfg.node_config(),
        NodeParts {
            coordinator: coordinator.clone(),
            queue,
            load,
            state,
            engine: Arc::new(NoopEngine),
            classifier,
            metrics: Some(metrics.clone()),
        },
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Some(addr) = cfg.metrics.addr {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = shoal::metrics::run_metrics_server(addr, metrics, shutdown_rx).await {
                error!(error = %e, "metrics server failed");
            }
        });
    }

    tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            debug!(key = %result.key, computation_type = %result.computation_type, "computation finished");
        }
    });

    let mut fatal = node.fatal();
    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            Ok(())
        }
        _ = fatal.wait_for(|failed| *failed) => {
            Err(anyhow::anyhow!("node {node_id} failed after repeated worker panics"))
        }
    };

    let _ = shutdown_tx.send(true);
    let stopping = node.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .context("worker shutdown panicked")?;
    if let Err(e) = coordinator.shutdown().await {
        error!(error = %e, "coordinator shutdown incomplete");
    }
    let _ = coordinator_task.await;

    outcome
}
