//! Per-process runtime: admission, routing and worker threads.
//!
//! [`Node::submit`] admits a work item through the load shedder and routes it
//! by the current assignment snapshot. Locally owned items land in the
//! work-stealing queue, where OS worker threads pick them up, load prior state,
//! call the [`ComputationEngine`], persist the new state and emit the result.
//!
//! Workers never touch the coordination loops; the only async calls they make
//! are bounded state store operations driven through the runtime handle.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::assignment::AssignmentError;
use crate::backpressure::{MetricsSource, NodeMetrics};
use crate::coordination::CoordinationError;
use crate::coordinator::DistributedCoordinator;
use crate::metrics::Metrics;
use crate::retry::{RetryPolicy, next_retry_delay};
use crate::shedding::{AdaptiveLoadShedder, AdmissionDecision, KeyClassifier, ShedReason, SheddingConfig};
use crate::state_sync::{StateStoreError, StateSynchronizer};
use crate::work_item::{ComputationType, WorkItem};
use crate::work_queue::{WorkStealingQueue, WorkerQueue};

const IDLE_PARK: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("request shed: {reason}")]
    Shed { reason: ShedReason },
    #[error("key {key} is owned by {owner}")]
    NotLocallyOwned { key: String, owner: String },
    #[error("key {key} is migrating between nodes")]
    InTransition { key: String },
    #[error("key {key} is not assigned yet; placement requested")]
    Unassigned { key: String },
    #[error("node is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Assignment(#[from] AssignmentError),
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error("no tokio runtime available for workers")]
    NoRuntime,
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Output of one computation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationOutput {
    pub result: Vec<u8>,
    /// New state to persist; `None` leaves the stored state untouched.
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
#[error("computation failed: {0}")]
pub struct EngineError(pub String);

/// The signal math. Runs on worker threads and must be CPU-bound and
/// synchronous.
pub trait ComputationEngine: Send + Sync {
    fn compute(
        &self,
        item: &WorkItem,
        prior_state: Option<&[u8]>,
    ) -> Result<ComputationOutput, EngineError>;
}

/// Engine that echoes the payload and keeps no state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEngine;

impl ComputationEngine for NoopEngine {
    fn compute(&self, item: &WorkItem, _prior: Option<&[u8]>) -> Result<ComputationOutput, EngineError> {
        Ok(ComputationOutput {
            result: item.payload.clone(),
            state: None,
        })
    }
}

/// A finished work item, emitted on the node's result channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationResult {
    pub key: String,
    pub computation_type: ComputationType,
    pub node_id: String,
    pub retry_count: u32,
    pub output: Vec<u8>,
}

/// This node's load: external CPU/memory/latency with the local queue depth.
pub struct LocalLoad {
    queue: WorkStealingQueue<WorkItem>,
    queue_capacity: u64,
    external: Arc<dyn MetricsSource>,
}

impl LocalLoad {
    pub fn new(
        queue: WorkStealingQueue<WorkItem>,
        queue_capacity: usize,
        external: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            queue,
            queue_capacity: queue_capacity as u64,
            external,
        }
    }

    /// Composite score used as `current_load` for admission.
    pub fn current_load(&self) -> f64 {
        self.sample().composite_score()
    }
}

impl MetricsSource for LocalLoad {
    fn sample(&self) -> NodeMetrics {
        NodeMetrics {
            queue_depth: self.queue.len() as u64,
            queue_capacity: self.queue_capacity,
            ..self.external.sample()
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub max_retries: u32,
    /// Consecutive worker panics (across all workers) before the node is failed
    pub max_consecutive_panics: u32,
    /// Bound of the result channel
    pub result_buffer: usize,
    pub shedding: SheddingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_consecutive_panics: 3,
            result_buffer: 1024,
            shedding: SheddingConfig::default(),
        }
    }
}

/// Everything a node is wired to.
pub struct NodeParts {
    pub coordinator: Arc<DistributedCoordinator>,
    pub queue: WorkStealingQueue<WorkItem>,
    pub load: Arc<LocalLoad>,
    pub state: StateSynchronizer,
    pub engine: Arc<dyn ComputationEngine>,
    pub classifier: Arc<dyn KeyClassifier>,
    pub metrics: Option<Metrics>,
}

struct Shared {
    node_id: String,
    config: NodeConfig,
    coordinator: Arc<DistributedCoordinator>,
    queue: WorkStealingQueue<WorkItem>,
    load: Arc<LocalLoad>,
    shedder: AdaptiveLoadShedder,
    state: StateSynchronizer,
    engine: Arc<dyn ComputationEngine>,
    metrics: Option<Metrics>,
    results: mpsc::Sender<ComputationResult>,
    runtime: Handle,
    stopping: AtomicBool,
    consecutive_panics: AtomicU32,
    fatal_tx: watch::Sender<bool>,
}

pub struct Node {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: Vec<Thread>,
    next_worker: AtomicUsize,
}

impl Node {
    /// Spawn one worker thread per queue worker. Must be called from within a
    /// tokio runtime.
    pub fn start(
        config: NodeConfig,
        parts: NodeParts,
    ) -> Result<(Arc<Node>, mpsc::Receiver<ComputationResult>), NodeError> {
        let runtime = Handle::try_current().map_err(|_| NodeError::NoRuntime)?;
        let (results, results_rx) = mpsc::channel(config.result_buffer.max(1));
        let (fatal_tx, _) = watch::channel(false);
        let node_id = parts.coordinator.node_id().to_string();
        let shedder = AdaptiveLoadShedder::new(config.shedding.clone(), parts.classifier);

        let shared = Arc::new(Shared {
            node_id: node_id.clone(),
            config,
            coordinator: parts.coordinator,
            queue: parts.queue,
            load: parts.load,
            shedder,
            state: parts.state,
            engine: parts.engine,
            metrics: parts.metrics,
            results,
            runtime,
            stopping: AtomicBool::new(false),
            consecutive_panics: AtomicU32::new(0),
            fatal_tx,
        });

        let mut workers = Vec::new();
        let mut threads = Vec::new();
        for index in 0..shared.queue.num_workers() {
            let worker_shared = Arc::clone(&shared);
            let queue = shared.queue.worker(index);
            let handle = thread::Builder::new()
                .name(format!("shoal-worker-{index}"))
                .spawn(move || worker_loop(worker_shared, queue))?;
            threads.push(handle.thread().clone());
            workers.push(handle);
        }
        info!(node_id = %node_id, workers = workers.len(), "node started");

        Ok((
            Arc::new(Node {
                shared,
                workers: Mutex::new(workers),
                threads,
                next_worker: AtomicUsize::new(0),
            }),
            results_rx,
        ))
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn coordinator(&self) -> &Arc<DistributedCoordinator> {
        &self.shared.coordinator
    }

    /// Current admission load in `[0, 1]`.
    pub fn current_load(&self) -> f64 {
        self.shared.load.current_load()
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Flips to true once workers have panicked too often in a row.
    pub fn fatal(&self) -> watch::Receiver<bool> {
        self.shared.fatal_tx.subscribe()
    }

    /// Admit and route a work item.
    ///
    /// Items for keys owned elsewhere come back as `NotLocallyOwned` for the
    /// caller to forward; items for keys in transition or not yet placed are
    /// rejected so the ingestion side can retry them.
    pub async fn submit(&self, item: WorkItem) -> Result<(), NodeError> {
        let shared = &self.shared;
        if shared.stopping.load(Ordering::SeqCst) {
            return Err(NodeError::ShuttingDown);
        }

        let load = shared.load.current_load();
        if let AdmissionDecision::Shed(reason) = shared.shedder.decide(item.priority, load, &item.key) {
            if let Some(m) = &shared.metrics {
                m.record_shed(item.priority.as_str());
            }
            return Err(NodeError::Shed { reason });
        }

        let table = shared.coordinator.table();
        if table.is_in_transition(&item.key) {
            return Err(NodeError::InTransition { key: item.key });
        }
        let owner = match table.owner(&item.key) {
            Some(owner) => owner.to_string(),
            None if shared.coordinator.is_leader() => {
                shared.coordinator.assignments().assign(&item.key)?
            }
            None => {
                shared.coordinator.request_assignment(&item.key).await?;
                return Err(NodeError::Unassigned { key: item.key });
            }
        };

        if owner != shared.node_id {
            return Err(NodeError::NotLocallyOwned {
                key: item.key,
                owner,
            });
        }
        self.enqueue(item);
        Ok(())
    }

    fn enqueue(&self, item: WorkItem) {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.threads.len().max(1);
        self.shared.queue.push_to(index, item);
        if let Some(t) = self.threads.get(index) {
            t.unpark();
        }
    }

    /// Stop accepting work, let workers drain their queues and join them.
    /// Blocks the calling thread.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        for t in &self.threads {
            t.unpark();
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for w in workers {
            if w.join().is_err() {
                warn!(node_id = %self.shared.node_id, "worker thread exited abnormally");
            }
        }
        info!(node_id = %self.shared.node_id, "node stopped");
    }
}

enum Outcome {
    Ok,
    Abandoned,
    Retry(WorkItem, Duration),
    Failed,
    Panicked,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Abandoned => "abandoned",
            Outcome::Retry(..) => "retried",
            Outcome::Failed => "failed",
            Outcome::Panicked => "panicked",
        }
    }
}

fn worker_loop(shared: Arc<Shared>, queue: WorkerQueue<WorkItem>) {
    let mut queue = queue;
    debug!(worker = queue.index(), "worker started");
    loop {
        if *shared.fatal_tx.borrow() {
            break;
        }
        let item = match queue.pop_local() {
            Some(item) => Some(item),
            None => match queue.steal() {
                Ok(item) => {
                    if let Some(m) = &shared.metrics {
                        m.record_steals(1);
                    }
                    Some(item)
                }
                Err(_) => None,
            },
        };
        let Some(item) = item else {
            if shared.stopping.load(Ordering::SeqCst) && shared.queue.is_empty() {
                break;
            }
            thread::park_timeout(IDLE_PARK);
            continue;
        };

        let outcome = process(&shared, item);
        if let Some(m) = &shared.metrics {
            m.record_processed(outcome.label());
        }
        match outcome {
            Outcome::Panicked => {
                let n = shared.consecutive_panics.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= shared.config.max_consecutive_panics {
                    error!(node_id = %shared.node_id, panics = n, "too many consecutive worker panics; node failed");
                    let _ = shared.fatal_tx.send(true);
                    break;
                }
            }
            Outcome::Retry(item, delay) => {
                shared.consecutive_panics.store(0, Ordering::SeqCst);
                thread::sleep(delay);
                queue.push(item);
            }
            Outcome::Ok | Outcome::Abandoned | Outcome::Failed => {
                shared.consecutive_panics.store(0, Ordering::SeqCst);
            }
        }
    }
    debug!(worker = queue.index(), "worker stopped");
}

fn process(shared: &Shared, item: WorkItem) -> Outcome {
    let table = shared.coordinator.table();
    if table.owner(&item.key) != Some(shared.node_id.as_str()) || table.is_in_transition(&item.key) {
        debug!(key = %item.key, "abandoning item for key no longer owned here");
        return Outcome::Abandoned;
    }

    let prior = match shared
        .runtime
        .block_on(shared.state.load(&item.key, &item.computation_type))
    {
        Ok(prior) => prior,
        Err(e) => return retry_or_fail(shared, item, &StepError::State(e)),
    };

    let computed = catch_unwind(AssertUnwindSafe(|| {
        shared.engine.compute(&item, prior.as_deref())
    }));
    let output = match computed {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return retry_or_fail(shared, item, &StepError::Engine(e)),
        Err(_) => {
            warn!(key = %item.key, computation_type = %item.computation_type, "computation panicked");
            return Outcome::Panicked;
        }
    };

    if let Some(state) = output.state
        && let Err(e) = shared
            .runtime
            .block_on(shared.state.save(&item.key, &item.computation_type, state))
    {
        warn!(key = %item.key, error = %e, "failed to persist computation state");
    }

    let result = ComputationResult {
        key: item.key,
        computation_type: item.computation_type,
        node_id: shared.node_id.clone(),
        retry_count: item.retry_count,
        output: output.result,
    };
    if shared.results.blocking_send(result).is_err() {
        debug!("result receiver dropped");
    }
    Outcome::Ok
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    State(StateStoreError),
    #[error(transparent)]
    Engine(EngineError),
}

fn retry_or_fail(shared: &Shared, item: WorkItem, err: &StepError) -> Outcome {
    let policy = RetryPolicy::work_item(shared.config.max_retries);
    match next_retry_delay(item.retry_count, &policy, 0.0) {
        Some(delay) => {
            debug!(key = %item.key, attempt = item.retry_count + 1, error = %err, "retrying work item");
            Outcome::Retry(item.retried(), delay)
        }
        None => {
            warn!(key = %item.key, retries = item.retry_count, error = %err, "work item failed");
            Outcome::Failed
        }
    }
}
