//! Per-worker deques with randomized tail stealing.
//!
//! A worker pushes to and pops from its own deque (push at the tail, pop at the
//! head). When its deque is empty it makes up to `max_attempts` steals from
//! random peers, taking from the victim's tail so owner and thief work opposite
//! ends. Steals only `try_lock` the victim, so an owner's own pop is never
//! stalled by a thief, and a victim is never drained below one item.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct StealConfig {
    pub max_attempts: usize,
    /// Pause between failed steal attempts
    pub backoff: Duration,
    /// Base seed for victim selection; worker `i` uses `seed + i`.
    pub seed: Option<u64>,
}

impl Default for StealConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: Duration::from_micros(50),
            seed: None,
        }
    }
}

/// No work was found after exhausting steal attempts. Not an error for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealFailure {
    pub attempts: usize,
}

struct Shared<T> {
    deques: Vec<Mutex<VecDeque<T>>>,
    config: StealConfig,
    steals: AtomicU64,
}

/// The set of worker deques for one node.
pub struct WorkStealingQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkStealingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> WorkStealingQueue<T> {
    pub fn new(workers: usize, config: StealConfig) -> Self {
        let workers = workers.max(1);
        Self {
            shared: Arc::new(Shared {
                deques: (0..workers).map(|_| Mutex::new(VecDeque::new())).collect(),
                config,
                steals: AtomicU64::new(0),
            }),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.shared.deques.len()
    }

    /// Handle for worker `index`. Each worker should hold exactly one.
    pub fn worker(&self, index: usize) -> WorkerQueue<T> {
        let index = index % self.shared.deques.len();
        let rng = match self.shared.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
            None => StdRng::from_os_rng(),
        };
        WorkerQueue {
            index,
            shared: Arc::clone(&self.shared),
            rng,
        }
    }

    /// Append to the tail of worker `index`'s deque.
    pub fn push_to(&self, index: usize, item: T) {
        let index = index % self.shared.deques.len();
        self.shared.deques[index].lock().push_back(item);
    }

    pub fn len_of(&self, index: usize) -> usize {
        self.shared.deques[index % self.shared.deques.len()].lock().len()
    }

    /// Total queued items across all workers.
    pub fn len(&self) -> usize {
        self.shared.deques.iter().map(|d| d.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful steals since creation.
    pub fn steal_count(&self) -> u64 {
        self.shared.steals.load(Ordering::Relaxed)
    }

    /// Remove every queued item.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        for d in &self.shared.deques {
            out.extend(d.lock().drain(..));
        }
        out
    }
}

/// One worker's view: its own deque plus the ability to steal from peers.
pub struct WorkerQueue<T> {
    index: usize,
    shared: Arc<Shared<T>>,
    rng: StdRng,
}

impl<T: Send> WorkerQueue<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn push(&self, item: T) {
        self.shared.deques[self.index].lock().push_back(item);
    }

    pub fn len(&self) -> usize {
        self.shared.deques[self.index].lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next item from the local head, else a stolen item, else `None`.
    pub fn pop(&mut self) -> Option<T> {
        if let Some(item) = self.pop_local() {
            return Some(item);
        }
        self.steal().ok()
    }

    /// Next item from the local head only.
    pub fn pop_local(&self) -> Option<T> {
        self.shared.deques[self.index].lock().pop_front()
    }

    /// Try up to `max_attempts` random victims, taking from their tail.
    pub fn steal(&mut self) -> Result<T, StealFailure> {
        let n = self.shared.deques.len();
        let attempts = self.shared.config.max_attempts;
        if n < 2 {
            return Err(StealFailure { attempts: 0 });
        }
        for attempt in 0..attempts {
            // pick any peer other than ourselves
            let mut victim = self.rng.random_range(0..n - 1);
            if victim >= self.index {
                victim += 1;
            }
            if let Some(mut deque) = self.shared.deques[victim].try_lock()
                && deque.len() > 1
                && let Some(item) = deque.pop_back()
            {
                self.shared.steals.fetch_add(1, Ordering::Relaxed);
                return Ok(item);
            }
            if attempt + 1 < attempts && !self.shared.config.backoff.is_zero() {
                std::thread::sleep(self.shared.config.backoff);
            }
        }
        Err(StealFailure { attempts })
    }
}
