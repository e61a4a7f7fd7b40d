use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration shared by store retries and work-item retries.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Maximum number of retries; `None` retries forever.
    pub retry_count: Option<u32>,
    pub initial_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub randomize_interval: Option<bool>,
    pub backoff_factor: Option<f64>,
}

impl RetryPolicy {
    pub fn default_initial_interval_ms() -> u64 {
        100
    }
    pub fn default_max_interval_ms() -> u64 {
        10_000
    }
    pub fn default_backoff_factor() -> f64 {
        2.0
    }
    pub fn default_randomize() -> bool {
        true
    }

    /// Policy used while the coordination store is unreachable: unbounded, jittered.
    pub fn registry() -> Self {
        Self {
            retry_count: None,
            initial_interval_ms: Some(100),
            max_interval_ms: Some(5_000),
            randomize_interval: Some(true),
            backoff_factor: Some(2.0),
        }
    }

    /// Policy for re-running a failed computation on the same node.
    pub fn work_item(max_retries: u32) -> Self {
        Self {
            retry_count: Some(max_retries),
            initial_interval_ms: Some(10),
            max_interval_ms: Some(1_000),
            randomize_interval: Some(false),
            backoff_factor: Some(2.0),
        }
    }
}

/// Delay before the next attempt, if any.
/// - `failures_so_far`: number of failed attempts so far (0 for first failure)
/// - `jitter`: a value in `[0, 1)` used when the policy randomizes
///
/// Returns `None` once the policy's retries are exhausted.
pub fn next_retry_delay(failures_so_far: u32, policy: &RetryPolicy, jitter: f64) -> Option<Duration> {
    if let Some(allowed) = policy.retry_count
        && failures_so_far >= allowed
    {
        return None;
    }

    let initial = policy
        .initial_interval_ms
        .unwrap_or_else(RetryPolicy::default_initial_interval_ms);
    let factor = policy
        .backoff_factor
        .unwrap_or_else(RetryPolicy::default_backoff_factor);
    let max_interval = policy
        .max_interval_ms
        .unwrap_or_else(RetryPolicy::default_max_interval_ms);
    let randomize = policy
        .randomize_interval
        .unwrap_or_else(RetryPolicy::default_randomize);

    // delay_n = initial * factor^n, capped before jitter so the exponent cannot overflow
    let mut delay = (initial as f64 * factor.powi(failures_so_far.min(63) as i32)).min(max_interval as f64);
    if randomize {
        // multiplier in [0.5, 1.5)
        delay *= 0.5 + jitter.clamp(0.0, 1.0);
    }
    let delay = (delay.round() as u64).min(max_interval);
    Some(Duration::from_millis(delay))
}

/// Stateful backoff for retry loops.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait, or `None` when retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let jitter: f64 = rand::rng().random();
        let delay = next_retry_delay(self.failures, &self.policy, jitter);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Uniform jitter in `[0, max)`, used to spread out election retries.
pub fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let ms = max.as_millis().max(1) as u64;
    Duration::from_millis(rand::rng().random_range(0..ms))
}
