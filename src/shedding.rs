//! Priority-aware request admission under load.
//!
//! Critical requests always pass. Everything else passes freely below a
//! per-priority threshold and is admitted with linearly falling probability
//! between the threshold and full load.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::work_item::Priority;

/// Decides whether a key deserves the raised admission threshold
/// (high-frequency or otherwise important instruments).
pub trait KeyClassifier: Send + Sync {
    fn is_important(&self, key: &str) -> bool;
}

/// Classifier that treats no key as important.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoImportantKeys;

impl KeyClassifier for NoImportantKeys {
    fn is_important(&self, _key: &str) -> bool {
        false
    }
}

/// Classifier backed by a fixed set of keys.
#[derive(Debug, Default, Clone)]
pub struct StaticKeyClassifier {
    keys: HashSet<String>,
}

impl StaticKeyClassifier {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl KeyClassifier for StaticKeyClassifier {
    fn is_important(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

impl<F> KeyClassifier for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_important(&self, key: &str) -> bool {
        self(key)
    }
}

#[derive(Debug, Clone)]
pub struct SheddingConfig {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    /// Added to the threshold of important keys, capped at 1.0
    pub important_boost: f64,
    /// Seed for the admission RNG; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SheddingConfig {
    fn default() -> Self {
        Self {
            high: 0.9,
            medium: 0.7,
            low: 0.5,
            important_boost: 0.1,
            seed: None,
        }
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct ShedReason {
    pub priority: Priority,
    pub load: f64,
    pub threshold: f64,
    pub admit_probability: f64,
}

impl fmt::Display for ShedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} priority shed at load {:.2} (threshold {:.2}, admit probability {:.2})",
            self.priority, self.load, self.threshold, self.admit_probability
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Admitted,
    Shed(ShedReason),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }
}

pub struct AdaptiveLoadShedder {
    config: SheddingConfig,
    classifier: Arc<dyn KeyClassifier>,
    rng: Mutex<StdRng>,
}

impl AdaptiveLoadShedder {
    pub fn new(config: SheddingConfig, classifier: Arc<dyn KeyClassifier>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            classifier,
            rng: Mutex::new(rng),
        }
    }

    /// Admission threshold for a request, or `None` for critical requests.
    pub fn threshold(&self, priority: Priority, key: &str) -> Option<f64> {
        let base = match priority {
            Priority::Critical => return None,
            Priority::High => self.config.high,
            Priority::Medium => self.config.medium,
            Priority::Low => self.config.low,
        };
        if self.classifier.is_important(key) {
            Some((base + self.config.important_boost).min(1.0))
        } else {
            Some(base.min(1.0))
        }
    }

    /// Probability in `[0, 1]` that a request at `current_load` is admitted.
    pub fn admit_probability(&self, priority: Priority, current_load: f64, key: &str) -> f64 {
        let Some(threshold) = self.threshold(priority, key) else {
            return 1.0;
        };
        let load = if current_load.is_nan() { 1.0 } else { current_load.clamp(0.0, 1.0) };
        if load < threshold {
            return 1.0;
        }
        if threshold >= 1.0 {
            return 0.0;
        }
        (1.0 - (load - threshold) / (1.0 - threshold)).clamp(0.0, 1.0)
    }

    pub fn decide(&self, priority: Priority, current_load: f64, key: &str) -> AdmissionDecision {
        let p = self.admit_probability(priority, current_load, key);
        if p >= 1.0 {
            return AdmissionDecision::Admitted;
        }
        let roll: f64 = self.rng.lock().random();
        if roll < p {
            return AdmissionDecision::Admitted;
        }
        let reason = ShedReason {
            priority,
            load: current_load,
            threshold: self.threshold(priority, key).unwrap_or(1.0),
            admit_probability: p,
        };
        debug!(key = %key, reason = %reason, "request shed");
        AdmissionDecision::Shed(reason)
    }

    pub fn admit(&self, priority: Priority, current_load: f64, key: &str) -> bool {
        self.decide(priority, current_load, key).is_admitted()
    }
}
