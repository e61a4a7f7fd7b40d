use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Request priority used for admission decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which computation a work item drives, e.g. `"greeks"` or `"rsi_14"`.
///
/// The core treats this as an opaque label; it is part of the state key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationType(pub String);

impl ComputationType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComputationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComputationType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ComputationType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit of work created when a tick arrives for a key.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub key: String,
    pub computation_type: ComputationType,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    /// Opaque tick payload handed to the computation engine.
    pub payload: Vec<u8>,
}

impl WorkItem {
    pub fn new(
        key: impl Into<String>,
        computation_type: impl Into<ComputationType>,
        priority: Priority,
    ) -> Self {
        Self {
            key: key.into(),
            computation_type: computation_type.into(),
            priority,
            enqueued_at: Instant::now(),
            retry_count: 0,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// The same item queued for another attempt.
    pub fn retried(mut self) -> Self {
        self.retry_count += 1;
        self
    }
}
