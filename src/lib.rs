//! Horizontal-scaling and load-distribution core for a cluster of nodes that
//! compute per-instrument signals (option Greeks, technical indicators).
//!
//! The pieces, leaves first:
//! - [`ring`]: consistent hash ring with virtual nodes and copy-on-write snapshots
//! - [`backpressure`]: composite per-node load score and cluster scaling advice
//! - [`shedding`]: priority-aware request admission
//! - [`work_queue`]: per-worker deques with tail stealing
//! - [`state_sync`]: externalised, TTL-bound, migratable computation state
//! - [`assignment`]: key ownership table, placement and rebalancing
//! - [`coordinator`]: lease-based leader election and cluster membership
//! - [`node`]: the per-process runtime tying everything to worker threads

pub use shoal_macros::test;

pub mod assignment;
pub mod backpressure;
pub mod coordination;
pub mod coordinator;
pub mod metrics;
pub mod node;
pub mod retry;
pub mod ring;
pub mod settings;
pub mod shedding;
pub mod state_sync;
pub mod trace;
pub mod work_item;
pub mod work_queue;

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
