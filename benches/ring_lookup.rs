//! Benchmark for hash ring lookups
//!
//! Measures owner and replica lookups on a 16-node ring, plus the cost of
//! publishing a new ring through `SharedRing` while readers are active.
//!
//! Run with: cargo bench --bench ring_lookup

use shoal::ring::{HashRing, SharedRing};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

const NODES: usize = 16;
const VIRTUAL_NODES: u32 = 150;
const KEYS: usize = 100_000;

fn build_ring() -> HashRing {
    let mut ring = HashRing::new(VIRTUAL_NODES);
    for i in 0..NODES {
        if let Some(next) = ring.with_node(&format!("node-{i:02}")) {
            ring = next;
        }
    }
    ring
}

fn keys() -> Vec<String> {
    (0..KEYS).map(|i| format!("NSE:INST{i:06}")).collect()
}

fn measure_owner(ring: &HashRing, keys: &[String]) -> f64 {
    let start = Instant::now();
    for key in keys {
        black_box(ring.owner(key));
    }
    keys.len() as f64 / start.elapsed().as_secs_f64()
}

fn measure_replicas(ring: &HashRing, keys: &[String], n: usize) -> f64 {
    let start = Instant::now();
    for key in keys {
        black_box(ring.replicas(key, n));
    }
    keys.len() as f64 / start.elapsed().as_secs_f64()
}

/// Readers look up owners on the shared ring while one writer flips a node in and out.
fn measure_shared_under_churn(keys: Arc<Vec<String>>, readers: usize) -> (f64, usize) {
    let shared = Arc::new(SharedRing::from_ring(build_ring()));
    let stop = Arc::new(AtomicBool::new(false));
    let publishes = Arc::new(AtomicUsize::new(0));

    let writer = {
        let shared = Arc::clone(&shared);
        let stop = Arc::clone(&stop);
        let publishes = Arc::clone(&publishes);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                shared.add_node("node-churn");
                shared.remove_node("node-churn");
                publishes.fetch_add(2, Ordering::Relaxed);
            }
        })
    };

    let start = Instant::now();
    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let shared = Arc::clone(&shared);
            let keys = Arc::clone(&keys);
            std::thread::spawn(move || {
                for key in keys.iter() {
                    black_box(shared.owner(key));
                }
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }
    let elapsed = start.elapsed().as_secs_f64();
    stop.store(true, Ordering::Relaxed);
    let _ = writer.join();

    (
        (keys.len() * readers) as f64 / elapsed,
        publishes.load(Ordering::Relaxed),
    )
}

fn main() {
    let ring = build_ring();
    let keys = keys();
    println!(
        "ring: {} nodes x {} virtual nodes = {} entries",
        ring.len(),
        ring.virtual_nodes(),
        ring.entries().len()
    );

    // warm up
    measure_owner(&ring, &keys);

    println!("owner:          {:>12.0} lookups/s", measure_owner(&ring, &keys));
    for n in [1, 3, 5] {
        println!(
            "replicas(n={n}):  {:>12.0} lookups/s",
            measure_replicas(&ring, &keys, n)
        );
    }

    let keys = Arc::new(keys);
    for readers in [1, 4, 8] {
        let (rate, publishes) = measure_shared_under_churn(Arc::clone(&keys), readers);
        println!(
            "shared owner, {readers} readers under churn: {rate:>12.0} lookups/s ({publishes} ring publishes)"
        );
    }
}
