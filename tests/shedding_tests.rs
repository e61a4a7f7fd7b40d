use std::sync::Arc;

use shoal::shedding::{
    AdaptiveLoadShedder, AdmissionDecision, KeyClassifier, NoImportantKeys, SheddingConfig,
    StaticKeyClassifier,
};
use shoal::work_item::Priority;

const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Medium, Priority::Low];

fn seeded(seed: u64, classifier: Arc<dyn KeyClassifier>) -> AdaptiveLoadShedder {
    AdaptiveLoadShedder::new(
        SheddingConfig {
            seed: Some(seed),
            ..SheddingConfig::default()
        },
        classifier,
    )
}

#[shoal::test]
fn idle_node_admits_everything() {
    let shedder = seeded(1, Arc::new(NoImportantKeys));
    for p in ALL {
        for i in 0..100 {
            assert!(shedder.admit(p, 0.0, &format!("key-{i}")));
        }
    }
}

#[shoal::test]
fn critical_is_never_shed() {
    let shedder = seeded(2, Arc::new(NoImportantKeys));
    for load in [0.5, 0.95, 1.0, 7.0, f64::NAN] {
        for _ in 0..200 {
            assert!(shedder.admit(Priority::Critical, load, "NSE:NIFTY"));
        }
    }
    assert_eq!(shedder.threshold(Priority::Critical, "NSE:NIFTY"), None);
}

#[shoal::test]
fn low_priority_at_full_load_is_always_shed() {
    let shedder = seeded(3, Arc::new(NoImportantKeys));
    for _ in 0..1000 {
        match shedder.decide(Priority::Low, 1.0, "NSE:SMALLCAP") {
            AdmissionDecision::Shed(reason) => {
                assert_eq!(reason.priority, Priority::Low);
                assert_eq!(reason.threshold, 0.5);
                assert_eq!(reason.admit_probability, 0.0);
            }
            AdmissionDecision::Admitted => panic!("low priority admitted at full load"),
        }
    }
}

#[shoal::test]
fn probability_falls_linearly_above_threshold() {
    let shedder = seeded(4, Arc::new(NoImportantKeys));
    let p = |prio, load| shedder.admit_probability(prio, load, "k");
    assert_eq!(p(Priority::Low, 0.49), 1.0);
    assert!((p(Priority::Low, 0.75) - 0.5).abs() < 1e-9);
    assert!((p(Priority::Medium, 0.85) - 0.5).abs() < 1e-9);
    assert!((p(Priority::High, 0.95) - 0.5).abs() < 1e-9);
    assert_eq!(p(Priority::Medium, 1.0), 0.0);

    // Higher priority never fares worse at the same load.
    for step in 0..=20 {
        let load = step as f64 / 20.0;
        assert!(p(Priority::High, load) >= p(Priority::Medium, load));
        assert!(p(Priority::Medium, load) >= p(Priority::Low, load));
    }
}

#[shoal::test]
fn admission_rate_tracks_probability() {
    let shedder = seeded(5, Arc::new(NoImportantKeys));
    let admitted = (0..10_000)
        .filter(|_| shedder.admit(Priority::Low, 0.75, "k"))
        .count();
    let rate = admitted as f64 / 10_000.0;
    assert!((0.45..0.55).contains(&rate), "admission rate {rate}");
}

#[shoal::test]
fn important_keys_get_a_raised_threshold() {
    let classifier = StaticKeyClassifier::new(["NSE:RELIANCE"]);
    let shedder = seeded(6, Arc::new(classifier));
    assert!((shedder.threshold(Priority::Low, "NSE:RELIANCE").unwrap() - 0.6).abs() < 1e-9);
    assert_eq!(shedder.threshold(Priority::Low, "NSE:OTHER"), Some(0.5));

    // Between the plain and the boosted threshold only important keys are sure to pass.
    assert_eq!(shedder.admit_probability(Priority::Low, 0.55, "NSE:RELIANCE"), 1.0);
    assert!(shedder.admit_probability(Priority::Low, 0.55, "NSE:OTHER") < 1.0);
}

#[shoal::test]
fn closures_classify_keys() {
    let classifier: Arc<dyn KeyClassifier> = Arc::new(|key: &str| key.starts_with("NSE:NIFTY"));
    let shedder = seeded(7, classifier);
    assert!(
        shedder.admit_probability(Priority::Medium, 0.75, "NSE:NIFTY50")
            > shedder.admit_probability(Priority::Medium, 0.75, "BSE:SENSEX")
    );
}

#[shoal::test]
fn same_seed_same_decisions() {
    let a = seeded(42, Arc::new(NoImportantKeys));
    let b = seeded(42, Arc::new(NoImportantKeys));
    for i in 0..500 {
        let load = 0.5 + (i % 50) as f64 / 100.0;
        assert_eq!(
            a.admit(Priority::Medium, load, "k"),
            b.admit(Priority::Medium, load, "k")
        );
    }
}
