//! # Evolution Protocol Integration
//!
//! Determinism for a fixed seed, the elitism invariant, persistence of the
//! best-known record and publication to live sessions.

use chrono::Utc;
use resonance_engine::config::{EngineConfig, EvolutionConfig};
use resonance_engine::evolution::{
    run_evolution_cycle, BestKnown, BiasPublisher, BiasStore, EvaluationSample,
    EvolutionPersistenceError, EvolutionProtocol, EvolutionState, FitnessLog, TurnSample,
};
use resonance_engine::{LoadBiasVector, TurnDecision};

fn sample(label: &str, evaluations: &[[f64; 4]]) -> TurnSample {
    TurnSample {
        label: label.to_string(),
        evaluations: evaluations
            .iter()
            .map(|s| EvaluationSample {
                scores: *s,
                hard_fail: false,
                timed_out: false,
            })
            .collect(),
        decision: TurnDecision::Rejected,
        final_coherence: 0.0,
        recorded_at: Utc::now(),
    }
}

/// Control and Logic are reliably strong, DataIntegrity is weak: a vector
/// leaning away from DataIntegrity turns these corrections into accepts.
fn skewed_history() -> Vec<TurnSample> {
    (0..12)
        .map(|i| {
            let wobble = (i % 3) as f64 * 0.01;
            sample(
                "tactical",
                &[
                    [0.98 - wobble, 0.96, 0.9, 0.55 + wobble],
                    [0.99, 0.97 - wobble, 0.92, 0.6],
                ],
            )
        })
        .collect()
}

fn config(seed: u64) -> EngineConfig {
    EngineConfig {
        evolution: EvolutionConfig {
            seed,
            max_generations: 8,
            stall_generations: 8,
            ..EvolutionConfig::default()
        },
        ..EngineConfig::default()
    }
}

#[test]
fn test_same_seed_same_outcome() {
    let history = skewed_history();
    let a = EvolutionProtocol::from_config(&config(42), EvolutionState::initial())
        .evolve("tactical", &history)
        .expect("test: evolve a");
    let b = EvolutionProtocol::from_config(&config(42), EvolutionState::initial())
        .evolve("tactical", &history)
        .expect("test: evolve b");
    assert_eq!(a, b);
}

#[test]
fn test_search_improves_on_equal_weights() {
    let history = skewed_history();
    let protocol = EvolutionProtocol::from_config(&config(7), EvolutionState::initial());
    let out = protocol.evolve("tactical", &history).expect("test: evolve");
    assert!(out.improved);
    assert!(out.best_fitness > 0.0);
    let w = out.best.weights();
    assert!(w[3] < 0.25, "data integrity weight should shrink: {w:?}");
    let sum: f64 = w.iter().sum();
    assert!((sum - 1.0).abs() < 1e-9);
}

#[test]
fn test_best_fitness_never_decreases_across_generations() {
    let history = skewed_history();
    let protocol = EvolutionProtocol::from_config(&config(3), EvolutionState::initial());
    let out = protocol.evolve("tactical", &history).expect("test: evolve");
    assert!(!out.summaries.is_empty());
    assert!(out
        .summaries
        .windows(2)
        .all(|w| w[1].best_fitness >= w[0].best_fitness - 1e-12));
    assert!(out.best_fitness >= out.summaries[0].best_fitness - 1e-12);
    assert!(out.hall_of_fame.len() <= 5);
}

#[test]
fn test_second_run_keeps_incumbent_without_strict_gain() {
    let history = skewed_history();
    let protocol = EvolutionProtocol::from_config(&config(11), EvolutionState::initial());
    let first = protocol.evolve("tactical", &history).expect("test: first");
    let second = protocol.evolve("tactical", &history).expect("test: second");
    assert!(second.best_fitness >= first.best_fitness - 1e-12);
    assert!(second.generation > first.generation);
}

#[test]
fn test_invalid_population_is_reported() {
    let mut cfg = config(1);
    cfg.evolution.population_size = 1;
    let err = EvolutionProtocol::from_config(&cfg, EvolutionState::initial())
        .evolve("x", &skewed_history())
        .unwrap_err();
    assert!(err.to_string().contains("population_size"));
}

#[tokio::test]
async fn test_cycle_persists_then_publishes() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let store = BiasStore::new(dir.path().join("best_biases.json"));
    let publisher = BiasPublisher::from_store(&store);
    assert_eq!(*publisher.current(), LoadBiasVector::EQUAL);

    let log = FitnessLog::new(64);
    for s in skewed_history() {
        log.record(s).expect("test: record");
    }
    let protocol = EvolutionProtocol::from_config(&config(5), EvolutionState::initial());
    let rx = publisher.subscribe();

    let out = run_evolution_cycle(&protocol, &log, "tactical", &store, &publisher)
        .await
        .expect("test: cycle");

    let persisted = store.load().expect("test: load").expect("test: record present");
    assert!(persisted.vector.max_difference(&out.best) < 1e-9);
    assert_eq!(persisted.generation, out.generation);
    assert_eq!(**rx.borrow(), out.best);

    // A restart resumes from the persisted record.
    let resumed = EvolutionState::from_best_known(&persisted);
    assert_eq!(resumed.best, persisted.vector);
    assert!(BiasPublisher::from_store(&store).current().max_difference(&out.best) < 1e-9);
}

#[tokio::test]
async fn test_save_overwrites_atomically() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let store = BiasStore::new(dir.path().join("best.json"));
    for generation in 1..=3 {
        let known = BestKnown {
            vector: LoadBiasVector::from_weights([generation as f64, 1.0, 1.0, 1.0]),
            fitness: 0.1 * generation as f64,
            generation,
        };
        store.save(&known).await.expect("test: save");
        let loaded = store.load().expect("test: load").expect("test: present");
        assert_eq!(loaded.generation, generation);
    }
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .expect("test: read dir")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_malformed_state_fails_loudly_but_sessions_fall_back() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let path = dir.path().join("best.json");
    std::fs::write(&path, r#"{"biases": {"control": "high"}, "fitness": 1}"#).expect("test: write");
    let store = BiasStore::new(&path);

    assert!(matches!(
        store.load(),
        Err(EvolutionPersistenceError::Malformed { .. })
    ));
    assert_eq!(*BiasPublisher::from_store(&store).current(), LoadBiasVector::EQUAL);
}

#[test]
fn test_negative_weight_is_invalid() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let path = dir.path().join("best.json");
    std::fs::write(
        &path,
        r#"{"biases": {"control": -0.1, "logic": 0.5, "security_audit": 0.3, "data_integrity": 0.3},
            "fitness": 0.4, "generation": 2}"#,
    )
    .expect("test: write");
    assert!(matches!(
        BiasStore::new(&path).load(),
        Err(EvolutionPersistenceError::Invalid { .. })
    ));
}
