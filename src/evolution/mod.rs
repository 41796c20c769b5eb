//! # Evolution Protocol
//!
//! Population search over the [`LoadBiasVector`] used by consensus
//! aggregation. Fitness comes from replaying recorded turns under each
//! candidate vector; the best-known vector is persisted atomically and then
//! published to live sessions.
//!
//! ## Guarantees
//! - Never touches live traffic: sessions only see a new vector through the
//!   [`BiasPublisher`] at the start of their next turn
//! - The best-known vector is never discarded and only replaced on strict
//!   improvement
//! - Deterministic for a given seed and sample set
//!
//! ## Module map
//! - [`bias`]    -- the weight vector
//! - [`fitness`] -- turn samples, the bounded log and the replay model
//! - [`search`]  -- the genetic search and its state
//! - [`store`]   -- the persisted best-known record
//! - [`publish`] -- live handoff and the full evolution cycle

pub mod bias;
pub mod fitness;
pub mod publish;
pub mod search;
pub mod store;

use std::path::PathBuf;

use thiserror::Error;

pub use bias::{InvalidBias, LoadBiasVector};
pub use fitness::{EvaluationSample, FitnessLog, FitnessModel, TurnSample};
pub use publish::{run_evolution_cycle, BiasPublisher};
pub use search::{
    Bifurcation, EvolutionOutcome, EvolutionProtocol, EvolutionState, GenerationSummary,
    HallOfFameEntry, Individual,
};
pub use store::{BestKnown, BiasRecord, BiasStore};

// ── Errors ──────────────────────────────────────────────────────────────────

/// The persisted best-known record could not be read or written.
#[derive(Debug, Error)]
pub enum EvolutionPersistenceError {
    /// Filesystem failure.
    #[error("evolution state I/O error at '{path}': {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a valid record.
    #[error("evolution state at '{path}' is malformed: {source}")]
    Malformed {
        /// File involved.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// The record parsed but its content is unusable.
    #[error("evolution state at '{path}' is invalid: {reason}")]
    Invalid {
        /// File involved.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
}

/// Errors raised by the evolution protocol.
#[derive(Debug, Error)]
pub enum EvolutionError {
    /// Attempted to evolve with an empty population.
    #[error("cannot evolve an empty population")]
    EmptyPopulation,

    /// The evolution configuration cannot drive a search.
    #[error("invalid evolution configuration: {0}")]
    InvalidConfig(String),

    /// Internal lock was poisoned by a panicking thread.
    #[error("evolution state lock poisoned")]
    LockPoisoned,

    /// The blocking search task did not complete.
    #[error("evolution task failed: {0}")]
    TaskFailed(String),

    /// Persisting the outcome failed.
    #[error(transparent)]
    Persistence(#[from] EvolutionPersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(EvolutionError::EmptyPopulation.to_string().contains("empty population"));
        assert!(EvolutionError::InvalidConfig("x".into()).to_string().contains("x"));

        let err = EvolutionPersistenceError::Invalid {
            path: PathBuf::from("state/best.json"),
            reason: "missing weight".into(),
        };
        assert!(err.to_string().contains("state/best.json"));
        let wrapped: EvolutionError = err.into();
        assert!(wrapped.to_string().contains("missing weight"));
    }
}
