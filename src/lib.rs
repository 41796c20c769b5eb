//! # resonance-engine
//!
//! A validation-and-consensus layer that sits between a language-model backend
//! and the end user. Every candidate response is scored by four independent
//! reviewers, aggregated into a coherence score under the current load-bias
//! weights, and either accepted, sent back for a bounded number of corrections,
//! or rejected with an explanation. A population search tunes the load-bias
//! weights between sessions.
//!
//! ## Architecture
//!
//! ```text
//! Generator ──▶ Candidate ──▶ ConsensusEngine ──▶ ACCEPT ──▶ TurnReport
//!     ▲                          │  (Control, Logic,
//!     │                          │   SecurityAudit, DataIntegrity)
//!     └──── CORRECT (≤ 3) ◀──────┤
//!                                └──▶ REJECT ──▶ TurnReport + explanation
//!
//! FitnessLog ──▶ EvolutionProtocol ──▶ BiasStore (atomic) ──▶ BiasPublisher ──▶ next turn
//! ```
//!
//! ## Module map
//! - [`config`]     -- TOML policy configuration, validation, schema export
//! - [`review`]     -- the four reviewers behind the [`review::Reviewer`] capability
//! - [`consensus`]  -- aggregation and the accept / correct / reject policy
//! - [`correction`] -- bounded correction loop state machine
//! - [`evolution`]  -- load-bias vectors, population search, persistence, publication
//! - [`session`]    -- per-turn orchestration over the components above
//! - [`monitor`]    -- coherence trend and anomaly tracking
//! - [`report`]     -- the structured per-turn report
//! - [`generator`] / [`context`] -- external collaborator interfaces and stubs

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod consensus;
pub mod context;
pub mod correction;
pub mod evolution;
pub mod generator;
pub mod monitor;
pub mod report;
pub mod review;
pub mod session;

// Re-exports for convenience
pub use consensus::{CoherenceLevel, ConsensusEngine, ConsensusResult, Decision};
pub use context::{ContextProvider, ContextSnapshot, OutputExpectations, TurnContext};
pub use correction::{CorrectionAttempt, CorrectionLoop, LoopState};
pub use evolution::{BiasPublisher, EvolutionProtocol, LoadBiasVector};
pub use generator::{EchoGenerator, GenerationError, GenerationRequest, Generator};
pub use monitor::{CoherenceMonitor, Trend};
pub use report::{RejectReason, TurnDecision, TurnReport};
pub use review::{Finding, ReviewVerdict, Reviewer, ReviewerPanel, ReviewerRole, Severity};
pub use session::{ResonanceSession, TurnError};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=resonance_engine=debug`).
///
/// # Errors
///
/// Returns [`ResonanceError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use resonance_engine::{init_tracing, ResonanceError};
/// # fn example() -> Result<(), ResonanceError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), ResonanceError> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => config::LogFormat::Json,
        _ => config::LogFormat::Pretty,
    };
    init_tracing_with(&format)
}

/// Initialise the global tracing subscriber with an explicit format, usually
/// `config.observability.log_format`.
///
/// # Errors
///
/// Same as [`init_tracing`].
pub fn init_tracing_with(format: &config::LogFormat) -> Result<(), ResonanceError> {
    let result = match format {
        config::LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        config::LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| ResonanceError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors.
///
/// Only configuration and persistence problems surface here; reviewer and
/// generation failures inside a turn are captured into the [`TurnReport`].
#[derive(Error, Debug)]
pub enum ResonanceError {
    /// The engine configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] config::validation::ConfigError),

    /// The persisted best-known biases could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(#[from] evolution::EvolutionPersistenceError),

    /// The evolution protocol could not complete a search cycle.
    #[error("evolution error: {0}")]
    Evolution(#[from] evolution::EvolutionError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Identifier of one user turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(
    /// The raw string ID, a UUID unless supplied by the caller.
    pub String,
);

impl TurnId {
    /// Create a new random [`TurnId`].
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Return the turn ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one candidate response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateId(
    /// The raw string ID.
    pub String,
);

impl CandidateId {
    /// Return the candidate ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CandidateOrigin {
    /// First response produced by the model for the turn.
    Model,
    /// A revision requested by the correction loop.
    Corrected {
        /// Which correction produced it, starting at 1.
        generation: u32,
    },
}

/// A candidate response.
///
/// Immutable once created: a correction produces a new `Candidate` that
/// supersedes the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    id: CandidateId,
    content: String,
    origin: CandidateOrigin,
    created_at: DateTime<Utc>,
}

impl Candidate {
    /// Create a candidate with a fresh ID and the current timestamp.
    pub fn new(content: impl Into<String>, origin: CandidateOrigin) -> Self {
        Self {
            id: CandidateId(format!("cand-{}", uuid::Uuid::new_v4())),
            content: content.into(),
            origin,
            created_at: Utc::now(),
        }
    }

    /// Create a candidate with a caller-chosen ID.
    pub fn with_id(id: impl Into<String>, content: impl Into<String>, origin: CandidateOrigin) -> Self {
        Self {
            id: CandidateId(id.into()),
            content: content.into(),
            origin,
            created_at: Utc::now(),
        }
    }

    /// Candidate ID.
    pub fn id(&self) -> &CandidateId {
        &self.id
    }

    /// Response text.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Who produced this candidate.
    pub fn origin(&self) -> CandidateOrigin {
        self.origin
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_id_generate_is_unique() {
        assert_ne!(TurnId::generate(), TurnId::generate());
    }

    #[test]
    fn test_turn_id_as_str_round_trips() {
        let id = TurnId("turn-1".to_string());
        assert_eq!(id.as_str(), "turn-1");
        assert_eq!(id.to_string(), "turn-1");
    }

    #[test]
    fn test_candidate_with_id_keeps_fields() {
        let c = Candidate::with_id("c-1", "hello.", CandidateOrigin::Model);
        assert_eq!(c.id().as_str(), "c-1");
        assert_eq!(c.content(), "hello.");
        assert_eq!(c.origin(), CandidateOrigin::Model);
    }

    #[test]
    fn test_candidate_new_ids_differ() {
        let a = Candidate::new("x", CandidateOrigin::Model);
        let b = Candidate::new("x", CandidateOrigin::Model);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_candidate_origin_serializes_tagged() {
        let json = serde_json::to_string(&CandidateOrigin::Corrected { generation: 2 })
            .expect("test: serialization");
        assert!(json.contains("\"corrected\""));
        assert!(json.contains("2"));
    }

    #[test]
    fn test_error_display_includes_message() {
        let err = ResonanceError::Other("boom".to_string());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
