//! Turn context and the context-capture collaborator.
//!
//! A [`ContextSnapshot`] is whatever the environment collaborator reports at
//! turn start. The consensus engine never depends on it being real sensor
//! data; [`SimulatedContextProvider`] returns fixed simulated observations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TurnId;

/// Environment observations captured once per turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Name of the collaborator that produced the snapshot.
    pub source: String,
    /// Label used to group fitness samples (e.g. "tactical", "support").
    pub label: String,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
    /// Free-form observations.
    pub observations: serde_json::Value,
    /// True when the data is simulated rather than captured.
    pub simulated: bool,
}

impl ContextSnapshot {
    /// An empty snapshot with the given label.
    pub fn empty(label: impl Into<String>) -> Self {
        Self {
            source: "none".to_string(),
            label: label.into(),
            captured_at: Utc::now(),
            observations: serde_json::Value::Null,
            simulated: true,
        }
    }
}

/// Consumed interface of the environment/vision collaborator.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Capture the current environment.
    async fn capture_context(&self) -> ContextSnapshot;
}

/// Deterministic stand-in for the vision collaborator.
#[derive(Debug, Clone)]
pub struct SimulatedContextProvider {
    label: String,
}

impl SimulatedContextProvider {
    /// Create a provider that labels every snapshot with `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Default for SimulatedContextProvider {
    fn default() -> Self {
        Self::new("default")
    }
}

#[async_trait]
impl ContextProvider for SimulatedContextProvider {
    async fn capture_context(&self) -> ContextSnapshot {
        ContextSnapshot {
            source: "simulation".to_string(),
            label: self.label.clone(),
            captured_at: Utc::now(),
            observations: serde_json::json!({
                "visual_input": "unavailable",
                "heuristic_scan": "standard protocol sequence 01",
            }),
            simulated: true,
        }
    }
}

/// Shape the caller expects the response to have.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputExpectations {
    /// A structured payload must be present.
    pub require_payload: bool,
    /// The payload's top level must be a JSON object.
    pub payload_object: bool,
    /// Fields that must appear (as payload keys, or `name:` sections in text).
    pub required_fields: Vec<String>,
}

/// Everything a reviewer may look at besides the candidate itself.
///
/// Built once per turn and shared read-only by all four reviewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnContext {
    /// Turn this context belongs to.
    pub turn_id: TurnId,
    /// The user input that started the turn.
    pub prompt: String,
    /// Stated objective the response should serve, if any.
    pub objective: Option<String>,
    /// Expected output shape.
    pub expectations: OutputExpectations,
    /// Environment snapshot captured at turn start.
    pub snapshot: ContextSnapshot,
}

impl TurnContext {
    /// Context for `prompt` with no objective, no expectations and an empty snapshot.
    pub fn for_prompt(prompt: impl Into<String>) -> Self {
        Self {
            turn_id: TurnId::generate(),
            prompt: prompt.into(),
            objective: None,
            expectations: OutputExpectations::default(),
            snapshot: ContextSnapshot::empty("default"),
        }
    }

    /// Set the objective.
    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = Some(objective.into());
        self
    }

    /// Set the output expectations.
    pub fn with_expectations(mut self, expectations: OutputExpectations) -> Self {
        self.expectations = expectations;
        self
    }

    /// Set the environment snapshot.
    pub fn with_snapshot(mut self, snapshot: ContextSnapshot) -> Self {
        self.snapshot = snapshot;
        self
    }
}
