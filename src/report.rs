//! Per-turn report.
//!
//! The structured object handed to an external log/report sink. The engine
//! only builds it; writing it anywhere is the caller's business. A rejected
//! turn always carries an explanation assembled from the findings of every
//! attempt, never a raw internal error.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consensus::CoherenceLevel;
use crate::correction::{CorrectionAttempt, LoopOutcome, LoopState};
use crate::evolution::LoadBiasVector;
use crate::review::{Finding, Severity};
use crate::{Candidate, TurnId};

/// Why a turn ended in REJECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// SecurityAudit raised an unconditional fail.
    HardSecurityFail,
    /// DataIntegrity raised an unconditional fail.
    HardIntegrityFail,
    /// Coherence fell below the floor threshold.
    BelowFloor,
    /// Coherence stayed between floor and accept after the last allowed correction.
    CorrectionBudgetExhausted,
    /// A correction was requested beyond the hard ceiling.
    RecursionLimitExceeded,
    /// The generation collaborator failed.
    GenerationFailed,
    /// A reviewer or the generation collaborator missed its deadline.
    Timeout,
}

impl RejectReason {
    /// One-line description.
    pub fn describe(self) -> &'static str {
        match self {
            RejectReason::HardSecurityFail => "security audit raised an unconditional fail",
            RejectReason::HardIntegrityFail => "data integrity check raised an unconditional fail",
            RejectReason::BelowFloor => "coherence fell below the minimum acceptable floor",
            RejectReason::CorrectionBudgetExhausted => {
                "coherence did not reach the accept threshold within the correction budget"
            }
            RejectReason::RecursionLimitExceeded => "correction recursion limit exceeded",
            RejectReason::GenerationFailed => "the generation backend failed to produce a candidate",
            RejectReason::Timeout => "a collaborator did not answer in time",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Terminal outcome of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDecision {
    /// A candidate was accepted.
    Accepted,
    /// The turn was rejected.
    Rejected,
}

/// Everything the outside world learns about one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnReport {
    /// Turn identifier.
    pub turn_id: TurnId,
    /// Context label the turn ran under.
    pub context_label: String,
    /// Final decision.
    pub decision: TurnDecision,
    /// Accepted candidate, if any.
    pub final_candidate: Option<Candidate>,
    /// Coherence of the last evaluation (0 when nothing was evaluated).
    pub coherence: f64,
    /// Level of `coherence`.
    pub level: CoherenceLevel,
    /// Corrections requested during the turn.
    pub corrections: u32,
    /// Every evaluation of the turn, in order.
    pub attempts: Vec<CorrectionAttempt>,
    /// Rejection reason.
    pub reason: Option<RejectReason>,
    /// Explanation built from accumulated findings (rejections only).
    pub explanation: Option<String>,
    /// Weights the turn was evaluated under.
    pub bias: LoadBiasVector,
    /// Turn start.
    pub started_at: DateTime<Utc>,
    /// Turn end.
    pub finished_at: DateTime<Utc>,
}

impl TurnReport {
    /// Build the report for a resolved loop.
    pub fn from_outcome(
        turn_id: TurnId,
        context_label: impl Into<String>,
        bias: LoadBiasVector,
        outcome: LoopOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        let coherence = outcome
            .history
            .last()
            .map(|a| a.result.coherence)
            .unwrap_or(0.0);
        let accepted = outcome.state == LoopState::Accepted;
        let (reason, explanation) = if accepted {
            (None, None)
        } else {
            let reason = outcome.reason.unwrap_or(RejectReason::BelowFloor);
            let text = explain(reason, &outcome.history, outcome.failure.as_ref());
            (Some(reason), Some(text))
        };

        Self {
            turn_id,
            context_label: context_label.into(),
            decision: if accepted {
                TurnDecision::Accepted
            } else {
                TurnDecision::Rejected
            },
            final_candidate: if accepted { outcome.final_candidate } else { None },
            coherence,
            level: CoherenceLevel::from_score(coherence),
            corrections: outcome.corrections,
            attempts: outcome.history,
            reason,
            explanation,
            bias,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Whether the turn accepted a candidate.
    pub fn is_accepted(&self) -> bool {
        self.decision == TurnDecision::Accepted
    }

    /// Serialise as a single JSON line for an append-only sink.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Assemble a human-readable rejection explanation.
///
/// Lists the reason, then every distinct warning-or-worse finding from every
/// attempt (prefixed with its role), then the collaborator failure if any.
pub fn explain(
    reason: RejectReason,
    history: &[CorrectionAttempt],
    failure: Option<&Finding>,
) -> String {
    let mut lines = vec![format!(
        "Rejected after {} evaluation(s): {}.",
        history.len(),
        reason.describe()
    )];

    let mut seen = BTreeSet::new();
    for attempt in history {
        for (role, finding) in attempt.result.findings() {
            if finding.severity < Severity::Warning {
                continue;
            }
            let line = format!("[{role}] {}", finding.message);
            if seen.insert(line.clone()) {
                lines.push(line);
            }
        }
    }

    if let Some(f) = failure {
        lines.push(format!("[{}] {}", f.code, f.message));
    }

    if lines.len() == 1 {
        if let Some(last) = history.last() {
            lines.push(format!(
                "Final coherence {:.3} ({:?}); no reviewer raised a specific finding.",
                last.result.coherence, last.result.level
            ));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_serializes_snake_case() {
        let json = serde_json::to_string(&RejectReason::RecursionLimitExceeded).expect("test: json");
        assert_eq!(json, "\"recursion_limit_exceeded\"");
    }

    #[test]
    fn test_explain_without_history_uses_failure() {
        let failure = Finding::new(Severity::Error, "generation.backend", "connection refused");
        let text = explain(RejectReason::GenerationFailed, &[], Some(&failure));
        assert!(text.starts_with("Rejected after 0 evaluation(s)"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_describe_is_display() {
        assert_eq!(RejectReason::Timeout.to_string(), RejectReason::Timeout.describe());
    }
}
