//! # Stage: Consensus Engine
//!
//! ## Responsibility
//! Run all four reviewers on a candidate, aggregate their scores into one
//! coherence score under the turn's [`LoadBiasVector`], and decide ACCEPT,
//! CORRECT or REJECT.
//!
//! ## Guarantees
//! - All four reviewers run for every candidate, concurrently, each under
//!   its own deadline; there is no early exit
//! - A reviewer error or missed deadline becomes an automatic fail verdict
//! - Coherence is a pure function of the four scores and the weights, and is
//!   non-decreasing in each score
//! - A hard-fail or a timed-out verdict always yields REJECT
//! - The decision is a pure function of coherence, flags and the number of
//!   corrections already issued
//!
//! ## NOT Responsible For
//! - Requesting revised candidates (see `correction`)
//! - Choosing the weights (see `evolution`)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AggregationKind, ConsensusConfig, EngineConfig};
use crate::context::TurnContext;
use crate::evolution::LoadBiasVector;
use crate::report::RejectReason;
use crate::review::{Finding, ReviewVerdict, Reviewer, ReviewerError, ReviewerPanel, ReviewerRole};
use crate::{Candidate, CandidateId};

// ── Levels and decisions ────────────────────────────────────────────────────

/// Coarse classification of a coherence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoherenceLevel {
    /// Below 0.3.
    Critical,
    /// 0.3 up to 0.7.
    Warning,
    /// 0.7 up to 0.9.
    Stable,
    /// 0.9 and above.
    Optimal,
}

impl CoherenceLevel {
    /// Classify `score`.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            CoherenceLevel::Optimal
        } else if score >= 0.7 {
            CoherenceLevel::Stable
        } else if score >= 0.3 {
            CoherenceLevel::Warning
        } else {
            CoherenceLevel::Critical
        }
    }
}

/// Outcome of one consensus evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Coherent; emit the candidate.
    Accept,
    /// Salvageable; request a revised candidate.
    Correct,
    /// Terminal rejection.
    Reject,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::Accept => "ACCEPT",
            Decision::Correct => "CORRECT",
            Decision::Reject => "REJECT",
        })
    }
}

// ── Policy ──────────────────────────────────────────────────────────────────

/// Thresholds and limits the decision function works with.
///
/// Built from [`ConsensusConfig`], which is validated; constructing one by
/// hand bypasses that validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusPolicy {
    /// ACCEPT at or above this coherence.
    pub accept_threshold: f64,
    /// CORRECT at or above this coherence while budget remains.
    pub floor_threshold: f64,
    /// Number of corrections the decision function allows.
    pub max_corrections: u32,
    /// Aggregation formula.
    pub aggregation: AggregationKind,
    /// Per-reviewer deadline.
    pub review_timeout: Duration,
}

impl From<&ConsensusConfig> for ConsensusPolicy {
    fn from(c: &ConsensusConfig) -> Self {
        Self {
            accept_threshold: c.accept_threshold,
            floor_threshold: c.floor_threshold,
            max_corrections: c.max_corrections,
            aggregation: c.aggregation,
            review_timeout: Duration::from_millis(c.review_timeout_ms),
        }
    }
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self::from(&ConsensusConfig::default())
    }
}

// ── Pure functions ──────────────────────────────────────────────────────────

/// Combine four scores (in [`ReviewerRole::ALL`] order) under `bias`.
///
/// Every formula is non-decreasing in each score and returns a value in
/// `[0, 1]`.
pub fn aggregate(scores: [f64; 4], bias: &LoadBiasVector, kind: AggregationKind) -> f64 {
    let weights = bias.weights();
    let pairs = scores
        .iter()
        .zip(weights.iter())
        .map(|(s, w)| (if s.is_finite() { s.clamp(0.0, 1.0) } else { 0.0 }, *w));
    let total_weight: f64 = weights.iter().sum();
    if total_weight <= f64::EPSILON {
        return 0.0;
    }

    let value = match kind {
        AggregationKind::WeightedMean => pairs.map(|(s, w)| s * w).sum::<f64>() / total_weight,
        AggregationKind::WeightedHarmonic => {
            let mut denom = 0.0;
            for (s, w) in pairs {
                if w <= 0.0 {
                    continue;
                }
                if s <= 0.0 {
                    return 0.0;
                }
                denom += w / s;
            }
            if denom <= 0.0 {
                0.0
            } else {
                total_weight / denom
            }
        }
        AggregationKind::Minimum => pairs
            .filter(|(_, w)| *w > 0.0)
            .map(|(s, _)| s)
            .fold(1.0, f64::min),
    };
    value.clamp(0.0, 1.0)
}

/// The decision function.
///
/// `corrections` is the number of corrections already issued this turn.
pub fn decide(
    coherence: f64,
    hard_fail: bool,
    timed_out: bool,
    corrections: u32,
    policy: &ConsensusPolicy,
) -> Decision {
    if hard_fail || timed_out {
        Decision::Reject
    } else if coherence >= policy.accept_threshold {
        Decision::Accept
    } else if coherence >= policy.floor_threshold && corrections < policy.max_corrections {
        Decision::Correct
    } else {
        Decision::Reject
    }
}

// ── Result ──────────────────────────────────────────────────────────────────

/// Full outcome of evaluating one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Candidate that was evaluated.
    pub candidate_id: CandidateId,
    /// One verdict per role, in [`ReviewerRole::ALL`] order.
    pub verdicts: [ReviewVerdict; 4],
    /// Aggregate coherence in `[0, 1]`.
    pub coherence: f64,
    /// Level of `coherence`.
    pub level: CoherenceLevel,
    /// Decision taken.
    pub decision: Decision,
    /// Any SecurityAudit or DataIntegrity verdict hard-failed.
    pub hard_fail: bool,
    /// Any reviewer missed its deadline.
    pub timed_out: bool,
    /// Corrections already issued when this evaluation ran.
    pub corrections: u32,
}

impl ConsensusResult {
    /// Verdict for `role`.
    pub fn verdict(&self, role: ReviewerRole) -> &ReviewVerdict {
        &self.verdicts[role.index()]
    }

    /// The four scores in role order.
    pub fn scores(&self) -> [f64; 4] {
        [
            self.verdicts[0].score,
            self.verdicts[1].score,
            self.verdicts[2].score,
            self.verdicts[3].score,
        ]
    }

    /// All findings of all four verdicts, tagged with their role.
    pub fn findings(&self) -> impl Iterator<Item = (ReviewerRole, &Finding)> {
        self.verdicts
            .iter()
            .flat_map(|v| v.findings.iter().map(move |f| (v.role, f)))
    }

    /// Why this result rejects, or `None` if it does not.
    ///
    /// Hard-fails take precedence over timeouts, which take precedence over
    /// the score-based reasons.
    pub fn reject_reason(&self, floor_threshold: f64) -> Option<RejectReason> {
        if self.decision != Decision::Reject {
            return None;
        }
        let reason = if self.verdict(ReviewerRole::SecurityAudit).hard_fail {
            RejectReason::HardSecurityFail
        } else if self.verdict(ReviewerRole::DataIntegrity).hard_fail {
            RejectReason::HardIntegrityFail
        } else if self.timed_out {
            RejectReason::Timeout
        } else if self.coherence < floor_threshold {
            RejectReason::BelowFloor
        } else {
            RejectReason::CorrectionBudgetExhausted
        };
        Some(reason)
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Orchestrates the reviewer panel and applies the decision policy.
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    panel: ReviewerPanel,
    policy: ConsensusPolicy,
}

impl ConsensusEngine {
    /// Engine over an explicit panel and policy.
    pub fn new(panel: ReviewerPanel, policy: ConsensusPolicy) -> Self {
        Self { panel, policy }
    }

    /// Engine with the built-in reviewers and the configured policy.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            ReviewerPanel::builtin(&config.reviewers),
            ConsensusPolicy::from(&config.consensus),
        )
    }

    /// The decision policy.
    pub fn policy(&self) -> &ConsensusPolicy {
        &self.policy
    }

    /// The reviewer panel.
    pub fn panel(&self) -> &ReviewerPanel {
        &self.panel
    }

    /// Evaluate `candidate`.
    ///
    /// `bias` is the immutable snapshot taken at turn start; `corrections`
    /// is the number of corrections already issued this turn.
    pub async fn evaluate(
        &self,
        candidate: &Candidate,
        context: &TurnContext,
        bias: &LoadBiasVector,
        corrections: u32,
    ) -> ConsensusResult {
        let timeout = self.policy.review_timeout;
        let (control, logic, security, integrity) = tokio::join!(
            run_reviewer(self.panel.get(ReviewerRole::Control), ReviewerRole::Control, candidate, context, timeout),
            run_reviewer(self.panel.get(ReviewerRole::Logic), ReviewerRole::Logic, candidate, context, timeout),
            run_reviewer(
                self.panel.get(ReviewerRole::SecurityAudit),
                ReviewerRole::SecurityAudit,
                candidate,
                context,
                timeout
            ),
            run_reviewer(
                self.panel.get(ReviewerRole::DataIntegrity),
                ReviewerRole::DataIntegrity,
                candidate,
                context,
                timeout
            ),
        );

        self.conclude(
            candidate.id().clone(),
            [control, logic, security, integrity],
            bias,
            corrections,
        )
    }

    /// Aggregate four verdicts and decide.
    pub fn conclude(
        &self,
        candidate_id: CandidateId,
        verdicts: [ReviewVerdict; 4],
        bias: &LoadBiasVector,
        corrections: u32,
    ) -> ConsensusResult {
        let scores = [
            verdicts[0].score,
            verdicts[1].score,
            verdicts[2].score,
            verdicts[3].score,
        ];
        let coherence = aggregate(scores, bias, self.policy.aggregation);
        let hard_fail = verdicts.iter().any(|v| v.hard_fail);
        let timed_out = verdicts.iter().any(|v| v.timed_out);
        let decision = decide(coherence, hard_fail, timed_out, corrections, &self.policy);

        debug!(
            candidate_id = %candidate_id,
            coherence,
            hard_fail,
            timed_out,
            corrections,
            decision = %decision,
            "consensus reached"
        );

        ConsensusResult {
            candidate_id,
            verdicts,
            coherence,
            level: CoherenceLevel::from_score(coherence),
            decision,
            hard_fail,
            timed_out,
            corrections,
        }
    }
}

async fn run_reviewer(
    reviewer: &Arc<dyn Reviewer>,
    role: ReviewerRole,
    candidate: &Candidate,
    context: &TurnContext,
    timeout: Duration,
) -> ReviewVerdict {
    let outcome = match tokio::time::timeout(timeout, reviewer.review(candidate, context)).await {
        Ok(result) => result,
        Err(_) => Err(ReviewerError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    };

    match outcome {
        Ok(verdict) => normalize(role, verdict),
        Err(e) => {
            warn!(role = %role, candidate_id = %candidate.id(), error = %e, "reviewer did not produce a verdict");
            ReviewVerdict::from_error(role, &e)
        }
    }
}

/// Pin the verdict to its slot's role and re-apply the score and hard-fail rules.
fn normalize(role: ReviewerRole, verdict: ReviewVerdict) -> ReviewVerdict {
    let ReviewVerdict {
        score,
        passed,
        hard_fail,
        timed_out,
        findings,
        ..
    } = verdict;
    let hard_fail = hard_fail && role.may_hard_fail();
    ReviewVerdict {
        role,
        score: if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 },
        passed: passed && !hard_fail,
        hard_fail,
        timed_out,
        findings,
    }
}
