//! # Stage: Reviewers
//!
//! ## Responsibility
//! Inspect one candidate against the turn context and emit a
//! [`ReviewVerdict`]. The role set is closed: Control, Logic, SecurityAudit,
//! DataIntegrity. Each role has one implementation behind the shared
//! [`Reviewer`] capability; the [`ReviewerPanel`] holds exactly one reviewer
//! per role.
//!
//! ## Guarantees
//! - Stateless: reviewers share no mutable state and may run concurrently
//! - Scores are clamped to `[0, 1]`; non-finite scores become `0`
//! - Only SecurityAudit and DataIntegrity verdicts can carry `hard_fail`
//!
//! ## NOT Responsible For
//! - Aggregating verdicts or deciding the outcome (that belongs to `consensus`)
//! - Enforcing deadlines (the consensus engine wraps every call in a timeout)
//!
//! ## Module map
//! - [`control`]   -- structural and policy integrity
//! - [`logic`]     -- relevance and reasoning soundness
//! - [`security`]  -- injection, unsafe-instruction and secret scanning
//! - [`integrity`] -- strict structured-payload validation

pub mod control;
pub mod integrity;
pub mod logic;
pub mod security;

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ReviewersConfig;
use crate::context::TurnContext;
use crate::Candidate;

pub use control::ControlReviewer;
pub use integrity::DataIntegrityReviewer;
pub use logic::LogicReviewer;
pub use security::SecurityAuditReviewer;

// ── Roles ───────────────────────────────────────────────────────────────────

/// The four reviewer roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerRole {
    /// Structural/architectural integrity.
    Control,
    /// Internal consistency and optimality of the reasoning.
    Logic,
    /// Injection, unsafe instructions, policy-violating content.
    SecurityAudit,
    /// Strict structured-payload validation.
    DataIntegrity,
}

impl ReviewerRole {
    /// Every role, in canonical order.
    pub const ALL: [ReviewerRole; 4] = [
        ReviewerRole::Control,
        ReviewerRole::Logic,
        ReviewerRole::SecurityAudit,
        ReviewerRole::DataIntegrity,
    ];

    /// Position of the role in [`ReviewerRole::ALL`].
    pub fn index(self) -> usize {
        match self {
            ReviewerRole::Control => 0,
            ReviewerRole::Logic => 1,
            ReviewerRole::SecurityAudit => 2,
            ReviewerRole::DataIntegrity => 3,
        }
    }

    /// Stable snake_case name, also used as the bias weight name.
    pub fn name(self) -> &'static str {
        match self {
            ReviewerRole::Control => "control",
            ReviewerRole::Logic => "logic",
            ReviewerRole::SecurityAudit => "security_audit",
            ReviewerRole::DataIntegrity => "data_integrity",
        }
    }

    /// Look a role up by its [`name`](Self::name).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }

    /// Whether this role may raise a hard-fail.
    pub fn may_hard_fail(self) -> bool {
        matches!(self, ReviewerRole::SecurityAudit | ReviewerRole::DataIntegrity)
    }
}

impl fmt::Display for ReviewerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Findings and verdicts ───────────────────────────────────────────────────

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Lowers the score but does not fail the review.
    Warning,
    /// Fails the review.
    Error,
    /// Fails the review; on SecurityAudit/DataIntegrity also a hard-fail.
    Critical,
}

/// A single reviewer observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Severity.
    pub severity: Severity,
    /// Stable code (e.g. `control.too_short`, `security.T2`).
    pub code: String,
    /// Human-readable description, usable as correction guidance.
    pub message: String,
}

impl Finding {
    /// Create a finding.
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.code, self.message)
    }
}

/// Why a reviewer could not produce a verdict.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReviewerError {
    /// The reviewer ran but could not inspect the candidate.
    #[error("reviewer failed: {0}")]
    Failure(String),

    /// The reviewer missed its deadline.
    #[error("reviewer timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },
}

/// Outcome of one reviewer on one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    /// Reviewer role.
    pub role: ReviewerRole,
    /// Score in `[0, 1]`.
    pub score: f64,
    /// Whether the review passed.
    pub passed: bool,
    /// Unconditional rejection flag (SecurityAudit/DataIntegrity only).
    pub hard_fail: bool,
    /// The reviewer did not answer in time.
    pub timed_out: bool,
    /// Observations, most severe first.
    pub findings: Vec<Finding>,
}

fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl ReviewVerdict {
    /// Build a verdict from a raw score and findings.
    ///
    /// `hard_fail` is set when the role may hard-fail and any finding is
    /// [`Severity::Critical`]; `passed` is false on hard-fail or on any
    /// error-level finding.
    pub fn new(role: ReviewerRole, score: f64, mut findings: Vec<Finding>) -> Self {
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));
        let worst = findings.first().map(|f| f.severity);
        let hard_fail = role.may_hard_fail() && worst == Some(Severity::Critical);
        let passed = !matches!(worst, Some(Severity::Error | Severity::Critical));
        Self {
            role,
            score: clamp_score(score),
            passed,
            hard_fail,
            timed_out: false,
            findings,
        }
    }

    /// The automatic fail verdict recorded when a reviewer errors out.
    pub fn from_error(role: ReviewerRole, error: &ReviewerError) -> Self {
        let (code, timed_out) = match error {
            ReviewerError::Failure(_) => ("reviewer.failure", false),
            ReviewerError::Timeout { .. } => ("reviewer.timeout", true),
        };
        Self {
            role,
            score: 0.0,
            passed: false,
            hard_fail: false,
            timed_out,
            findings: vec![Finding::new(Severity::Error, code, error.to_string())],
        }
    }
}

// ── Capability ──────────────────────────────────────────────────────────────

/// Shared reviewer capability.
///
/// Implementations must be thread-safe and stateless with respect to one
/// another; the consensus engine calls all four concurrently.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Role this reviewer fills.
    fn role(&self) -> ReviewerRole;

    /// Review `candidate` under `context`.
    async fn review(
        &self,
        candidate: &Candidate,
        context: &TurnContext,
    ) -> Result<ReviewVerdict, ReviewerError>;
}

/// Exactly one reviewer per role.
#[derive(Clone)]
pub struct ReviewerPanel {
    slots: [Arc<dyn Reviewer>; 4],
}

impl ReviewerPanel {
    /// Panel of the built-in heuristic reviewers.
    pub fn builtin(config: &ReviewersConfig) -> Self {
        Self {
            slots: [
                Arc::new(ControlReviewer::new(config.clone())),
                Arc::new(LogicReviewer::new()),
                Arc::new(SecurityAuditReviewer::new(config.clone())),
                Arc::new(DataIntegrityReviewer::new(config.clone())),
            ],
        }
    }

    /// Replace the reviewer in the slot of `reviewer.role()`.
    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        let idx = reviewer.role().index();
        self.slots[idx] = reviewer;
        self
    }

    /// Reviewer for `role`.
    pub fn get(&self, role: ReviewerRole) -> &Arc<dyn Reviewer> {
        &self.slots[role.index()]
    }
}

impl fmt::Debug for ReviewerPanel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewerPanel")
            .field("roles", &ReviewerRole::ALL)
            .finish()
    }
}

// ── Shared text helpers ─────────────────────────────────────────────────────

/// Compile `pattern` once into `cell`.
///
/// Patterns are constants; a pattern that fails to compile yields `None`
/// and the caller skips that check.
pub(crate) fn compiled(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &str,
) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Lowercased alphanumeric words of `text`.
pub(crate) fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Sentences split on terminal punctuation, semicolons and newlines.
pub(crate) fn sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?', ';', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CandidateOrigin;

    struct Fixed(ReviewerRole, f64);

    #[async_trait]
    impl Reviewer for Fixed {
        fn role(&self) -> ReviewerRole {
            self.0
        }

        async fn review(
            &self,
            _candidate: &Candidate,
            _context: &TurnContext,
        ) -> Result<ReviewVerdict, ReviewerError> {
            Ok(ReviewVerdict::new(self.0, self.1, Vec::new()))
        }
    }

    #[test]
    fn test_role_index_matches_all_order() {
        for (i, role) in ReviewerRole::ALL.iter().enumerate() {
            assert_eq!(role.index(), i);
        }
    }

    #[test]
    fn test_role_name_round_trips() {
        for role in ReviewerRole::ALL {
            assert_eq!(ReviewerRole::from_name(role.name()), Some(role));
        }
        assert_eq!(ReviewerRole::from_name("gold"), None);
    }

    #[test]
    fn test_only_security_and_integrity_may_hard_fail() {
        assert!(!ReviewerRole::Control.may_hard_fail());
        assert!(!ReviewerRole::Logic.may_hard_fail());
        assert!(ReviewerRole::SecurityAudit.may_hard_fail());
        assert!(ReviewerRole::DataIntegrity.may_hard_fail());
    }

    #[test]
    fn test_verdict_clamps_score() {
        assert_eq!(ReviewVerdict::new(ReviewerRole::Logic, 1.7, vec![]).score, 1.0);
        assert_eq!(ReviewVerdict::new(ReviewerRole::Logic, -0.2, vec![]).score, 0.0);
        assert_eq!(ReviewVerdict::new(ReviewerRole::Logic, f64::NAN, vec![]).score, 0.0);
    }

    #[test]
    fn test_critical_on_control_is_not_hard_fail() {
        let v = ReviewVerdict::new(
            ReviewerRole::Control,
            0.9,
            vec![Finding::new(Severity::Critical, "x", "y")],
        );
        assert!(!v.hard_fail);
        assert!(!v.passed);
    }

    #[test]
    fn test_critical_on_security_is_hard_fail() {
        let v = ReviewVerdict::new(
            ReviewerRole::SecurityAudit,
            1.0,
            vec![Finding::new(Severity::Critical, "security.T2", "injection")],
        );
        assert!(v.hard_fail);
        assert!(!v.passed);
    }

    #[test]
    fn test_warning_still_passes() {
        let v = ReviewVerdict::new(
            ReviewerRole::Logic,
            0.8,
            vec![Finding::new(Severity::Warning, "logic.overclaim", "always")],
        );
        assert!(v.passed);
    }

    #[test]
    fn test_findings_sorted_most_severe_first() {
        let v = ReviewVerdict::new(
            ReviewerRole::Control,
            0.5,
            vec![
                Finding::new(Severity::Info, "a", "a"),
                Finding::new(Severity::Error, "b", "b"),
                Finding::new(Severity::Warning, "c", "c"),
            ],
        );
        assert_eq!(v.findings[0].severity, Severity::Error);
        assert_eq!(v.findings[2].severity, Severity::Info);
    }

    #[test]
    fn test_from_error_timeout_sets_flag() {
        let v = ReviewVerdict::from_error(
            ReviewerRole::Logic,
            &ReviewerError::Timeout { timeout_ms: 10 },
        );
        assert!(v.timed_out);
        assert_eq!(v.score, 0.0);
        assert!(!v.passed);
        assert!(!v.hard_fail);
    }

    #[test]
    fn test_from_error_failure_is_plain_fail() {
        let v = ReviewVerdict::from_error(
            ReviewerRole::SecurityAudit,
            &ReviewerError::Failure("cannot parse".into()),
        );
        assert!(!v.timed_out);
        assert!(!v.hard_fail);
        assert_eq!(v.findings[0].code, "reviewer.failure");
    }

    #[tokio::test]
    async fn test_panel_with_reviewer_replaces_slot() {
        let panel = ReviewerPanel::builtin(&ReviewersConfig::default())
            .with_reviewer(Arc::new(Fixed(ReviewerRole::Logic, 0.42)));
        let cand = Candidate::new("text.", CandidateOrigin::Model);
        let ctx = TurnContext::for_prompt("q");
        let v = panel
            .get(ReviewerRole::Logic)
            .review(&cand, &ctx)
            .await
            .expect("test: review");
        assert!((v.score - 0.42).abs() < f64::EPSILON);
        assert_eq!(panel.get(ReviewerRole::Control).role(), ReviewerRole::Control);
    }

    #[test]
    fn test_words_and_sentences_helpers() {
        assert_eq!(words("Enable, then DISABLE!"), vec!["enable", "then", "disable"]);
        assert_eq!(sentences("One. Two!\nThree"), vec!["One", "Two", "Three"]);
    }
}
