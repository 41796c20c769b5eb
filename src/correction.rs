//! # Stage: Correction Loop
//!
//! ## Responsibility
//! Drive one turn through INIT → EVALUATING → (ACCEPTED | CORRECTING |
//! REJECTED). Each CORRECT decision requests a revised candidate from the
//! generation collaborator, carrying the prior candidate and the findings of
//! all four reviewers as guidance.
//!
//! ## Guarantees
//! - Strict ordering: candidate N+1 is never requested before candidate N's
//!   consensus result is known
//! - At most [`HARD_CORRECTION_CEILING`] corrections; a CORRECT decision
//!   beyond that ends the turn with `RecursionLimitExceeded`
//! - Hard-fails are terminal and never corrected
//! - Generation failures and deadlines end the turn as REJECT, never hang it
//! - Cancellation returns [`TurnError::Cancelled`]; the in-flight history is
//!   dropped with the loop
//!
//! ## NOT Responsible For
//! - Capturing context or picking the bias snapshot (see `session`)
//! - Recording fitness samples (see `evolution::fitness`)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::HARD_CORRECTION_CEILING;
use crate::consensus::{ConsensusEngine, ConsensusResult, Decision};
use crate::context::TurnContext;
use crate::evolution::LoadBiasVector;
use crate::generator::{GenerationError, GenerationRequest, Generator};
use crate::report::RejectReason;
use crate::review::{Finding, Severity};
use crate::session::TurnError;
use crate::Candidate;

/// States of the correction state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Nothing evaluated yet.
    Init,
    /// A candidate is under review.
    Evaluating,
    /// A revised candidate has been requested.
    Correcting,
    /// Terminal: a candidate was accepted.
    Accepted,
    /// Terminal: the turn was rejected.
    Rejected,
}

impl LoopState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Accepted | LoopState::Rejected)
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// A failed generation rejects from `Init` or `Correcting`; every
    /// verdict is reached from `Evaluating`. Terminal states have no exits.
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, next),
            (Init, Evaluating)
                | (Init, Rejected)
                | (Evaluating, Accepted)
                | (Evaluating, Correcting)
                | (Evaluating, Rejected)
                | (Correcting, Evaluating)
                | (Correcting, Rejected)
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopState::Init => "INIT",
            LoopState::Evaluating => "EVALUATING",
            LoopState::Correcting => "CORRECTING",
            LoopState::Accepted => "ACCEPTED",
            LoopState::Rejected => "REJECTED",
        })
    }
}

/// One evaluated candidate in a turn's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionAttempt {
    /// 1-based position in the history; attempt 1 is the original candidate.
    pub iteration: u32,
    /// The candidate evaluated.
    pub candidate: Candidate,
    /// Its consensus result.
    pub result: ConsensusResult,
}

/// How a loop run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// Terminal state.
    pub state: LoopState,
    /// Accepted candidate, when `state` is `Accepted`.
    pub final_candidate: Option<Candidate>,
    /// Every evaluation, in order.
    pub history: Vec<CorrectionAttempt>,
    /// Corrections requested.
    pub corrections: u32,
    /// Rejection reason, when `state` is `Rejected`.
    pub reason: Option<RejectReason>,
    /// Collaborator failure that ended the turn, if any.
    pub failure: Option<Finding>,
}

impl LoopOutcome {
    /// Coherence of the last evaluation, if any.
    pub fn final_coherence(&self) -> Option<f64> {
        self.history.last().map(|a| a.result.coherence)
    }
}

/// Runs the correction state machine for one turn.
#[derive(Clone)]
pub struct CorrectionLoop {
    engine: Arc<ConsensusEngine>,
    generator: Arc<dyn Generator>,
    generation_timeout: Duration,
}

impl fmt::Debug for CorrectionLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrectionLoop")
            .field("engine", &self.engine)
            .field("generation_timeout", &self.generation_timeout)
            .finish()
    }
}

/// Where the loop is, plus everything gathered so far.
struct Run {
    state: LoopState,
    history: Vec<CorrectionAttempt>,
    corrections: u32,
}

impl Run {
    fn transition(&mut self, next: LoopState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal loop transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, corrections = self.corrections, "loop transition");
        self.state = next;
    }

    fn finish(
        mut self,
        state: LoopState,
        final_candidate: Option<Candidate>,
        reason: Option<RejectReason>,
        failure: Option<Finding>,
    ) -> LoopOutcome {
        self.transition(state);
        LoopOutcome {
            state,
            final_candidate,
            history: self.history,
            corrections: self.corrections,
            reason,
            failure,
        }
    }
}

impl CorrectionLoop {
    /// Create a loop over `engine` and `generator`.
    pub fn new(
        engine: Arc<ConsensusEngine>,
        generator: Arc<dyn Generator>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            generator,
            generation_timeout,
        }
    }

    /// Run one turn to a terminal state.
    ///
    /// `bias` is the turn's immutable weight snapshot. `cancel` flips to
    /// `true` to abort; the loop then returns [`TurnError::Cancelled`]
    /// without producing an outcome.
    pub async fn run(
        &self,
        context: &TurnContext,
        bias: &LoadBiasVector,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<LoopOutcome, TurnError> {
        let mut run = Run {
            state: LoopState::Init,
            history: Vec::new(),
            corrections: 0,
        };

        let request = GenerationRequest::initial(context);
        let mut candidate = match self.generate(&request, cancel).await? {
            Ok(c) => c,
            Err(e) => return Ok(generation_failed(run, e)),
        };

        loop {
            run.transition(LoopState::Evaluating);
            let result = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(TurnError::Cancelled),
                r = self.engine.evaluate(&candidate, context, bias, run.corrections) => r,
            };
            let decision = result.decision;
            let iteration = u32::try_from(run.history.len()).unwrap_or(u32::MAX).saturating_add(1);

            info!(
                turn_id = %context.turn_id,
                candidate_id = %candidate.id(),
                iteration,
                coherence = result.coherence,
                decision = %decision,
                "candidate evaluated"
            );

            let guidance = correction_guidance(&result, self.engine.policy().accept_threshold);
            let reason = result.reject_reason(self.engine.policy().floor_threshold);
            run.history.push(CorrectionAttempt {
                iteration,
                candidate: candidate.clone(),
                result,
            });

            match decision {
                Decision::Accept => {
                    return Ok(run.finish(LoopState::Accepted, Some(candidate), None, None));
                }
                Decision::Reject => {
                    return Ok(run.finish(LoopState::Rejected, None, reason, None));
                }
                Decision::Correct => {
                    run.corrections += 1;
                    if run.corrections > HARD_CORRECTION_CEILING {
                        warn!(
                            turn_id = %context.turn_id,
                            corrections = run.corrections,
                            "correction requested beyond the recursion limit"
                        );
                        let failure = Finding::new(
                            Severity::Error,
                            "loop.recursion_limit",
                            format!(
                                "a correction was requested after {HARD_CORRECTION_CEILING} corrections"
                            ),
                        );
                        return Ok(run.finish(
                            LoopState::Rejected,
                            None,
                            Some(RejectReason::RecursionLimitExceeded),
                            Some(failure),
                        ));
                    }

                    run.transition(LoopState::Correcting);
                    let request =
                        GenerationRequest::correction(context, candidate, guidance, run.corrections);
                    candidate = match self.generate(&request, cancel).await? {
                        Ok(c) => c,
                        Err(e) => return Ok(generation_failed(run, e)),
                    };
                }
            }
        }
    }

    /// Call the generator under the deadline, racing cancellation.
    ///
    /// The outer `Result` carries cancellation; the inner one the
    /// collaborator's outcome.
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Result<Candidate, GenerationError>, TurnError> {
        let timeout = self.generation_timeout;
        let call = tokio::time::timeout(timeout, self.generator.generate(request));
        let outcome = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(TurnError::Cancelled),
            r = call => r,
        };
        Ok(match outcome {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        })
    }
}

fn generation_failed(run: Run, error: GenerationError) -> LoopOutcome {
    warn!(error = %error, corrections = run.corrections, "generation failed");
    let (reason, code) = match error {
        GenerationError::Timeout { .. } => (RejectReason::Timeout, "generation.timeout"),
        _ => (RejectReason::GenerationFailed, "generation.failure"),
    };
    let failure = Finding::new(Severity::Error, code, error.to_string());
    run.finish(LoopState::Rejected, None, Some(reason), Some(failure))
}

/// Guidance for the next correction: every finding of all four verdicts,
/// most severe first, or a plain coherence target when there are none.
pub fn correction_guidance(result: &ConsensusResult, accept_threshold: f64) -> Vec<String> {
    let mut findings: Vec<_> = result.findings().collect();
    findings.sort_by(|a, b| b.1.severity.cmp(&a.1.severity));
    let mut guidance: Vec<String> = findings
        .into_iter()
        .map(|(role, f)| format!("[{role}] {}", f.message))
        .collect();
    if guidance.is_empty() {
        guidance.push(format!(
            "raise overall coherence from {:.2} to at least {:.2}",
            result.coherence, accept_threshold
        ));
    }
    guidance
}

/// Resolves once the cancel flag reads `true`. Never resolves if the
/// sender is dropped without cancelling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusPolicy;
    use crate::generator::EchoGenerator;
    use crate::review::{ReviewVerdict, Reviewer, ReviewerError, ReviewerPanel, ReviewerRole};
    use crate::config::ReviewersConfig;
    use async_trait::async_trait;

    struct Fixed(ReviewerRole, f64);

    #[async_trait]
    impl Reviewer for Fixed {
        fn role(&self) -> ReviewerRole {
            self.0
        }
        async fn review(
            &self,
            _c: &Candidate,
            _x: &TurnContext,
        ) -> Result<ReviewVerdict, ReviewerError> {
            Ok(ReviewVerdict::new(self.0, self.1, Vec::new()))
        }
    }

    fn engine_all(score: f64) -> Arc<ConsensusEngine> {
        let mut panel = ReviewerPanel::builtin(&ReviewersConfig::default());
        for role in ReviewerRole::ALL {
            panel = panel.with_reviewer(Arc::new(Fixed(role, score)));
        }
        Arc::new(ConsensusEngine::new(panel, ConsensusPolicy::default()))
    }

    #[test]
    fn test_loop_state_terminal() {
        assert!(LoopState::Accepted.is_terminal());
        assert!(LoopState::Rejected.is_terminal());
        assert!(!LoopState::Correcting.is_terminal());
        assert_eq!(LoopState::Evaluating.to_string(), "EVALUATING");
    }

    #[tokio::test]
    async fn test_accept_on_first_attempt() {
        let lp = CorrectionLoop::new(
            engine_all(0.95),
            Arc::new(EchoGenerator::with_delay(0)),
            Duration::from_secs(1),
        );
        let (_tx, mut rx) = watch::channel(false);
        let ctx = TurnContext::for_prompt("hello there");
        let out = lp
            .run(&ctx, &LoadBiasVector::EQUAL, &mut rx)
            .await
            .expect("test: run");
        assert_eq!(out.state, LoopState::Accepted);
        assert_eq!(out.history.len(), 1);
        assert_eq!(out.corrections, 0);
        assert_eq!(out.final_candidate.map(|c| c.content().to_string()), Some("hello there".into()));
    }

    #[tokio::test]
    async fn test_constant_mid_score_exhausts_budget() {
        let lp = CorrectionLoop::new(
            engine_all(0.8),
            Arc::new(EchoGenerator::with_delay(0)),
            Duration::from_secs(1),
        );
        let (_tx, mut rx) = watch::channel(false);
        let out = lp
            .run(&TurnContext::for_prompt("q"), &LoadBiasVector::EQUAL, &mut rx)
            .await
            .expect("test: run");
        assert_eq!(out.state, LoopState::Rejected);
        assert_eq!(out.corrections, 3);
        assert_eq!(out.history.len(), 4);
        assert_eq!(out.reason, Some(RejectReason::CorrectionBudgetExhausted));
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_error() {
        let lp = CorrectionLoop::new(
            engine_all(0.95),
            Arc::new(EchoGenerator::with_delay(0)),
            Duration::from_secs(1),
        );
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).expect("test: send");
        let err = lp
            .run(&TurnContext::for_prompt("q"), &LoadBiasVector::EQUAL, &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Cancelled));
    }

    #[test]
    fn test_transition_table() {
        use LoopState::*;
        assert!(Init.can_transition_to(Evaluating));
        assert!(Init.can_transition_to(Rejected));
        assert!(Evaluating.can_transition_to(Accepted));
        assert!(Evaluating.can_transition_to(Correcting));
        assert!(Evaluating.can_transition_to(Rejected));
        assert!(Correcting.can_transition_to(Evaluating));
        assert!(Correcting.can_transition_to(Rejected));

        assert!(!Init.can_transition_to(Accepted));
        assert!(!Init.can_transition_to(Correcting));
        assert!(!Correcting.can_transition_to(Accepted));
        assert!(!Evaluating.can_transition_to(Evaluating));
        for next in [Init, Evaluating, Correcting, Accepted, Rejected] {
            assert!(!Accepted.can_transition_to(next));
            assert!(!Rejected.can_transition_to(next));
        }
    }

    #[test]
    fn test_guidance_carries_every_finding_most_severe_first() {
        let engine = engine_all(0.8);
        let mut verdicts = ReviewerRole::ALL.map(|r| ReviewVerdict::new(r, 0.8, vec![]));
        verdicts[0] = ReviewVerdict::new(
            ReviewerRole::Control,
            0.8,
            vec![Finding::new(Severity::Info, "control.note", "answer could be shorter")],
        );
        verdicts[1] = ReviewVerdict::new(
            ReviewerRole::Logic,
            0.8,
            vec![Finding::new(Severity::Warning, "logic.overclaim", "claim lacks support")],
        );
        let result = engine.conclude(
            crate::CandidateId("c".into()),
            verdicts,
            &LoadBiasVector::EQUAL,
            0,
        );
        let g = correction_guidance(&result, 0.9);
        assert_eq!(g.len(), 2);
        assert!(g[0].contains("claim lacks support"));
        assert!(g[1].contains("answer could be shorter"));
    }

    #[test]
    fn test_guidance_falls_back_to_target() {
        let engine = engine_all(0.8);
        let verdicts = ReviewerRole::ALL.map(|r| ReviewVerdict::new(r, 0.8, vec![]));
        let result = engine.conclude(
            crate::CandidateId("c".into()),
            verdicts,
            &LoadBiasVector::EQUAL,
            0,
        );
        let g = correction_guidance(&result, 0.9);
        assert_eq!(g.len(), 1);
        assert!(g[0].contains("0.80"));
    }
}
