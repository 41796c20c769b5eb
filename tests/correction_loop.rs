//! # Correction Loop Integration
//!
//! Scripted reviewers score each candidate by the correction that produced
//! it, so the loop's path through CORRECT / ACCEPT / REJECT is fully
//! determined. Also covers generator failure, generator timeout, the
//! recursion ceiling and cancellation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use resonance_engine::config::ReviewersConfig;
use resonance_engine::consensus::ConsensusPolicy;
use resonance_engine::correction::LoopOutcome;
use resonance_engine::review::ReviewerError;
use resonance_engine::{
    Candidate, CandidateOrigin, ConsensusEngine, CorrectionLoop, EchoGenerator, GenerationError,
    GenerationRequest, Generator, LoadBiasVector, LoopState, RejectReason, ReviewVerdict,
    Reviewer, ReviewerPanel, ReviewerRole, TurnContext, TurnError, TurnReport,
};
use tokio::sync::{watch, Notify};

/// Scores a candidate by its correction number; the last entry repeats.
struct ScriptedReviewer {
    role: ReviewerRole,
    script: Vec<f64>,
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    fn role(&self) -> ReviewerRole {
        self.role
    }

    async fn review(
        &self,
        candidate: &Candidate,
        _context: &TurnContext,
    ) -> Result<ReviewVerdict, ReviewerError> {
        let n = match candidate.origin() {
            CandidateOrigin::Model => 0,
            CandidateOrigin::Corrected { generation } => generation as usize,
        };
        let score = self.script[n.min(self.script.len() - 1)];
        Ok(ReviewVerdict::new(self.role, score, Vec::new()))
    }
}

/// Records every request, then echoes.
#[derive(Default)]
struct RecordingGenerator {
    requests: Mutex<Vec<GenerationRequest>>,
}

#[async_trait]
impl Generator for RecordingGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Candidate, GenerationError> {
        self.requests
            .lock()
            .expect("test: lock")
            .push(request.clone());
        Ok(Candidate::new(
            format!("draft {}", request.correction),
            request.origin(),
        ))
    }
}

/// Succeeds for the first candidate, fails every correction.
struct FailingCorrections;

#[async_trait]
impl Generator for FailingCorrections {
    async fn generate(&self, request: &GenerationRequest) -> Result<Candidate, GenerationError> {
        if request.correction == 0 {
            Ok(Candidate::new("first draft", request.origin()))
        } else {
            Err(GenerationError::Backend("connection reset".into()))
        }
    }
}

/// Signals when called, then never answers.
struct HangingGenerator {
    called: Arc<Notify>,
}

#[async_trait]
impl Generator for HangingGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> Result<Candidate, GenerationError> {
        self.called.notify_one();
        std::future::pending().await
    }
}

fn scripted_engine(script: &[f64], policy: ConsensusPolicy) -> Arc<ConsensusEngine> {
    let mut panel = ReviewerPanel::builtin(&ReviewersConfig::default());
    for role in ReviewerRole::ALL {
        panel = panel.with_reviewer(Arc::new(ScriptedReviewer {
            role,
            script: script.to_vec(),
        }));
    }
    Arc::new(ConsensusEngine::new(panel, policy))
}

async fn run(
    engine: Arc<ConsensusEngine>,
    generator: Arc<dyn Generator>,
    timeout: Duration,
) -> LoopOutcome {
    let (_tx, mut rx) = watch::channel(false);
    CorrectionLoop::new(engine, generator, timeout)
        .run(
            &TurnContext::for_prompt("plan the migration"),
            &LoadBiasVector::EQUAL,
            &mut rx,
        )
        .await
        .expect("test: loop run")
}

#[tokio::test]
async fn test_correct_correct_then_reject_below_floor() {
    let engine = scripted_engine(&[0.75, 0.80, 0.65], ConsensusPolicy::default());
    let out = run(engine, Arc::new(EchoGenerator::with_delay(0)), Duration::from_secs(5)).await;

    assert_eq!(out.state, LoopState::Rejected);
    assert_eq!(out.history.len(), 3);
    assert_eq!(out.corrections, 2);
    assert_eq!(out.reason, Some(RejectReason::BelowFloor));
    let coherences: Vec<f64> = out.history.iter().map(|a| a.result.coherence).collect();
    assert!((coherences[0] - 0.75).abs() < 1e-9);
    assert!((coherences[1] - 0.80).abs() < 1e-9);
    assert!((coherences[2] - 0.65).abs() < 1e-9);
    let iterations: Vec<u32> = out.history.iter().map(|a| a.iteration).collect();
    assert_eq!(iterations, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_rejected_turn_report_has_explanation() {
    let engine = scripted_engine(&[0.75, 0.80, 0.65], ConsensusPolicy::default());
    let out = run(engine, Arc::new(EchoGenerator::with_delay(0)), Duration::from_secs(5)).await;
    let report = TurnReport::from_outcome(
        resonance_engine::TurnId::generate(),
        "default",
        LoadBiasVector::EQUAL,
        out,
        chrono::Utc::now(),
    );
    assert!(!report.is_accepted());
    assert!(report.final_candidate.is_none());
    let text = report.explanation.expect("test: explanation");
    assert!(!text.is_empty());
    assert_eq!(report.attempts.len(), 3);
}

#[tokio::test]
async fn test_accept_after_one_correction() {
    let engine = scripted_engine(&[0.8, 0.95], ConsensusPolicy::default());
    let out = run(engine, Arc::new(EchoGenerator::with_delay(0)), Duration::from_secs(5)).await;
    assert_eq!(out.state, LoopState::Accepted);
    assert_eq!(out.corrections, 1);
    let accepted = out.final_candidate.expect("test: candidate");
    assert_eq!(accepted.origin(), CandidateOrigin::Corrected { generation: 1 });
}

#[tokio::test]
async fn test_never_more_than_three_corrections() {
    let engine = scripted_engine(&[0.8], ConsensusPolicy::default());
    let generator = Arc::new(RecordingGenerator::default());
    let out = run(engine, generator.clone(), Duration::from_secs(5)).await;

    assert_eq!(out.state, LoopState::Rejected);
    assert_eq!(out.history.len(), 4);
    assert_eq!(out.corrections, 3);
    assert_eq!(out.reason, Some(RejectReason::CorrectionBudgetExhausted));

    let requests = generator.requests.lock().expect("test: lock");
    let corrections: Vec<u32> = requests.iter().map(|r| r.correction).collect();
    assert_eq!(corrections, vec![0, 1, 2, 3]);
    for r in requests.iter().skip(1) {
        assert!(r.prior.is_some());
        assert!(!r.guidance.is_empty());
    }
}

#[tokio::test]
async fn test_recursion_ceiling_holds_against_lenient_policy() {
    let policy = ConsensusPolicy {
        max_corrections: 10,
        ..ConsensusPolicy::default()
    };
    let engine = scripted_engine(&[0.8], policy);
    let out = run(engine, Arc::new(EchoGenerator::with_delay(0)), Duration::from_secs(5)).await;

    assert_eq!(out.state, LoopState::Rejected);
    assert_eq!(out.reason, Some(RejectReason::RecursionLimitExceeded));
    assert_eq!(out.history.len(), 4);
    let failure = out.failure.expect("test: failure finding");
    assert_eq!(failure.code, "loop.recursion_limit");
}

#[tokio::test]
async fn test_generation_failure_rejects_turn() {
    let engine = scripted_engine(&[0.8], ConsensusPolicy::default());
    let out = run(engine, Arc::new(FailingCorrections), Duration::from_secs(5)).await;

    assert_eq!(out.state, LoopState::Rejected);
    assert_eq!(out.reason, Some(RejectReason::GenerationFailed));
    assert_eq!(out.history.len(), 1);
    assert_eq!(out.corrections, 1);
    assert_eq!(out.failure.map(|f| f.code), Some("generation.failure".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_generation_timeout_rejects_with_timeout() {
    let engine = scripted_engine(&[0.95], ConsensusPolicy::default());
    let generator = Arc::new(HangingGenerator {
        called: Arc::new(Notify::new()),
    });
    let out = run(engine, generator, Duration::from_millis(200)).await;

    assert_eq!(out.state, LoopState::Rejected);
    assert_eq!(out.reason, Some(RejectReason::Timeout));
    assert!(out.history.is_empty());
    assert_eq!(out.failure.map(|f| f.code), Some("generation.timeout".to_string()));
}

#[tokio::test]
async fn test_cancellation_mid_generation() {
    let engine = scripted_engine(&[0.8], ConsensusPolicy::default());
    let called = Arc::new(Notify::new());
    let generator = Arc::new(HangingGenerator {
        called: Arc::clone(&called),
    });
    let correction = CorrectionLoop::new(engine, generator, Duration::from_secs(3600));
    let (tx, mut rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        correction
            .run(
                &TurnContext::for_prompt("plan the migration"),
                &LoadBiasVector::EQUAL,
                &mut rx,
            )
            .await
    });

    called.notified().await;
    tx.send(true).expect("test: send");
    let result = handle.await.expect("test: join");
    assert!(matches!(result, Err(TurnError::Cancelled)));
}
