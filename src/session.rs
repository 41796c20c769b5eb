//! # Session Orchestrator
//!
//! Composes context capture, the correction loop, fitness logging and the
//! coherence monitor for one user turn at a time.
//!
//! ## Responsibility
//! - Capture the environment snapshot and build the [`TurnContext`]
//! - Take an immutable `Arc` snapshot of the published load-bias vector
//! - Run the [`CorrectionLoop`] to a terminal state and build the [`TurnReport`]
//! - Record a [`TurnSample`] and a monitor observation for every resolved turn
//!
//! ## Guarantees
//! - The bias snapshot is fixed for the whole turn, whatever is published meanwhile
//! - A cancelled turn records nothing
//! - Reviewer and generation failures end up in the report, never as an `Err`
//!
//! ## NOT Responsible For
//! - Running evolution (see [`crate::evolution::run_evolution_cycle`])
//! - Writing reports anywhere

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn, Instrument};

use crate::config::EngineConfig;
use crate::consensus::ConsensusEngine;
use crate::context::{ContextProvider, TurnContext};
use crate::correction::CorrectionLoop;
use crate::evolution::{BiasPublisher, FitnessLog, LoadBiasVector, TurnSample};
use crate::generator::Generator;
use crate::monitor::CoherenceMonitor;
use crate::report::TurnReport;

/// Errors that end a turn without a report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TurnError {
    /// The caller cancelled the turn.
    #[error("turn cancelled")]
    Cancelled,

    /// The turn could not be set up.
    #[error("invalid turn context: {0}")]
    Context(String),
}

/// Runs turns against one engine, generator and bias feed.
///
/// Cheap to clone; clones share the fitness log and monitor.
#[derive(Clone)]
pub struct ResonanceSession {
    engine: Arc<ConsensusEngine>,
    correction: CorrectionLoop,
    context: Arc<dyn ContextProvider>,
    bias: watch::Receiver<Arc<LoadBiasVector>>,
    log: FitnessLog,
    monitor: CoherenceMonitor,
}

impl std::fmt::Debug for ResonanceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResonanceSession")
            .field("engine", &self.engine)
            .field("bias", &**self.bias.borrow())
            .field("samples", &self.log.len())
            .finish()
    }
}

impl ResonanceSession {
    /// Session over explicit components.
    pub fn new(
        engine: Arc<ConsensusEngine>,
        generator: Arc<dyn Generator>,
        context: Arc<dyn ContextProvider>,
        bias: watch::Receiver<Arc<LoadBiasVector>>,
        generation_timeout: Duration,
        log: FitnessLog,
    ) -> Self {
        let correction = CorrectionLoop::new(Arc::clone(&engine), generator, generation_timeout);
        Self {
            engine,
            correction,
            context,
            bias,
            log,
            monitor: CoherenceMonitor::default(),
        }
    }

    /// Session built from `config`, subscribed to `publisher`.
    pub fn from_config(
        config: &EngineConfig,
        generator: Arc<dyn Generator>,
        context: Arc<dyn ContextProvider>,
        publisher: &BiasPublisher,
    ) -> Self {
        Self::new(
            Arc::new(ConsensusEngine::from_config(config)),
            generator,
            context,
            publisher.subscribe(),
            Duration::from_millis(config.correction.generation_timeout_ms),
            FitnessLog::new(config.evolution.sample_window),
        )
    }

    /// Replace the monitor, e.g. to share one across sessions.
    pub fn with_monitor(mut self, monitor: CoherenceMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// The consensus engine.
    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    /// Samples recorded by this session.
    pub fn fitness_log(&self) -> &FitnessLog {
        &self.log
    }

    /// Turn monitor.
    pub fn monitor(&self) -> &CoherenceMonitor {
        &self.monitor
    }

    /// The vector the next turn would use.
    pub fn current_bias(&self) -> Arc<LoadBiasVector> {
        Arc::clone(&self.bias.borrow())
    }

    /// Run a turn for a bare prompt.
    ///
    /// # Errors
    /// See [`run_turn`](Self::run_turn).
    pub async fn ask(
        &self,
        prompt: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<TurnReport, TurnError> {
        self.run_turn(TurnContext::for_prompt(prompt), cancel).await
    }

    /// Run one turn to ACCEPT or REJECT.
    ///
    /// The context provider's snapshot replaces whatever snapshot `request`
    /// carries. Flip `cancel` to `true` to abort.
    ///
    /// # Errors
    /// - [`TurnError::Context`] if the prompt is blank.
    /// - [`TurnError::Cancelled`] if `cancel` fired before the turn resolved.
    pub async fn run_turn(
        &self,
        request: TurnContext,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<TurnReport, TurnError> {
        if request.prompt.trim().is_empty() {
            return Err(TurnError::Context("prompt is empty".to_string()));
        }

        let started_at = Utc::now();
        let snapshot = self.context.capture_context().await;
        let context = request.with_snapshot(snapshot);
        let bias = self.current_bias();
        let label = context.snapshot.label.clone();

        let span = tracing::info_span!(
            "turn",
            turn_id = %context.turn_id,
            label = %label,
            decision = tracing::field::Empty,
            coherence = tracing::field::Empty,
        );

        let outcome = self
            .correction
            .run(&context, &bias, cancel)
            .instrument(span.clone())
            .await;
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                warn!(parent: &span, error = %e, "turn abandoned");
                return Err(e);
            }
        };

        let report =
            TurnReport::from_outcome(context.turn_id.clone(), label, *bias, outcome, started_at);
        span.record("decision", tracing::field::debug(report.decision));
        span.record("coherence", report.coherence);

        if let Err(e) = self.log.record(TurnSample::from_report(&report)) {
            warn!(parent: &span, error = %e, "fitness sample dropped");
        }
        self.monitor.observe(&report);

        info!(
            parent: &span,
            decision = ?report.decision,
            coherence = report.coherence,
            corrections = report.corrections,
            reason = ?report.reason,
            "turn resolved"
        );
        Ok(report)
    }
}
