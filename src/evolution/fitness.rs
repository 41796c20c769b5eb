//! Turn samples, the bounded fitness log, and the replay fitness model.
//!
//! A [`TurnSample`] keeps only what replay needs: the four scores and the
//! hard-fail/timeout flags of every evaluation in a turn. Candidate text and
//! findings are dropped when the turn resolves.
//!
//! Fitness of a vector is computed by replaying each sample's evaluations
//! under that vector. The first simulated ACCEPT at correction `k` earns
//! `coherence * (1 - correction_penalty * k)`; a simulated REJECT, or running
//! out of recorded evaluations, earns 0. Fitness is the mean reward minus
//! `variance_penalty` times the variance of the simulated final coherence.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EvolutionError, LoadBiasVector};
use crate::config::EvolutionConfig;
use crate::consensus::{aggregate, decide, ConsensusPolicy, Decision};
use crate::report::{TurnDecision, TurnReport};

/// Replay data for one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSample {
    /// Scores in role order.
    pub scores: [f64; 4],
    /// Any hard-fail flag.
    pub hard_fail: bool,
    /// Any reviewer timeout.
    pub timed_out: bool,
}

/// Replay data for one resolved turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSample {
    /// Context label of the turn.
    pub label: String,
    /// Every evaluation, in order.
    pub evaluations: Vec<EvaluationSample>,
    /// How the turn actually ended.
    pub decision: TurnDecision,
    /// Coherence of the last evaluation.
    pub final_coherence: f64,
    /// When the turn resolved.
    pub recorded_at: DateTime<Utc>,
}

impl TurnSample {
    /// Strip a report down to its replay data.
    pub fn from_report(report: &TurnReport) -> Self {
        Self {
            label: report.context_label.clone(),
            evaluations: report
                .attempts
                .iter()
                .map(|a| EvaluationSample {
                    scores: a.result.scores(),
                    hard_fail: a.result.hard_fail,
                    timed_out: a.result.timed_out,
                })
                .collect(),
            decision: report.decision,
            final_coherence: report.coherence,
            recorded_at: report.finished_at,
        }
    }
}

// ── Log ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct LogInner {
    capacity: usize,
    samples: VecDeque<TurnSample>,
}

/// Bounded window of recent turn samples.
///
/// Cheap to clone; all clones share the same window.
#[derive(Debug, Clone)]
pub struct FitnessLog {
    inner: Arc<Mutex<LogInner>>,
}

impl FitnessLog {
    /// A log keeping at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                capacity,
                samples: VecDeque::with_capacity(capacity),
            })),
        }
    }

    /// Append a sample, evicting the oldest when full.
    ///
    /// # Errors
    /// Returns [`EvolutionError::LockPoisoned`] if the internal lock is poisoned.
    pub fn record(&self, sample: TurnSample) -> Result<(), EvolutionError> {
        let mut inner = self.inner.lock().map_err(|_| EvolutionError::LockPoisoned)?;
        if inner.samples.len() == inner.capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(sample);
        Ok(())
    }

    /// Samples carrying `label`, or every sample when none carries it.
    ///
    /// # Errors
    /// Returns [`EvolutionError::LockPoisoned`] if the internal lock is poisoned.
    pub fn samples_for(&self, label: &str) -> Result<Vec<TurnSample>, EvolutionError> {
        let inner = self.inner.lock().map_err(|_| EvolutionError::LockPoisoned)?;
        let matching: Vec<TurnSample> = inner
            .samples
            .iter()
            .filter(|s| s.label == label)
            .cloned()
            .collect();
        if matching.is_empty() {
            Ok(inner.samples.iter().cloned().collect())
        } else {
            Ok(matching)
        }
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(g) => g.samples.len(),
            Err(_) => 0,
        }
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Model ───────────────────────────────────────────────────────────────────

/// Scores a [`LoadBiasVector`] against recorded turns.
#[derive(Debug, Clone, PartialEq)]
pub struct FitnessModel {
    policy: ConsensusPolicy,
    correction_penalty: f64,
    variance_penalty: f64,
}

impl FitnessModel {
    /// Model replaying under `policy` with the configured penalties.
    pub fn new(policy: ConsensusPolicy, config: &EvolutionConfig) -> Self {
        Self {
            policy,
            correction_penalty: config.correction_penalty,
            variance_penalty: config.variance_penalty,
        }
    }

    /// Simulated reward and final coherence of one turn under `bias`.
    pub fn replay(&self, bias: &LoadBiasVector, sample: &TurnSample) -> (f64, f64) {
        let mut last = 0.0;
        for (k, eval) in sample.evaluations.iter().enumerate() {
            let corrections = u32::try_from(k).unwrap_or(u32::MAX);
            let coherence = aggregate(eval.scores, bias, self.policy.aggregation);
            last = coherence;
            match decide(coherence, eval.hard_fail, eval.timed_out, corrections, &self.policy) {
                Decision::Accept => {
                    let discount = (1.0 - self.correction_penalty * k as f64).max(0.0);
                    return (coherence * discount, coherence);
                }
                Decision::Reject => return (0.0, coherence),
                Decision::Correct => {}
            }
        }
        (0.0, last)
    }

    /// Fitness of `bias` over `samples`. An empty sample set scores 0.
    pub fn fitness(&self, bias: &LoadBiasVector, samples: &[TurnSample]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let n = samples.len() as f64;
        let (rewards, finals): (Vec<f64>, Vec<f64>) =
            samples.iter().map(|s| self.replay(bias, s)).unzip();
        let mean_reward = rewards.iter().sum::<f64>() / n;
        let mean_final = finals.iter().sum::<f64>() / n;
        let variance = finals.iter().map(|c| (c - mean_final).powi(2)).sum::<f64>() / n;
        mean_reward - self.variance_penalty * variance
    }
}
