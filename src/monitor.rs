//! # Coherence Monitor
//!
//! Tracks resolved turns and reports the coherence trend, per-reviewer
//! failure counts and anomalies (sharp swings, correction-heavy turns).
//! Purely observational: nothing here feeds back into consensus.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::report::{TurnDecision, TurnReport};
use crate::review::ReviewerRole;
use crate::TurnId;

/// Scores compared by [`CoherenceMonitor::trend`].
pub const TREND_WINDOW: usize = 10;
/// Half-difference that counts as a trend.
pub const TREND_THRESHOLD: f64 = 0.1;
/// Scores inspected for a sharp swing.
pub const SWING_WINDOW: usize = 5;
/// Max-minus-min across [`SWING_WINDOW`] that counts as a swing.
pub const SWING_THRESHOLD: f64 = 0.5;
/// Corrections in one turn above which the turn is flagged.
pub const CORRECTION_ALERT: u32 = 2;

/// Direction of recent coherence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Second half of the window is clearly higher.
    Improving,
    /// Second half of the window is clearly lower.
    Degrading,
    /// No clear movement.
    Stable,
    /// Fewer than [`TREND_WINDOW`] turns recorded.
    InsufficientData,
}

/// Something worth a look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Anomaly {
    /// Coherence moved sharply across the last few turns.
    SharpSwing {
        /// Lowest score in the window.
        low: f64,
        /// Highest score in the window.
        high: f64,
    },
    /// A turn needed many corrections.
    CorrectionHeavy {
        /// The turn.
        turn_id: TurnId,
        /// Corrections it used.
        corrections: u32,
    },
}

/// One recorded turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnObservation {
    /// The turn.
    pub turn_id: TurnId,
    /// Final coherence.
    pub coherence: f64,
    /// Final decision.
    pub decision: TurnDecision,
    /// Corrections used.
    pub corrections: u32,
    /// Roles that failed at least once in the turn.
    pub failed_roles: Vec<ReviewerRole>,
}

impl TurnObservation {
    /// Extract an observation from a report.
    pub fn from_report(report: &TurnReport) -> Self {
        let mut failed_roles = Vec::new();
        for role in ReviewerRole::ALL {
            let failed = report
                .attempts
                .iter()
                .any(|a| !a.result.verdict(role).passed);
            if failed {
                failed_roles.push(role);
            }
        }
        Self {
            turn_id: report.turn_id.clone(),
            coherence: report.coherence,
            decision: report.decision,
            corrections: report.corrections,
            failed_roles,
        }
    }
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    /// Turns in the window.
    pub turns: usize,
    /// Mean coherence of the window, 0 when empty.
    pub average_coherence: f64,
    /// Coherence of the latest turn.
    pub current_coherence: Option<f64>,
    /// Accepted share of the window, 0 when empty.
    pub acceptance_rate: f64,
    /// Trend.
    pub trend: Trend,
    /// Failure counts in role order.
    pub role_failures: [u64; 4],
    /// Active anomalies.
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug)]
struct MonitorInner {
    capacity: usize,
    history: VecDeque<TurnObservation>,
    role_failures: [u64; 4],
}

/// Bounded history of turn outcomes.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct CoherenceMonitor {
    inner: Arc<Mutex<MonitorInner>>,
}

impl Default for CoherenceMonitor {
    fn default() -> Self {
        Self::new(100)
    }
}

impl CoherenceMonitor {
    /// Monitor holding at most `capacity` turns (minimum [`TREND_WINDOW`]).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(TREND_WINDOW);
        Self {
            inner: Arc::new(Mutex::new(MonitorInner {
                capacity,
                history: VecDeque::with_capacity(capacity),
                role_failures: [0; 4],
            })),
        }
    }

    /// Record a resolved turn.
    ///
    /// Returns the anomalies raised by this turn. A poisoned lock drops the
    /// observation with a warning.
    pub fn observe(&self, report: &TurnReport) -> Vec<Anomaly> {
        let observation = TurnObservation::from_report(report);
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, "coherence monitor lock poisoned");
                return Vec::new();
            }
        };

        for role in &observation.failed_roles {
            guard.role_failures[role.index()] += 1;
        }
        let mut raised = Vec::new();
        if observation.corrections > CORRECTION_ALERT {
            raised.push(Anomaly::CorrectionHeavy {
                turn_id: observation.turn_id.clone(),
                corrections: observation.corrections,
            });
        }
        if guard.history.len() == guard.capacity {
            guard.history.pop_front();
        }
        guard.history.push_back(observation);
        if let Some(swing) = swing(&guard.history) {
            raised.push(swing);
        }
        drop(guard);

        for anomaly in &raised {
            warn!(anomaly = ?anomaly, "coherence anomaly");
        }
        debug!(turn_id = %report.turn_id, coherence = report.coherence, "turn observed");
        raised
    }

    /// Trend over the last [`TREND_WINDOW`] turns.
    pub fn trend(&self) -> Trend {
        match self.inner.lock() {
            Ok(g) => trend(&g.history),
            Err(_) => Trend::InsufficientData,
        }
    }

    /// Full view of the monitor.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => {
                return MonitorSnapshot {
                    turns: 0,
                    average_coherence: 0.0,
                    current_coherence: None,
                    acceptance_rate: 0.0,
                    trend: Trend::InsufficientData,
                    role_failures: [0; 4],
                    anomalies: Vec::new(),
                }
            }
        };
        let n = guard.history.len();
        let (average_coherence, acceptance_rate) = if n == 0 {
            (0.0, 0.0)
        } else {
            let sum: f64 = guard.history.iter().map(|o| o.coherence).sum();
            let accepted = guard
                .history
                .iter()
                .filter(|o| o.decision == TurnDecision::Accepted)
                .count();
            (sum / n as f64, accepted as f64 / n as f64)
        };
        let mut anomalies: Vec<Anomaly> = guard
            .history
            .iter()
            .filter(|o| o.corrections > CORRECTION_ALERT)
            .map(|o| Anomaly::CorrectionHeavy {
                turn_id: o.turn_id.clone(),
                corrections: o.corrections,
            })
            .collect();
        anomalies.extend(swing(&guard.history));

        MonitorSnapshot {
            turns: n,
            average_coherence,
            current_coherence: guard.history.back().map(|o| o.coherence),
            acceptance_rate,
            trend: trend(&guard.history),
            role_failures: guard.role_failures,
            anomalies,
        }
    }

    /// Times `role` failed, counted once per turn.
    pub fn failures(&self, role: ReviewerRole) -> u64 {
        self.inner
            .lock()
            .map(|g| g.role_failures[role.index()])
            .unwrap_or(0)
    }
}

fn trend(history: &VecDeque<TurnObservation>) -> Trend {
    if history.len() < TREND_WINDOW {
        return Trend::InsufficientData;
    }
    let recent: Vec<f64> = history
        .iter()
        .skip(history.len() - TREND_WINDOW)
        .map(|o| o.coherence)
        .collect();
    let half = TREND_WINDOW / 2;
    let first = recent[..half].iter().sum::<f64>() / half as f64;
    let second = recent[half..].iter().sum::<f64>() / (TREND_WINDOW - half) as f64;
    let delta = second - first;
    if delta > TREND_THRESHOLD {
        Trend::Improving
    } else if delta < -TREND_THRESHOLD {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

fn swing(history: &VecDeque<TurnObservation>) -> Option<Anomaly> {
    if history.len() < SWING_WINDOW {
        return None;
    }
    let (low, high) = history
        .iter()
        .skip(history.len() - SWING_WINDOW)
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), o| {
            (lo.min(o.coherence), hi.max(o.coherence))
        });
    (high - low > SWING_THRESHOLD).then_some(Anomaly::SharpSwing { low, high })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(coherence: f64) -> TurnObservation {
        TurnObservation {
            turn_id: TurnId::generate(),
            coherence,
            decision: TurnDecision::Accepted,
            corrections: 0,
            failed_roles: Vec::new(),
        }
    }

    fn history(scores: &[f64]) -> VecDeque<TurnObservation> {
        scores.iter().map(|s| obs(*s)).collect()
    }

    #[test]
    fn test_trend_needs_full_window() {
        assert_eq!(trend(&history(&[0.9; 9])), Trend::InsufficientData);
    }

    #[test]
    fn test_trend_directions() {
        let up = [0.5, 0.5, 0.5, 0.5, 0.5, 0.8, 0.8, 0.8, 0.8, 0.8];
        let down = [0.9, 0.9, 0.9, 0.9, 0.9, 0.6, 0.6, 0.6, 0.6, 0.6];
        assert_eq!(trend(&history(&up)), Trend::Improving);
        assert_eq!(trend(&history(&down)), Trend::Degrading);
        assert_eq!(trend(&history(&[0.85; 10])), Trend::Stable);
    }

    #[test]
    fn test_trend_uses_latest_window_only() {
        let mut scores = vec![0.1; 20];
        scores.extend([0.9; 10]);
        assert_eq!(trend(&history(&scores)), Trend::Stable);
    }

    #[test]
    fn test_swing_detection() {
        assert!(swing(&history(&[0.9, 0.9, 0.3, 0.9, 0.9])).is_some());
        assert!(swing(&history(&[0.9, 0.8, 0.7, 0.8, 0.9])).is_none());
        assert!(swing(&history(&[0.1, 0.9])).is_none());
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = CoherenceMonitor::default().snapshot();
        assert_eq!(snap.turns, 0);
        assert_eq!(snap.current_coherence, None);
        assert_eq!(snap.trend, Trend::InsufficientData);
        assert!(snap.anomalies.is_empty());
    }

    #[test]
    fn test_trend_serialises_snake_case() {
        let json = serde_json::to_string(&Trend::InsufficientData).expect("test: json");
        assert_eq!(json, "\"insufficient_data\"");
    }
}
