//! Live handoff of the best-known vector, and the full evolution cycle.
//!
//! Sessions never read [`EvolutionState`](super::EvolutionState). They hold a
//! [`watch::Receiver`] from a [`BiasPublisher`] and clone the current
//! `Arc<LoadBiasVector>` at turn start; whatever is published afterwards
//! only affects later turns.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    BiasStore, EvolutionError, EvolutionOutcome, EvolutionProtocol, FitnessLog, LoadBiasVector,
};

/// Broadcasts the current load-bias vector to sessions.
#[derive(Clone)]
pub struct BiasPublisher {
    tx: Arc<watch::Sender<Arc<LoadBiasVector>>>,
}

impl BiasPublisher {
    /// Publisher starting at `initial`.
    pub fn new(initial: LoadBiasVector) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Publisher seeded from the persisted record.
    ///
    /// Falls back to equal weights when the record is absent or unusable;
    /// call [`BiasStore::load`] directly to fail on a corrupt file instead.
    pub fn from_store(store: &BiasStore) -> Self {
        Self::new(store.load_or_default().vector)
    }

    /// Receiver for a session.
    pub fn subscribe(&self) -> watch::Receiver<Arc<LoadBiasVector>> {
        self.tx.subscribe()
    }

    /// Currently published vector.
    pub fn current(&self) -> Arc<LoadBiasVector> {
        Arc::clone(&self.tx.borrow())
    }

    /// Replace the published vector. Works with or without live receivers.
    pub fn publish(&self, vector: LoadBiasVector) {
        let previous = self.tx.send_replace(Arc::new(vector));
        debug!(
            from = %previous,
            to = %vector,
            receivers = self.tx.receiver_count(),
            "load bias published"
        );
    }
}

impl Default for BiasPublisher {
    fn default() -> Self {
        Self::new(LoadBiasVector::EQUAL)
    }
}

impl std::fmt::Debug for BiasPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiasPublisher")
            .field("current", &**self.tx.borrow())
            .finish()
    }
}

/// Run one search over the logged samples, persist, then publish.
///
/// The search itself is CPU-bound and runs on the blocking pool. The store
/// is written before anything is published, so a session never runs on a
/// vector that a restart would lose.
///
/// # Errors
/// - Any [`EvolutionError`] from the search.
/// - [`EvolutionError::TaskFailed`] if the blocking task panicked or was cancelled.
/// - [`EvolutionError::Persistence`] if the record could not be written; nothing
///   is published in that case.
pub async fn run_evolution_cycle(
    protocol: &EvolutionProtocol,
    log: &FitnessLog,
    label: &str,
    store: &BiasStore,
    publisher: &BiasPublisher,
) -> Result<EvolutionOutcome, EvolutionError> {
    let samples = log.samples_for(label)?;
    let search = protocol.clone();
    let search_label = label.to_string();

    let outcome = tokio::task::spawn_blocking(move || search.evolve(&search_label, &samples))
        .await
        .map_err(|e| EvolutionError::TaskFailed(e.to_string()))??;

    let known = protocol.state()?.best_known();
    store.save(&known).await?;
    publisher.publish(known.vector);

    info!(
        label,
        generation = outcome.generation,
        best_fitness = outcome.best_fitness,
        improved = outcome.improved,
        samples = outcome.sample_count,
        biases = %known.vector,
        "evolution cycle complete"
    );
    Ok(outcome)
}
