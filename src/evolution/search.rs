//! # Stage: Evolution Protocol search
//!
//! ## Responsibility
//! Use a genetic algorithm to search the space of [`LoadBiasVector`]s. Each
//! generation evaluates every individual with the [`FitnessModel`], keeps
//! the elites and the best-known vector, and breeds the rest through
//! tournament selection, crossover and bounded mutation.
//!
//! ## Guarantees
//! - Thread-safe: all operations use `Arc<Mutex<Inner>>`
//! - Bounded: population size and generation count are configurable limits
//! - Deterministic: given the same seed, state and samples, results are reproducible
//! - Elitist: the best-known vector is carried into every generation and its
//!   fitness never decreases within a run; ties never overwrite it
//! - Non-panicking: every public method returns `Result`
//!
//! ## NOT Responsible For
//! - Persisting or publishing the result (see `store` and `publish`)
//! - Collecting samples (see `fitness`)

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::fitness::{FitnessModel, TurnSample};
use super::store::BestKnown;
use super::{EvolutionError, LoadBiasVector};
use crate::config::{CrossoverKind, EngineConfig, EvolutionConfig};
use crate::consensus::ConsensusPolicy;

/// Best-fitness jump between consecutive generations recorded as a bifurcation.
pub const BIFURCATION_DELTA: f64 = 0.15;

/// Entries kept in the hall of fame.
pub const HALL_OF_FAME_SIZE: usize = 5;

/// Two vectors closer than this are the same individual.
const SAME_VECTOR: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// One member of the population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    /// Candidate weights.
    pub vector: LoadBiasVector,
    /// Fitness (higher is better).
    pub fitness: f64,
    /// Generation the individual was created in.
    pub generation: u32,
}

/// Population, counter and best-known vector.
///
/// Exclusively owned by [`EvolutionProtocol`]; everyone else gets clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionState {
    /// Last evaluated population, fittest first.
    pub population: Vec<Individual>,
    /// Generations run so far, across all cycles.
    pub generation: u32,
    /// Best-known vector.
    pub best: LoadBiasVector,
    /// Its fitness.
    pub best_fitness: f64,
}

impl EvolutionState {
    /// Fresh state around the equal vector.
    pub fn initial() -> Self {
        Self {
            population: Vec::new(),
            generation: 0,
            best: LoadBiasVector::EQUAL,
            best_fitness: 0.0,
        }
    }

    /// State resumed from a persisted record.
    pub fn from_best_known(known: &BestKnown) -> Self {
        Self {
            population: Vec::new(),
            generation: known.generation,
            best: known.vector,
            best_fitness: known.fitness,
        }
    }

    /// The persistable part of the state.
    pub fn best_known(&self) -> BestKnown {
        BestKnown {
            vector: self.best,
            fitness: self.best_fitness,
            generation: self.generation,
        }
    }
}

impl Default for EvolutionState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Statistics of one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    /// Generation number.
    pub generation: u32,
    /// Best fitness in the generation.
    pub best_fitness: f64,
    /// Mean fitness of the generation.
    pub mean_fitness: f64,
    /// Whether the best-known vector was replaced.
    pub improved: bool,
}

/// A sharp move of the best fitness between generations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bifurcation {
    /// Generation where it happened.
    pub generation: u32,
    /// Change of best fitness relative to the previous generation.
    pub delta: f64,
    /// The generation's best vector.
    pub vector: LoadBiasVector,
}

/// A top performer of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallOfFameEntry {
    /// Weights.
    pub vector: LoadBiasVector,
    /// Fitness.
    pub fitness: f64,
    /// Generation it was evaluated in.
    pub generation: u32,
}

/// Result of one call to [`EvolutionProtocol::evolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionOutcome {
    /// Best-known vector after the run.
    pub best: LoadBiasVector,
    /// Its fitness on this run's samples.
    pub best_fitness: f64,
    /// Generation counter after the run.
    pub generation: u32,
    /// Generations executed in this run.
    pub generations_run: usize,
    /// Whether the run replaced the incumbent.
    pub improved: bool,
    /// Samples the run was scored on.
    pub sample_count: usize,
    /// Per-generation statistics.
    pub summaries: Vec<GenerationSummary>,
    /// Sharp best-fitness moves.
    pub bifurcations: Vec<Bifurcation>,
    /// Top entries of the run, fittest first.
    pub hall_of_fame: Vec<HallOfFameEntry>,
}

// ---------------------------------------------------------------------------
// Inner state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Inner {
    config: EvolutionConfig,
    model: FitnessModel,
    state: EvolutionState,
    rng_state: u64,
}

impl Inner {
    fn next_f64(&mut self) -> f64 {
        (xorshift_mod(&mut self.rng_state, 1_000_000) as f64) / 1_000_000.0
    }

    fn random_vector(&mut self) -> LoadBiasVector {
        let raw = [self.next_f64(), self.next_f64(), self.next_f64(), self.next_f64()];
        LoadBiasVector::from_weights(raw).with_floor(self.config.weight_floor)
    }

    fn seed_population(&mut self) -> Vec<Individual> {
        let size = self.config.population_size;
        let generation = self.state.generation;
        let mut seeds = vec![self.state.best];
        if self.state.best.max_difference(&LoadBiasVector::EQUAL) > SAME_VECTOR {
            seeds.push(LoadBiasVector::EQUAL);
        }
        for ind in &self.state.population {
            if seeds.len() >= size {
                break;
            }
            if seeds.iter().all(|s| s.max_difference(&ind.vector) > SAME_VECTOR) {
                seeds.push(ind.vector);
            }
        }
        while seeds.len() < size {
            let v = self.random_vector();
            seeds.push(v);
        }
        seeds.truncate(size);
        seeds
            .into_iter()
            .map(|vector| Individual {
                vector,
                fitness: 0.0,
                generation,
            })
            .collect()
    }

    fn breed(&mut self, ranked: &[Individual], generation: u32) -> Vec<Individual> {
        let size = self.config.population_size;
        let elite_count = self.config.elite_count.min(ranked.len());
        let mut next: Vec<Individual> = ranked[..elite_count]
            .iter()
            .map(|e| Individual {
                vector: e.vector,
                fitness: e.fitness,
                generation,
            })
            .collect();

        let best = self.state.best;
        if next.iter().all(|i| i.vector.max_difference(&best) > SAME_VECTOR) {
            next.push(Individual {
                vector: best,
                fitness: self.state.best_fitness,
                generation,
            });
        }

        let crossover_rate = self.config.crossover_rate;
        let mutation_rate = self.config.mutation_rate;
        let strength = self.config.mutation_strength;
        let floor = self.config.weight_floor;
        let crossover = self.config.crossover;
        let rng = &mut self.rng_state;

        while next.len() < size {
            let p1 = tournament_select(ranked, rng).vector.weights();
            let p2 = tournament_select(ranked, rng).vector.weights();

            let cross_roll = (xorshift_mod(rng, 1_000_000) as f64) / 1_000_000.0;
            let mut child = if cross_roll < crossover_rate {
                match crossover {
                    CrossoverKind::Average => average_crossover(&p1, &p2),
                    CrossoverKind::Uniform => uniform_crossover(&p1, &p2, rng),
                }
            } else {
                p1
            };

            for w in child.iter_mut() {
                let mut_roll = (xorshift_mod(rng, 1_000_000) as f64) / 1_000_000.0;
                if mut_roll < mutation_rate {
                    let noise_roll = (xorshift_mod(rng, 1_000_000) as f64) / 1_000_000.0;
                    let noise = (noise_roll - 0.5) * 2.0 * strength;
                    *w = (*w + noise).clamp(0.0, 1.0);
                }
            }

            next.push(Individual {
                vector: LoadBiasVector::from_weights(child).with_floor(floor),
                fitness: 0.0,
                generation,
            });
        }
        next
    }
}

// ---------------------------------------------------------------------------
// EvolutionProtocol
// ---------------------------------------------------------------------------

/// Genetic search over load bias vectors.
///
/// Cheap to clone -- all clones share the same inner state via `Arc<Mutex<_>>`.
#[derive(Debug, Clone)]
pub struct EvolutionProtocol {
    inner: Arc<Mutex<Inner>>,
}

impl EvolutionProtocol {
    /// Create a protocol over `state`.
    ///
    /// A zero seed is replaced by 1 (xorshift would stay at zero forever).
    pub fn new(config: EvolutionConfig, model: FitnessModel, state: EvolutionState) -> Self {
        let seed = if config.seed == 0 { 1 } else { config.seed };
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                model,
                state,
                rng_state: seed,
            })),
        }
    }

    /// Protocol configured from the engine config.
    pub fn from_config(config: &EngineConfig, state: EvolutionState) -> Self {
        let model = FitnessModel::new(ConsensusPolicy::from(&config.consensus), &config.evolution);
        Self::new(config.evolution.clone(), model, state)
    }

    /// Run one search for `label` over `history`.
    ///
    /// Samples are narrowed to `label` when any carry it. The incumbent is
    /// re-scored on those samples first, so improvements are judged against
    /// the same data. Runs `max_generations` generations, or stops after
    /// `stall_generations` without strict improvement.
    ///
    /// # Errors
    /// - [`EvolutionError::InvalidConfig`] if the population cannot be bred.
    /// - [`EvolutionError::EmptyPopulation`] if seeding produced nobody.
    /// - [`EvolutionError::LockPoisoned`] if the internal lock is poisoned.
    pub fn evolve(
        &self,
        label: &str,
        history: &[TurnSample],
    ) -> Result<EvolutionOutcome, EvolutionError> {
        let mut inner = self.inner.lock().map_err(|_| EvolutionError::LockPoisoned)?;

        if inner.config.population_size < 2 {
            return Err(EvolutionError::InvalidConfig(format!(
                "population_size must be at least 2, got {}",
                inner.config.population_size
            )));
        }
        if inner.config.elite_count >= inner.config.population_size {
            return Err(EvolutionError::InvalidConfig(format!(
                "elite_count ({}) must be below population_size ({})",
                inner.config.elite_count, inner.config.population_size
            )));
        }

        let labelled: Vec<&TurnSample> = history.iter().filter(|s| s.label == label).collect();
        let samples: Vec<TurnSample> = if labelled.is_empty() {
            history.to_vec()
        } else {
            labelled.into_iter().cloned().collect()
        };

        let incumbent = inner.state.best;
        inner.state.best_fitness = inner.model.fitness(&incumbent, &samples);
        let start_fitness = inner.state.best_fitness;

        let mut population = inner.seed_population();
        if population.is_empty() {
            return Err(EvolutionError::EmptyPopulation);
        }

        info!(
            label,
            samples = samples.len(),
            population = population.len(),
            incumbent = %incumbent,
            incumbent_fitness = start_fitness,
            "evolution run started"
        );

        let max_generations = inner.config.max_generations;
        let stall_limit = inner.config.stall_generations;
        let mut summaries = Vec::new();
        let mut bifurcations = Vec::new();
        let mut hall_of_fame: Vec<HallOfFameEntry> = Vec::new();
        let mut prev_gen_best: Option<f64> = None;
        let mut stall = 0usize;
        let mut generations_run = 0usize;

        for _ in 0..max_generations {
            inner.state.generation = inner.state.generation.saturating_add(1);
            let gen = inner.state.generation;
            generations_run += 1;

            for ind in population.iter_mut() {
                ind.fitness = inner.model.fitness(&ind.vector, &samples);
                ind.generation = gen;
            }
            // Stable sort: on equal fitness the earlier (incumbent-first) order wins.
            population.sort_by(|a, b| {
                b.fitness
                    .partial_cmp(&a.fitness)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let gen_best = population[0].clone();
            let mean_fitness =
                population.iter().map(|i| i.fitness).sum::<f64>() / population.len() as f64;

            let improved = gen_best.fitness > inner.state.best_fitness;
            if improved {
                inner.state.best = gen_best.vector;
                inner.state.best_fitness = gen_best.fitness;
                stall = 0;
            } else {
                stall += 1;
            }

            if let Some(prev) = prev_gen_best {
                let delta = gen_best.fitness - prev;
                if delta.abs() > BIFURCATION_DELTA {
                    info!(generation = gen, delta, vector = %gen_best.vector, "bifurcation");
                    bifurcations.push(Bifurcation {
                        generation: gen,
                        delta,
                        vector: gen_best.vector,
                    });
                }
            }
            prev_gen_best = Some(gen_best.fitness);

            for ind in population.iter().take(HALL_OF_FAME_SIZE) {
                admit(&mut hall_of_fame, ind);
            }

            debug!(
                generation = gen,
                best_fitness = gen_best.fitness,
                mean_fitness,
                improved,
                "generation evaluated"
            );
            summaries.push(GenerationSummary {
                generation: gen,
                best_fitness: gen_best.fitness,
                mean_fitness,
                improved,
            });

            if stall >= stall_limit {
                debug!(generation = gen, stall, "search stalled");
                break;
            }
            population = inner.breed(&population, gen);
        }

        inner.state.population = population;
        let outcome = EvolutionOutcome {
            best: inner.state.best,
            best_fitness: inner.state.best_fitness,
            generation: inner.state.generation,
            generations_run,
            improved: inner.state.best_fitness > start_fitness,
            sample_count: samples.len(),
            summaries,
            bifurcations,
            hall_of_fame,
        };

        info!(
            best = %outcome.best,
            best_fitness = outcome.best_fitness,
            generations_run,
            improved = outcome.improved,
            "evolution run finished"
        );
        Ok(outcome)
    }

    /// Snapshot of the current state.
    ///
    /// # Errors
    /// Returns [`EvolutionError::LockPoisoned`] if the internal lock is poisoned.
    pub fn state(&self) -> Result<EvolutionState, EvolutionError> {
        let inner = self.inner.lock().map_err(|_| EvolutionError::LockPoisoned)?;
        Ok(inner.state.clone())
    }

    /// Best-known vector and fitness.
    ///
    /// # Errors
    /// Returns [`EvolutionError::LockPoisoned`] if the internal lock is poisoned.
    pub fn best(&self) -> Result<(LoadBiasVector, f64), EvolutionError> {
        let inner = self.inner.lock().map_err(|_| EvolutionError::LockPoisoned)?;
        Ok((inner.state.best, inner.state.best_fitness))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn admit(hall: &mut Vec<HallOfFameEntry>, ind: &Individual) {
    if hall
        .iter()
        .any(|e| e.vector.max_difference(&ind.vector) <= SAME_VECTOR)
    {
        return;
    }
    hall.push(HallOfFameEntry {
        vector: ind.vector,
        fitness: ind.fitness,
        generation: ind.generation,
    });
    hall.sort_by(|a, b| {
        b.fitness
            .partial_cmp(&a.fitness)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hall.truncate(HALL_OF_FAME_SIZE);
}

fn tournament_select<'a>(population: &'a [Individual], rng_state: &mut u64) -> &'a Individual {
    let len = population.len();
    let mut best_idx = xorshift_mod(rng_state, len);
    for _ in 0..2 {
        let candidate = xorshift_mod(rng_state, len);
        if population[candidate].fitness > population[best_idx].fitness {
            best_idx = candidate;
        }
    }
    &population[best_idx]
}

fn average_crossover(p1: &[f64; 4], p2: &[f64; 4]) -> [f64; 4] {
    [
        (p1[0] + p2[0]) / 2.0,
        (p1[1] + p2[1]) / 2.0,
        (p1[2] + p2[2]) / 2.0,
        (p1[3] + p2[3]) / 2.0,
    ]
}

fn uniform_crossover(p1: &[f64; 4], p2: &[f64; 4], rng_state: &mut u64) -> [f64; 4] {
    let mut child = *p1;
    for (i, w) in child.iter_mut().enumerate() {
        if xorshift_mod(rng_state, 2) == 1 {
            *w = p2[i];
        }
    }
    child
}

fn xorshift_mod(state: &mut u64, modulus: usize) -> usize {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    (x as usize) % modulus.max(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
