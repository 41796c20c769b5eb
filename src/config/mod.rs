//! # Stage: Declarative Engine Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML policy file that fixes every threshold,
//! timeout and search constant the engine uses. Policy constants live here,
//! never as literals in the components, so each is independently testable.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `EngineConfig`
//! - Total defaults: an empty document yields the documented default policy
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Reading the persisted bias record (that belongs to `evolution::store`)
//! - Installing the tracing subscriber (that belongs to `init_tracing`)

pub mod loader;
pub mod validation;

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Hard ceiling on correction requests per turn. No configuration can raise it.
pub const HARD_CORRECTION_CEILING: u32 = 3;

// ── Default value functions ──────────────────────────────────────────────

fn default_accept_threshold() -> f64 {
    0.90
}

fn default_floor_threshold() -> f64 {
    0.70
}

fn default_max_corrections() -> u32 {
    HARD_CORRECTION_CEILING
}

fn default_review_timeout_ms() -> u64 {
    5_000
}

fn default_generation_timeout_ms() -> u64 {
    30_000
}

fn default_min_chars() -> usize {
    2
}

fn default_max_chars() -> usize {
    8_000
}

fn default_max_data_density() -> f64 {
    100.0
}

fn default_population_size() -> usize {
    10
}

fn default_elite_count() -> usize {
    2
}

fn default_mutation_rate() -> f64 {
    0.3
}

fn default_mutation_strength() -> f64 {
    0.1
}

fn default_crossover_rate() -> f64 {
    0.7
}

fn default_max_generations() -> usize {
    5
}

fn default_stall_generations() -> usize {
    3
}

fn default_weight_floor() -> f64 {
    0.05
}

fn default_variance_penalty() -> f64 {
    0.1
}

fn default_correction_penalty() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    42
}

fn default_sample_window() -> usize {
    200
}

fn default_biases_path() -> PathBuf {
    PathBuf::from("state/best_biases.json")
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an engine instance.
///
/// # Example
///
/// ```toml
/// [consensus]
/// accept_threshold = 0.9
/// floor_threshold = 0.7
///
/// [evolution]
/// population_size = 10
/// max_generations = 5
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Decision policy for the consensus engine.
    pub consensus: ConsensusConfig,
    /// Correction loop settings.
    pub correction: CorrectionConfig,
    /// Built-in reviewer limits.
    pub reviewers: ReviewersConfig,
    /// Population search constants.
    pub evolution: EvolutionConfig,
    /// Location of the persisted best-known biases.
    pub persistence: PersistenceConfig,
    /// Logging output.
    pub observability: ObservabilityConfig,
}

// ── Consensus ────────────────────────────────────────────────────────────

/// How the four verdict scores are combined into one coherence score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// Weighted arithmetic mean under the load-bias weights.
    #[default]
    WeightedMean,
    /// Weighted harmonic mean; punishes a single weak reviewer harder.
    WeightedHarmonic,
    /// The lowest verdict score, ignoring weights.
    Minimum,
}

/// Consensus decision policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Aggregate score at or above which a candidate is accepted.
    pub accept_threshold: f64,
    /// Minimum aggregate score for a candidate to be worth correcting.
    pub floor_threshold: f64,
    /// Corrections allowed before a correctable score becomes a rejection.
    pub max_corrections: u32,
    /// Aggregation formula.
    pub aggregation: AggregationKind,
    /// Per-reviewer deadline (ms). A reviewer that misses it yields a timeout verdict.
    pub review_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            accept_threshold: default_accept_threshold(),
            floor_threshold: default_floor_threshold(),
            max_corrections: default_max_corrections(),
            aggregation: AggregationKind::default(),
            review_timeout_ms: default_review_timeout_ms(),
        }
    }
}

// ── Correction ───────────────────────────────────────────────────────────

/// Correction loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Deadline (ms) for one call to the generation collaborator.
    pub generation_timeout_ms: u64,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            generation_timeout_ms: default_generation_timeout_ms(),
        }
    }
}

// ── Reviewers ────────────────────────────────────────────────────────────

/// Limits used by the built-in reviewers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ReviewersConfig {
    /// Candidates shorter than this (in chars, trimmed) fail the control review.
    pub min_chars: usize,
    /// Candidates longer than this are flagged as resource exhaustion.
    pub max_chars: usize,
    /// Characters per structure above which a payload is considered redundant.
    pub max_data_density: f64,
}

impl Default for ReviewersConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            max_data_density: default_max_data_density(),
        }
    }
}

// ── Evolution ────────────────────────────────────────────────────────────

/// How two parent vectors are combined.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CrossoverKind {
    /// Component-wise average of the parents.
    #[default]
    Average,
    /// Each component picked from either parent at random.
    Uniform,
}

/// Population search constants.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Number of vectors per generation ("parallel realities").
    pub population_size: usize,
    /// Top vectors copied unchanged into the next generation.
    pub elite_count: usize,
    /// Probability that a weight is perturbed.
    pub mutation_rate: f64,
    /// Maximum absolute offset applied by one mutation.
    pub mutation_strength: f64,
    /// Probability that a child is produced by crossover instead of cloning.
    pub crossover_rate: f64,
    /// Crossover mode.
    pub crossover: CrossoverKind,
    /// Fixed number of generations per search cycle.
    pub max_generations: usize,
    /// Stop early after this many generations without strict improvement.
    pub stall_generations: usize,
    /// Lower clamp applied to each weight before renormalisation.
    pub weight_floor: f64,
    /// Fitness penalty per unit of coherence variance.
    pub variance_penalty: f64,
    /// Fractional reward lost per correction the simulated turn needed.
    pub correction_penalty: f64,
    /// RNG seed; identical inputs and seed give identical results.
    pub seed: u64,
    /// Number of recent turn samples retained for fitness evaluation.
    pub sample_window: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            elite_count: default_elite_count(),
            mutation_rate: default_mutation_rate(),
            mutation_strength: default_mutation_strength(),
            crossover_rate: default_crossover_rate(),
            crossover: CrossoverKind::default(),
            max_generations: default_max_generations(),
            stall_generations: default_stall_generations(),
            weight_floor: default_weight_floor(),
            variance_penalty: default_variance_penalty(),
            correction_penalty: default_correction_penalty(),
            seed: default_seed(),
            sample_window: default_sample_window(),
        }
    }
}

// ── Persistence ──────────────────────────────────────────────────────────

/// Location of the persisted best-known biases record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// JSON file holding the best-known bias weights.
    pub biases_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            biases_path: default_biases_path(),
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log output format.
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

/// Export the JSON Schema for `EngineConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EngineConfig);
    serde_json::to_string_pretty(&schema)
}
