//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`EngineConfig`] that cannot
//! be expressed through the type system alone (threshold ranges, the
//! accept/floor ordering, the hard correction ceiling, search sizes).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value

use super::{EngineConfig, HARD_CORRECTION_CEILING};

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "consensus.floor_threshold").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn unit_range(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(ConfigError::InvalidField {
            field: field.into(),
            value: value.to_string(),
            reason: "must be between 0.0 and 1.0".into(),
        });
    }
}

fn non_negative(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !(value >= 0.0 && value.is_finite()) {
        errors.push(ConfigError::InvalidField {
            field: field.into(),
            value: value.to_string(),
            reason: "must be a finite value \u{2265} 0.0".into(),
        });
    }
}

/// Validate all semantic constraints on an [`EngineConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &EngineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Consensus thresholds ─────────────────────────────────────────
    let consensus = &config.consensus;
    unit_range(&mut errors, "consensus.accept_threshold", consensus.accept_threshold);
    unit_range(&mut errors, "consensus.floor_threshold", consensus.floor_threshold);

    if consensus.floor_threshold > consensus.accept_threshold {
        errors.push(ConfigError::InvalidField {
            field: "consensus.floor_threshold".into(),
            value: consensus.floor_threshold.to_string(),
            reason: "must be \u{2264} accept_threshold".into(),
        });
    }

    if consensus.max_corrections > HARD_CORRECTION_CEILING {
        errors.push(ConfigError::InvalidField {
            field: "consensus.max_corrections".into(),
            value: consensus.max_corrections.to_string(),
            reason: format!("must be \u{2264} {HARD_CORRECTION_CEILING}"),
        });
    }

    if consensus.review_timeout_ms == 0 {
        errors.push(ConfigError::InvalidField {
            field: "consensus.review_timeout_ms".into(),
            value: "0".into(),
            reason: "must be at least 1ms".into(),
        });
    }

    // ── Correction ───────────────────────────────────────────────────
    if config.correction.generation_timeout_ms == 0 {
        errors.push(ConfigError::InvalidField {
            field: "correction.generation_timeout_ms".into(),
            value: "0".into(),
            reason: "must be at least 1ms".into(),
        });
    }

    // ── Reviewers ────────────────────────────────────────────────────
    if config.reviewers.min_chars > config.reviewers.max_chars {
        errors.push(ConfigError::InvalidField {
            field: "reviewers.min_chars".into(),
            value: config.reviewers.min_chars.to_string(),
            reason: "must be \u{2264} max_chars".into(),
        });
    }
    if config.reviewers.max_data_density <= 0.0 {
        errors.push(ConfigError::InvalidField {
            field: "reviewers.max_data_density".into(),
            value: config.reviewers.max_data_density.to_string(),
            reason: "must be greater than 0".into(),
        });
    }

    // ── Evolution ────────────────────────────────────────────────────
    let evo = &config.evolution;
    if evo.population_size < 2 {
        errors.push(ConfigError::InvalidField {
            field: "evolution.population_size".into(),
            value: evo.population_size.to_string(),
            reason: "must be at least 2".into(),
        });
    }
    if evo.elite_count == 0 || evo.elite_count >= evo.population_size {
        errors.push(ConfigError::InvalidField {
            field: "evolution.elite_count".into(),
            value: evo.elite_count.to_string(),
            reason: "must be at least 1 and below population_size".into(),
        });
    }
    unit_range(&mut errors, "evolution.mutation_rate", evo.mutation_rate);
    unit_range(&mut errors, "evolution.mutation_strength", evo.mutation_strength);
    unit_range(&mut errors, "evolution.crossover_rate", evo.crossover_rate);
    if evo.max_generations == 0 {
        errors.push(ConfigError::InvalidField {
            field: "evolution.max_generations".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }
    if evo.stall_generations == 0 {
        errors.push(ConfigError::InvalidField {
            field: "evolution.stall_generations".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }
    // Four weights clamped at the floor must still fit in a unit sum.
    if !(0.0..0.25).contains(&evo.weight_floor) {
        errors.push(ConfigError::InvalidField {
            field: "evolution.weight_floor".into(),
            value: evo.weight_floor.to_string(),
            reason: "must be in [0.0, 0.25)".into(),
        });
    }
    non_negative(&mut errors, "evolution.variance_penalty", evo.variance_penalty);
    unit_range(&mut errors, "evolution.correction_penalty", evo.correction_penalty);
    if evo.sample_window == 0 {
        errors.push(ConfigError::InvalidField {
            field: "evolution.sample_window".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    // ── Persistence ──────────────────────────────────────────────────
    if config.persistence.biases_path.as_os_str().is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "persistence.biases_path".into(),
            value: String::new(),
            reason: "path must not be empty".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
