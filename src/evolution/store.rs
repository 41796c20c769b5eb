//! Persistence of the best-known biases record.
//!
//! The record is a small JSON document:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "biases": { "control": 0.3, "logic": 0.3, "security_audit": 0.2, "data_integrity": 0.2 },
//!   "fitness": 0.87,
//!   "generation": 12,
//!   "updated_at": "2026-01-01T00:00:00Z"
//! }
//! ```
//!
//! A missing file is not an error ([`BiasStore::load`] returns `Ok(None)`);
//! a present but malformed one always is. Writes go to a sibling temp file
//! that is then renamed over the target, so a reader never sees a partial
//! record.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{EvolutionPersistenceError, LoadBiasVector};

/// Current on-disk schema version.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    RECORD_SCHEMA_VERSION
}

/// On-disk form of the best-known configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasRecord {
    /// Schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Flat `weight name -> value` mapping.
    pub biases: BTreeMap<String, f64>,
    /// Fitness of the vector when it was written.
    pub fitness: f64,
    /// Generation counter when it was written.
    pub generation: u32,
    /// Write time.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Validated best-known configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestKnown {
    /// Weights.
    pub vector: LoadBiasVector,
    /// Fitness.
    pub fitness: f64,
    /// Generation counter.
    pub generation: u32,
}

impl Default for BestKnown {
    fn default() -> Self {
        Self {
            vector: LoadBiasVector::EQUAL,
            fitness: 0.0,
            generation: 0,
        }
    }
}

impl From<&BestKnown> for BiasRecord {
    fn from(b: &BestKnown) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            biases: b.vector.to_map(),
            fitness: b.fitness,
            generation: b.generation,
            updated_at: Some(Utc::now()),
        }
    }
}

/// Reads and atomically writes the best-known record at one path.
#[derive(Debug, Clone)]
pub struct BiasStore {
    path: PathBuf,
}

impl BiasStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "biases".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Load the record.
    ///
    /// # Returns
    /// - `Ok(None)` if the file does not exist.
    /// - `Ok(Some(_))` for a valid record.
    ///
    /// # Errors
    /// - [`EvolutionPersistenceError::Io`] if the file exists but cannot be read.
    /// - [`EvolutionPersistenceError::Malformed`] if it is not a JSON record.
    /// - [`EvolutionPersistenceError::Invalid`] if the weights or numbers are unusable.
    pub fn load(&self) -> Result<Option<BestKnown>, EvolutionPersistenceError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted biases");
                return Ok(None);
            }
            Err(e) => {
                return Err(EvolutionPersistenceError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let record: BiasRecord =
            serde_json::from_str(&content).map_err(|e| EvolutionPersistenceError::Malformed {
                path: self.path.clone(),
                source: e,
            })?;

        let invalid = |reason: String| EvolutionPersistenceError::Invalid {
            path: self.path.clone(),
            reason,
        };
        if record.schema_version != RECORD_SCHEMA_VERSION {
            return Err(invalid(format!(
                "unsupported schema version {} (expected {RECORD_SCHEMA_VERSION})",
                record.schema_version
            )));
        }
        if !record.fitness.is_finite() {
            return Err(invalid("fitness is not a finite number".to_string()));
        }
        let vector = LoadBiasVector::from_map(&record.biases).map_err(|e| invalid(e.to_string()))?;

        info!(
            path = %self.path.display(),
            generation = record.generation,
            fitness = record.fitness,
            biases = %vector,
            "persisted biases loaded"
        );
        Ok(Some(BestKnown {
            vector,
            fitness: record.fitness,
            generation: record.generation,
        }))
    }

    /// Load the record, falling back to equal weights on absence or error.
    ///
    /// Errors are logged, not returned; this is the path sessions use so a
    /// corrupt file never blocks live traffic.
    pub fn load_or_default(&self) -> BestKnown {
        match self.load() {
            Ok(Some(known)) => known,
            Ok(None) => BestKnown::default(),
            Err(e) => {
                warn!(error = %e, "persisted biases unusable, using equal weights");
                BestKnown::default()
            }
        }
    }

    /// Atomically replace the record.
    ///
    /// # Errors
    /// Returns [`EvolutionPersistenceError::Io`] if the directory, temp file
    /// or rename fails, and [`EvolutionPersistenceError::Malformed`] if the
    /// record cannot be serialised.
    pub async fn save(&self, best: &BestKnown) -> Result<(), EvolutionPersistenceError> {
        let io_err = |source: std::io::Error| EvolutionPersistenceError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }

        let record = BiasRecord::from(best);
        let json = serde_json::to_string_pretty(&record).map_err(|e| {
            EvolutionPersistenceError::Malformed {
                path: self.path.clone(),
                source: e,
            }
        })?;

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json.as_bytes()).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;

        info!(
            path = %self.path.display(),
            generation = best.generation,
            fitness = best.fitness,
            biases = %best.vector,
            "best-known biases persisted"
        );
        Ok(())
    }
}
