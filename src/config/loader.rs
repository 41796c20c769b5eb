//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into an [`EngineConfig`], and run
//! validation before returning. This is the entry point for loading the
//! engine policy at startup; failures here are allowed to abort the process.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message

use std::path::Path;

use tracing::debug;

use super::validation::{self, ConfigError};
use super::EngineConfig;

/// Load an [`EngineConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(EngineConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Example
///
/// ```rust,ignore
/// use resonance_engine::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("resonance.toml"))?;
/// println!("accept at {}", config.consensus.accept_threshold);
/// ```
pub fn load_from_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load an [`EngineConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
pub fn load_from_str(content: &str, source_name: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    debug!(source = source_name, "engine configuration loaded");
    Ok(config)
}
