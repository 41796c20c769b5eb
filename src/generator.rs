//! Generation collaborator abstraction.
//!
//! The engine never talks to a model directly. Candidate text comes from a
//! [`Generator`]: the first call of a turn carries only the prompt and
//! context, each correction call also carries the prior candidate and the
//! findings gathered from all four reviewers.
//!
//! [`EchoGenerator`] is the deterministic reference implementation used for
//! smoke tests and benchmarks.

use async_trait::async_trait;
use thiserror::Error;

use crate::context::TurnContext;
use crate::{Candidate, CandidateOrigin};

/// Failure of the generation collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    /// Network or backend failure.
    #[error("generation backend failed: {0}")]
    Backend(String),

    /// The backend did not answer within the deadline.
    #[error("generation timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },

    /// The backend answered with nothing usable.
    #[error("generation returned an empty response")]
    EmptyResponse,
}

/// One request to the generation collaborator.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The user input.
    pub prompt: String,
    /// Turn context (read-only).
    pub context: TurnContext,
    /// Candidate being corrected, if this is a correction.
    pub prior: Option<Candidate>,
    /// Correction guidance assembled from every reviewer's findings.
    pub guidance: Vec<String>,
    /// 0 for the first candidate, `n` for the n-th correction.
    pub correction: u32,
}

impl GenerationRequest {
    /// The request for a turn's first candidate.
    pub fn initial(context: &TurnContext) -> Self {
        Self {
            prompt: context.prompt.clone(),
            context: context.clone(),
            prior: None,
            guidance: Vec::new(),
            correction: 0,
        }
    }

    /// A correction request superseding `prior`.
    pub fn correction(
        context: &TurnContext,
        prior: Candidate,
        guidance: Vec<String>,
        correction: u32,
    ) -> Self {
        Self {
            prompt: context.prompt.clone(),
            context: context.clone(),
            prior: Some(prior),
            guidance,
            correction,
        }
    }

    /// Origin to stamp on the candidate produced for this request.
    pub fn origin(&self) -> CandidateOrigin {
        if self.correction == 0 {
            CandidateOrigin::Model
        } else {
            CandidateOrigin::Corrected {
                generation: self.correction,
            }
        }
    }
}

/// Trait for candidate generators.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn Generator>`.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a candidate for the request.
    async fn generate(&self, request: &GenerationRequest) -> Result<Candidate, GenerationError>;
}

/// Deterministic echo generator.
///
/// Echoes the prompt as the first candidate. On correction it re-emits the
/// prior candidate with mechanical fixes: whitespace trimmed and the final
/// sentence terminated.
pub struct EchoGenerator {
    /// Simulated generation delay.
    pub delay_ms: u64,
}

impl EchoGenerator {
    /// Echo generator with a 10ms simulated delay.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Echo generator with a custom delay.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn terminate_sentence(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.chars().last() {
        Some('.' | '!' | '?' | '}' | ']' | '"') | None => trimmed.to_string(),
        Some(_) => format!("{trimmed}."),
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Candidate, GenerationError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }

        let content = match &request.prior {
            Some(prior) => terminate_sentence(prior.content()),
            None => request.prompt.trim().to_string(),
        };
        if content.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }

        Ok(Candidate::new(content, request.origin()))
    }
}
