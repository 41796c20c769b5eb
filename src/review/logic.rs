//! Logic reviewer: relevance and reasoning soundness.
//!
//! The score blends two parts:
//!
//! - relevance (40%): coverage of the objective's keywords, or the prompt's
//!   when no objective is stated
//! - soundness (60%): starts at 1 and loses points for unanswered question
//!   words, overclaiming, recommendations without a stated reason, and
//!   repeated sentences
//!
//! Never raises a hard-fail.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{sentences, words, Finding, ReviewVerdict, Reviewer, ReviewerError, ReviewerRole, Severity};
use crate::context::TurnContext;
use crate::Candidate;

const RELEVANCE_WEIGHT: f64 = 0.4;
const SOUNDNESS_WEIGHT: f64 = 0.6;

const STOPWORDS: &[&str] = &[
    "about", "above", "after", "again", "also", "been", "before", "being", "between", "both",
    "could", "does", "doing", "down", "each", "from", "have", "having", "here", "into", "just",
    "more", "most", "much", "only", "other", "over", "same", "should", "some", "such", "than",
    "that", "their", "them", "then", "there", "these", "they", "this", "those", "through", "under",
    "very", "were", "what", "when", "where", "which", "while", "will", "with", "would", "your",
    "please", "tell",
];

const OVERCLAIMS: &[&str] = &["always", "never", "guaranteed", "guarantee", "certainly", "impossible"];

const RECOMMENDATIONS: &[&str] = &["should", "must", "recommend", "recommended", "advise"];

const RATIONALE: &[&str] = &[
    "because", "since", "therefore", "thus", "hence", "so", "due", "given", "as",
];

const COMPARISONS: &[&str] = &[
    "than", "better", "worse", "versus", "compared", "faster", "slower", "cheaper", "prefer",
];

/// What a question word in the prompt asks the answer to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expectation {
    Reason,
    Quantity,
    Comparison,
}

fn question_expectations(prompt: &str) -> Vec<Expectation> {
    let lower = prompt.to_lowercase();
    let vocab = words(&lower);
    let mut out = Vec::new();
    if vocab.iter().any(|w| w == "why") {
        out.push(Expectation::Reason);
    }
    if lower.contains("how many") || lower.contains("how much") {
        out.push(Expectation::Quantity);
    }
    if vocab.iter().any(|w| w == "compare" || w == "versus" || w == "vs")
        || (vocab.iter().any(|w| w == "which") && vocab.iter().any(|w| w == "better" || w == "best"))
    {
        out.push(Expectation::Comparison);
    }
    out
}

/// Content keywords of `text`: lowercase words of four or more characters
/// that are not stopwords.
pub(crate) fn keywords(text: &str) -> HashSet<String> {
    words(text)
        .into_iter()
        .filter(|w| w.chars().count() >= 4 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Reasoning reviewer.
#[derive(Debug, Clone, Default)]
pub struct LogicReviewer;

impl LogicReviewer {
    /// Create the reviewer.
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of the review.
    pub fn inspect(&self, candidate: &Candidate, context: &TurnContext) -> ReviewVerdict {
        let text = candidate.content();
        let mut findings = Vec::new();

        let target = context.objective.as_deref().unwrap_or(&context.prompt);
        let wanted = keywords(target);
        let relevance = if wanted.is_empty() {
            1.0
        } else {
            let present = words(text).into_iter().collect::<HashSet<_>>();
            wanted.iter().filter(|k| present.contains(*k)).count() as f64 / wanted.len() as f64
        };
        if relevance < 0.3 {
            findings.push(Finding::new(
                Severity::Warning,
                "logic.off_objective",
                format!(
                    "response covers {:.0}% of the key terms of {:?}",
                    relevance * 100.0,
                    target
                ),
            ));
        }

        let vocab: Vec<String> = words(text);
        let has = |list: &[&str]| vocab.iter().any(|w| list.contains(&w.as_str()));

        let mut soundness: f64 = 1.0;

        for expectation in question_expectations(&context.prompt) {
            let (met, what) = match expectation {
                Expectation::Reason => (has(RATIONALE), "a reason for a 'why' question"),
                Expectation::Quantity => (
                    text.chars().any(|c| c.is_ascii_digit()),
                    "a number for a 'how many/much' question",
                ),
                Expectation::Comparison => (has(COMPARISONS), "a comparison"),
            };
            if !met {
                findings.push(Finding::new(
                    Severity::Warning,
                    "logic.unanswered",
                    format!("the prompt asks for {what} but the response gives none"),
                ));
                soundness -= 0.15;
            }
        }

        let overclaims = vocab
            .iter()
            .filter(|w| OVERCLAIMS.contains(&w.as_str()))
            .count();
        if overclaims > 0 {
            findings.push(Finding::new(
                Severity::Warning,
                "logic.overclaim",
                format!("{overclaims} absolute claim(s) without qualification"),
            ));
            soundness -= 0.1 * overclaims.min(3) as f64;
        }

        if has(RECOMMENDATIONS) && !has(RATIONALE) {
            findings.push(Finding::new(
                Severity::Warning,
                "logic.unjustified_action",
                "recommends an action without giving a reason",
            ));
            soundness -= 0.2;
        }

        let mut seen = HashSet::new();
        let repeats = sentences(text)
            .into_iter()
            .map(str::to_lowercase)
            .filter(|s| !seen.insert(s.clone()))
            .count();
        if repeats > 0 {
            findings.push(Finding::new(
                Severity::Warning,
                "logic.repetition",
                format!("{repeats} sentence(s) repeated verbatim"),
            ));
            soundness -= 0.2;
        }

        let score = RELEVANCE_WEIGHT * relevance + SOUNDNESS_WEIGHT * soundness.max(0.0);
        ReviewVerdict::new(ReviewerRole::Logic, score, findings)
    }
}

#[async_trait]
impl Reviewer for LogicReviewer {
    fn role(&self) -> ReviewerRole {
        ReviewerRole::Logic
    }

    async fn review(
        &self,
        candidate: &Candidate,
        context: &TurnContext,
    ) -> Result<ReviewVerdict, ReviewerError> {
        Ok(self.inspect(candidate, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CandidateOrigin;

    fn inspect(text: &str, ctx: &TurnContext) -> ReviewVerdict {
        LogicReviewer::new().inspect(&Candidate::new(text, CandidateOrigin::Model), ctx)
    }

    #[test]
    fn test_keywords_drop_short_and_stop_words() {
        let k = keywords("What is the capital of France?");
        assert_eq!(k, ["capital", "france"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn test_relevant_answer_scores_full() {
        let ctx = TurnContext::for_prompt("What is the capital of France?");
        let v = inspect("Paris is the capital of France.", &ctx);
        assert_eq!(v.score, 1.0);
        assert!(v.findings.is_empty());
    }

    #[test]
    fn test_objective_takes_precedence_over_prompt() {
        let ctx = TurnContext::for_prompt("What is the capital of France?")
            .with_objective("summarize quarterly revenue");
        let v = inspect("Paris is the capital of France.", &ctx);
        assert!((v.score - 0.6).abs() < 1e-9);
        assert_eq!(v.findings[0].code, "logic.off_objective");
    }

    #[test]
    fn test_overclaim_lowers_soundness() {
        let ctx = TurnContext::for_prompt("Is the cache safe?");
        let v = inspect("The cache is always safe.", &ctx);
        assert!((v.score - (0.4 + 0.6 * 0.9)).abs() < 1e-9);
    }

    #[test]
    fn test_recommendation_without_reason() {
        let ctx = TurnContext::for_prompt("Which database?");
        let v = inspect("You should use the Postgres database.", &ctx);
        assert!(v.findings.iter().any(|f| f.code == "logic.unjustified_action"));

        let v = inspect("You should use the Postgres database because it is durable.", &ctx);
        assert!(!v.findings.iter().any(|f| f.code == "logic.unjustified_action"));
    }

    #[test]
    fn test_repeated_sentences_flagged() {
        let ctx = TurnContext::for_prompt("status");
        let v = inspect("Status is green. Status is green.", &ctx);
        assert!(v.findings.iter().any(|f| f.code == "logic.repetition"));
    }

    #[test]
    fn test_question_expectations_detected() {
        assert_eq!(question_expectations("Why is it slow?"), vec![Expectation::Reason]);
        assert_eq!(question_expectations("How many nodes?"), vec![Expectation::Quantity]);
        assert_eq!(
            question_expectations("Which engine is better?"),
            vec![Expectation::Comparison]
        );
        assert!(question_expectations("Describe the engine.").is_empty());
    }

    #[test]
    fn test_how_many_without_number_is_unanswered() {
        let ctx = TurnContext::for_prompt("How many replicas are running?");
        let v = inspect("Several replicas are running.", &ctx);
        assert!(v.findings.iter().any(|f| f.code == "logic.unanswered"));

        let v = inspect("Three replicas are running, 3 in total.", &ctx);
        assert!(!v.findings.iter().any(|f| f.code == "logic.unanswered"));
    }

    #[test]
    fn test_why_answered_with_reason() {
        let ctx = TurnContext::for_prompt("Why is the build slow?");
        let v = inspect("The build is slow because caching is off.", &ctx);
        assert!(v.findings.is_empty());
    }

    #[test]
    fn test_prompt_without_keywords_counts_as_relevant() {
        let ctx = TurnContext::for_prompt("ok?");
        let v = inspect("Yes.", &ctx);
        assert_eq!(v.score, 1.0);
    }
}
