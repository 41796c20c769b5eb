//! Control reviewer: structural and policy integrity.
//!
//! Checks that the candidate is a well-formed response of sensible size,
//! that required fields or sections are present, and that no sentence
//! issues two opposing directives. Never raises a hard-fail.

use std::collections::HashSet;

use async_trait::async_trait;

use super::integrity::{parse_payload, PayloadParse};
use super::{sentences, words, Finding, ReviewVerdict, Reviewer, ReviewerError, ReviewerRole, Severity};
use crate::config::ReviewersConfig;
use crate::context::TurnContext;
use crate::Candidate;

/// Directive pairs that must not appear together in one sentence.
const OPPOSING_DIRECTIVES: &[(&str, &str)] = &[
    ("enable", "disable"),
    ("allow", "deny"),
    ("always", "never"),
    ("increase", "decrease"),
    ("start", "stop"),
    ("include", "exclude"),
];

/// Structural reviewer.
#[derive(Debug, Clone)]
pub struct ControlReviewer {
    config: ReviewersConfig,
}

impl ControlReviewer {
    /// Create a reviewer with the given limits.
    pub fn new(config: ReviewersConfig) -> Self {
        Self { config }
    }

    /// Synchronous core of the review.
    pub fn inspect(&self, candidate: &Candidate, context: &TurnContext) -> ReviewVerdict {
        let text = candidate.content().trim();
        let chars = text.chars().count();
        let mut findings = Vec::new();
        let mut score: f64 = 1.0;

        if chars < self.config.min_chars {
            findings.push(Finding::new(
                Severity::Error,
                "control.too_short",
                format!("response has {chars} chars, minimum is {}", self.config.min_chars),
            ));
            score -= 0.6;
        }
        if chars > self.config.max_chars {
            findings.push(Finding::new(
                Severity::Warning,
                "control.oversized",
                format!("response has {chars} chars, maximum is {}", self.config.max_chars),
            ));
            score -= 0.2;
        }

        let required = &context.expectations.required_fields;
        if !required.is_empty() {
            let missing = missing_fields(text, required);
            if !missing.is_empty() {
                findings.push(Finding::new(
                    Severity::Error,
                    "control.missing_field",
                    format!("missing required sections: {}", missing.join(", ")),
                ));
                score -= 0.5 * missing.len() as f64 / required.len() as f64;
            }
        }

        let mut contradictions = 0usize;
        for sentence in sentences(text) {
            let vocab: HashSet<String> = words(sentence).into_iter().collect();
            for (a, b) in OPPOSING_DIRECTIVES {
                if vocab.contains(*a) && vocab.contains(*b) {
                    contradictions += 1;
                    findings.push(Finding::new(
                        Severity::Warning,
                        "control.contradiction",
                        format!("sentence both says '{a}' and '{b}': {sentence:?}"),
                    ));
                }
            }
        }
        score -= 0.15 * contradictions.min(3) as f64;

        if let Some(detail) = unbalanced(text) {
            findings.push(Finding::new(Severity::Warning, "control.unbalanced", detail));
            score -= 0.2;
        }

        ReviewVerdict::new(ReviewerRole::Control, score, findings)
    }
}

/// Required fields absent both as payload keys and as `name:` sections.
fn missing_fields<'a>(text: &str, required: &'a [String]) -> Vec<&'a str> {
    let parsed = parse_payload(text);
    let keys: HashSet<&str> = match &parsed {
        PayloadParse::Parsed { value, .. } => value
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default(),
        _ => HashSet::new(),
    };
    let lower = text.to_lowercase();

    required
        .iter()
        .filter(|field| {
            let f = field.to_lowercase();
            !keys.contains(field.as_str()) && !lower.contains(&format!("{f}:"))
        })
        .map(String::as_str)
        .collect()
}

/// Describe the first bracket/quote imbalance, if any.
fn unbalanced(text: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(open) {
                    return Some(format!("unexpected closing '{c}'"));
                }
            }
            _ => {}
        }
    }

    if in_string {
        return Some("unterminated string literal".to_string());
    }
    stack.last().map(|open| format!("unclosed '{open}'"))
}

#[async_trait]
impl Reviewer for ControlReviewer {
    fn role(&self) -> ReviewerRole {
        ReviewerRole::Control
    }

    async fn review(
        &self,
        candidate: &Candidate,
        context: &TurnContext,
    ) -> Result<ReviewVerdict, ReviewerError> {
        Ok(self.inspect(candidate, context))
    }
}
