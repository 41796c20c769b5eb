//! DataIntegrity reviewer: strict structured-payload validation.
//!
//! A candidate may carry a JSON payload in one of three forms:
//!
//! - tagged: `#[identifier] {json}`
//! - fenced: a ```` ```json ```` code block
//! - whole body: the trimmed candidate is itself a JSON object or array
//!
//! Parse failures, a missing required payload, a wrong top-level shape and
//! missing required fields are critical findings and therefore hard-fail.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::{compiled, Finding, ReviewVerdict, Reviewer, ReviewerError, ReviewerRole, Severity};
use crate::config::ReviewersConfig;
use crate::context::TurnContext;
use crate::Candidate;

/// Where a payload was found in the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadForm {
    /// `#[id] {json}`
    Tagged,
    /// ```` ```json ```` block.
    Fenced,
    /// Entire candidate body.
    WholeBody,
}

/// Result of looking for a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadParse {
    /// No payload marker present.
    Absent,
    /// A payload marker is present but its content is not valid JSON.
    Malformed {
        /// Where it was found.
        form: PayloadForm,
        /// Parser message.
        error: String,
    },
    /// A payload was found and parsed.
    Parsed {
        /// Where it was found.
        form: PayloadForm,
        /// Parsed value.
        value: Value,
        /// Raw payload length in characters.
        raw_chars: usize,
    },
}

impl PayloadParse {
    /// The parsed value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            PayloadParse::Parsed { value, .. } => Some(value),
            _ => None,
        }
    }
}

fn tagged_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(?s)^#\[[^\]\n]+\]\s*([\{\[].*)")
}

fn fenced_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(?s)```json\s*(.*?)```")
}

fn is_json_shaped(text: &str) -> bool {
    (text.starts_with('{') && text.ends_with('}')) || (text.starts_with('[') && text.ends_with(']'))
}

/// Locate and parse the structured payload of `text`.
pub fn parse_payload(text: &str) -> PayloadParse {
    let trimmed = text.trim();

    let located = if let Some(caps) = tagged_re().and_then(|re| re.captures(trimmed)) {
        caps.get(1).map(|m| (PayloadForm::Tagged, m.as_str().trim()))
    } else if let Some(caps) = fenced_re().and_then(|re| re.captures(trimmed)) {
        caps.get(1).map(|m| (PayloadForm::Fenced, m.as_str().trim()))
    } else if is_json_shaped(trimmed) {
        Some((PayloadForm::WholeBody, trimmed))
    } else {
        None
    };

    let Some((form, raw)) = located else {
        return PayloadParse::Absent;
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(value) => PayloadParse::Parsed {
            form,
            value,
            raw_chars: raw.chars().count(),
        },
        Err(e) => PayloadParse::Malformed {
            form,
            error: e.to_string(),
        },
    }
}

fn structure_count(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(structure_count).sum::<usize>(),
        Value::Array(items) => 1 + items.iter().map(structure_count).sum::<usize>(),
        _ => 0,
    }
}

/// Strict payload validator.
#[derive(Debug, Clone)]
pub struct DataIntegrityReviewer {
    config: ReviewersConfig,
}

impl DataIntegrityReviewer {
    /// Create a reviewer with the given limits.
    pub fn new(config: ReviewersConfig) -> Self {
        Self { config }
    }

    /// Synchronous core of the review.
    pub fn inspect(&self, candidate: &Candidate, context: &TurnContext) -> ReviewVerdict {
        let expect = &context.expectations;
        let mut findings = Vec::new();
        let mut score: f64 = 1.0;

        match parse_payload(candidate.content()) {
            PayloadParse::Absent => {
                if expect.require_payload {
                    findings.push(Finding::new(
                        Severity::Critical,
                        "integrity.missing_payload",
                        "a structured JSON payload is required but none was found",
                    ));
                    score = 0.0;
                }
            }
            PayloadParse::Malformed { form, error } => {
                findings.push(Finding::new(
                    Severity::Critical,
                    "integrity.malformed_payload",
                    format!("{form:?} payload is not valid JSON: {error}"),
                ));
                score = 0.0;
            }
            PayloadParse::Parsed {
                value, raw_chars, ..
            } => {
                if expect.payload_object && !value.is_object() {
                    findings.push(Finding::new(
                        Severity::Critical,
                        "integrity.shape",
                        "payload top level must be a JSON object",
                    ));
                    score = 0.0;
                }

                if let Value::Object(map) = &value {
                    let missing: Vec<&str> = expect
                        .required_fields
                        .iter()
                        .filter(|f| !map.contains_key(f.as_str()))
                        .map(String::as_str)
                        .collect();
                    if !missing.is_empty() {
                        findings.push(Finding::new(
                            Severity::Critical,
                            "integrity.missing_field",
                            format!("payload is missing required fields: {}", missing.join(", ")),
                        ));
                        score = 0.0;
                    }
                } else if expect.require_payload && !expect.required_fields.is_empty() {
                    findings.push(Finding::new(
                        Severity::Critical,
                        "integrity.missing_field",
                        "required fields cannot be present in a non-object payload",
                    ));
                    score = 0.0;
                }

                let density = raw_chars as f64 / structure_count(&value).max(1) as f64;
                if density > self.config.max_data_density {
                    findings.push(Finding::new(
                        Severity::Warning,
                        "integrity.density",
                        format!(
                            "payload density {density:.1} chars/structure exceeds {:.1}",
                            self.config.max_data_density
                        ),
                    ));
                    score -= 0.3;
                }
            }
        }

        ReviewVerdict::new(ReviewerRole::DataIntegrity, score, findings)
    }
}

#[async_trait]
impl Reviewer for DataIntegrityReviewer {
    fn role(&self) -> ReviewerRole {
        ReviewerRole::DataIntegrity
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
    use crate::context::OutputExpectations;
    use crate::CandidateOrigin;

    fn cand(text: &str) -> Candidate {
        Candidate::new(text, CandidateOrigin::Model)
    }

    fn ctx_requiring(fields: &[&str]) -> TurnContext {
        TurnContext::for_prompt("status").with_expectations(OutputExpectations {
            require_payload: true,
            payload_object: true,
            required_fields: fields.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn reviewer() -> DataIntegrityReviewer {
        DataIntegrityReviewer::new(ReviewersConfig::default())
    }

    #[test]
    fn test_parse_tagged_payload() {
        let p = parse_payload("#[status] {\"ok\": true}");
        assert!(matches!(p, PayloadParse::Parsed { form: PayloadForm::Tagged, .. }));
        assert_eq!(p.value().and_then(|v| v.get("ok")), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_parse_fenced_payload() {
        let p = parse_payload("Here you go:\n```json\n{\"a\": 1}\n```\n");
        assert!(matches!(p, PayloadParse::Parsed { form: PayloadForm::Fenced, .. }));
    }

    #[test]
    fn test_parse_whole_body_array() {
        let p = parse_payload("  [1, 2, 3] ");
        assert!(matches!(p, PayloadParse::Parsed { form: PayloadForm::WholeBody, .. }));
    }

    #[test]
    fn test_parse_plain_text_is_absent() {
        assert_eq!(parse_payload("Paris is the capital of France."), PayloadParse::Absent);
    }

    #[test]
    fn test_bracketed_prose_is_not_a_payload() {
        assert_eq!(parse_payload("[Note] the build is green"), PayloadParse::Absent);
    }

    #[test]
    fn test_rust_attribute_in_prose_is_not_a_payload() {
        let text = "Add #[derive(Debug)] above the struct so it can be printed.";
        assert_eq!(parse_payload(text), PayloadParse::Absent);
        let v = reviewer().inspect(&cand(text), &TurnContext::for_prompt("q"));
        assert!(v.passed);
        assert!(!v.hard_fail);
    }

    #[test]
    fn test_leading_attribute_on_code_is_not_a_payload() {
        assert_eq!(
            parse_payload("#[derive(Debug)]\nstruct Config { port: u16 }"),
            PayloadParse::Absent
        );
    }

    #[test]
    fn test_parse_broken_json_is_malformed() {
        let p = parse_payload("#[x] {\"a\": ");
        assert!(matches!(p, PayloadParse::Malformed { form: PayloadForm::Tagged, .. }));
    }

    #[test]
    fn test_plain_text_without_expectations_passes() {
        let v = reviewer().inspect(&cand("Plain answer."), &TurnContext::for_prompt("q"));
        assert!(v.passed);
        assert!(!v.hard_fail);
        assert_eq!(v.score, 1.0);
    }

    #[test]
    fn test_missing_required_payload_hard_fails() {
        let v = reviewer().inspect(&cand("no payload here"), &ctx_requiring(&[]));
        assert!(v.hard_fail);
        assert_eq!(v.findings[0].code, "integrity.missing_payload");
    }

    #[test]
    fn test_malformed_payload_hard_fails_even_when_not_required() {
        let v = reviewer().inspect(&cand("{\"a\": 1,,}"), &TurnContext::for_prompt("q"));
        assert!(v.hard_fail);
        assert_eq!(v.score, 0.0);
    }

    #[test]
    fn test_array_when_object_expected_hard_fails() {
        let v = reviewer().inspect(&cand("[1, 2]"), &ctx_requiring(&[]));
        assert!(v.hard_fail);
        assert_eq!(v.findings[0].code, "integrity.shape");
    }

    #[test]
    fn test_missing_required_field_hard_fails() {
        let v = reviewer().inspect(&cand("{\"status\": \"ok\"}"), &ctx_requiring(&["status", "eta"]));
        assert!(v.hard_fail);
        assert!(v.findings[0].message.contains("eta"));
    }

    #[test]
    fn test_complete_payload_passes() {
        let v = reviewer().inspect(
            &cand("#[report] {\"status\": \"ok\", \"eta\": 5}"),
            &ctx_requiring(&["status", "eta"]),
        );
        assert!(v.passed);
        assert!(!v.hard_fail);
    }

    #[test]
    fn test_dense_payload_is_warning_only() {
        let long = "x".repeat(500);
        let text = format!("{{\"blob\": \"{long}\"}}");
        let v = reviewer().inspect(&cand(&text), &TurnContext::for_prompt("q"));
        assert!(!v.hard_fail);
        assert!(v.passed);
        assert!(v.score < 1.0);
        assert_eq!(v.findings[0].code, "integrity.density");
    }
}
