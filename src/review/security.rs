//! SecurityAudit reviewer.
//!
//! Scans candidate text against a fixed threat catalogue. Critical threats
//! (injection, prompt-override phrases, shell execution directives, secret
//! material) produce a hard-fail. Semantic corruption and resource
//! exhaustion only lower the score.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use super::{Finding, ReviewVerdict, Reviewer, ReviewerError, ReviewerRole, Severity};
use crate::config::ReviewersConfig;
use crate::context::TurnContext;
use crate::Candidate;

/// Threat classes checked by the audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threat {
    /// T1: semantic corruption (garbled or self-negating text).
    SemanticCorruption,
    /// T2: code or markup injection.
    Injection,
    /// T3: attempts to override the assistant's instructions.
    PromptOverride,
    /// T4: shell or interpreter execution directives.
    ShellExecution,
    /// T5: credentials or secrets in the clear.
    SecretMaterial,
    /// T6: resource exhaustion.
    ResourceExhaustion,
}

impl Threat {
    /// Catalogue identifier.
    pub fn id(self) -> &'static str {
        match self {
            Threat::SemanticCorruption => "T1",
            Threat::Injection => "T2",
            Threat::PromptOverride => "T3",
            Threat::ShellExecution => "T4",
            Threat::SecretMaterial => "T5",
            Threat::ResourceExhaustion => "T6",
        }
    }

    /// Severity a match of this threat carries.
    pub fn severity(self) -> Severity {
        match self {
            Threat::SemanticCorruption | Threat::ResourceExhaustion => Severity::Warning,
            _ => Severity::Critical,
        }
    }
}

/// A run of identical tokens this long is treated as a flood.
const FLOOD_RUN: usize = 8;

struct Signature {
    threat: Threat,
    label: &'static str,
    pattern: &'static str,
}

const SIGNATURES: &[Signature] = &[
    Signature {
        threat: Threat::Injection,
        label: "SQL data-definition or data-manipulation statement",
        pattern: r"(?i)\b(drop|alter|truncate|create)\s+(table|database|user)\b|\bdelete\s+from\b|\binsert\s+into\b|\bupdate\s+\w+\s+set\b",
    },
    Signature {
        threat: Threat::Injection,
        label: "script tag",
        pattern: r"(?i)<\s*script\b",
    },
    Signature {
        threat: Threat::Injection,
        label: "javascript: URL",
        pattern: r"(?i)javascript\s*:",
    },
    Signature {
        threat: Threat::Injection,
        label: "inline event handler",
        pattern: r"(?i)<[a-z][^<>]*\son[a-z]+\s*=",
    },
    Signature {
        threat: Threat::Injection,
        label: "iframe tag",
        pattern: r"(?i)<\s*iframe\b",
    },
    Signature {
        threat: Threat::Injection,
        label: "HTML data URL",
        pattern: r"(?i)data\s*:\s*text/html",
    },
    Signature {
        threat: Threat::PromptOverride,
        label: "instruction override phrase",
        pattern: r"(?i)\b(ignore|disregard|forget)\s+(all\s+)?(the\s+)?(previous|prior|above|system)\s+(instructions|prompt|rules)",
    },
    Signature {
        threat: Threat::PromptOverride,
        label: "mode escalation phrase",
        pattern: r"(?i)\byou\s+are\s+now\s+(in\s+)?(developer|jailbreak|unrestricted)\s+mode",
    },
    Signature {
        threat: Threat::ShellExecution,
        label: "recursive root deletion",
        pattern: r"(?i)\brm\s+-[a-z]*r[a-z]*f?\s+/",
    },
    Signature {
        threat: Threat::ShellExecution,
        label: "piped remote script execution",
        pattern: r"(?i)\b(curl|wget)\b[^\n|]*\|\s*(sudo\s+)?(sh|bash|zsh)\b",
    },
    Signature {
        threat: Threat::ShellExecution,
        label: "interpreter execution call",
        pattern: r"(?i)\b(os\.system|subprocess\.(run|call|popen)|eval|exec)\s*\(",
    },
    Signature {
        threat: Threat::SecretMaterial,
        label: "credential assignment",
        pattern: r#"(?i)\b(password|passwd|api[_-]?key|secret|access[_-]?token)\b\s*[:=]\s*["']?[^\s"']{6,}"#,
    },
    Signature {
        threat: Threat::SecretMaterial,
        label: "private key block",
        pattern: r"-----BEGIN [A-Z ]*PRIVATE KEY-----",
    },
    Signature {
        threat: Threat::SemanticCorruption,
        label: "runaway punctuation",
        pattern: r"[!?]{4,}",
    },
    Signature {
        threat: Threat::SemanticCorruption,
        label: "self-negating statement",
        pattern: r"(?i)\b(this|that)\s+is\s+not\s+(this|that)\b",
    },
    Signature {
        threat: Threat::ResourceExhaustion,
        label: "stacked payload tags",
        pattern: r"#\[[^\]\n]+\][^#]*#\[[^\]\n]+\]",
    },
];

fn signature_set() -> &'static [(Threat, &'static str, Option<Regex>)] {
    static SET: OnceLock<Vec<(Threat, &'static str, Option<Regex>)>> = OnceLock::new();
    SET.get_or_init(|| {
        SIGNATURES
            .iter()
            .map(|s| (s.threat, s.label, Regex::new(s.pattern).ok()))
            .collect()
    })
}

/// Threat-catalogue scanner.
#[derive(Debug, Clone)]
pub struct SecurityAuditReviewer {
    config: ReviewersConfig,
}

impl SecurityAuditReviewer {
    /// Create an auditor with the given limits.
    pub fn new(config: ReviewersConfig) -> Self {
        Self { config }
    }

    /// Threats found in `text`, each with a description of what matched.
    pub fn scan(&self, text: &str) -> Vec<(Threat, String)> {
        let mut hits: Vec<(Threat, String)> = signature_set()
            .iter()
            .filter_map(|(threat, label, re)| {
                let re = re.as_ref()?;
                re.find(text)
                    .map(|m| (*threat, format!("{label} near {:?}", truncate(m.as_str(), 40))))
            })
            .collect();

        let chars = text.chars().count();
        if chars > self.config.max_chars {
            hits.push((
                Threat::ResourceExhaustion,
                format!("candidate is {chars} chars, limit is {}", self.config.max_chars),
            ));
        }

        let run = longest_token_repeat(text);
        if run >= FLOOD_RUN {
            hits.push((
                Threat::ResourceExhaustion,
                format!("same token repeated {run} times in a row"),
            ));
        }

        hits
    }

    /// Synchronous core of the review.
    pub fn inspect(&self, candidate: &Candidate) -> ReviewVerdict {
        let hits = self.scan(candidate.content());
        let mut score: f64 = 1.0;
        let findings: Vec<Finding> = hits
            .into_iter()
            .map(|(threat, detail)| {
                let severity = threat.severity();
                score -= if severity == Severity::Critical { 0.5 } else { 0.15 };
                Finding::new(severity, format!("security.{}", threat.id()), detail)
            })
            .collect();

        ReviewVerdict::new(ReviewerRole::SecurityAudit, score, findings)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}

/// Length of the longest run of one identical whitespace-separated token.
fn longest_token_repeat(text: &str) -> usize {
    let mut best = 0usize;
    let mut run = 0usize;
    let mut prev: Option<&str> = None;
    for token in text.split_whitespace() {
        if prev == Some(token) {
            run += 1;
        } else {
            run = 1;
            prev = Some(token);
        }
        best = best.max(run);
    }
    best
}

#[async_trait]
impl Reviewer for SecurityAuditReviewer {
    fn role(&self) -> ReviewerRole {
        ReviewerRole::SecurityAudit
    }

    async fn review(
        &self,
        candidate: &Candidate,
        _context: &TurnContext,
    ) -> Result<ReviewVerdict, ReviewerError> {
        Ok(self.inspect(candidate))
    }
}
