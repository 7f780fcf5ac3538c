//! PostGuard: output verification before anything reaches the client
//!
//! Applied to every surfaced text, including canned refusals and cached
//! entries. Deterministic for the same `(text, context)` pair.

use serde::{Deserialize, Serialize};

use super::{redact_spans, scan, Detection, DetectionCategory};

/// Verdict for verified output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostGuardAction {
    Pass,
    Redact,
    Block,
}

impl std::fmt::Display for PostGuardAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostGuardAction::Pass => write!(f, "pass"),
            PostGuardAction::Redact => write!(f, "redact"),
            PostGuardAction::Block => write!(f, "block"),
        }
    }
}

/// Citation-presence verdict. `NotApplicable` when grounding was not
/// requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationsOk {
    Yes,
    No,
    NotApplicable,
}

/// Context the verifier needs about the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostGuardContext {
    pub grounding_required: bool,
}

/// Verification report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostGuardReport {
    pub action: PostGuardAction,
    pub redacted_text: Option<String>,
    pub violations: Vec<Detection>,
    pub toxicity: f64,
    pub citations_ok: CitationsOk,
}

impl PostGuardReport {
    /// Text to surface after applying the verdict; `None` means block.
    pub fn surfaced_text<'a>(&'a self, original: &'a str) -> Option<&'a str> {
        match self.action {
            PostGuardAction::Pass => Some(original),
            PostGuardAction::Redact => self.redacted_text.as_deref(),
            PostGuardAction::Block => None,
        }
    }
}

/// Toxic lexicon for the coarse score. Each hit raises the score; the
/// block threshold corresponds to several distinct hits in a short text.
const TOXIC_TERMS: &[&str] = &[
    "idiot",
    "moron",
    "stupid",
    "worthless",
    "kill yourself",
    "i hate you",
    "go die",
];

/// Markers accepted as evidence of citations.
const CITATION_MARKERS: &[&str] = &["[1]", "[2]", "http://", "https://", "(source:", "according to"];

/// Output verifier. Stateless and shared.
#[derive(Debug, Clone)]
pub struct PostGuard {
    block_toxicity: f64,
}

impl Default for PostGuard {
    fn default() -> Self {
        Self {
            block_toxicity: 0.6,
        }
    }
}

impl PostGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify generated output. Deterministic for the same inputs.
    pub fn verify(&self, text: &str, ctx: &PostGuardContext) -> PostGuardReport {
        let toxicity = toxicity_score(text);
        let citations_ok = if ctx.grounding_required {
            if has_citations(text) {
                CitationsOk::Yes
            } else {
                CitationsOk::No
            }
        } else {
            CitationsOk::NotApplicable
        };

        let mut violations: Vec<Detection> = Vec::new();
        violations.extend(scan::emails(text));
        violations.extend(scan::credit_cards(text));
        violations.extend(scan::government_ids(text));
        violations.extend(scan::phrases(
            text,
            TOXIC_TERMS,
            DetectionCategory::DisallowedContent,
        ));

        if toxicity >= self.block_toxicity || citations_ok == CitationsOk::No {
            return PostGuardReport {
                action: PostGuardAction::Block,
                redacted_text: None,
                violations,
                toxicity,
                citations_ok,
            };
        }

        let pii: Vec<Detection> = violations
            .iter()
            .filter(|d| {
                matches!(
                    d.category,
                    DetectionCategory::Email
                        | DetectionCategory::CreditCard
                        | DetectionCategory::GovernmentId
                )
            })
            .cloned()
            .collect();

        if !pii.is_empty() {
            return PostGuardReport {
                action: PostGuardAction::Redact,
                redacted_text: Some(redact_spans(text, &pii)),
                violations,
                toxicity,
                citations_ok,
            };
        }

        PostGuardReport {
            action: PostGuardAction::Pass,
            redacted_text: None,
            violations,
            toxicity,
            citations_ok,
        }
    }
}

/// Coarse toxicity score in [0, 1]: 0.25 per distinct lexicon hit.
fn toxicity_score(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let hits = TOXIC_TERMS.iter().filter(|t| lowered.contains(*t)).count();
    (hits as f64 * 0.25).min(1.0)
}

fn has_citations(text: &str) -> bool {
    let lowered = text.to_lowercase();
    CITATION_MARKERS.iter().any(|m| lowered.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_output_passes() {
        let report = PostGuard::new().verify("The answer is 42.", &PostGuardContext::default());
        assert_eq!(report.action, PostGuardAction::Pass);
        assert_eq!(report.citations_ok, CitationsOk::NotApplicable);
        assert_eq!(report.toxicity, 0.0);
    }

    #[test]
    fn leaked_pii_is_redacted() {
        let report = PostGuard::new().verify(
            "Reach the author at author@example.org for details.",
            &PostGuardContext::default(),
        );
        assert_eq!(report.action, PostGuardAction::Redact);
        let redacted = report.redacted_text.as_deref().unwrap();
        assert!(redacted.contains("<REDACTED:EMAIL>"));
        assert!(!redacted.contains("author@example.org"));
    }

    #[test]
    fn toxic_output_blocked() {
        let report = PostGuard::new().verify(
            "You idiot, you moron, this is stupid.",
            &PostGuardContext::default(),
        );
        assert_eq!(report.action, PostGuardAction::Block);
        assert!(report.toxicity >= 0.6);
        assert!(report.surfaced_text("x").is_none());
    }

    #[test]
    fn grounding_without_citations_blocks() {
        let ctx = PostGuardContext {
            grounding_required: true,
        };
        let report = PostGuard::new().verify("Paris is the capital of France.", &ctx);
        assert_eq!(report.action, PostGuardAction::Block);
        assert_eq!(report.citations_ok, CitationsOk::No);
    }

    #[test]
    fn grounding_with_citations_passes() {
        let ctx = PostGuardContext {
            grounding_required: true,
        };
        let report = PostGuard::new().verify(
            "Paris is the capital of France [1] (source: atlas).",
            &ctx,
        );
        assert_eq!(report.action, PostGuardAction::Pass);
        assert_eq!(report.citations_ok, CitationsOk::Yes);
    }

    #[test]
    fn deterministic_for_same_input() {
        let guard = PostGuard::new();
        let ctx = PostGuardContext::default();
        let a = guard.verify("hello there", &ctx);
        let b = guard.verify("hello there", &ctx);
        assert_eq!(a.action, b.action);
        assert_eq!(a.toxicity, b.toxicity);
    }
}
