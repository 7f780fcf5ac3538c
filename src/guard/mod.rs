//! Safety sandwich: PreGuard on input, PostGuard on output
//!
//! Both guards are deterministic, never touch the network, and share the
//! span scanners in this module. Detection works over the raw text with
//! byte-offset spans so redaction can splice stable placeholder tokens in
//! place of the sensitive content.

pub mod post;
pub mod pre;

pub use post::{CitationsOk, PostGuard, PostGuardAction, PostGuardContext, PostGuardReport};
pub use pre::{PreGuard, PreGuardAction, PreGuardReport};

use serde::{Deserialize, Serialize};

/// Category of a detected span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionCategory {
    Email,
    Phone,
    CreditCard,
    GovernmentId,
    PromptInjection,
    DisallowedContent,
}

impl DetectionCategory {
    /// Stable placeholder token spliced in for sanitized spans.
    pub fn placeholder(&self) -> &'static str {
        match self {
            DetectionCategory::Email => "<REDACTED:EMAIL>",
            DetectionCategory::Phone => "<REDACTED:PHONE>",
            DetectionCategory::CreditCard => "<REDACTED:CARD>",
            DetectionCategory::GovernmentId => "<REDACTED:GOV_ID>",
            DetectionCategory::PromptInjection => "<BLOCKED:INJECTION>",
            DetectionCategory::DisallowedContent => "<BLOCKED:CONTENT>",
        }
    }
}

/// One detected span. The matched text itself is never stored, only its
/// location and category, so reports are safe to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub category: DetectionCategory,
    pub start: usize,
    pub end: usize,
}

/// Byte-offset span scanners shared by both guards.
pub(crate) mod scan {
    use super::{Detection, DetectionCategory};

    /// Scan for email-shaped tokens.
    pub fn emails(text: &str) -> Vec<Detection> {
        let mut out = Vec::new();
        for (start, word) in words(text) {
            if let Some(at) = word.find('@') {
                let domain = &word[at + 1..];
                if at > 0 && domain.contains('.') && !domain.ends_with('.') {
                    out.push(Detection {
                        category: DetectionCategory::Email,
                        start,
                        end: start + word.len(),
                    });
                }
            }
        }
        out
    }

    /// Scan for phone-like digit groups: 10-11 digits allowing separators.
    pub fn phones(text: &str) -> Vec<Detection> {
        digit_runs(text, 10, 11, DetectionCategory::Phone)
    }

    /// Scan for credit-card-like runs: 13-19 digits allowing separators.
    pub fn credit_cards(text: &str) -> Vec<Detection> {
        digit_runs(text, 13, 19, DetectionCategory::CreditCard)
    }

    /// Scan for SSN-shaped government ids (ddd-dd-dddd).
    pub fn government_ids(text: &str) -> Vec<Detection> {
        let bytes = text.as_bytes();
        let mut out = Vec::new();
        let pattern_len = 11;
        if bytes.len() < pattern_len {
            return out;
        }
        for start in 0..=bytes.len() - pattern_len {
            let window = &bytes[start..start + pattern_len];
            let shaped = window.iter().enumerate().all(|(i, b)| match i {
                3 | 6 => *b == b'-',
                _ => b.is_ascii_digit(),
            });
            let bounded_left = start == 0 || !bytes[start - 1].is_ascii_digit();
            let bounded_right = start + pattern_len == bytes.len()
                || !bytes[start + pattern_len].is_ascii_digit();
            if shaped && bounded_left && bounded_right {
                out.push(Detection {
                    category: DetectionCategory::GovernmentId,
                    start,
                    end: start + pattern_len,
                });
            }
        }
        out
    }

    /// Case-insensitive phrase scan, returning the span of each hit.
    pub fn phrases(
        text: &str,
        needles: &[&str],
        category: DetectionCategory,
    ) -> Vec<Detection> {
        let lowered = text.to_lowercase();
        let mut out = Vec::new();
        for needle in needles {
            let mut from = 0;
            while let Some(pos) = lowered[from..].find(needle) {
                let start = from + pos;
                out.push(Detection {
                    category,
                    start,
                    end: start + needle.len(),
                });
                from = start + needle.len();
            }
        }
        out
    }

    fn words(text: &str) -> Vec<(usize, &str)> {
        let mut out = Vec::new();
        let mut start = None;
        for (i, ch) in text.char_indices() {
            if ch.is_whitespace() {
                if let Some(s) = start.take() {
                    out.push((s, &text[s..i]));
                }
            } else if start.is_none() {
                start = Some(i);
            }
        }
        if let Some(s) = start {
            out.push((s, &text[s..]));
        }
        out
    }

    /// Runs of digits (separators `space - ( )` allowed inside) whose digit
    /// count falls within `[min, max]`. A run bordered by more digits is
    /// not a hit.
    fn digit_runs(
        text: &str,
        min: usize,
        max: usize,
        category: DetectionCategory,
    ) -> Vec<Detection> {
        let bytes = text.as_bytes();
        let mut out = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if !bytes[i].is_ascii_digit() {
                i += 1;
                continue;
            }
            let start = i;
            let mut digits = 0usize;
            let mut end = i;
            while i < bytes.len() {
                let b = bytes[i];
                if b.is_ascii_digit() {
                    digits += 1;
                    end = i + 1;
                    i += 1;
                } else if matches!(b, b' ' | b'-' | b'(' | b')')
                    && i + 1 < bytes.len()
                    && bytes[i + 1].is_ascii_digit()
                {
                    i += 1;
                } else {
                    break;
                }
            }
            if (min..=max).contains(&digits) {
                out.push(Detection {
                    category,
                    start,
                    end,
                });
            }
        }
        out
    }
}

/// Splice placeholders over the detected spans, right to left so earlier
/// offsets stay valid.
pub(crate) fn redact_spans(text: &str, detections: &[Detection]) -> String {
    let mut spans: Vec<&Detection> = detections.iter().collect();
    spans.sort_by_key(|d| d.start);
    spans.dedup_by(|a, b| a.start < b.end && b.start < a.end);
    let mut out = text.to_string();
    for det in spans.iter().rev() {
        if det.end <= out.len()
            && out.is_char_boundary(det.start)
            && out.is_char_boundary(det.end)
        {
            out.replace_range(det.start..det.end, det.category.placeholder());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_scan_finds_span() {
        let hits = scan::emails("contact bob@example.com today");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, DetectionCategory::Email);
        assert_eq!(&"contact bob@example.com today"[hits[0].start..hits[0].end], "bob@example.com");
    }

    #[test]
    fn placeholder_is_not_redetected() {
        let redacted = redact_spans("mail bob@example.com", &scan::emails("mail bob@example.com"));
        assert_eq!(redacted, "mail <REDACTED:EMAIL>");
        assert!(scan::emails(&redacted).is_empty());
    }

    #[test]
    fn card_and_phone_runs_disambiguate_by_length() {
        let text = "call 415-555-0123 or pay with 4111 1111 1111 1111";
        let phones = scan::phones(text);
        let cards = scan::credit_cards(text);
        assert_eq!(phones.len(), 1);
        assert_eq!(cards.len(), 1);
        assert!(cards[0].start > phones[0].end);
    }

    #[test]
    fn ssn_shape_detected() {
        let hits = scan::government_ids("ssn is 123-45-6789 ok");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn redaction_handles_multiple_spans() {
        let text = "a@b.co and c@d.org";
        let out = redact_spans(text, &scan::emails(text));
        assert_eq!(out, "<REDACTED:EMAIL> and <REDACTED:EMAIL>");
    }
}
