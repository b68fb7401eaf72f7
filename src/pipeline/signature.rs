//! Signature derivation for evidence normalization
//!
//! Every evidence submission is reduced to a normalized signature through
//! a fixed pipeline: stop-word-filtered keyword extraction, rule-based
//! intent classification, and domain-hint extraction. The signature's
//! deterministic hash is the exact-match key for pattern deduplication.

use crate::pipeline::types::{DomainHint, EvidenceContext, IntentCategory, PatternSignature};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Keyword extraction cap.
pub const MAX_KEYWORDS: usize = 20;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9][a-z0-9'-]+").unwrap());

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "that", "this", "with", "from", "was", "are", "were", "have",
        "has", "had", "not", "but", "can", "could", "would", "should", "will", "about",
        "into", "over", "under", "then", "than", "them", "they", "their", "there", "what",
        "when", "where", "which", "while", "who", "whom", "why", "how", "all", "any",
        "both", "each", "more", "most", "some", "such", "only", "own", "same", "too",
        "very", "just", "because", "been", "being", "does", "doing", "don't", "its",
        "it's", "i'm", "you", "your", "please", "want", "need", "like", "get", "got",
        "make", "made", "did", "didn't", "won't", "also", "out", "our",
    ]
    .into_iter()
    .collect()
});

/// Fixed keyword-to-intent table, checked in order; highest match count
/// wins, ties resolved by table order, falls back to `general`.
static INTENT_TABLE: Lazy<Vec<(IntentCategory, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        (
            IntentCategory::Research,
            vec![
                "research", "find", "search", "discover", "sources", "investigate",
                "lookup", "latest", "news", "papers", "literature",
            ],
        ),
        (
            IntentCategory::Analysis,
            vec![
                "analyze", "analysis", "compare", "comparison", "evaluate", "breakdown",
                "trends", "insights", "metrics", "statistics", "summarize", "summary",
            ],
        ),
        (
            IntentCategory::Creation,
            vec![
                "write", "draft", "create", "generate", "compose", "design", "build",
                "article", "blog", "email", "report", "story", "content",
            ],
        ),
        (
            IntentCategory::Verification,
            vec![
                "verify", "check", "validate", "confirm", "fact", "accuracy", "correct",
                "proofread", "review", "audit",
            ],
        ),
        (
            IntentCategory::Automation,
            vec![
                "automate", "schedule", "workflow", "pipeline", "trigger", "batch",
                "recurring", "sync", "integrate", "export",
            ],
        ),
    ]
});

/// Fixed keyword-to-domain table; every matching domain becomes a hint.
static DOMAIN_TABLE: Lazy<Vec<(DomainHint, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        (
            DomainHint::Medical,
            vec!["medical", "health", "clinical", "patient", "diagnosis", "pharma", "drug"],
        ),
        (
            DomainHint::Legal,
            vec!["legal", "law", "contract", "compliance", "regulation", "policy", "gdpr"],
        ),
        (
            DomainHint::Financial,
            vec![
                "financial", "finance", "invoice", "tax", "accounting", "budget",
                "investment", "trading", "payment",
            ],
        ),
        (
            DomainHint::Technology,
            vec!["code", "software", "api", "technical", "engineering", "deploy", "database"],
        ),
        (
            DomainHint::Education,
            vec!["course", "lesson", "teaching", "curriculum", "student", "quiz", "tutorial"],
        ),
        (
            DomainHint::Commerce,
            vec!["product", "marketing", "sales", "customer", "ecommerce", "campaign", "seo"],
        ),
    ]
});

/// Derive the normalized signature for an evidence submission.
pub fn derive_signature(context: &EvidenceContext) -> PatternSignature {
    let mut text = context.original_request.clone();
    if let Some(reason) = &context.failure_reason {
        text.push(' ');
        text.push_str(reason);
    }

    let keywords = extract_keywords(&text, MAX_KEYWORDS);
    let intent = classify_intent(&keywords);
    let domains = extract_domains(&keywords);

    let mut gap_markers: Vec<String> = context.failed_workflow_id.iter().cloned().collect();
    gap_markers.sort();

    PatternSignature {
        intent,
        keywords,
        domains,
        gap_markers,
    }
}

/// Lowercased, stop-word-filtered keywords in first-occurrence order,
/// capped at `limit`.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for token in TOKEN_RE.find_iter(&lowered) {
        let word = token.as_str();
        if word.len() < 3 || STOP_WORDS.contains(word) {
            continue;
        }
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
            if keywords.len() >= limit {
                break;
            }
        }
    }

    keywords
}

/// Rule-based intent classification against the fixed keyword table.
pub fn classify_intent(keywords: &[String]) -> IntentCategory {
    let keyword_set: HashSet<&str> = keywords.iter().map(String::as_str).collect();

    let mut best = IntentCategory::General;
    let mut best_hits = 0usize;
    for (intent, markers) in INTENT_TABLE.iter() {
        let hits = markers.iter().filter(|m| keyword_set.contains(**m)).count();
        if hits > best_hits {
            best = *intent;
            best_hits = hits;
        }
    }
    best
}

/// Domain hints: every domain with at least one keyword hit, in table order.
pub fn extract_domains(keywords: &[String]) -> Vec<DomainHint> {
    let keyword_set: HashSet<&str> = keywords.iter().map(String::as_str).collect();

    DOMAIN_TABLE
        .iter()
        .filter(|(_, markers)| markers.iter().any(|m| keyword_set.contains(*m)))
        .map(|(domain, _)| *domain)
        .collect()
}

/// Deterministic content hash of a normalized signature: sorted keywords,
/// intent, sorted domains.
pub fn content_hash(signature: &PatternSignature) -> String {
    let mut keywords = signature.keywords.clone();
    keywords.sort();

    let mut domains: Vec<&str> = signature.domains.iter().map(DomainHint::as_str).collect();
    domains.sort_unstable();

    let canonical = format!(
        "{}|{}|{}",
        keywords.join(","),
        signature.intent.as_str(),
        domains.join(",")
    );

    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

/// Flat text rendering of a signature, used as embedding input.
pub fn signature_text(signature: &PatternSignature) -> String {
    let domains: Vec<&str> = signature.domains.iter().map(DomainHint::as_str).collect();
    format!(
        "{} {} {}",
        signature.intent.as_str(),
        signature.keywords.join(" "),
        domains.join(" ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(request: &str, reason: Option<&str>) -> EvidenceContext {
        EvidenceContext {
            original_request: request.to_string(),
            failure_reason: reason.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_keywords_filter_stop_words_and_cap() {
        let words = extract_keywords("the quick brown fox jumps over the lazy dog", 20);
        assert!(!words.contains(&"the".to_string()));
        assert!(words.contains(&"quick".to_string()));

        let long_text = (0..50).map(|i| format!("unique{}", i)).collect::<Vec<_>>().join(" ");
        assert_eq!(extract_keywords(&long_text, MAX_KEYWORDS).len(), MAX_KEYWORDS);
    }

    #[test]
    fn test_keywords_dedupe_preserving_first_occurrence() {
        let words = extract_keywords("compare compare prices prices compare", 20);
        assert_eq!(words, vec!["compare".to_string(), "prices".to_string()]);
    }

    #[test]
    fn test_intent_classification_falls_back_to_general() {
        let sig = derive_signature(&ctx("hello there friend", None));
        assert_eq!(sig.intent, IntentCategory::General);
    }

    #[test]
    fn test_intent_classification_picks_dominant_table() {
        let sig = derive_signature(&ctx(
            "research and find the latest papers and sources on a topic",
            None,
        ));
        assert_eq!(sig.intent, IntentCategory::Research);
    }

    #[test]
    fn test_domain_hints_extracted() {
        let sig = derive_signature(&ctx(
            "analyze clinical trial data for a patient cohort",
            None,
        ));
        assert_eq!(sig.domains, vec![DomainHint::Medical]);
    }

    #[test]
    fn test_hash_is_order_insensitive_over_keywords() {
        let a = PatternSignature {
            intent: IntentCategory::Research,
            keywords: vec!["alpha".into(), "beta".into()],
            domains: vec![],
            gap_markers: vec![],
        };
        let b = PatternSignature {
            intent: IntentCategory::Research,
            keywords: vec!["beta".into(), "alpha".into()],
            domains: vec![],
            gap_markers: vec![],
        };
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_hash_differs_across_intents() {
        let a = PatternSignature {
            intent: IntentCategory::Research,
            keywords: vec!["alpha".into()],
            domains: vec![],
            gap_markers: vec![],
        };
        let mut b = a.clone();
        b.intent = IntentCategory::Creation;
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_failure_reason_contributes_to_signature() {
        let with_reason = derive_signature(&ctx("summarize my meeting", Some("output too shallow")));
        assert!(with_reason.keywords.contains(&"shallow".to_string()));
    }
}
