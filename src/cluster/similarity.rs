//! Semantic similarity between findings.
//!
//! Score in [0, 1]:
//! - 0 when the criteria differ
//! - 1 when the cluster keys are equal
//! - otherwise the Jaccard overlap of the token sets of `selector + details`,
//!   tokens being NFKC-normalised, lowercased alphanumeric runs
//!
//! Symmetric and deterministic; no randomness, no external model.

use std::collections::BTreeSet;

use unicode_normalization::UnicodeNormalization;

use super::key::ClusterKey;
use crate::core::Finding;

/// Precomputed comparison data for one finding
#[derive(Debug, Clone)]
pub struct Signature {
    pub key: ClusterKey,
    pub tokens: BTreeSet<String>,
}

impl Signature {
    pub fn of(finding: &Finding) -> Self {
        let text = format!("{} {}", finding.selector(), finding.details());
        Self {
            key: ClusterKey::derive(finding),
            tokens: tokenize(&text),
        }
    }
}

/// NFKC, lowercase, split on anything that is not alphanumeric
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let normalized: String = text.nfkc().collect::<String>().to_lowercase();
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// |a ∩ b| / |a ∪ b|, 0 for two empty sets
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

pub fn similarity(a: &Signature, b: &Signature) -> f64 {
    if a.key.criterion != b.key.criterion {
        0.0
    } else if a.key == b.key {
        1.0
    } else {
        jaccard(&a.tokens, &b.tokens)
    }
}

/// Convenience for one-off comparisons
pub fn finding_similarity(a: &Finding, b: &Finding) -> f64 {
    similarity(&Signature::of(a), &Signature::of(b))
}
