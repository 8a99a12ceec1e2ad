//! Text similarity scoring
//!
//! Loop detection compares free-form text (error messages, consultation
//! requests) for "meaning the same thing". The scorer sits behind a trait so
//! an embedding-backed implementation can replace the lexical default.

use std::collections::HashMap;

/// Consultations scoring strictly above this are the same request
pub const COLLABORATION_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Failures scoring strictly above this are the same failure
pub const FAILURE_SIMILARITY_THRESHOLD: f64 = 0.95;

/// Scores semantic similarity of two texts in `[0, 1]`
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Cosine similarity over lowercase alphanumeric token counts
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalSimilarity;

impl LexicalSimilarity {
    fn term_counts(text: &str) -> HashMap<String, f64> {
        let mut counts = HashMap::new();
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            *counts.entry(token.to_lowercase()).or_insert(0.0) += 1.0;
        }
        counts
    }
}

impl SimilarityScorer for LexicalSimilarity {
    fn score(&self, a: &str, b: &str) -> f64 {
        let left = Self::term_counts(a);
        let right = Self::term_counts(b);

        match (left.is_empty(), right.is_empty()) {
            (true, true) => return 1.0,
            (true, false) | (false, true) => return 0.0,
            _ => {}
        }

        let dot: f64 = left
            .iter()
            .filter_map(|(term, l)| right.get(term).map(|r| l * r))
            .sum();
        let norm_left = left.values().map(|v| v * v).sum::<f64>().sqrt();
        let norm_right = right.values().map(|v| v * v).sum::<f64>().sqrt();

        (dot / (norm_left * norm_right)).clamp(0.0, 1.0)
    }
}
