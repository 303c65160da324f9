//! Term drift: which vocabulary moved toward or away from an archetype's
//! centroid between windows.
//!
//! The reference vocabulary is derived once from the listing corpus
//! (high-frequency unigrams and bigrams) and embedded through the same model
//! as everything else; per-window diffs then only cost cosine arithmetic.

use std::collections::HashMap;

use anyhow::{Context, Result};

use quarry_embed::{Embedder, cosine_similarity};

/// Similarity change a term must show before it counts as gained or lost.
const DRIFT_DELTA: f64 = 0.02;
/// How many gained/lost terms are kept per diff.
const TOP_TERMS: usize = 10;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "was", "has", "are", "not", "this", "that",
    "with", "from", "have", "you", "can", "its", "will", "but", "they",
    "all", "been", "also", "into", "more", "than", "when", "who", "what",
    "how", "out", "our", "new", "now", "role", "work", "team", "experience",
];

#[derive(Debug, Clone, Default)]
pub struct TermDrift {
    pub gained: Vec<String>,
    pub lost: Vec<String>,
}

pub struct ReferenceVocabulary {
    terms: Vec<(String, Vec<f32>)>,
}

impl ReferenceVocabulary {
    /// High-frequency unigrams and bigrams from the corpus, most frequent
    /// first, capped at `max_terms`.
    pub fn derive_terms(corpus: &[String], max_terms: usize) -> Vec<String> {
        let mut frequency: HashMap<String, usize> = HashMap::new();
        for text in corpus {
            let words: Vec<String> = text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| t.len() >= 3)
                .map(|t| t.to_lowercase())
                .filter(|t| !STOP_WORDS.contains(&t.as_str()))
                .collect();
            for word in &words {
                *frequency.entry(word.clone()).or_default() += 1;
            }
            for pair in words.windows(2) {
                *frequency.entry(format!("{} {}", pair[0], pair[1])).or_default() += 1;
            }
        }

        let mut ranked: Vec<(String, usize)> = frequency
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.into_iter().take(max_terms).map(|(t, _)| t).collect()
    }

    pub async fn build(
        corpus: &[String],
        max_terms: usize,
        embedder: &dyn Embedder,
    ) -> Result<Self> {
        let terms = Self::derive_terms(corpus, max_terms);
        let vectors = embedder
            .embed_batch(&terms)
            .await
            .context("embedding reference vocabulary")?;
        Ok(Self {
            terms: terms.into_iter().zip(vectors).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Terms whose similarity to the centroid rose (gained) or fell (lost)
    /// by more than the drift delta between windows, strongest movement
    /// first, top-N each.
    pub fn diff(&self, previous_centroid: &[f32], current_centroid: &[f32]) -> TermDrift {
        let mut gained: Vec<(String, f64)> = Vec::new();
        let mut lost: Vec<(String, f64)> = Vec::new();

        for (term, vector) in &self.terms {
            let before = cosine_similarity(vector, previous_centroid);
            let after = cosine_similarity(vector, current_centroid);
            let change = after - before;
            if change > DRIFT_DELTA {
                gained.push((term.clone(), change));
            } else if change < -DRIFT_DELTA {
                lost.push((term.clone(), -change));
            }
        }

        gained.sort_by(|a, b| b.1.total_cmp(&a.1));
        lost.sort_by(|a, b| b.1.total_cmp(&a.1));
        TermDrift {
            gained: gained.into_iter().take(TOP_TERMS).map(|(t, _)| t).collect(),
            lost: lost.into_iter().take(TOP_TERMS).map(|(t, _)| t).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_terms_ranks_by_frequency_and_includes_bigrams() {
        let corpus = vec![
            "snowflake migration and snowflake modelling".to_string(),
            "snowflake migration again".to_string(),
            "airflow orchestration".to_string(),
        ];
        let terms = ReferenceVocabulary::derive_terms(&corpus, 10);
        assert_eq!(terms.first().map(String::as_str), Some("snowflake"));
        assert!(terms.contains(&"snowflake migration".to_string()));
        // Single-occurrence terms are noise, not vocabulary.
        assert!(!terms.contains(&"orchestration".to_string()));
    }

    #[test]
    fn diff_separates_gained_from_lost() {
        let vocabulary = ReferenceVocabulary {
            terms: vec![
                ("lakehouse".to_string(), vec![1.0, 0.0]),
                ("hadoop".to_string(), vec![0.0, 1.0]),
                ("python".to_string(), vec![0.7, 0.7]),
            ],
        };
        // The centroid swings from the hadoop axis toward the lakehouse axis.
        let drift = vocabulary.diff(&[0.0, 1.0], &[1.0, 0.0]);
        assert_eq!(drift.gained, vec!["lakehouse".to_string()]);
        assert_eq!(drift.lost, vec!["hadoop".to_string()]);
    }

    #[test]
    fn movement_inside_the_delta_is_ignored() {
        let vocabulary = ReferenceVocabulary {
            terms: vec![("python".to_string(), vec![1.0, 0.0])],
        };
        let drift = vocabulary.diff(&[1.0, 0.0], &[1.0, 0.001]);
        assert!(drift.gained.is_empty());
        assert!(drift.lost.is_empty());
    }
}
