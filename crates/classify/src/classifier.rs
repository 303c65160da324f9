//! Archetype scoring.
//!
//! Deterministic given the listing text, the seed dictionary, and the
//! embedding model version.  Sentence embeddings are optional: when absent
//! (no model service reachable) the verb-pattern and indicator signals carry
//! the classification alone.

use anyhow::Result;
use tracing::trace;

use quarry_embed::cosine_similarity;
use quarry_store::{Archetype, ArchetypeScores, RoleType};

use crate::seeds::{SeedBank, SeedCentroids};

/// Points awarded per verb-pattern match in a sentence.
const VERB_PATTERN_POINTS: f64 = 1.0;
/// Points awarded per indicator phrase in a sentence.
const INDICATOR_POINTS: f64 = 0.5;
/// Weight of the seed-centroid similarity term.
const EMBEDDING_WEIGHT: f64 = 0.3;
/// Similarity below this contributes nothing.
const EMBEDDING_FLOOR: f64 = 0.5;
/// Role-type prior applied before normalisation.
const PRIOR_MAJOR: f64 = 0.1;
const PRIOR_MINOR: f64 = 0.05;

/// One sentence of listing text, with its embedding when available.
#[derive(Debug, Clone)]
pub struct SentenceInput {
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

impl SentenceInput {
    pub fn bare(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            embedding: None,
        }
    }
}

pub struct Classifier {
    bank: SeedBank,
}

impl Classifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            bank: SeedBank::compile()?,
        })
    }

    pub fn bank(&self) -> &SeedBank {
        &self.bank
    }

    /// Split listing text into sentences on terminal punctuation and
    /// newlines.  Bullet-style JDs arrive as one fragment per line.
    pub fn split_sentences(text: &str) -> Vec<String> {
        text.split(|c: char| matches!(c, '.' | '!' | '?' | '\n' | '\r' | ';' | '•'))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Score sentences against the seed dictionary, apply the role-type
    /// prior, and normalise.
    pub fn classify(
        &self,
        sentences: &[SentenceInput],
        role_type: RoleType,
        seed_centroids: Option<&SeedCentroids>,
    ) -> ArchetypeScores {
        let mut raw = ArchetypeScores::default();

        for sentence in sentences {
            let lowered = sentence.text.to_lowercase();
            for seed in self.bank.iter() {
                let mut points = 0.0;
                for pattern in &seed.verb_patterns {
                    if pattern.is_match(&sentence.text) {
                        points += VERB_PATTERN_POINTS;
                    }
                }
                for indicator in seed.indicators {
                    if lowered.contains(indicator) {
                        points += INDICATOR_POINTS;
                    }
                }
                if let (Some(embedding), Some(centroids)) =
                    (sentence.embedding.as_deref(), seed_centroids)
                {
                    if let Some(centroid) = centroids.get(seed.archetype) {
                        let similarity = cosine_similarity(embedding, centroid);
                        if similarity >= EMBEDDING_FLOOR {
                            points += similarity * EMBEDDING_WEIGHT;
                        }
                    }
                }
                if points > 0.0 {
                    trace!(
                        archetype = seed.archetype.slug(),
                        points,
                        sentence = %sentence.text,
                        "sentence scored"
                    );
                    raw.add(seed.archetype, points);
                }
            }
        }

        apply_role_prior(&mut raw, role_type);
        raw.normalised()
    }

    /// Convenience path for ad-hoc text with no embeddings (the `classify`
    /// CLI command).
    pub fn classify_text(&self, text: &str, role_type: RoleType) -> ArchetypeScores {
        let sentences: Vec<SentenceInput> = Self::split_sentences(text)
            .into_iter()
            .map(SentenceInput::bare)
            .collect();
        self.classify(&sentences, role_type, None)
    }
}

/// Contract work skews toward project-shaped roles (build, migrate);
/// permanent work skews toward stewardship (operate, translate).
fn apply_role_prior(scores: &mut ArchetypeScores, role_type: RoleType) {
    match role_type {
        RoleType::Contract => {
            scores.add(Archetype::Builder, PRIOR_MAJOR);
            scores.add(Archetype::Fixer, PRIOR_MAJOR);
            scores.add(Archetype::Operator, -PRIOR_MINOR);
            scores.add(Archetype::Translator, -PRIOR_MINOR);
        }
        RoleType::Permanent => {
            scores.add(Archetype::Builder, -PRIOR_MAJOR);
            scores.add(Archetype::Fixer, -PRIOR_MAJOR);
            scores.add(Archetype::Operator, PRIOR_MINOR);
            scores.add(Archetype::Translator, PRIOR_MINOR);
        }
        RoleType::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seeds::SeedCentroids;

    fn classifier() -> Classifier {
        Classifier::new().expect("classifier compiles")
    }

    #[test]
    fn greenfield_contract_listing_scores_builder_first() {
        let scores = classifier().classify_text(
            "We need you to design and implement a new cloud-native data platform from the ground up.",
            RoleType::Contract,
        );

        assert!(scores.sums_to_one());
        assert_eq!(scores.primary(), Archetype::Builder);
        assert!(scores.builder >= 0.50, "builder = {}", scores.builder);
        assert!(scores.builder > scores.fixer);
        assert!(scores.fixer > scores.operator);
        assert!(scores.fixer > scores.translator);
        // The contract prior is the only fixer signal in this text.
        assert!(scores.fixer > 0.0);
    }

    #[test]
    fn migration_listing_scores_fixer_and_is_not_a_close_call() {
        let scores = classifier().classify_text(
            "Migrate legacy Redshift warehouse to Snowflake and retire aging ETL.",
            RoleType::Unknown,
        );

        assert_eq!(scores.primary(), Archetype::Fixer);
        let (_, top, second) = scores.top_two();
        assert!(top >= 0.5);
        assert!(top - second >= 0.10, "top={top} second={second}");
    }

    #[test]
    fn signal_free_text_yields_the_uniform_map() {
        let scores = classifier().classify_text(
            "Friendly office with good coffee near the station.",
            RoleType::Unknown,
        );
        assert_eq!(scores, ArchetypeScores::uniform());
    }

    #[test]
    fn contract_prior_shifts_weight_toward_builder_and_fixer() {
        let text = "Maintain and support the existing reporting platform.";
        let neutral = classifier().classify_text(text, RoleType::Unknown);
        let contract = classifier().classify_text(text, RoleType::Contract);

        assert_eq!(neutral.primary(), Archetype::Operator);
        assert_eq!(contract.primary(), Archetype::Operator);
        assert!(contract.builder > neutral.builder);
        assert!(contract.operator < neutral.operator);
    }

    #[test]
    fn embedding_similarity_supplements_unseen_phrasings() {
        let classifier = classifier();
        let centroids = SeedCentroids::from_parts(vec![(
            Archetype::Translator,
            vec![1.0, 0.0],
        )]);

        // No verb pattern or indicator fires on this sentence; only the
        // similarity term carries it.
        let sentences = vec![SentenceInput {
            text: "Act as the go-between for product and analytics".to_string(),
            embedding: Some(vec![1.0, 0.0]),
        }];
        let scores = classifier.classify(&sentences, RoleType::Unknown, Some(&centroids));
        assert_eq!(scores.primary(), Archetype::Translator);
        assert!(scores.translator > 0.9);
    }

    #[test]
    fn similarity_below_the_floor_contributes_nothing() {
        let classifier = classifier();
        let centroids = SeedCentroids::from_parts(vec![(
            Archetype::Translator,
            vec![1.0, 0.0],
        )]);

        // cos([0.49, 0.872], [1, 0]) ≈ 0.49 < 0.5
        let sentences = vec![SentenceInput {
            text: "Act as the go-between for product and analytics".to_string(),
            embedding: Some(vec![0.49, 0.872]),
        }];
        let scores = classifier.classify(&sentences, RoleType::Unknown, Some(&centroids));
        assert_eq!(scores, ArchetypeScores::uniform());
    }

    #[test]
    fn sentences_split_on_punctuation_and_lines() {
        let sentences = Classifier::split_sentences(
            "Build pipelines. Support production!\n• Run workshops; mentor analysts",
        );
        assert_eq!(
            sentences,
            vec![
                "Build pipelines",
                "Support production",
                "Run workshops",
                "mentor analysts"
            ]
        );
    }
}
