//! Listing classification: metadata extraction, archetype scoring against
//! the seed dictionary, and resume variant selection.

mod classifier;
mod metadata;
mod seeds;
mod selector;

pub use classifier::{Classifier, SentenceInput};
pub use metadata::{extract_metadata, extract_tech_tags};
pub use seeds::{ArchetypeSeed, SeedBank, SeedCentroids};
pub use selector::{SelectionDecision, select_variant};
