//! Market drift tracking: rolling centroids, term diffs, and the
//! three-condition rewrite trigger.

mod centroid;
mod terms;
mod trigger;

pub use centroid::{alignment, shift_between, staleness, window_centroid};
pub use terms::{ReferenceVocabulary, TermDrift};
pub use trigger::{HoldReason, RewriteReport, TriggerVerdict, evaluate_rewrite};
