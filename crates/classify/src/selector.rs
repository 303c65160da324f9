//! Variant selection: which resume goes out for a scored listing, and
//! whether the listing is worth applying to at all.

use quarry_store::{Archetype, ArchetypeScores};

/// The selector's verdict, recorded verbatim on the application at emission.
#[derive(Debug, Clone)]
pub struct SelectionDecision {
    pub archetype: Archetype,
    pub top_score: f64,
    pub second_score: f64,
    pub alignment: f64,
    /// top_score x alignment; the queue-admission metric.
    pub combined: f64,
    /// false means the listing is kept for intelligence only.
    pub admitted: bool,
    /// Top two scores within the close-call delta; still queued, but flagged.
    pub needs_review: bool,
    pub rationale: String,
}

/// Pick the top archetype and gate admission on combined score.
///
/// A variant with no alignment yet (no centroid has been computed for its
/// archetype) is treated as fully aligned rather than starving the queue
/// before the first drift window closes.
pub fn select_variant(
    scores: &ArchetypeScores,
    variant_alignment: Option<f64>,
    close_call_delta: f64,
    combined_score_threshold: f64,
) -> SelectionDecision {
    let (archetype, top_score, second_score) = scores.top_two();
    let alignment = variant_alignment.unwrap_or(1.0);
    let combined = top_score * alignment;
    let admitted = combined >= combined_score_threshold;
    let needs_review = (top_score - second_score) < close_call_delta;

    let rationale = format!(
        "top={}:{top_score:.3} second={second_score:.3} alignment={alignment:.3} \
         combined={combined:.3} threshold={combined_score_threshold} admitted={admitted} \
         close_call={needs_review}",
        archetype.slug(),
    );

    SelectionDecision {
        archetype,
        top_score,
        second_score,
        alignment,
        combined,
        admitted,
        needs_review,
        rationale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(builder: f64, fixer: f64, operator: f64, translator: f64) -> ArchetypeScores {
        ArchetypeScores {
            builder,
            fixer,
            operator,
            translator,
        }
    }

    #[test]
    fn strong_listing_with_aligned_variant_is_admitted() {
        let decision = select_variant(&scores(0.6, 0.3, 0.05, 0.05), Some(0.9), 0.10, 0.15);
        assert_eq!(decision.archetype, Archetype::Builder);
        assert!(decision.admitted);
        assert!(!decision.needs_review);
        assert!((decision.combined - 0.54).abs() < 1e-9);
    }

    #[test]
    fn weak_combined_score_routes_to_intelligence_only() {
        // 0.3 x 0.4 = 0.12 < 0.15
        let decision = select_variant(&scores(0.3, 0.25, 0.25, 0.2), Some(0.4), 0.10, 0.15);
        assert!(!decision.admitted);
    }

    #[test]
    fn combined_exactly_at_threshold_is_admitted() {
        let decision = select_variant(&scores(0.3, 0.25, 0.25, 0.2), Some(0.5), 0.10, 0.15);
        assert!(decision.admitted);
    }

    #[test]
    fn gap_of_exactly_the_delta_is_not_a_close_call() {
        let decision = select_variant(&scores(0.40, 0.30, 0.20, 0.10), Some(1.0), 0.10, 0.15);
        assert!(!decision.needs_review);
    }

    #[test]
    fn gap_below_the_delta_is_a_close_call_but_still_selected() {
        let decision = select_variant(&scores(0.38, 0.32, 0.20, 0.10), Some(1.0), 0.10, 0.15);
        assert!(decision.needs_review);
        assert!(decision.admitted);
        assert_eq!(decision.archetype, Archetype::Builder);
    }

    #[test]
    fn missing_alignment_defaults_to_fully_aligned() {
        let decision = select_variant(&scores(0.5, 0.3, 0.1, 0.1), None, 0.10, 0.15);
        assert_eq!(decision.alignment, 1.0);
        assert_eq!(decision.combined, 0.5);
    }

    #[test]
    fn rationale_names_the_winning_archetype() {
        let decision = select_variant(&scores(0.5, 0.3, 0.1, 0.1), Some(0.8), 0.10, 0.15);
        assert!(decision.rationale.contains("top=builder"));
        assert!(decision.rationale.contains("admitted=true"));
    }
}
