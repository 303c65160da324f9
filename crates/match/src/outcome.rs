//! Rule-based outcome classification of inbound messages.
//!
//! Case-insensitive substring matching against per-category keyword lists.
//! Confidence is matches over list size for the winning category; when two
//! categories score the same confidence the higher-priority one wins
//! (interview > rejected > viewed > acknowledged).

use quarry_store::OutcomeStage;

struct OutcomeRule {
    stage: OutcomeStage,
    keywords: &'static [&'static str],
}

/// Highest priority first.
const RULES: &[OutcomeRule] = &[
    OutcomeRule {
        stage: OutcomeStage::Interview,
        keywords: &[
            "interview",
            "schedule a time",
            "phone screen",
            "speak with you",
            "meet the team",
            "your availability",
            "book a call",
            "next steps",
        ],
    },
    OutcomeRule {
        stage: OutcomeStage::Rejected,
        keywords: &[
            "unfortunately",
            "not be progressing",
            "other candidates",
            "unsuccessful",
            "will not be moving forward",
            "position has been filled",
            "regret to inform",
            "decided not to proceed",
        ],
    },
    OutcomeRule {
        stage: OutcomeStage::Viewed,
        keywords: &[
            "viewed your application",
            "reviewing your application",
            "under review",
            "shortlist",
        ],
    },
    OutcomeRule {
        stage: OutcomeStage::Acknowledged,
        keywords: &[
            "received your application",
            "thank you for applying",
            "application received",
            "successfully submitted",
            "confirm receipt",
        ],
    },
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeCall {
    /// None when no category matched ("other").
    pub stage: Option<OutcomeStage>,
    pub confidence: f64,
}

pub fn classify_outcome(text: &str) -> OutcomeCall {
    let lowered = text.to_lowercase();
    let mut best: Option<(OutcomeStage, f64)> = None;

    // RULES is priority-ordered, so a strict `>` keeps the higher-priority
    // category on equal confidence.
    for rule in RULES {
        let matches = rule
            .keywords
            .iter()
            .filter(|k| lowered.contains(*k))
            .count();
        if matches == 0 {
            continue;
        }
        let confidence = matches as f64 / rule.keywords.len() as f64;
        if best.map(|(_, c)| confidence > c).unwrap_or(true) {
            best = Some((rule.stage, confidence));
        }
    }

    match best {
        Some((stage, confidence)) => OutcomeCall {
            stage: Some(stage),
            confidence,
        },
        None => OutcomeCall {
            stage: None,
            confidence: 0.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interview_keywords_classify_as_interview() {
        let call = classify_outcome("Great news — we'd love to schedule a time to chat.");
        assert_eq!(call.stage, Some(OutcomeStage::Interview));
        assert!(call.confidence > 0.0);
    }

    #[test]
    fn rejection_with_more_matches_beats_a_stray_interview_mention() {
        let call = classify_outcome(
            "Thank you for attending the interview. Unfortunately we will not be moving forward; \
             we decided not to proceed and wish you well against other candidates.",
        );
        assert_eq!(call.stage, Some(OutcomeStage::Rejected));
    }

    #[test]
    fn equal_confidence_resolves_by_priority() {
        // One interview keyword (of 8) and one rejection keyword (of 8):
        // equal confidence, interview wins on priority.
        let call = classify_outcome("We can schedule a time, though unfortunately not this week.");
        assert_eq!(call.stage, Some(OutcomeStage::Interview));
    }

    #[test]
    fn acknowledgement_classifies_with_proportional_confidence() {
        let call = classify_outcome("We have received your application. Application received!");
        assert_eq!(call.stage, Some(OutcomeStage::Acknowledged));
        assert!((call.confidence - 2.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn unmatched_text_is_other() {
        let call = classify_outcome("Quarterly newsletter: what's new in our data team.");
        assert_eq!(call.stage, None);
        assert_eq!(call.confidence, 0.0);
    }
}
