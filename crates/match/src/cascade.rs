//! The cascade matcher: domain → title → tech overlap → date proximity.
//!
//! Each step narrows the candidate set of open applications and refines a
//! score; the decision rule at the end either auto-matches a single
//! confident candidate, queues a ranked shortlist for manual review, or
//! gives up.  Ambiguity is not an error here.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use strsim::jaro_winkler;
use tracing::debug;
use uuid::Uuid;

use quarry_store::{KnownSender, OpenApplication};

use crate::parse::root_label;

/// Most candidates kept on a manual-review shortlist.
const REVIEW_SHORTLIST: usize = 3;
/// Per-tag bonus for listing technologies mentioned in the body.
const TECH_TAG_BONUS: f64 = 0.1;
/// Date-proximity bonuses.
const DATE_NEAR_BONUS: f64 = 0.2;
const DATE_FAR_BONUS: f64 = 0.1;
const DATE_NEAR_DAYS: i64 = 30;
const DATE_FAR_DAYS: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct CascadeConfig {
    /// Entity similarity required against a KnownSender's recorded entity.
    pub known_sender_similarity: f64,
    /// Entity similarity required against the raw domain root label.
    pub domain_label_similarity: f64,
    /// Title token overlap below which a candidate is dropped.
    pub title_overlap_min: f64,
    /// Score a lone surviving candidate must exceed to auto-match.
    pub auto_confidence: f64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            known_sender_similarity: 0.7,
            domain_label_similarity: 0.5,
            title_overlap_min: 0.2,
            auto_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub application_id: Uuid,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub enum MatchDecision {
    Auto(RankedCandidate),
    NeedsReview(Vec<RankedCandidate>),
    Unmatched,
}

/// Run the cascade for an inbound message.
///
/// `known_sender` short-circuits the domain step: the recorded hiring entity
/// is trusted over the raw domain label.
pub fn cascade_match(
    sender_domain: &str,
    subject: &str,
    body: &str,
    received_at: DateTime<Utc>,
    known_sender: Option<&KnownSender>,
    open: &[OpenApplication],
    config: &CascadeConfig,
) -> MatchDecision {
    // 1. Domain: restrict to applications whose hiring entity matches the
    //    sender's identity.
    let survivors: Vec<&OpenApplication> = match known_sender {
        Some(sender) => open
            .iter()
            .filter(|app| {
                entity_similarity(&app.listing_company, &sender.company)
                    > config.known_sender_similarity
            })
            .collect(),
        None => {
            let label = root_label(sender_domain);
            open.iter()
                .filter(|app| {
                    entity_similarity(&app.listing_company, label) > config.domain_label_similarity
                })
                .collect()
        }
    };
    if survivors.is_empty() {
        return MatchDecision::Unmatched;
    }

    // 2–4. Title overlap is the base score; tech and recency refine it.
    let message_tokens = tokenize(&format!("{subject} {body}"));
    let body_lower = body.to_lowercase();
    let mut ranked: Vec<RankedCandidate> = Vec::new();
    for app in survivors {
        let overlap = title_overlap(&app.listing_title, &message_tokens);
        if overlap < config.title_overlap_min {
            continue;
        }
        let tech_hits = app
            .tech_tags
            .iter()
            .filter(|tag| contains_word(&body_lower, &tag.to_lowercase()))
            .count();
        let score = overlap
            + TECH_TAG_BONUS * tech_hits as f64
            + date_proximity_bonus(app.application.submitted_at, received_at);
        debug!(
            application = %app.application.id,
            overlap,
            tech_hits,
            score,
            "cascade candidate scored"
        );
        ranked.push(RankedCandidate {
            application_id: app.application.id,
            score,
        });
    }

    decide(ranked, config.auto_confidence)
}

/// Call-log entries flow through the same narrowing using the entity, title,
/// and date the caller provided.
pub fn match_call_log(
    company: &str,
    title: &str,
    called_at: DateTime<Utc>,
    open: &[OpenApplication],
    config: &CascadeConfig,
) -> MatchDecision {
    let survivors: Vec<&OpenApplication> = open
        .iter()
        .filter(|app| {
            entity_similarity(&app.listing_company, company) > config.domain_label_similarity
        })
        .collect();
    if survivors.is_empty() {
        return MatchDecision::Unmatched;
    }

    let call_tokens = tokenize(title);
    let mut ranked: Vec<RankedCandidate> = Vec::new();
    for app in survivors {
        let overlap = title_overlap(&app.listing_title, &call_tokens);
        if overlap < config.title_overlap_min {
            continue;
        }
        let score = overlap + date_proximity_bonus(app.application.submitted_at, called_at);
        ranked.push(RankedCandidate {
            application_id: app.application.id,
            score,
        });
    }

    decide(ranked, config.auto_confidence)
}

fn decide(mut ranked: Vec<RankedCandidate>, auto_confidence: f64) -> MatchDecision {
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    let confident = ranked.iter().filter(|c| c.score > auto_confidence).count();
    if confident == 1 && ranked[0].score > auto_confidence {
        return MatchDecision::Auto(ranked[0].clone());
    }
    if ranked.is_empty() {
        return MatchDecision::Unmatched;
    }
    ranked.truncate(REVIEW_SHORTLIST);
    MatchDecision::NeedsReview(ranked)
}

/// Fraction of the listing title's tokens present in the message.  The full
/// (subject + body) token set is the haystack; dividing by the title's own
/// size keeps long bodies from drowning a perfect title hit.
fn title_overlap(title: &str, message_tokens: &BTreeSet<String>) -> f64 {
    let title_tokens = tokenize(title);
    if title_tokens.is_empty() {
        return 0.0;
    }
    let hits = title_tokens.intersection(message_tokens).count();
    hits as f64 / title_tokens.len() as f64
}

/// Messages landing within a month of the application are very likely about
/// it; within two months, plausibly.
fn date_proximity_bonus(submitted_at: DateTime<Utc>, received_at: DateTime<Utc>) -> f64 {
    let days = (received_at - submitted_at).num_days();
    if (0..=DATE_NEAR_DAYS).contains(&days) {
        DATE_NEAR_BONUS
    } else if ((DATE_NEAR_DAYS + 1)..=DATE_FAR_DAYS).contains(&days) {
        DATE_FAR_BONUS
    } else {
        0.0
    }
}

/// Jaro-Winkler over normalised entity names.
pub fn entity_similarity(a: &str, b: &str) -> f64 {
    jaro_winkler(&normalise_entity(a), &normalise_entity(b))
}

/// Legal suffixes carry no identity signal.
const ENTITY_SUFFIXES: &[&str] = &[
    "pty", "ltd", "limited", "inc", "llc", "group", "holdings", "co", "corp",
];

fn normalise_entity(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !ENTITY_SUFFIXES.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "was", "has", "are", "not", "this", "that",
    "with", "from", "have", "you", "can", "its", "will", "but", "they",
    "all", "been", "also", "into", "more", "than", "when", "who", "what",
    "how", "out", "our", "new", "now", "your", "role",
];

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let begin = start + pos;
        let end = begin + needle.len();
        let boundary_before = begin == 0
            || !haystack[..begin]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let boundary_after = end == haystack.len()
            || !haystack[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if boundary_before && boundary_after {
            return true;
        }
        start = end;
    }
    false
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use quarry_store::{Application, Archetype, OutcomeStage};

    use super::*;

    fn open_application(company: &str, title: &str, days_ago: i64) -> OpenApplication {
        OpenApplication {
            application: Application {
                id: Uuid::new_v4(),
                listing_id: 1,
                variant: Archetype::Builder,
                version_id: "v1".to_string(),
                profile_state: Archetype::Builder,
                batch_id: Uuid::new_v4(),
                submitted_at: Utc::now() - Duration::days(days_ago),
                outcome: OutcomeStage::Submitted,
                outcome_at: None,
                outcome_message_id: None,
                submit_error: None,
                selection_rationale: String::new(),
            },
            listing_external_id: "ext-1".to_string(),
            listing_title: title.to_string(),
            listing_company: company.to_string(),
            tech_tags: vec!["snowflake".to_string(), "dbt".to_string()],
        }
    }

    #[test]
    fn direct_reply_auto_matches_through_the_full_cascade() {
        let app = open_application("Woolworths", "Senior Data Engineer", 8);
        let decision = cascade_match(
            "woolworths.com.au",
            "Senior Data Engineer role — next steps",
            "Hi, we'd like to schedule a time to talk about the Senior Data Engineer position.",
            Utc::now(),
            None,
            &[app.clone()],
            &CascadeConfig::default(),
        );

        match decision {
            MatchDecision::Auto(candidate) => {
                assert_eq!(candidate.application_id, app.application.id);
                // Full title overlap plus the near-date bonus.
                assert!(candidate.score > 1.0, "score = {}", candidate.score);
            }
            other => panic!("expected auto match, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_domain_is_unmatched() {
        let app = open_application("Woolworths", "Senior Data Engineer", 8);
        let decision = cascade_match(
            "randomshop.com",
            "Senior Data Engineer",
            "anything",
            Utc::now(),
            None,
            &[app],
            &CascadeConfig::default(),
        );
        assert!(matches!(decision, MatchDecision::Unmatched));
    }

    #[test]
    fn two_confident_candidates_require_manual_review() {
        // Same employer domain, two open applications, both titles echoed.
        let a = open_application("Acme", "Data Engineer", 5);
        let b = open_application("Acme", "Analytics Engineer", 6);
        let decision = cascade_match(
            "acme.com",
            "Your Data Engineer / Analytics Engineer applications",
            "Both roles mention engineer and data and analytics.",
            Utc::now(),
            None,
            &[a, b],
            &CascadeConfig::default(),
        );

        match decision {
            MatchDecision::NeedsReview(candidates) => {
                assert!(candidates.len() <= 3);
                assert_eq!(candidates.len(), 2);
                assert!(candidates[0].score >= candidates[1].score);
            }
            other => panic!("expected manual review, got {other:?}"),
        }
    }

    #[test]
    fn known_sender_filter_is_stricter_than_the_label_filter() {
        let app = open_application("Woolworths", "Senior Data Engineer", 8);
        let sender = KnownSender {
            address: "jane@woolworths.com.au".to_string(),
            domain: "woolworths.com.au".to_string(),
            company: "Completely Different Corp".to_string(),
            sender_class: quarry_store::SenderClass::Direct,
            first_seen: Utc::now(),
        };
        let decision = cascade_match(
            "woolworths.com.au",
            "Senior Data Engineer",
            "body",
            Utc::now(),
            Some(&sender),
            &[app],
            &CascadeConfig::default(),
        );
        assert!(matches!(decision, MatchDecision::Unmatched));
    }

    #[test]
    fn weak_title_overlap_drops_the_candidate() {
        let app = open_application("Woolworths", "Senior Data Engineer", 8);
        let decision = cascade_match(
            "woolworths.com.au",
            "Customer satisfaction survey",
            "Tell us about shopping in store.",
            Utc::now(),
            None,
            &[app],
            &CascadeConfig::default(),
        );
        assert!(matches!(decision, MatchDecision::NeedsReview(_) | MatchDecision::Unmatched));
        if let MatchDecision::NeedsReview(c) = decision {
            panic!("candidate should have been dropped, got {c:?}");
        }
    }

    #[test]
    fn date_bonus_boundaries_land_exactly_on_30_and_60_days() {
        let now = Utc::now();
        let bonus = |days| date_proximity_bonus(now - Duration::days(days), now);
        assert_eq!(bonus(0), 0.2);
        assert_eq!(bonus(30), 0.2);
        assert_eq!(bonus(31), 0.1);
        assert_eq!(bonus(60), 0.1);
        assert_eq!(bonus(61), 0.0);
        // Message predating the application earns nothing.
        assert_eq!(date_proximity_bonus(now + Duration::days(1), now), 0.0);
    }

    #[test]
    fn tech_tag_mentions_raise_the_score() {
        let app = open_application("Acme", "Data Engineer", 5);
        let with_tech = cascade_match(
            "acme.com",
            "Data Engineer",
            "We liked your snowflake and dbt experience.",
            Utc::now(),
            None,
            &[app.clone()],
            &CascadeConfig::default(),
        );
        let without_tech = cascade_match(
            "acme.com",
            "Data Engineer",
            "We liked your background.",
            Utc::now(),
            None,
            &[app],
            &CascadeConfig::default(),
        );
        let score_of = |d: MatchDecision| match d {
            MatchDecision::Auto(c) => c.score,
            MatchDecision::NeedsReview(c) => c[0].score,
            MatchDecision::Unmatched => 0.0,
        };
        assert!((score_of(with_tech) - score_of(without_tech) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn call_log_matches_through_entity_title_and_date() {
        let app = open_application("Woolworths", "Senior Data Engineer", 3);
        let decision = match_call_log(
            "Woolworths",
            "Senior Data Engineer",
            Utc::now(),
            &[app.clone()],
            &CascadeConfig::default(),
        );
        match decision {
            MatchDecision::Auto(candidate) => {
                assert_eq!(candidate.application_id, app.application.id)
            }
            other => panic!("expected auto match, got {other:?}"),
        }
    }

    #[test]
    fn entity_similarity_ignores_legal_suffixes() {
        assert!(entity_similarity("Woolworths Group Ltd", "woolworths") > 0.9);
        assert!(entity_similarity("Woolworths", "Coles") < 0.7);
    }
}
