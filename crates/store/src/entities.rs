use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Closed classification enums ───────────────────────────────────────────────

/// The four work shapes a listing (and a resume variant) can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Archetype {
    Builder,
    Fixer,
    Operator,
    Translator,
}

impl Archetype {
    /// Fixed order; doubles as the tie-break order when scores are equal.
    pub const ALL: [Archetype; 4] = [
        Archetype::Builder,
        Archetype::Fixer,
        Archetype::Operator,
        Archetype::Translator,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Archetype::Builder => "builder",
            Archetype::Fixer => "fixer",
            Archetype::Operator => "operator",
            Archetype::Translator => "translator",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.slug() == slug)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Contract,
    Permanent,
    #[default]
    Unknown,
}

impl RoleType {
    pub fn slug(self) -> &'static str {
        match self {
            RoleType::Contract => "contract",
            RoleType::Permanent => "permanent",
            RoleType::Unknown => "unknown",
        }
    }

    pub fn from_slug(slug: &str) -> Self {
        match slug {
            "contract" => RoleType::Contract,
            "permanent" => RoleType::Permanent,
            _ => RoleType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Seniority {
    Junior,
    Mid,
    Senior,
    Lead,
    #[default]
    Unknown,
}

impl Seniority {
    pub fn slug(self) -> &'static str {
        match self {
            Seniority::Junior => "junior",
            Seniority::Mid => "mid",
            Seniority::Senior => "senior",
            Seniority::Lead => "lead",
            Seniority::Unknown => "unknown",
        }
    }

    pub fn from_slug(slug: &str) -> Self {
        match slug {
            "junior" => Seniority::Junior,
            "mid" => Seniority::Mid,
            "senior" => Seniority::Senior,
            "lead" => Seniority::Lead,
            _ => Seniority::Unknown,
        }
    }
}

/// Application lifecycle stage.
///
/// `priority()` defines the only legal direction of travel: an outcome is
/// replaced only by one of strictly higher priority.  Ghost sits just above
/// Submitted so any real signal arriving late un-ghosts the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStage {
    Submitted,
    Ghost,
    Acknowledged,
    Viewed,
    Rejected,
    Interview,
    Offer,
}

impl OutcomeStage {
    pub fn priority(self) -> u8 {
        match self {
            OutcomeStage::Submitted => 0,
            OutcomeStage::Ghost => 1,
            OutcomeStage::Acknowledged => 2,
            OutcomeStage::Viewed => 3,
            OutcomeStage::Rejected => 4,
            OutcomeStage::Interview => 5,
            OutcomeStage::Offer => 6,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            OutcomeStage::Submitted => "submitted",
            OutcomeStage::Ghost => "ghost",
            OutcomeStage::Acknowledged => "acknowledged",
            OutcomeStage::Viewed => "viewed",
            OutcomeStage::Rejected => "rejected",
            OutcomeStage::Interview => "interview",
            OutcomeStage::Offer => "offer",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        [
            OutcomeStage::Submitted,
            OutcomeStage::Ghost,
            OutcomeStage::Acknowledged,
            OutcomeStage::Viewed,
            OutcomeStage::Rejected,
            OutcomeStage::Interview,
            OutcomeStage::Offer,
        ]
        .into_iter()
        .find(|s| s.slug() == slug)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SenderClass {
    Structured,
    Direct,
    Agency,
    #[default]
    Unknown,
}

impl SenderClass {
    pub fn slug(self) -> &'static str {
        match self {
            SenderClass::Structured => "structured",
            SenderClass::Direct => "direct",
            SenderClass::Agency => "agency",
            SenderClass::Unknown => "unknown",
        }
    }

    pub fn from_slug(slug: &str) -> Self {
        match slug {
            "structured" => SenderClass::Structured,
            "direct" => SenderClass::Direct,
            "agency" => SenderClass::Agency,
            _ => SenderClass::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    ExternalId,
    Cascade,
    Manual,
    #[default]
    Unmatched,
}

impl MatchMethod {
    pub fn slug(self) -> &'static str {
        match self {
            MatchMethod::ExternalId => "external_id",
            MatchMethod::Cascade => "cascade",
            MatchMethod::Manual => "manual",
            MatchMethod::Unmatched => "unmatched",
        }
    }

    pub fn from_slug(slug: &str) -> Self {
        match slug {
            "external_id" => MatchMethod::ExternalId,
            "cascade" => MatchMethod::Cascade,
            "manual" => MatchMethod::Manual,
            _ => MatchMethod::Unmatched,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MarketShift,
    ResumeStale,
    RewriteTriggered,
}

impl AlertKind {
    pub fn slug(self) -> &'static str {
        match self {
            AlertKind::MarketShift => "market_shift",
            AlertKind::ResumeStale => "resume_stale",
            AlertKind::RewriteTriggered => "rewrite_triggered",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        [
            AlertKind::MarketShift,
            AlertKind::ResumeStale,
            AlertKind::RewriteTriggered,
        ]
        .into_iter()
        .find(|k| k.slug() == slug)
    }
}

// ── Archetype score map ───────────────────────────────────────────────────────

/// Score map over the four archetypes.  After classification it sums to 1.0
/// (within 1e-6) or is the uniform 0.25 fallback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ArchetypeScores {
    pub builder: f64,
    pub fixer: f64,
    pub operator: f64,
    pub translator: f64,
}

impl ArchetypeScores {
    pub fn uniform() -> Self {
        Self {
            builder: 0.25,
            fixer: 0.25,
            operator: 0.25,
            translator: 0.25,
        }
    }

    pub fn get(&self, archetype: Archetype) -> f64 {
        match archetype {
            Archetype::Builder => self.builder,
            Archetype::Fixer => self.fixer,
            Archetype::Operator => self.operator,
            Archetype::Translator => self.translator,
        }
    }

    pub fn add(&mut self, archetype: Archetype, delta: f64) {
        match archetype {
            Archetype::Builder => self.builder += delta,
            Archetype::Fixer => self.fixer += delta,
            Archetype::Operator => self.operator += delta,
            Archetype::Translator => self.translator += delta,
        }
    }

    pub fn total(&self) -> f64 {
        self.builder + self.fixer + self.operator + self.translator
    }

    /// Clamp negatives (priors can push a zero score below zero), then scale
    /// to sum 1.0.  All-zero input yields the uniform map.
    pub fn normalised(&self) -> Self {
        let mut out = *self;
        out.builder = out.builder.max(0.0);
        out.fixer = out.fixer.max(0.0);
        out.operator = out.operator.max(0.0);
        out.translator = out.translator.max(0.0);
        let total = out.total();
        if total <= f64::EPSILON {
            return Self::uniform();
        }
        out.builder /= total;
        out.fixer /= total;
        out.operator /= total;
        out.translator /= total;
        out
    }

    /// Argmax with the fixed tie order builder > fixer > operator > translator.
    pub fn primary(&self) -> Archetype {
        let mut best = Archetype::Builder;
        let mut best_score = self.get(best);
        for archetype in Archetype::ALL {
            let score = self.get(archetype);
            if score > best_score {
                best = archetype;
                best_score = score;
            }
        }
        best
    }

    /// (top archetype, top score, second score).
    pub fn top_two(&self) -> (Archetype, f64, f64) {
        let top = self.primary();
        let top_score = self.get(top);
        let second = Archetype::ALL
            .into_iter()
            .filter(|a| *a != top)
            .map(|a| self.get(a))
            .fold(0.0_f64, f64::max);
        (top, top_score, second)
    }

    pub fn sums_to_one(&self) -> bool {
        (self.total() - 1.0).abs() <= 1e-6
    }
}

// ── Entities ──────────────────────────────────────────────────────────────────

/// A scraped job listing.  Immutable after classification except for the
/// intelligence-only flag and derived scores on reclassification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub body: String,
    pub first_seen: DateTime<Utc>,
    pub search_keyword: String,
    pub role_type: RoleType,
    pub seniority: Seniority,
    pub tech_tags: Vec<String>,
    /// SHA-256 hex of `body`; reposts of the same text under a new external
    /// id are detected through this.
    pub content_hash: String,
    pub scores: Option<ArchetypeScores>,
    pub primary_archetype: Option<Archetype>,
    pub intelligence_only: bool,
    pub classify_attempts: u32,
    pub next_classify_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn is_classified(&self) -> bool {
        self.scores.is_some()
    }
}

/// Scraper-facing listing payload, before classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewListing {
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub body: String,
    pub first_seen: DateTime<Utc>,
    pub search_keyword: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub listing_id: i64,
    pub variant: Archetype,
    /// Version-store handle of the variant at emission time.  Never rewritten.
    pub version_id: String,
    pub profile_state: Archetype,
    pub batch_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub outcome: OutcomeStage,
    pub outcome_at: Option<DateTime<Utc>>,
    pub outcome_message_id: Option<String>,
    /// Recoverable submitter failure; set rows do not count toward the batch.
    pub submit_error: Option<String>,
    pub selection_rationale: String,
}

/// An application joined with the listing fields the cascade needs.
#[derive(Debug, Clone)]
pub struct OpenApplication {
    pub application: Application,
    pub listing_external_id: String,
    pub listing_title: String,
    pub listing_company: String,
    pub tech_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub external_id: String,
    pub received_at: DateTime<Utc>,
    pub sender: String,
    pub sender_domain: String,
    pub subject: String,
    pub body: String,
    pub source_class: SenderClass,
    /// None when the body matched no outcome category.
    pub outcome: Option<OutcomeStage>,
    pub outcome_confidence: f64,
    pub application_id: Option<Uuid>,
    pub match_method: MatchMethod,
    pub needs_review: bool,
    /// Ranked candidate application ids when needs_review is set.
    pub review_candidates: Vec<Uuid>,
}

/// Inbox-facing message payload before classification and matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub external_id: String,
    pub received_at: DateTime<Utc>,
    pub sender: String,
    pub subject: String,
    pub body_plain: String,
    pub body_html: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownSender {
    pub address: String,
    pub domain: String,
    pub company: String,
    pub sender_class: SenderClass,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLog {
    pub id: i64,
    pub phone: Option<String>,
    pub company: String,
    pub title: String,
    pub outcome: OutcomeStage,
    pub notes: String,
    pub called_at: DateTime<Utc>,
    pub application_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCallLog {
    pub phone: Option<String>,
    pub company: String,
    pub title: String,
    pub outcome: OutcomeStage,
    pub notes: String,
    pub called_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeVariant {
    pub archetype: Archetype,
    /// Path of the variant file inside the version store.
    pub path: String,
    pub version_id: String,
    /// Cosine similarity to the latest centroid of the variant's archetype.
    pub alignment: Option<f64>,
    pub last_rewrite: Option<DateTime<Utc>>,
}

impl ResumeVariant {
    pub fn staleness(&self) -> Option<f64> {
        self.alignment.map(|a| 1.0 - a)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCentroid {
    pub id: i64,
    pub archetype: Archetype,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub jd_count: usize,
    /// 1 - cosine to the previous centroid of the same archetype, when one exists.
    pub shift: Option<f64>,
    pub gained_terms: Vec<String>,
    pub lost_terms: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftAlert {
    pub id: i64,
    pub archetype: Archetype,
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
    pub details: serde_json::Value,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub archetype: Archetype,
    pub profile_state: Archetype,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub app_count: u32,
}

impl Batch {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalised_scores_sum_to_one() {
        let scores = ArchetypeScores {
            builder: 1.6,
            fixer: 0.1,
            operator: -0.05,
            translator: -0.05,
        };
        let n = scores.normalised();
        assert!(n.sums_to_one());
        assert!(n.builder > 0.9, "builder = {}", n.builder);
        assert_eq!(n.operator, 0.0);
    }

    #[test]
    fn all_zero_scores_fall_back_to_uniform() {
        let n = ArchetypeScores::default().normalised();
        assert_eq!(n, ArchetypeScores::uniform());
        assert!(n.sums_to_one());
    }

    #[test]
    fn primary_ties_break_in_fixed_order() {
        let scores = ArchetypeScores {
            builder: 0.25,
            fixer: 0.25,
            operator: 0.25,
            translator: 0.25,
        };
        assert_eq!(scores.primary(), Archetype::Builder);

        let scores = ArchetypeScores {
            builder: 0.1,
            fixer: 0.4,
            operator: 0.4,
            translator: 0.1,
        };
        assert_eq!(scores.primary(), Archetype::Fixer);
    }

    #[test]
    fn outcome_priority_orders_real_signals_above_ghost() {
        assert!(OutcomeStage::Acknowledged.priority() > OutcomeStage::Ghost.priority());
        assert!(OutcomeStage::Interview.priority() > OutcomeStage::Rejected.priority());
        assert!(OutcomeStage::Offer.priority() > OutcomeStage::Interview.priority());
    }

    #[test]
    fn enum_slugs_round_trip() {
        for archetype in Archetype::ALL {
            assert_eq!(Archetype::from_slug(archetype.slug()), Some(archetype));
        }
        for kind in [
            AlertKind::MarketShift,
            AlertKind::ResumeStale,
            AlertKind::RewriteTriggered,
        ] {
            assert_eq!(AlertKind::from_slug(kind.slug()), Some(kind));
        }
    }
}
