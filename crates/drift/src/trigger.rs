//! The rewrite trigger: a three-condition gate per archetype.
//!
//! A moving market with an aligned variant needs no rewrite; a drifted
//! variant in a static market is preference, not necessity.  Requiring an
//! unacknowledged market-shift alert AND an unacknowledged staleness alert
//! AND an expired cooldown suppresses jitter at the threshold boundaries.

use chrono::{DateTime, Utc};
use serde_json::json;

use quarry_store::{Archetype, DriftAlert, ResumeVariant};

#[derive(Debug, Clone)]
pub struct RewriteReport {
    pub archetype: Archetype,
    pub shift: f64,
    pub staleness: f64,
    pub gained_terms: Vec<String>,
    pub lost_terms: Vec<String>,
    pub version_id: String,
    pub last_rewrite: Option<DateTime<Utc>>,
    pub suggested_focus: String,
}

impl RewriteReport {
    /// Details blob stored on the rewrite_triggered alert.
    pub fn details(&self) -> serde_json::Value {
        json!({
            "shift": self.shift,
            "staleness": self.staleness,
            "gained_terms": self.gained_terms,
            "lost_terms": self.lost_terms,
            "version_id": self.version_id,
            "last_rewrite": self.last_rewrite.map(|d| d.to_rfc3339()),
            "suggested_focus": self.suggested_focus,
        })
    }
}

#[derive(Debug, Clone)]
pub enum TriggerVerdict {
    Fire(Box<RewriteReport>),
    Hold(HoldReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldReason {
    NoMarketShift,
    NoStaleness,
    CooldownActive { days_remaining: i64 },
}

/// Evaluate the gate for one archetype.
///
/// `shift_alert` and `stale_alert` must be the latest *unacknowledged*
/// alerts of their kinds; an acknowledged or missing alert holds the gate.
/// A variant that has never been rewritten passes the cooldown.
pub fn evaluate_rewrite(
    archetype: Archetype,
    shift_alert: Option<&DriftAlert>,
    stale_alert: Option<&DriftAlert>,
    variant: &ResumeVariant,
    gained_terms: &[String],
    lost_terms: &[String],
    cooldown_days: i64,
    now: DateTime<Utc>,
) -> TriggerVerdict {
    let Some(shift_alert) = shift_alert else {
        return TriggerVerdict::Hold(HoldReason::NoMarketShift);
    };
    let Some(stale_alert) = stale_alert else {
        return TriggerVerdict::Hold(HoldReason::NoStaleness);
    };

    if let Some(last_rewrite) = variant.last_rewrite {
        let age_days = (now - last_rewrite).num_days();
        if age_days < cooldown_days {
            return TriggerVerdict::Hold(HoldReason::CooldownActive {
                days_remaining: cooldown_days - age_days,
            });
        }
    }

    let report = RewriteReport {
        archetype,
        shift: shift_alert.value,
        staleness: stale_alert.value,
        gained_terms: gained_terms.to_vec(),
        lost_terms: lost_terms.to_vec(),
        version_id: variant.version_id.clone(),
        last_rewrite: variant.last_rewrite,
        suggested_focus: suggested_focus(gained_terms, lost_terms),
    };
    TriggerVerdict::Fire(Box::new(report))
}

/// Plain-language rewrite guidance from the term diff.
fn suggested_focus(gained: &[String], lost: &[String]) -> String {
    match (gained.is_empty(), lost.is_empty()) {
        (false, false) => format!(
            "Emphasise {}; wind back {}.",
            join_terms(gained),
            join_terms(lost)
        ),
        (false, true) => format!("Emphasise {}.", join_terms(gained)),
        (true, false) => format!("Wind back {}.", join_terms(lost)),
        (true, true) => {
            "The market moved but no single term dominates; review the latest listings by hand."
                .to_string()
        }
    }
}

fn join_terms(terms: &[String]) -> String {
    terms
        .iter()
        .take(5)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ")
}
