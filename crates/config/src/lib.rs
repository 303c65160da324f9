use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: String,
    pub spool_path: String,
    pub snapshot_dir: String,
    /// Number of point-in-time snapshots kept before the oldest is pruned.
    pub snapshot_keep: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: ".quarry/quarry.db".to_string(),
            spool_path: ".quarry/spool.jsonl".to_string(),
            snapshot_dir: ".quarry/snapshots".to_string(),
            snapshot_keep: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Base URL for the embedding API.  Overridden at runtime by the
    /// `QUARRY_EMBED_BASE_URL` environment variable when set.
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub timeout_secs: u64,
    pub cache_size: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 768,
            timeout_secs: 30,
            cache_size: 512,
        }
    }
}

/// Tuning thresholds for the signal and decision engine.
///
/// These are the recognised knobs; anything else is a code change, not
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Centroid shift above which a market_shift alert fires (strictly above).
    pub shift_threshold: f64,
    /// Variant staleness distance above which a resume_stale alert fires.
    pub staleness_threshold: f64,
    /// Minimum days since the last rewrite before a rewrite can trigger again.
    pub rewrite_cooldown_days: i64,
    /// Rolling centroid window width in days.
    pub window_days: i64,
    /// Minimum listings in a window before a centroid is emitted.
    pub min_window_jd_count: usize,
    /// Top-two archetype score gap below which a listing is a close call.
    pub close_call_delta: f64,
    /// Combined score (top score x variant alignment) below which a listing
    /// is kept for intelligence only.
    pub combined_score_threshold: f64,
    /// Cascade score a lone candidate must exceed to auto-match.
    pub match_auto_confidence: f64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            shift_threshold: 0.05,
            staleness_threshold: 0.08,
            rewrite_cooldown_days: 21,
            window_days: 30,
            min_window_jd_count: 5,
            close_call_delta: 0.10,
            combined_score_threshold: 0.15,
            match_auto_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub inbox_poll_minutes: u64,
    pub drift_interval_days: u64,
    pub backup_interval_hours: u64,
    /// How far back the inbox poll looks past the watermark.
    pub inbox_lookback_hours: i64,
    pub classify_max_attempts: u32,
    pub classify_backoff_base_secs: u64,
    pub classify_backoff_cap_secs: u64,
    /// Applications still unanswered after this many days are marked ghost.
    pub ghost_after_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            inbox_poll_minutes: 15,
            drift_interval_days: 7,
            backup_interval_hours: 24,
            inbox_lookback_hours: 24,
            classify_max_attempts: 6,
            classify_backoff_base_secs: 30,
            classify_backoff_cap_secs: 3600,
            ghost_after_days: 45,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Sender domains recognised as the job board itself (structured path).
    pub board_domains: Vec<String>,
    /// Regex extracting the external listing id from a board URL in a message
    /// body.  Must contain an `id` capture group.
    pub board_id_pattern: String,
    /// Domain or display-name fragments that mark a sender as an agency.
    pub agency_keywords: Vec<String>,
    /// Entity similarity required when the sender domain is already known.
    pub known_sender_similarity: f64,
    /// Entity similarity required against a raw domain root label.
    pub domain_label_similarity: f64,
    /// Title token overlap below which a cascade candidate is dropped.
    pub title_overlap_min: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            board_domains: vec!["seek.com.au".to_string(), "linkedin.com".to_string()],
            board_id_pattern: r"/job/(?P<id>\d{6,})".to_string(),
            agency_keywords: vec![
                "recruit".to_string(),
                "talent".to_string(),
                "staffing".to_string(),
                "personnel".to_string(),
                "hays".to_string(),
            ],
            known_sender_similarity: 0.7,
            domain_label_similarity: 0.5,
            title_overlap_min: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionsConfig {
    /// Path to the git checkout holding the resume variant files.
    pub repo_path: String,
}

impl Default for VersionsConfig {
    fn default() -> Self {
        Self {
            repo_path: ".quarry/resumes".to_string(),
        }
    }
}

/// External collaborator processes.  Both receive/emit JSON on stdio; an
/// empty command disables the surface (emission refuses, the inbox job is
/// not spawned).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CollaboratorsConfig {
    /// Invoked per application with the submission plan on stdin; exit 0
    /// means submitted.
    pub submit_command: String,
    /// Invoked per poll with the watermark as argv; prints a JSON array of
    /// raw messages.
    pub inbox_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub embed: EmbedConfig,
    pub tuning: TuningConfig,
    pub scheduler: SchedulerConfig,
    pub matching: MatchConfig,
    pub versions: VersionsConfig,
    pub collaborators: CollaboratorsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("QUARRY_DB_PATH") {
            if !value.is_empty() {
                config.store.db_path = value;
            }
        }
        if let Ok(value) = env::var("QUARRY_EMBED_BASE_URL") {
            if !value.is_empty() {
                config.embed.base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::AppConfig;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = AppConfig::default();
        assert_eq!(config.tuning.shift_threshold, 0.05);
        assert_eq!(config.tuning.staleness_threshold, 0.08);
        assert_eq!(config.tuning.rewrite_cooldown_days, 21);
        assert_eq!(config.tuning.window_days, 30);
        assert_eq!(config.tuning.min_window_jd_count, 5);
        assert_eq!(config.tuning.close_call_delta, 0.10);
        assert_eq!(config.tuning.combined_score_threshold, 0.15);
        assert_eq!(config.tuning.match_auto_confidence, 0.5);
    }

    #[test]
    fn round_trips_through_toml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("quarry.toml");

        let mut config = AppConfig::default();
        config.embed.model = "mxbai-embed-large".to_string();
        config.scheduler.inbox_poll_minutes = 5;
        config.save_to(&path)?;

        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.embed.model, "mxbai-embed-large");
        assert_eq!(loaded.scheduler.inbox_poll_minutes, 5);
        Ok(())
    }

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let loaded = AppConfig::load_from("definitely/not/a/real/path.toml")?;
        assert_eq!(loaded.store.db_path, AppConfig::default().store.db_path);
        Ok(())
    }
}
