//! Offline write spool.
//!
//! When the primary store is unreachable, ingest-side writes (listings,
//! messages, call logs) are appended here as JSONL and flushed on the next
//! top-level operation or an explicit `quarry sync`.  Each append is fsync'd
//! so a spooled write survives a crash immediately after it is accepted.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::entities::{NewCallLog, NewListing, NewMessage};
use crate::error::StoreError;
use crate::store::{ListingMeta, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpoolRecord {
    Listing {
        listing: NewListing,
        role_type: String,
        seniority: String,
        tech_tags: Vec<String>,
    },
    Message {
        message: NewMessage,
    },
    CallLog {
        log: NewCallLog,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub record: SpoolRecord,
}

impl SpoolEvent {
    pub fn new(record: SpoolRecord) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            record,
        }
    }
}

/// Outcome of a flush: how many records landed, how many were duplicates the
/// store already had, how many remain spooled.
#[derive(Debug, Clone, Default)]
pub struct FlushOutcome {
    pub flushed: usize,
    pub duplicates: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone)]
pub struct Spool {
    path: PathBuf,
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: &SpoolEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(event)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        // Flush userspace buffers and fsync so the spooled write survives a
        // crash or power loss immediately after append.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Atomically replace the spool with `events`.
    ///
    /// New content goes to a `.tmp` sibling, is fsync'd, then renamed over
    /// the original.  A crash before the rename leaves the old spool intact;
    /// after it, a consistent new one.
    pub async fn overwrite(&self, events: &[SpoolEvent]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "spool.jsonl".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            for event in events {
                let line = serde_json::to_string(event)?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }

    pub fn load(&self) -> Result<Vec<SpoolEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::OpenOptions::new().read(true).open(&self.path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<SpoolEvent>(&line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt spool record, skipping line (preserved in .corrupt sidecar)"
                    );
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    if let Ok(mut bad) = fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&corrupt_path)
                    {
                        use std::io::Write as _;
                        let _ = writeln!(bad, "{line}");
                    }
                }
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "spool loaded with skipped corrupt lines, inspect .corrupt sidecar"
            );
        }

        Ok(events)
    }

    /// Best-effort flush into the store.  Unique conflicts mean the primary
    /// already has the record (the spooled write raced a direct one) and are
    /// dropped; transient failures keep the event spooled for next time.
    pub async fn flush_into(&self, store: &Store) -> Result<FlushOutcome> {
        let events = self.load()?;
        if events.is_empty() {
            return Ok(FlushOutcome::default());
        }

        let mut outcome = FlushOutcome::default();
        let mut remaining = Vec::new();
        for event in events {
            let result = match &event.record {
                SpoolRecord::Listing {
                    listing,
                    role_type,
                    seniority,
                    tech_tags,
                } => {
                    let meta = ListingMeta {
                        role_type: crate::entities::RoleType::from_slug(role_type),
                        seniority: crate::entities::Seniority::from_slug(seniority),
                        tech_tags: tech_tags.clone(),
                    };
                    store.insert_listing(listing, &meta).map(|_| ())
                }
                SpoolRecord::Message { message } => {
                    // Spooled messages have not been matched yet; they land
                    // unmatched and the next inbox poll's cascade picks them up.
                    let parsed = crate::entities::Message {
                        external_id: message.external_id.clone(),
                        received_at: message.received_at,
                        sender: message.sender.clone(),
                        sender_domain: String::new(),
                        subject: message.subject.clone(),
                        body: message.body_plain.clone(),
                        source_class: crate::entities::SenderClass::Unknown,
                        outcome: None,
                        outcome_confidence: 0.0,
                        application_id: None,
                        match_method: crate::entities::MatchMethod::Unmatched,
                        needs_review: true,
                        review_candidates: Vec::new(),
                    };
                    store.record_message(&parsed)
                }
                SpoolRecord::CallLog { log } => store.record_call_log(log, None).map(|_| ()),
            };

            match result {
                Ok(()) => outcome.flushed += 1,
                Err(StoreError::UniqueConflict { .. }) => outcome.duplicates += 1,
                Err(err) if err.is_retryable() => {
                    tracing::warn!(%err, "spool flush hit transient store error, keeping record");
                    remaining.push(event);
                }
                Err(err) => {
                    tracing::warn!(%err, "spooled record rejected by store, dropping");
                }
            }
        }

        outcome.remaining = remaining.len();
        self.overwrite(&remaining).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::Utc;

    use super::*;

    fn sample_listing(external_id: &str) -> NewListing {
        NewListing {
            external_id: external_id.to_string(),
            title: "Senior Data Engineer".to_string(),
            company: "Acme".to_string(),
            body: "Build out a new lakehouse platform.".to_string(),
            first_seen: Utc::now(),
            search_keyword: "data engineer".to_string(),
        }
    }

    #[tokio::test]
    async fn append_then_flush_lands_in_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spool = Spool::new(dir.path().join("spool.jsonl"));
        let store = Store::open_in_memory("test-model", 3)?;

        spool
            .append(&SpoolEvent::new(SpoolRecord::Listing {
                listing: sample_listing("ext-1"),
                role_type: "contract".to_string(),
                seniority: "senior".to_string(),
                tech_tags: vec!["spark".to_string()],
            }))
            .await?;

        let outcome = spool.flush_into(&store).await?;
        assert_eq!(outcome.flushed, 1);
        assert_eq!(outcome.remaining, 0);
        assert!(store.listing_by_external_id("ext-1")?.is_some());

        // Spool is now empty; a second flush is a no-op.
        let outcome = spool.flush_into(&store).await?;
        assert_eq!(outcome.flushed, 0);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_spooled_listing_is_dropped_not_retried() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spool = Spool::new(dir.path().join("spool.jsonl"));
        let store = Store::open_in_memory("test-model", 3)?;
        store.insert_listing(&sample_listing("ext-dup"), &ListingMeta::default())?;

        spool
            .append(&SpoolEvent::new(SpoolRecord::Listing {
                listing: sample_listing("ext-dup"),
                role_type: "unknown".to_string(),
                seniority: "unknown".to_string(),
                tech_tags: Vec::new(),
            }))
            .await?;

        let outcome = spool.flush_into(&store).await?;
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.remaining, 0);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped_and_preserved() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("spool.jsonl");
        let spool = Spool::new(&path);

        spool
            .append(&SpoolEvent::new(SpoolRecord::CallLog {
                log: NewCallLog {
                    phone: None,
                    company: "Acme".to_string(),
                    title: "Data Engineer".to_string(),
                    outcome: crate::entities::OutcomeStage::Interview,
                    notes: String::new(),
                    called_at: Utc::now(),
                },
            }))
            .await?;
        std::fs::write(
            &path,
            format!("{}\nnot json at all\n", std::fs::read_to_string(&path)?.trim()),
        )?;

        let events = spool.load()?;
        assert_eq!(events.len(), 1);
        assert!(path.with_extension("jsonl.corrupt").exists());
        Ok(())
    }
}
