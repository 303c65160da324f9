//! The relational store: single source of truth for every entity and the
//! coordination point between the ingesting agent and the worker.
//!
//! All methods are synchronous; critical sections are short and never await.
//! The connection is embedded SQLite (`rusqlite`, bundled).  Cross-host
//! invariants (one open batch) are enforced with conditional writes on a
//! single-row lock table rather than an in-process mutex.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::*;
use crate::error::{StoreError, StoreResult};
use crate::schema;

/// Per-archetype queue summary line.
#[derive(Debug, Clone)]
pub struct QueueSummary {
    pub archetype: Archetype,
    pub count: usize,
    pub avg_top_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct QueueReport {
    pub per_archetype: Vec<QueueSummary>,
    pub intelligence_only: usize,
    pub unclassified: usize,
}

/// One (archetype, outcome) cell of the funnel rollup.
#[derive(Debug, Clone)]
pub struct FunnelRow {
    pub archetype: Archetype,
    pub outcome: OutcomeStage,
    pub count: usize,
}

/// Per-variant-version performance attribution.
#[derive(Debug, Clone)]
pub struct VersionMetrics {
    pub variant: Archetype,
    pub version_id: String,
    pub sent: usize,
    pub responses: usize,
    pub interviews: usize,
}

/// Centroid payload prior to insertion.
#[derive(Debug, Clone)]
pub struct NewCentroid {
    pub archetype: Archetype,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub jd_count: usize,
    pub shift: Option<f64>,
    pub gained_terms: Vec<String>,
    pub lost_terms: Vec<String>,
    pub vector: Vec<f32>,
}

/// Extracted listing metadata, produced deterministically at ingest time.
#[derive(Debug, Clone, Default)]
pub struct ListingMeta {
    pub role_type: RoleType,
    pub seniority: Seniority,
    pub tech_tags: Vec<String>,
}

pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
    model_version: String,
    dimension: usize,
}

impl Store {
    /// Open (or create) the store at `path` and run migrations.
    ///
    /// `model_version` and `dimension` pin the embedding space this process
    /// expects; rows tagged with a different model fail loudly on read until
    /// a re-embedding pass updates them.
    pub fn open(
        path: impl AsRef<Path>,
        model_version: impl Into<String>,
        dimension: usize,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Transient(format!("creating {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| StoreError::from_sqlite(e, "store", path.display().to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            model_version: model_version.into(),
            dimension,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory(model_version: impl Into<String>, dimension: usize) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            model_version: model_version.into(),
            dimension,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-write elsewhere; the connection
        // itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Embedding codec ───────────────────────────────────────────────────────

    fn encode_embedding(&self, vector: &[f32]) -> StoreResult<Vec<u8>> {
        if vector.len() != self.dimension {
            return Err(StoreError::Invariant(format!(
                "embedding dimension mismatch: got {}, store expects {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(vector.iter().flat_map(|f| f.to_le_bytes()).collect())
    }

    fn decode_embedding(
        &self,
        blob: &[u8],
        dim: usize,
        model: &str,
        context: &str,
    ) -> StoreResult<Vec<f32>> {
        if model != self.model_version {
            return Err(StoreError::Invariant(format!(
                "{context}: embedding model '{model}' does not match configured '{}'; re-embed required",
                self.model_version
            )));
        }
        if dim != self.dimension || blob.len() != dim * 4 {
            return Err(StoreError::Invariant(format!(
                "{context}: embedding dimension mismatch (dim={dim}, blob={} bytes, expected dim={})",
                blob.len(),
                self.dimension
            )));
        }
        Ok(blob
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    // ── Listings ──────────────────────────────────────────────────────────────

    /// Insert a scraped listing with its extracted metadata.  Returns the row
    /// id.  A duplicate external id is a `UniqueConflict`; classification is
    /// never re-run for it.
    pub fn insert_listing(&self, new: &NewListing, meta: &ListingMeta) -> StoreResult<i64> {
        if new.external_id.trim().is_empty() {
            return Err(StoreError::Validation("listing external_id is empty".into()));
        }
        if new.title.trim().is_empty() || new.body.trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "listing {} is missing title or body",
                new.external_id
            )));
        }

        let content_hash = content_hash(&new.body);
        let tags = serde_json::to_string(&meta.tech_tags)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO listings
               (external_id, title, company, body, first_seen, search_keyword,
                role_type, seniority, tech_tags, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                new.external_id,
                new.title,
                new.company,
                new.body,
                new.first_seen,
                new.search_keyword,
                meta.role_type.slug(),
                meta.seniority.slug(),
                tags,
                content_hash,
            ],
        )
        .map_err(|e| StoreError::from_sqlite(e, "listings", new.external_id.clone()))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn listing(&self, id: i64) -> StoreResult<Listing> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {LISTING_COLS} FROM listings WHERE id = ?1"),
            params![id],
            row_to_listing,
        )
        .optional()?
        .ok_or_else(|| StoreError::Validation(format!("unknown listing id {id}")))
    }

    pub fn listing_by_external_id(&self, external_id: &str) -> StoreResult<Option<Listing>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!("SELECT {LISTING_COLS} FROM listings WHERE external_id = ?1"),
                params![external_id],
                row_to_listing,
            )
            .optional()?)
    }

    /// Another listing (different id) carrying the same body text, if any.
    pub fn repost_of(&self, listing_id: i64, content_hash: &str) -> StoreResult<Option<i64>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT id FROM listings WHERE content_hash = ?1 AND id != ?2 LIMIT 1",
                params![content_hash, listing_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Persist classifier output: score map, primary archetype, document
    /// embedding, and the intelligence-only admission decision.  Clears any
    /// pending retry state.
    pub fn record_classification(
        &self,
        listing_id: i64,
        scores: &ArchetypeScores,
        embedding: &[f32],
        intelligence_only: bool,
    ) -> StoreResult<()> {
        if !scores.sums_to_one() {
            return Err(StoreError::Invariant(format!(
                "archetype scores sum to {} for listing {listing_id}",
                scores.total()
            )));
        }
        let blob = self.encode_embedding(embedding)?;
        let json = serde_json::to_string(scores).map_err(|e| StoreError::Validation(e.to_string()))?;
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE listings
             SET scores = ?1, primary_archetype = ?2, embedding = ?3,
                 embedding_dim = ?4, embedding_model = ?5,
                 intelligence_only = ?6, next_classify_at = NULL
             WHERE id = ?7",
            params![
                json,
                scores.primary().slug(),
                blob,
                self.dimension as i64,
                self.model_version,
                intelligence_only,
                listing_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Validation(format!("unknown listing id {listing_id}")));
        }
        Ok(())
    }

    /// Record a failed classify/embed attempt and when to retry next.
    /// Returns the new attempt count.
    pub fn mark_classification_failed(
        &self,
        listing_id: i64,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<u32> {
        let conn = self.conn();
        conn.execute(
            "UPDATE listings
             SET classify_attempts = classify_attempts + 1, next_classify_at = ?1
             WHERE id = ?2",
            params![next_attempt_at, listing_id],
        )?;
        Ok(conn.query_row(
            "SELECT classify_attempts FROM listings WHERE id = ?1",
            params![listing_id],
            |row| row.get::<_, u32>(0),
        )?)
    }

    /// Unclassified listings whose retry time has come, attempts still below cap.
    pub fn unclassified_due(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<Vec<Listing>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LISTING_COLS} FROM listings
             WHERE scores IS NULL AND classify_attempts < ?1
               AND (next_classify_at IS NULL OR next_classify_at <= ?2)
             ORDER BY first_seen ASC"
        ))?;
        let rows = stmt.query_map(params![max_attempts, now], row_to_listing)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_intelligence_only(&self, listing_id: i64, flag: bool) -> StoreResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE listings SET intelligence_only = ?1 WHERE id = ?2",
            params![flag, listing_id],
        )?;
        if changed == 0 {
            return Err(StoreError::Validation(format!("unknown listing id {listing_id}")));
        }
        Ok(())
    }

    pub fn listing_embedding(&self, listing_id: i64) -> StoreResult<Option<Vec<f32>>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT embedding, embedding_dim, embedding_model FROM listings WHERE id = ?1",
                params![listing_id],
                |row| {
                    Ok((
                        row.get::<_, Option<Vec<u8>>>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((Some(blob), Some(dim), Some(model))) => Ok(Some(self.decode_embedding(
                &blob,
                dim as usize,
                &model,
                &format!("listing {listing_id}"),
            )?)),
            _ => Ok(None),
        }
    }

    /// Embeddings of listings with `primary_archetype = archetype` first seen
    /// inside `[start, end)`.  Mixed model versions in the window fail loudly.
    pub fn window_embeddings(
        &self,
        archetype: Archetype,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Vec<f32>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, embedding, embedding_dim, embedding_model FROM listings
             WHERE primary_archetype = ?1 AND first_seen >= ?2 AND first_seen < ?3
               AND embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![archetype.slug(), start, end], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, blob, dim, model) = row?;
            out.push(self.decode_embedding(&blob, dim as usize, &model, &format!("listing {id}"))?);
        }
        Ok(out)
    }

    /// Listings whose stored embedding was produced by a different model.
    pub fn listings_needing_reembed(&self) -> StoreResult<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM listings
             WHERE embedding IS NOT NULL AND embedding_model != ?1",
        )?;
        let rows = stmt.query_map(params![self.model_version], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_listing_embedding(&self, listing_id: i64, embedding: &[f32]) -> StoreResult<()> {
        let blob = self.encode_embedding(embedding)?;
        let conn = self.conn();
        conn.execute(
            "UPDATE listings SET embedding = ?1, embedding_dim = ?2, embedding_model = ?3
             WHERE id = ?4",
            params![blob, self.dimension as i64, self.model_version, listing_id],
        )?;
        Ok(())
    }

    /// Recent listing bodies, newest first, for reference-vocabulary building.
    pub fn recent_listing_texts(&self, limit: usize) -> StoreResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT body FROM listings ORDER BY first_seen DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Queue ─────────────────────────────────────────────────────────────────

    /// Classified listings that are admissible and not yet applied to,
    /// grouped by primary archetype, plus the intelligence-only and
    /// unclassified counts.
    pub fn queue_report(&self) -> StoreResult<QueueReport> {
        let conn = self.conn();
        let mut report = QueueReport::default();

        let mut stmt = conn.prepare(
            "SELECT l.primary_archetype, l.scores FROM listings l
             WHERE l.scores IS NOT NULL AND l.intelligence_only = 0
               AND NOT EXISTS (
                 SELECT 1 FROM applications a
                 WHERE a.listing_id = l.id AND a.submit_error IS NULL
               )",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut counts: Vec<(Archetype, usize, f64)> = Archetype::ALL
            .into_iter()
            .map(|a| (a, 0usize, 0.0f64))
            .collect();
        for row in rows {
            let (slug, scores_json) = row?;
            let Some(archetype) = Archetype::from_slug(&slug) else {
                continue;
            };
            let scores: ArchetypeScores = serde_json::from_str(&scores_json)
                .map_err(|e| StoreError::Validation(format!("corrupt score map: {e}")))?;
            let (_, top, _) = scores.top_two();
            let entry = counts.iter_mut().find(|(a, _, _)| *a == archetype);
            if let Some((_, count, sum)) = entry {
                *count += 1;
                *sum += top;
            }
        }
        report.per_archetype = counts
            .into_iter()
            .map(|(archetype, count, sum)| QueueSummary {
                archetype,
                count,
                avg_top_score: if count == 0 { 0.0 } else { sum / count as f64 },
            })
            .collect();

        report.intelligence_only = conn.query_row(
            "SELECT COUNT(*) FROM listings WHERE intelligence_only = 1",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize;
        report.unclassified = conn.query_row(
            "SELECT COUNT(*) FROM listings WHERE scores IS NULL",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize;
        Ok(report)
    }

    /// Queued listings for one archetype, best top-score first.
    pub fn queue_for(&self, archetype: Archetype, limit: usize) -> StoreResult<Vec<Listing>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LISTING_COLS} FROM listings l
             WHERE l.primary_archetype = ?1 AND l.scores IS NOT NULL
               AND l.intelligence_only = 0
               AND NOT EXISTS (
                 SELECT 1 FROM applications a
                 WHERE a.listing_id = l.id AND a.submit_error IS NULL
               )
             ORDER BY l.first_seen DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![archetype.slug(), limit as i64], row_to_listing)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Batches ───────────────────────────────────────────────────────────────

    /// Open a batch for `archetype`.  The caller asserts the externally
    /// advertised profile state; a mismatch, or any batch already open, is an
    /// invariant violation and changes nothing.
    pub fn open_batch(&self, archetype: Archetype, profile_state: Archetype) -> StoreResult<Batch> {
        if archetype != profile_state {
            return Err(StoreError::Invariant(format!(
                "profile state is {} but batch requested for {}",
                profile_state.slug(),
                archetype.slug()
            )));
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let claimed = tx.execute(
            "UPDATE batch_lock SET open_batch_id = ?1 WHERE id = 1 AND open_batch_id IS NULL",
            params![id.to_string()],
        )?;
        if claimed == 0 {
            let holder: Option<String> = tx
                .query_row("SELECT open_batch_id FROM batch_lock WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .optional()?
                .flatten();
            return Err(StoreError::Invariant(format!(
                "a batch is already open ({})",
                holder.unwrap_or_default()
            )));
        }
        tx.execute(
            "INSERT INTO batches (id, archetype, profile_state, opened_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), archetype.slug(), profile_state.slug(), now],
        )?;
        tx.commit()?;
        debug!(batch = %id, archetype = archetype.slug(), "batch opened");
        Ok(Batch {
            id,
            archetype,
            profile_state,
            opened_at: now,
            closed_at: None,
            app_count: 0,
        })
    }

    pub fn close_batch(&self, batch_id: Uuid) -> StoreResult<Batch> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE batches SET closed_at = ?1 WHERE id = ?2 AND closed_at IS NULL",
            params![now, batch_id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::Invariant(format!(
                "batch {batch_id} is not open"
            )));
        }
        tx.execute(
            "UPDATE batch_lock SET open_batch_id = NULL WHERE open_batch_id = ?1",
            params![batch_id.to_string()],
        )?;
        let batch = tx.query_row(
            &format!("SELECT {BATCH_COLS} FROM batches WHERE id = ?1"),
            params![batch_id.to_string()],
            row_to_batch,
        )?;
        tx.commit()?;
        Ok(batch)
    }

    pub fn open_batch_row(&self) -> StoreResult<Option<Batch>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {BATCH_COLS} FROM batches
                     WHERE id = (SELECT open_batch_id FROM batch_lock WHERE id = 1)"
                ),
                [],
                row_to_batch,
            )
            .optional()?)
    }

    pub fn batch(&self, batch_id: Uuid) -> StoreResult<Batch> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {BATCH_COLS} FROM batches WHERE id = ?1"),
            params![batch_id.to_string()],
            row_to_batch,
        )
        .optional()?
        .ok_or_else(|| StoreError::Validation(format!("unknown batch {batch_id}")))
    }

    // ── Applications ──────────────────────────────────────────────────────────

    pub fn application_for(
        &self,
        listing_id: i64,
        batch_id: Uuid,
    ) -> StoreResult<Option<Application>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {APPLICATION_COLS} FROM applications
                     WHERE listing_id = ?1 AND batch_id = ?2"
                ),
                params![listing_id, batch_id.to_string()],
                row_to_application,
            )
            .optional()?)
    }

    pub fn application(&self, id: Uuid) -> StoreResult<Option<Application>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!("SELECT {APPLICATION_COLS} FROM applications WHERE id = ?1"),
                params![id.to_string()],
                row_to_application,
            )
            .optional()?)
    }

    /// Record an emission attempt.  Inserts a fresh row, or, when a prior
    /// attempt for the same (listing, batch) failed, updates it in place, so
    /// emission is idempotent per (listing, batch).  A successful submission
    /// advances the batch application count; a failed one does not.
    pub fn record_application(&self, app: &Application) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let (intelligence_only,): (bool,) = tx
            .query_row(
                "SELECT intelligence_only FROM listings WHERE id = ?1",
                params![app.listing_id],
                |row| Ok((row.get(0)?,)),
            )
            .optional()?
            .ok_or_else(|| StoreError::Validation(format!("unknown listing id {}", app.listing_id)))?;
        if intelligence_only {
            return Err(StoreError::Invariant(format!(
                "listing {} is intelligence-only and cannot be applied to",
                app.listing_id
            )));
        }

        let batch = tx
            .query_row(
                &format!("SELECT {BATCH_COLS} FROM batches WHERE id = ?1"),
                params![app.batch_id.to_string()],
                row_to_batch,
            )
            .optional()?
            .ok_or_else(|| StoreError::Validation(format!("unknown batch {}", app.batch_id)))?;
        if !batch.is_open() {
            return Err(StoreError::Invariant(format!("batch {} is closed", app.batch_id)));
        }
        if app.profile_state != batch.archetype {
            return Err(StoreError::Invariant(format!(
                "application profile state {} does not match batch archetype {}",
                app.profile_state.slug(),
                batch.archetype.slug()
            )));
        }

        let existing: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT id, submit_error FROM applications WHERE listing_id = ?1 AND batch_id = ?2",
                params![app.listing_id, app.batch_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO applications
                       (id, listing_id, variant, version_id, profile_state, batch_id,
                        submitted_at, outcome, submit_error, selection_rationale)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        app.id.to_string(),
                        app.listing_id,
                        app.variant.slug(),
                        app.version_id,
                        app.profile_state.slug(),
                        app.batch_id.to_string(),
                        app.submitted_at,
                        app.outcome.slug(),
                        app.submit_error,
                        app.selection_rationale,
                    ],
                )?;
            }
            Some((_, None)) => {
                // Already submitted successfully in this batch: emission is a no-op.
                tx.commit()?;
                return Ok(());
            }
            Some((existing_id, Some(_))) => {
                tx.execute(
                    "UPDATE applications
                     SET version_id = ?1, submitted_at = ?2, submit_error = ?3,
                         selection_rationale = ?4
                     WHERE id = ?5",
                    params![
                        app.version_id,
                        app.submitted_at,
                        app.submit_error,
                        app.selection_rationale,
                        existing_id,
                    ],
                )?;
            }
        }

        if app.submit_error.is_none() {
            tx.execute(
                "UPDATE batches SET app_count = app_count + 1 WHERE id = ?1",
                params![app.batch_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Advance an application's outcome.  Returns false (and changes nothing)
    /// when the new stage does not have strictly higher priority; outcomes
    /// only move forward.
    pub fn advance_outcome(
        &self,
        application_id: Uuid,
        stage: OutcomeStage,
        at: DateTime<Utc>,
        message_external_id: Option<&str>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row(
                "SELECT outcome FROM applications WHERE id = ?1",
                params![application_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                StoreError::Validation(format!("unknown application {application_id}"))
            })?;
        let current = OutcomeStage::from_slug(&current)
            .ok_or_else(|| StoreError::Validation(format!("corrupt outcome slug '{current}'")))?;
        if stage.priority() <= current.priority() {
            warn!(
                application = %application_id,
                current = current.slug(),
                attempted = stage.slug(),
                "outcome update skipped: not a strict upgrade"
            );
            return Ok(false);
        }
        tx.execute(
            "UPDATE applications SET outcome = ?1, outcome_at = ?2, outcome_message_id = ?3
             WHERE id = ?4",
            params![stage.slug(), at, message_external_id, application_id.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Applications still awaiting a terminal outcome, joined with the
    /// listing fields the cascade scores against.
    pub fn open_applications(&self) -> StoreResult<Vec<OpenApplication>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPLICATION_COLS_PREFIXED}, l.external_id, l.title, l.company, l.tech_tags
             FROM applications a JOIN listings l ON l.id = a.listing_id
             WHERE a.outcome IN ('submitted', 'acknowledged', 'viewed')
               AND a.submit_error IS NULL"
        ))?;
        let rows = stmt.query_map([], |row| {
            let application = row_to_application(row)?;
            let tags_json: String = row.get(15)?;
            Ok((
                application,
                row.get::<_, String>(12)?,
                row.get::<_, String>(13)?,
                row.get::<_, String>(14)?,
                tags_json,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (application, external_id, title, company, tags_json) = row?;
            let tech_tags: Vec<String> = serde_json::from_str(&tags_json)
                .map_err(|e| StoreError::Validation(format!("corrupt tech tags: {e}")))?;
            out.push(OpenApplication {
                application,
                listing_external_id: external_id,
                listing_title: title,
                listing_company: company,
                tech_tags,
            });
        }
        Ok(out)
    }

    /// The open application whose listing carries this external id, if any.
    pub fn application_by_listing_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Application>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {APPLICATION_COLS_PREFIXED}
                     FROM applications a JOIN listings l ON l.id = a.listing_id
                     WHERE l.external_id = ?1 AND a.submit_error IS NULL
                     ORDER BY a.submitted_at DESC LIMIT 1"
                ),
                params![external_id],
                row_to_application,
            )
            .optional()?)
    }

    /// Mark long-silent submitted applications as ghost.  Returns how many.
    pub fn ghost_sweep(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let now = Utc::now();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE applications SET outcome = 'ghost', outcome_at = ?1
             WHERE outcome = 'submitted' AND submit_error IS NULL AND submitted_at < ?2",
            params![now, cutoff],
        )?;
        Ok(changed)
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn message_exists(&self, external_id: &str) -> StoreResult<bool> {
        let conn = self.conn();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM messages WHERE external_id = ?1",
                params![external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn record_message(&self, message: &Message) -> StoreResult<()> {
        let candidates = serde_json::to_string(&message.review_candidates)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages
               (external_id, received_at, sender, sender_domain, subject, body,
                source_class, outcome, outcome_confidence, application_id,
                match_method, needs_review, review_candidates)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                message.external_id,
                message.received_at,
                message.sender,
                message.sender_domain,
                message.subject,
                message.body,
                message.source_class.slug(),
                message.outcome.map(|o| o.slug()),
                message.outcome_confidence,
                message.application_id.map(|id| id.to_string()),
                message.match_method.slug(),
                message.needs_review,
                candidates,
            ],
        )
        .map_err(|e| StoreError::from_sqlite(e, "messages", message.external_id.clone()))?;
        Ok(())
    }

    /// Confirm a match (auto or manual) as one transaction: point the message
    /// at the application, advance the outcome, and upsert the sender into
    /// the known-senders fast path.  Returns whether the outcome advanced.
    pub fn confirm_match(
        &self,
        message_external_id: &str,
        application_id: Uuid,
        method: MatchMethod,
        outcome: Option<OutcomeStage>,
        sender: Option<&KnownSender>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let received_at: DateTime<Utc> = tx
            .query_row(
                "SELECT received_at FROM messages WHERE external_id = ?1",
                params![message_external_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                StoreError::Validation(format!("unknown message {message_external_id}"))
            })?;
        tx.execute(
            "UPDATE messages SET application_id = ?1, match_method = ?2, needs_review = 0
             WHERE external_id = ?3",
            params![application_id.to_string(), method.slug(), message_external_id],
        )?;

        let mut advanced = false;
        if let Some(stage) = outcome {
            let current: Option<String> = tx
                .query_row(
                    "SELECT outcome FROM applications WHERE id = ?1",
                    params![application_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let current = current
                .as_deref()
                .and_then(OutcomeStage::from_slug)
                .ok_or_else(|| {
                    StoreError::Validation(format!("unknown application {application_id}"))
                })?;
            if stage.priority() > current.priority() {
                tx.execute(
                    "UPDATE applications
                     SET outcome = ?1, outcome_at = ?2, outcome_message_id = ?3
                     WHERE id = ?4",
                    params![stage.slug(), received_at, message_external_id, application_id.to_string()],
                )?;
                advanced = true;
            }
        }

        if let Some(sender) = sender {
            upsert_known_sender_tx(&tx, sender)?;
        }
        tx.commit()?;
        Ok(advanced)
    }

    pub fn messages_needing_review(&self) -> StoreResult<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages WHERE needs_review = 1 ORDER BY received_at DESC"
        ))?;
        let rows = stmt.query_map([], row_to_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Known senders ─────────────────────────────────────────────────────────

    pub fn known_sender_by_domain(&self, domain: &str) -> StoreResult<Option<KnownSender>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT address, domain, company, sender_class, first_seen
                 FROM known_senders WHERE domain = ?1 LIMIT 1",
                params![domain],
                row_to_known_sender,
            )
            .optional()?)
    }

    pub fn upsert_known_sender(&self, sender: &KnownSender) -> StoreResult<()> {
        let conn = self.conn();
        upsert_known_sender_tx(&conn, sender)
    }

    // ── Call logs ─────────────────────────────────────────────────────────────

    pub fn record_call_log(
        &self,
        log: &NewCallLog,
        application_id: Option<Uuid>,
    ) -> StoreResult<i64> {
        if log.company.trim().is_empty() {
            return Err(StoreError::Validation("call log company is empty".into()));
        }
        let conn = self.conn();
        conn.execute(
            "INSERT INTO call_logs (phone, company, title, outcome, notes, called_at, application_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.phone,
                log.company,
                log.title,
                log.outcome.slug(),
                log.notes,
                log.called_at,
                application_id.map(|id| id.to_string()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ── Resume variants ───────────────────────────────────────────────────────

    pub fn upsert_variant(
        &self,
        variant: &ResumeVariant,
        embedding: Option<&[f32]>,
    ) -> StoreResult<()> {
        let blob = embedding.map(|e| self.encode_embedding(e)).transpose()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO resume_variants
               (archetype, path, version_id, alignment, last_rewrite,
                embedding, embedding_dim, embedding_model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(archetype) DO UPDATE SET
               path = excluded.path,
               version_id = excluded.version_id,
               alignment = excluded.alignment,
               last_rewrite = excluded.last_rewrite,
               embedding = COALESCE(excluded.embedding, resume_variants.embedding),
               embedding_dim = COALESCE(excluded.embedding_dim, resume_variants.embedding_dim),
               embedding_model = COALESCE(excluded.embedding_model, resume_variants.embedding_model)",
            params![
                variant.archetype.slug(),
                variant.path,
                variant.version_id,
                variant.alignment,
                variant.last_rewrite,
                blob,
                blob.as_ref().map(|_| self.dimension as i64),
                blob.as_ref().map(|_| self.model_version.clone()),
            ],
        )?;
        Ok(())
    }

    pub fn variant(&self, archetype: Archetype) -> StoreResult<Option<ResumeVariant>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT archetype, path, version_id, alignment, last_rewrite
                 FROM resume_variants WHERE archetype = ?1",
                params![archetype.slug()],
                row_to_variant,
            )
            .optional()?)
    }

    pub fn variants(&self) -> StoreResult<Vec<ResumeVariant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT archetype, path, version_id, alignment, last_rewrite
             FROM resume_variants ORDER BY archetype",
        )?;
        let rows = stmt.query_map([], row_to_variant)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn variant_embedding(&self, archetype: Archetype) -> StoreResult<Option<Vec<f32>>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT embedding, embedding_dim, embedding_model
                 FROM resume_variants WHERE archetype = ?1",
                params![archetype.slug()],
                |row| {
                    Ok((
                        row.get::<_, Option<Vec<u8>>>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((Some(blob), Some(dim), Some(model))) => Ok(Some(self.decode_embedding(
                &blob,
                dim as usize,
                &model,
                &format!("{} variant", archetype.slug()),
            )?)),
            _ => Ok(None),
        }
    }

    pub fn set_variant_alignment(&self, archetype: Archetype, alignment: f64) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE resume_variants SET alignment = ?1 WHERE archetype = ?2",
            params![alignment, archetype.slug()],
        )?;
        Ok(())
    }

    // ── Centroids ─────────────────────────────────────────────────────────────

    /// Insert a centroid.  Idempotent on (archetype, window_start): returns
    /// false when that window was already recorded, leaving it untouched.
    pub fn insert_centroid(&self, centroid: &NewCentroid) -> StoreResult<bool> {
        let blob = self.encode_embedding(&centroid.vector)?;
        let gained = serde_json::to_string(&centroid.gained_terms)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let lost = serde_json::to_string(&centroid.lost_terms)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT INTO centroids
               (archetype, window_start, window_end, jd_count, shift,
                gained_terms, lost_terms, centroid, embedding_dim, embedding_model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(archetype, window_start) DO NOTHING",
            params![
                centroid.archetype.slug(),
                centroid.window_start,
                centroid.window_end,
                centroid.jd_count as i64,
                centroid.shift,
                gained,
                lost,
                blob,
                self.dimension as i64,
                self.model_version,
                Utc::now(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn latest_centroid(
        &self,
        archetype: Archetype,
    ) -> StoreResult<Option<(MarketCentroid, Vec<f32>)>> {
        self.centroid_where(
            "archetype = ?1 ORDER BY window_start DESC LIMIT 1",
            params![archetype.slug()],
        )
    }

    /// The most recent centroid for `archetype` strictly before `window_start`.
    pub fn centroid_before(
        &self,
        archetype: Archetype,
        window_start: DateTime<Utc>,
    ) -> StoreResult<Option<(MarketCentroid, Vec<f32>)>> {
        self.centroid_where(
            "archetype = ?1 AND window_start < ?2 ORDER BY window_start DESC LIMIT 1",
            params![archetype.slug(), window_start],
        )
    }

    fn centroid_where(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> StoreResult<Option<(MarketCentroid, Vec<f32>)>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, archetype, window_start, window_end, jd_count, shift,
                            gained_terms, lost_terms, created_at, centroid, embedding_dim,
                            embedding_model
                     FROM centroids WHERE {clause}"
                ),
                args,
                |row| {
                    Ok((
                        row_to_centroid(row)?,
                        row.get::<_, Vec<u8>>(9)?,
                        row.get::<_, i64>(10)?,
                        row.get::<_, String>(11)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((centroid, blob, dim, model)) => {
                let vector = self.decode_embedding(
                    &blob,
                    dim as usize,
                    &model,
                    &format!("{} centroid", centroid.archetype.slug()),
                )?;
                Ok(Some((centroid, vector)))
            }
        }
    }

    // ── Alerts ────────────────────────────────────────────────────────────────

    pub fn record_alert(
        &self,
        archetype: Archetype,
        kind: AlertKind,
        value: f64,
        threshold: f64,
        details: &serde_json::Value,
    ) -> StoreResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO alerts (archetype, kind, value, threshold, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                archetype.slug(),
                kind.slug(),
                value,
                threshold,
                details.to_string(),
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest alert of this kind for the archetype, only if unacknowledged:
    /// the rewrite trigger's notion of "recent".
    pub fn latest_unacknowledged(
        &self,
        archetype: Archetype,
        kind: AlertKind,
    ) -> StoreResult<Option<DriftAlert>> {
        let conn = self.conn();
        let alert = conn
            .query_row(
                &format!(
                    "SELECT {ALERT_COLS} FROM alerts
                     WHERE archetype = ?1 AND kind = ?2
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![archetype.slug(), kind.slug()],
                row_to_alert,
            )
            .optional()?;
        Ok(alert.filter(|a| !a.acknowledged))
    }

    pub fn unacknowledged_alerts(&self) -> StoreResult<Vec<DriftAlert>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLS} FROM alerts WHERE acknowledged = 0 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], row_to_alert)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn acknowledge_alert(&self, alert_id: i64) -> StoreResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE alerts SET acknowledged = 1 WHERE id = ?1",
            params![alert_id],
        )?;
        if changed == 0 {
            return Err(StoreError::Validation(format!("unknown alert id {alert_id}")));
        }
        Ok(())
    }

    // ── Watermarks ────────────────────────────────────────────────────────────

    pub fn watermark(&self, source: &str) -> StoreResult<Option<String>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT last_external_id FROM watermarks WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_watermark(&self, source: &str, last_external_id: &str) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO watermarks (source, last_external_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(source) DO UPDATE SET
               last_external_id = excluded.last_external_id,
               updated_at = excluded.updated_at",
            params![source, last_external_id, Utc::now()],
        )?;
        Ok(())
    }

    // ── Rollups ───────────────────────────────────────────────────────────────

    pub fn funnel(&self) -> StoreResult<Vec<FunnelRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT profile_state, outcome, COUNT(*) FROM applications
             WHERE submit_error IS NULL GROUP BY profile_state, outcome",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (archetype, outcome, count) = row?;
            let (Some(archetype), Some(outcome)) = (
                Archetype::from_slug(&archetype),
                OutcomeStage::from_slug(&outcome),
            ) else {
                continue;
            };
            out.push(FunnelRow {
                archetype,
                outcome,
                count: count as usize,
            });
        }
        Ok(out)
    }

    /// Days from submission to first recorded outcome, for responded
    /// applications.  Feeds the median-lag figure on `status`.
    pub fn response_lags_days(&self) -> StoreResult<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT submitted_at, outcome_at FROM applications
             WHERE outcome_at IS NOT NULL AND outcome NOT IN ('ghost') AND submit_error IS NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, DateTime<Utc>>(0)?,
                row.get::<_, DateTime<Utc>>(1)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (submitted, responded) = row?;
            out.push((responded - submitted).num_days());
        }
        Ok(out)
    }

    pub fn version_metrics(&self) -> StoreResult<Vec<VersionMetrics>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT variant, version_id, COUNT(*),
                    SUM(CASE WHEN outcome NOT IN ('submitted', 'ghost') THEN 1 ELSE 0 END),
                    SUM(CASE WHEN outcome IN ('interview', 'offer') THEN 1 ELSE 0 END)
             FROM applications WHERE submit_error IS NULL
             GROUP BY variant, version_id
             ORDER BY variant, version_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (variant, version_id, sent, responses, interviews) = row?;
            let Some(variant) = Archetype::from_slug(&variant) else {
                continue;
            };
            out.push(VersionMetrics {
                variant,
                version_id,
                sent: sent as usize,
                responses: responses as usize,
                interviews: interviews as usize,
            });
        }
        Ok(out)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    /// Point-in-time snapshot via `VACUUM INTO`, pruning to `keep` files.
    pub fn snapshot_into(&self, dir: impl AsRef<Path>, keep: usize) -> StoreResult<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::Transient(format!("creating {}: {e}", dir.display())))?;
        let name = format!("quarry-{}.db", Utc::now().format("%Y%m%d-%H%M%S"));
        let target = dir.join(name);
        {
            let conn = self.conn();
            conn.execute(
                "VACUUM INTO ?1",
                params![target.display().to_string()],
            )?;
        }

        let mut snapshots: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| StoreError::Transient(e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("quarry-") && n.ends_with(".db"))
                    .unwrap_or(false)
            })
            .collect();
        snapshots.sort();
        while snapshots.len() > keep {
            let oldest = snapshots.remove(0);
            if let Err(err) = std::fs::remove_file(&oldest) {
                warn!(path = %oldest.display(), %err, "failed to prune old snapshot");
            }
        }
        Ok(target)
    }
}

/// SHA-256 hex fingerprint of a listing body, for repost detection.
pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ── Row mapping ───────────────────────────────────────────────────────────────

const LISTING_COLS: &str = "id, external_id, title, company, body, first_seen, search_keyword, \
     role_type, seniority, tech_tags, content_hash, scores, primary_archetype, \
     intelligence_only, classify_attempts, next_classify_at";

const APPLICATION_COLS: &str = "id, listing_id, variant, version_id, profile_state, batch_id, \
     submitted_at, outcome, outcome_at, outcome_message_id, submit_error, selection_rationale";

const APPLICATION_COLS_PREFIXED: &str =
    "a.id, a.listing_id, a.variant, a.version_id, a.profile_state, a.batch_id, \
     a.submitted_at, a.outcome, a.outcome_at, a.outcome_message_id, a.submit_error, \
     a.selection_rationale";

const MESSAGE_COLS: &str = "external_id, received_at, sender, sender_domain, subject, body, \
     source_class, outcome, outcome_confidence, application_id, match_method, needs_review, \
     review_candidates";

const BATCH_COLS: &str = "id, archetype, profile_state, opened_at, closed_at, app_count";

const ALERT_COLS: &str = "id, archetype, kind, value, threshold, details, acknowledged, created_at";

fn bad_col<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn slug_err(idx: usize, slug: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognised slug '{slug}'").into(),
    )
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| bad_col(idx, e))
}

fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| bad_col(idx, e)))
        .transpose()
}

fn row_to_listing(row: &Row<'_>) -> rusqlite::Result<Listing> {
    let tags_json: String = row.get(9)?;
    let tech_tags: Vec<String> =
        serde_json::from_str(&tags_json).map_err(|e| bad_col(9, e))?;
    let scores_json: Option<String> = row.get(11)?;
    let scores: Option<ArchetypeScores> = scores_json
        .map(|s| serde_json::from_str(&s).map_err(|e| bad_col(11, e)))
        .transpose()?;
    let primary: Option<String> = row.get(12)?;
    Ok(Listing {
        id: row.get(0)?,
        external_id: row.get(1)?,
        title: row.get(2)?,
        company: row.get(3)?,
        body: row.get(4)?,
        first_seen: row.get(5)?,
        search_keyword: row.get(6)?,
        role_type: RoleType::from_slug(&row.get::<_, String>(7)?),
        seniority: Seniority::from_slug(&row.get::<_, String>(8)?),
        tech_tags,
        content_hash: row.get(10)?,
        scores,
        primary_archetype: primary.as_deref().and_then(Archetype::from_slug),
        intelligence_only: row.get(13)?,
        classify_attempts: row.get(14)?,
        next_classify_at: row.get(15)?,
    })
}

fn row_to_application(row: &Row<'_>) -> rusqlite::Result<Application> {
    let variant: String = row.get(2)?;
    let profile: String = row.get(4)?;
    let outcome: String = row.get(7)?;
    Ok(Application {
        id: uuid_col(row, 0)?,
        listing_id: row.get(1)?,
        variant: Archetype::from_slug(&variant).ok_or_else(|| slug_err(2, &variant))?,
        version_id: row.get(3)?,
        profile_state: Archetype::from_slug(&profile).ok_or_else(|| slug_err(4, &profile))?,
        batch_id: uuid_col(row, 5)?,
        submitted_at: row.get(6)?,
        outcome: OutcomeStage::from_slug(&outcome).ok_or_else(|| slug_err(7, &outcome))?,
        outcome_at: row.get(8)?,
        outcome_message_id: row.get(9)?,
        submit_error: row.get(10)?,
        selection_rationale: row.get(11)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let outcome: Option<String> = row.get(7)?;
    let candidates_json: String = row.get(12)?;
    let raw_candidates: Vec<String> =
        serde_json::from_str(&candidates_json).map_err(|e| bad_col(12, e))?;
    let review_candidates = raw_candidates
        .iter()
        .map(|s| Uuid::parse_str(s).map_err(|e| bad_col(12, e)))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Message {
        external_id: row.get(0)?,
        received_at: row.get(1)?,
        sender: row.get(2)?,
        sender_domain: row.get(3)?,
        subject: row.get(4)?,
        body: row.get(5)?,
        source_class: SenderClass::from_slug(&row.get::<_, String>(6)?),
        outcome: outcome.as_deref().and_then(OutcomeStage::from_slug),
        outcome_confidence: row.get(8)?,
        application_id: opt_uuid_col(row, 9)?,
        match_method: MatchMethod::from_slug(&row.get::<_, String>(10)?),
        needs_review: row.get(11)?,
        review_candidates,
    })
}

fn row_to_batch(row: &Row<'_>) -> rusqlite::Result<Batch> {
    let archetype: String = row.get(1)?;
    let profile: String = row.get(2)?;
    Ok(Batch {
        id: uuid_col(row, 0)?,
        archetype: Archetype::from_slug(&archetype).ok_or_else(|| slug_err(1, &archetype))?,
        profile_state: Archetype::from_slug(&profile).ok_or_else(|| slug_err(2, &profile))?,
        opened_at: row.get(3)?,
        closed_at: row.get(4)?,
        app_count: row.get(5)?,
    })
}

fn row_to_known_sender(row: &Row<'_>) -> rusqlite::Result<KnownSender> {
    Ok(KnownSender {
        address: row.get(0)?,
        domain: row.get(1)?,
        company: row.get(2)?,
        sender_class: SenderClass::from_slug(&row.get::<_, String>(3)?),
        first_seen: row.get(4)?,
    })
}

fn row_to_variant(row: &Row<'_>) -> rusqlite::Result<ResumeVariant> {
    let archetype: String = row.get(0)?;
    Ok(ResumeVariant {
        archetype: Archetype::from_slug(&archetype).ok_or_else(|| slug_err(0, &archetype))?,
        path: row.get(1)?,
        version_id: row.get(2)?,
        alignment: row.get(3)?,
        last_rewrite: row.get(4)?,
    })
}

fn row_to_centroid(row: &Row<'_>) -> rusqlite::Result<MarketCentroid> {
    let archetype: String = row.get(1)?;
    let gained_json: String = row.get(6)?;
    let lost_json: String = row.get(7)?;
    Ok(MarketCentroid {
        id: row.get(0)?,
        archetype: Archetype::from_slug(&archetype).ok_or_else(|| slug_err(1, &archetype))?,
        window_start: row.get(2)?,
        window_end: row.get(3)?,
        jd_count: row.get::<_, i64>(4)? as usize,
        shift: row.get(5)?,
        gained_terms: serde_json::from_str(&gained_json).map_err(|e| bad_col(6, e))?,
        lost_terms: serde_json::from_str(&lost_json).map_err(|e| bad_col(7, e))?,
        created_at: row.get(8)?,
    })
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<DriftAlert> {
    let kind: String = row.get(2)?;
    let details_json: String = row.get(5)?;
    let archetype: String = row.get(1)?;
    Ok(DriftAlert {
        id: row.get(0)?,
        archetype: Archetype::from_slug(&archetype).ok_or_else(|| slug_err(1, &archetype))?,
        kind: AlertKind::from_slug(&kind).ok_or_else(|| slug_err(2, &kind))?,
        value: row.get(3)?,
        threshold: row.get(4)?,
        details: serde_json::from_str(&details_json).map_err(|e| bad_col(5, e))?,
        acknowledged: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn upsert_known_sender_tx(conn: &Connection, sender: &KnownSender) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO known_senders (address, domain, company, sender_class, first_seen)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(address) DO UPDATE SET
           domain = excluded.domain,
           company = excluded.company,
           sender_class = excluded.sender_class",
        params![
            sender.address,
            sender.domain,
            sender.company,
            sender.sender_class.slug(),
            sender.first_seen,
        ],
    )?;
    Ok(())
}
