//! Pipeline orchestration: the post-insert classification hook, inbox
//! processing, the weekly drift cycle, and the spool/sync/re-embed
//! housekeeping the scheduler drives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quarry_classify::{
    Classifier, SeedCentroids, SentenceInput, extract_metadata, select_variant,
};
use quarry_config::AppConfig;
use quarry_drift::{
    ReferenceVocabulary, TermDrift, TriggerVerdict, alignment, evaluate_rewrite, shift_between,
    staleness, window_centroid,
};
use quarry_embed::Embedder;
use quarry_match::{
    CascadeConfig, MatchDecision, MessageParser, ParsedMessage, cascade_match, classify_outcome,
    match_call_log,
};
use quarry_store::{
    AlertKind, Archetype, FlushOutcome, KnownSender, MatchMethod, Message, NewCallLog, NewCentroid,
    NewListing, NewMessage, ResumeVariant, SenderClass, Spool, SpoolEvent, SpoolRecord, Store,
    StoreError,
};

use crate::interfaces::{InboxSource, VersionStore};

/// Deadline applied to every collaborator RPC the pipeline issues itself.
const EXTERNAL_CALL_DEADLINE: Duration = Duration::from_secs(60);
/// Watermark key for the single inbox source.
const INBOX_SOURCE: &str = "inbox";
/// Corpus size and vocabulary cap for term-drift diffs.
const VOCABULARY_CORPUS: usize = 200;
const VOCABULARY_TERMS: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and classified; visible to the queue.
    Classified(i64),
    /// Stored, but classification failed and will be retried with backoff.
    Unclassified(i64),
    /// Primary store unreachable; spooled for the next sync.
    Spooled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Duplicate,
    AutoMatched {
        application_id: Uuid,
        method: MatchMethod,
    },
    NeedsReview {
        candidates: usize,
    },
    Unmatched,
}

#[derive(Debug, Clone, Default)]
pub struct InboxStats {
    pub fetched: usize,
    pub duplicates: usize,
    pub matched: usize,
    pub needs_review: usize,
    pub unmatched: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ArchetypeDrift {
    pub archetype: Option<Archetype>,
    pub jd_count: usize,
    pub centroid_recorded: bool,
    pub shift: Option<f64>,
    pub staleness: Option<f64>,
    pub rewrite_triggered: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DriftCycleReport {
    pub per_archetype: Vec<ArchetypeDrift>,
    pub ghosted: usize,
}

pub struct Pipeline {
    config: AppConfig,
    store: Arc<Store>,
    spool: Spool,
    embedder: Arc<dyn Embedder>,
    classifier: Classifier,
    seed_centroids: OnceCell<SeedCentroids>,
    parser: MessageParser,
}

impl Pipeline {
    pub fn new(config: AppConfig, store: Arc<Store>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let classifier = Classifier::new()?;
        let parser = MessageParser::new(
            &config.matching.board_domains,
            &config.matching.agency_keywords,
            &config.matching.board_id_pattern,
        )?;
        let spool = Spool::new(&config.store.spool_path);
        Ok(Self {
            config,
            store,
            spool,
            embedder,
            classifier,
            seed_centroids: OnceCell::new(),
            parser,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    fn cascade_config(&self) -> CascadeConfig {
        CascadeConfig {
            known_sender_similarity: self.config.matching.known_sender_similarity,
            domain_label_similarity: self.config.matching.domain_label_similarity,
            title_overlap_min: self.config.matching.title_overlap_min,
            auto_confidence: self.config.tuning.match_auto_confidence,
        }
    }

    /// Seed centroids are built once per process and survive embed-service
    /// flakiness: a failed build is retried on the next classification.
    async fn seed_centroids(&self) -> Option<&SeedCentroids> {
        match self
            .seed_centroids
            .get_or_try_init(|| SeedCentroids::build(self.classifier.bank(), self.embedder.as_ref()))
            .await
        {
            Ok(centroids) => Some(centroids),
            Err(err) => {
                warn!(%err, "seed centroid build failed; scoring without the similarity term");
                None
            }
        }
    }

    // ── Listing ingest (post-insert hook) ─────────────────────────────────────

    /// Scraper entry point.  The listing and its classification are written
    /// before this returns, so a listing is never queue-visible unclassified.
    pub async fn ingest_listing(&self, new: NewListing) -> Result<IngestOutcome> {
        let meta = extract_metadata(&new.title, &new.body);
        let listing_id = match self.store.insert_listing(&new, &meta) {
            Ok(id) => id,
            Err(err) if err.is_retryable() => {
                warn!(%err, listing = %new.external_id, "store unreachable; spooling listing");
                self.spool
                    .append(&SpoolEvent::new(SpoolRecord::Listing {
                        listing: new,
                        role_type: meta.role_type.slug().to_string(),
                        seniority: meta.seniority.slug().to_string(),
                        tech_tags: meta.tech_tags,
                    }))
                    .await?;
                return Ok(IngestOutcome::Spooled);
            }
            Err(err) => return Err(err.into()),
        };

        match self.classify_listing(listing_id).await {
            Ok(()) => Ok(IngestOutcome::Classified(listing_id)),
            Err(err) => {
                let next = Utc::now() + self.classify_backoff(0);
                let attempts = self.store.mark_classification_failed(listing_id, next)?;
                warn!(
                    listing_id,
                    attempts,
                    %err,
                    "classification failed; listing held back from the queue"
                );
                Ok(IngestOutcome::Unclassified(listing_id))
            }
        }
    }

    async fn classify_listing(&self, listing_id: i64) -> Result<()> {
        let listing = self.store.listing(listing_id)?;

        // One batch call covers the document vector and every sentence.
        let sentences = Classifier::split_sentences(&listing.body);
        let mut inputs = Vec::with_capacity(sentences.len() + 1);
        inputs.push(listing.body.clone());
        inputs.extend(sentences.iter().cloned());
        let mut vectors = self
            .embedder
            .embed_batch(&inputs)
            .await
            .context("embedding listing")?;
        let document_embedding = vectors.remove(0);
        let sentence_inputs: Vec<SentenceInput> = sentences
            .into_iter()
            .zip(vectors.into_iter())
            .map(|(text, embedding)| SentenceInput {
                text,
                embedding: Some(embedding),
            })
            .collect();

        let seed_centroids = self.seed_centroids().await;
        let scores = self
            .classifier
            .classify(&sentence_inputs, listing.role_type, seed_centroids);

        let repost_of = self.store.repost_of(listing.id, &listing.content_hash)?;
        let variant_alignment = self
            .store
            .variant(scores.primary())?
            .and_then(|v| v.alignment);
        let decision = select_variant(
            &scores,
            variant_alignment,
            self.config.tuning.close_call_delta,
            self.config.tuning.combined_score_threshold,
        );

        // Reposts feed the centroids but never the queue.
        let intelligence_only = repost_of.is_some() || !decision.admitted;
        self.store
            .record_classification(listing.id, &scores, &document_embedding, intelligence_only)?;
        info!(
            listing = %listing.external_id,
            archetype = scores.primary().slug(),
            intelligence_only,
            repost = repost_of.is_some(),
            close_call = decision.needs_review,
            rationale = %decision.rationale,
            "listing classified"
        );
        Ok(())
    }

    fn classify_backoff(&self, attempts: u32) -> chrono::Duration {
        let base = self.config.scheduler.classify_backoff_base_secs;
        let cap = self.config.scheduler.classify_backoff_cap_secs;
        let secs = base.saturating_mul(2u64.saturating_pow(attempts)).min(cap);
        chrono::Duration::seconds(secs as i64)
    }

    /// Retry listings whose classify hook failed, with capped exponential
    /// backoff.  Returns how many were (re)classified.
    pub async fn retry_unclassified(&self) -> Result<usize> {
        let due = self
            .store
            .unclassified_due(Utc::now(), self.config.scheduler.classify_max_attempts)?;
        let mut classified = 0;
        for listing in due {
            match self.classify_listing(listing.id).await {
                Ok(()) => classified += 1,
                Err(err) => {
                    let next = Utc::now() + self.classify_backoff(listing.classify_attempts);
                    let attempts = self.store.mark_classification_failed(listing.id, next)?;
                    warn!(listing_id = listing.id, attempts, %err, "classification retry failed");
                }
            }
        }
        Ok(classified)
    }

    // ── Inbox ─────────────────────────────────────────────────────────────────

    pub async fn poll_inbox(&self, inbox: &dyn InboxSource) -> Result<InboxStats> {
        // Top-level operation: drain any spooled writes first.
        if let Err(err) = self.sync_spool().await {
            warn!(%err, "spool flush failed; continuing with poll");
        }

        let watermark = self.store.watermark(INBOX_SOURCE)?;
        let lookback = Utc::now() - chrono::Duration::hours(self.config.scheduler.inbox_lookback_hours);
        let messages = tokio::time::timeout(
            EXTERNAL_CALL_DEADLINE,
            inbox.fetch_since(watermark.as_deref(), lookback),
        )
        .await
        .map_err(|_| anyhow!("inbox fetch timed out after {EXTERNAL_CALL_DEADLINE:?}"))?
        .context("fetching inbox")?;

        let mut stats = InboxStats {
            fetched: messages.len(),
            ..Default::default()
        };
        for raw in &messages {
            match self.process_message(raw).await {
                Ok(ProcessOutcome::Duplicate) => stats.duplicates += 1,
                Ok(ProcessOutcome::AutoMatched { .. }) => stats.matched += 1,
                Ok(ProcessOutcome::NeedsReview { .. }) => stats.needs_review += 1,
                Ok(ProcessOutcome::Unmatched) => stats.unmatched += 1,
                Err(err) => {
                    warn!(message = %raw.external_id, %err, "message processing failed");
                    stats.failed += 1;
                }
            }
        }

        if let Some(last) = messages.last() {
            self.store.set_watermark(INBOX_SOURCE, &last.external_id)?;
        }
        info!(
            fetched = stats.fetched,
            matched = stats.matched,
            needs_review = stats.needs_review,
            unmatched = stats.unmatched,
            "inbox poll complete"
        );
        Ok(stats)
    }

    /// Parse, classify, and match one raw message.  Re-ingesting a known
    /// external id is a no-op.
    pub async fn process_message(&self, raw: &NewMessage) -> Result<ProcessOutcome> {
        if self.store.message_exists(&raw.external_id)? {
            return Ok(ProcessOutcome::Duplicate);
        }

        let parsed = self.parser.parse(raw);
        let outcome_call = classify_outcome(&parsed.body);

        // Structured path: board sender carrying a listing id in a URL.
        if parsed.source_class == SenderClass::Structured {
            if let Some(listing_external_id) = &parsed.board_listing_id {
                if let Some(application) = self
                    .store
                    .application_by_listing_external_id(listing_external_id)?
                {
                    self.record_message(&parsed, &outcome_call, MatchMethod::ExternalId, Some(application.id), false, &[])?;
                    self.store.confirm_match(
                        &parsed.external_id,
                        application.id,
                        MatchMethod::ExternalId,
                        outcome_call.stage,
                        None,
                    )?;
                    return Ok(ProcessOutcome::AutoMatched {
                        application_id: application.id,
                        method: MatchMethod::ExternalId,
                    });
                }
                debug!(
                    listing = %listing_external_id,
                    "board message references a listing we never applied to"
                );
            }
        }

        // Cascade path.
        let known_sender = self.store.known_sender_by_domain(&parsed.sender_domain)?;
        let open = self.store.open_applications()?;
        let decision = cascade_match(
            &parsed.sender_domain,
            &parsed.subject,
            &parsed.body,
            parsed.received_at,
            known_sender.as_ref(),
            &open,
            &self.cascade_config(),
        );

        match decision {
            MatchDecision::Auto(candidate) => {
                let company = open
                    .iter()
                    .find(|app| app.application.id == candidate.application_id)
                    .map(|app| app.listing_company.clone())
                    .unwrap_or_default();
                self.record_message(&parsed, &outcome_call, MatchMethod::Cascade, Some(candidate.application_id), false, &[])?;
                let sender = KnownSender {
                    address: parsed.sender.clone(),
                    domain: parsed.sender_domain.clone(),
                    company,
                    sender_class: parsed.source_class,
                    first_seen: parsed.received_at,
                };
                self.store.confirm_match(
                    &parsed.external_id,
                    candidate.application_id,
                    MatchMethod::Cascade,
                    outcome_call.stage,
                    Some(&sender),
                )?;
                Ok(ProcessOutcome::AutoMatched {
                    application_id: candidate.application_id,
                    method: MatchMethod::Cascade,
                })
            }
            MatchDecision::NeedsReview(candidates) => {
                let ids: Vec<Uuid> = candidates.iter().map(|c| c.application_id).collect();
                self.record_message(&parsed, &outcome_call, MatchMethod::Unmatched, None, true, &ids)?;
                Ok(ProcessOutcome::NeedsReview {
                    candidates: ids.len(),
                })
            }
            MatchDecision::Unmatched => {
                self.record_message(&parsed, &outcome_call, MatchMethod::Unmatched, None, false, &[])?;
                Ok(ProcessOutcome::Unmatched)
            }
        }
    }

    fn record_message(
        &self,
        parsed: &ParsedMessage,
        outcome_call: &quarry_match::OutcomeCall,
        method: MatchMethod,
        application_id: Option<Uuid>,
        needs_review: bool,
        candidates: &[Uuid],
    ) -> Result<(), StoreError> {
        self.store.record_message(&Message {
            external_id: parsed.external_id.clone(),
            received_at: parsed.received_at,
            sender: parsed.sender.clone(),
            sender_domain: parsed.sender_domain.clone(),
            subject: parsed.subject.clone(),
            body: parsed.body.clone(),
            source_class: parsed.source_class,
            outcome: outcome_call.stage,
            outcome_confidence: outcome_call.confidence,
            application_id,
            match_method: method,
            needs_review,
            review_candidates: candidates.to_vec(),
        })
    }

    // ── Call-log intake ───────────────────────────────────────────────────────

    /// Manual call outcomes run the same cascade on the provided entity,
    /// title, and date.
    pub async fn log_call(&self, log: NewCallLog) -> Result<Option<Uuid>> {
        let open = self.store.open_applications()?;
        let decision = match_call_log(
            &log.company,
            &log.title,
            log.called_at,
            &open,
            &self.cascade_config(),
        );

        match decision {
            MatchDecision::Auto(candidate) => {
                self.store.record_call_log(&log, Some(candidate.application_id))?;
                self.store.advance_outcome(
                    candidate.application_id,
                    log.outcome,
                    log.called_at,
                    None,
                )?;
                info!(application = %candidate.application_id, outcome = log.outcome.slug(), "call log matched");
                Ok(Some(candidate.application_id))
            }
            MatchDecision::NeedsReview(candidates) => {
                self.store.record_call_log(&log, None)?;
                warn!(
                    candidates = candidates.len(),
                    company = %log.company,
                    "call log ambiguous; left unmatched for manual follow-up"
                );
                Ok(None)
            }
            MatchDecision::Unmatched => {
                self.store.record_call_log(&log, None)?;
                Ok(None)
            }
        }
    }

    // ── Drift cycle ───────────────────────────────────────────────────────────

    /// The weekly job: per-archetype centroids, shift and staleness alerts,
    /// rewrite-trigger evaluation, and the ghost sweep.
    pub async fn run_drift_cycle(&self, now: DateTime<Utc>) -> Result<DriftCycleReport> {
        let tuning = &self.config.tuning;
        let window_start = now - chrono::Duration::days(tuning.window_days);
        let mut report = DriftCycleReport::default();
        let mut vocabulary: Option<ReferenceVocabulary> = None;

        for archetype in Archetype::ALL {
            let mut line = ArchetypeDrift {
                archetype: Some(archetype),
                ..Default::default()
            };

            let embeddings = self.store.window_embeddings(archetype, window_start, now)?;
            line.jd_count = embeddings.len();
            let Some(centroid) = window_centroid(&embeddings, tuning.min_window_jd_count) else {
                debug!(
                    archetype = archetype.slug(),
                    jd_count = embeddings.len(),
                    "window below minimum; no centroid"
                );
                report.per_archetype.push(line);
                continue;
            };

            let previous = self.store.centroid_before(archetype, window_start)?;
            let shift = previous
                .as_ref()
                .map(|(_, prev)| shift_between(prev, &centroid));
            line.shift = shift;

            let drift_terms = if let Some((_, prev)) = &previous {
                if vocabulary.is_none() {
                    let corpus = self.store.recent_listing_texts(VOCABULARY_CORPUS)?;
                    vocabulary = Some(
                        ReferenceVocabulary::build(&corpus, VOCABULARY_TERMS, self.embedder.as_ref())
                            .await?,
                    );
                }
                vocabulary
                    .as_ref()
                    .map(|v| v.diff(prev, &centroid))
                    .unwrap_or_default()
            } else {
                TermDrift::default()
            };

            let inserted = self.store.insert_centroid(&NewCentroid {
                archetype,
                window_start,
                window_end: now,
                jd_count: embeddings.len(),
                shift,
                gained_terms: drift_terms.gained.clone(),
                lost_terms: drift_terms.lost.clone(),
                vector: centroid.clone(),
            })?;
            line.centroid_recorded = inserted;

            // Alerts fire at most once per (archetype, window): only on the
            // run that actually recorded the centroid.
            if inserted {
                if let Some(shift) = shift {
                    if shift > tuning.shift_threshold {
                        self.store.record_alert(
                            archetype,
                            AlertKind::MarketShift,
                            shift,
                            tuning.shift_threshold,
                            &serde_json::json!({
                                "gained_terms": drift_terms.gained,
                                "lost_terms": drift_terms.lost,
                            }),
                        )?;
                        info!(archetype = archetype.slug(), shift, "market shift alert");
                    }
                }

                if let Some(variant_embedding) = self.store.variant_embedding(archetype)? {
                    let align = alignment(&variant_embedding, &centroid);
                    self.store.set_variant_alignment(archetype, align)?;
                    let stale = staleness(align);
                    line.staleness = Some(stale);
                    if stale > tuning.staleness_threshold {
                        self.store.record_alert(
                            archetype,
                            AlertKind::ResumeStale,
                            stale,
                            tuning.staleness_threshold,
                            &serde_json::json!({ "alignment": align }),
                        )?;
                        info!(archetype = archetype.slug(), staleness = stale, "resume stale alert");
                    }
                }
            }

            line.rewrite_triggered = self.evaluate_rewrite_gate(archetype, now)?;
            report.per_archetype.push(line);
        }

        report.ghosted = self.store.ghost_sweep(
            now - chrono::Duration::days(self.config.scheduler.ghost_after_days),
        )?;
        if report.ghosted > 0 {
            info!(ghosted = report.ghosted, "ghost sweep marked silent applications");
        }
        Ok(report)
    }

    /// The three-condition gate; on fire, records the rewrite_triggered alert
    /// and acknowledges its two component alerts.
    fn evaluate_rewrite_gate(&self, archetype: Archetype, now: DateTime<Utc>) -> Result<bool> {
        let Some(variant) = self.store.variant(archetype)? else {
            return Ok(false);
        };
        let shift_alert = self
            .store
            .latest_unacknowledged(archetype, AlertKind::MarketShift)?;
        let stale_alert = self
            .store
            .latest_unacknowledged(archetype, AlertKind::ResumeStale)?;

        let (gained, lost) = match self.store.latest_centroid(archetype)? {
            Some((centroid, _)) => (centroid.gained_terms, centroid.lost_terms),
            None => (Vec::new(), Vec::new()),
        };

        let verdict = evaluate_rewrite(
            archetype,
            shift_alert.as_ref(),
            stale_alert.as_ref(),
            &variant,
            &gained,
            &lost,
            self.config.tuning.rewrite_cooldown_days,
            now,
        );

        match verdict {
            TriggerVerdict::Fire(rewrite_report) => {
                self.store.record_alert(
                    archetype,
                    AlertKind::RewriteTriggered,
                    rewrite_report.staleness,
                    self.config.tuning.staleness_threshold,
                    &rewrite_report.details(),
                )?;
                if let Some(alert) = &shift_alert {
                    self.store.acknowledge_alert(alert.id)?;
                }
                if let Some(alert) = &stale_alert {
                    self.store.acknowledge_alert(alert.id)?;
                }
                info!(
                    archetype = archetype.slug(),
                    version = %rewrite_report.version_id,
                    focus = %rewrite_report.suggested_focus,
                    "rewrite triggered"
                );
                Ok(true)
            }
            TriggerVerdict::Hold(reason) => {
                debug!(archetype = archetype.slug(), ?reason, "rewrite gate held");
                Ok(false)
            }
        }
    }

    // ── Variants and re-embedding ─────────────────────────────────────────────

    /// Pull current versions from the version store, re-embedding and
    /// re-aligning any variant whose content changed (an external rewrite).
    pub async fn refresh_variants(&self, versions: &dyn VersionStore) -> Result<usize> {
        let mut updated = 0;
        for archetype in Archetype::ALL {
            let current = match versions.current_version(archetype).await {
                Ok(version) => version,
                Err(err) => {
                    debug!(archetype = archetype.slug(), %err, "no variant in version store");
                    continue;
                }
            };
            let existing = self.store.variant(archetype)?;
            if existing.as_ref().is_some_and(|v| v.version_id == current) {
                continue;
            }

            let text = versions.read_version(archetype, &current).await?;
            let embedding = self.embedder.embed(&text).await?;
            let align = self
                .store
                .latest_centroid(archetype)?
                .map(|(_, centroid)| alignment(&embedding, &centroid));
            let variant = ResumeVariant {
                archetype,
                path: versions.variant_path(archetype),
                version_id: current,
                alignment: align,
                // A changed version on an existing variant is a completed
                // external rewrite; first sight is not.
                last_rewrite: existing.as_ref().map(|_| Utc::now()),
            };
            self.store.upsert_variant(&variant, Some(&embedding))?;
            info!(
                archetype = archetype.slug(),
                version = %variant.version_id,
                "variant refreshed from version store"
            );
            updated += 1;
        }
        Ok(updated)
    }

    /// Re-embed every listing tagged with a stale model version, and the
    /// variants when a version store is at hand.  Centroids cannot be
    /// recomputed until this completes.
    pub async fn reembed(&self, versions: Option<&dyn VersionStore>) -> Result<usize> {
        let ids = self.store.listings_needing_reembed()?;
        for id in &ids {
            let listing = self.store.listing(*id)?;
            let vector = self.embedder.embed(&listing.body).await?;
            self.store.update_listing_embedding(*id, &vector)?;
        }
        if !ids.is_empty() {
            info!(listings = ids.len(), model = self.store.model_version(), "re-embedded listings");
        }

        if let Some(versions) = versions {
            for variant in self.store.variants()? {
                let text = versions
                    .read_version(variant.archetype, &variant.version_id)
                    .await?;
                let embedding = self.embedder.embed(&text).await?;
                self.store.upsert_variant(&variant, Some(&embedding))?;
            }
        }
        Ok(ids.len())
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    /// Flush the offline spool into the primary store.
    pub async fn sync_spool(&self) -> Result<FlushOutcome> {
        let outcome = self.spool.flush_into(&self.store).await?;
        if outcome.flushed > 0 || outcome.duplicates > 0 {
            info!(
                flushed = outcome.flushed,
                duplicates = outcome.duplicates,
                remaining = outcome.remaining,
                "spool flushed"
            );
        }
        Ok(outcome)
    }

    /// Point-in-time snapshot of the store.
    pub fn backup(&self) -> Result<std::path::PathBuf> {
        let path = self.store.snapshot_into(
            &self.config.store.snapshot_dir,
            self.config.store.snapshot_keep,
        )?;
        info!(path = %path.display(), "store snapshot written");
        Ok(path)
    }
}
