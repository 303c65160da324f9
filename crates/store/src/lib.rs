//! Append-only relational store for the application pipeline.
//!
//! Single source of truth for listings, applications, messages, outcomes,
//! centroids, alerts, and batches, plus the offline spool used when the
//! primary store is unreachable.

mod entities;
mod error;
mod schema;
mod spool;
mod store;

pub use entities::*;
pub use error::{ErrorKind, StoreError, StoreResult};
pub use spool::{FlushOutcome, Spool, SpoolEvent, SpoolRecord};
pub use store::{
    FunnelRow, ListingMeta, NewCentroid, QueueReport, QueueSummary, Store, VersionMetrics,
    content_hash,
};

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;

    const DIM: usize = 4;

    fn store() -> Store {
        Store::open_in_memory("test-model", DIM).expect("in-memory store")
    }

    fn listing(external_id: &str) -> NewListing {
        NewListing {
            external_id: external_id.to_string(),
            title: "Senior Data Engineer".to_string(),
            company: "Woolworths".to_string(),
            body: format!("Build a new data platform. Listing {external_id}."),
            first_seen: Utc::now(),
            search_keyword: "data engineer".to_string(),
        }
    }

    fn builder_scores() -> ArchetypeScores {
        ArchetypeScores {
            builder: 0.7,
            fixer: 0.2,
            operator: 0.05,
            translator: 0.05,
        }
    }

    fn classified_listing(store: &Store, external_id: &str) -> i64 {
        let id = store
            .insert_listing(&listing(external_id), &ListingMeta::default())
            .expect("insert");
        store
            .record_classification(id, &builder_scores(), &[1.0, 0.0, 0.0, 0.0], false)
            .expect("classify");
        id
    }

    fn application_row(listing_id: i64, batch: &Batch) -> Application {
        Application {
            id: Uuid::new_v4(),
            listing_id,
            variant: batch.archetype,
            version_id: "v1".to_string(),
            profile_state: batch.archetype,
            batch_id: batch.id,
            submitted_at: Utc::now(),
            outcome: OutcomeStage::Submitted,
            outcome_at: None,
            outcome_message_id: None,
            submit_error: None,
            selection_rationale: String::new(),
        }
    }

    #[test]
    fn duplicate_external_listing_id_is_a_unique_conflict() -> Result<()> {
        let store = store();
        store.insert_listing(&listing("ext-1"), &ListingMeta::default())?;
        let err = store
            .insert_listing(&listing("ext-1"), &ListingMeta::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueConflict);
        Ok(())
    }

    #[test]
    fn classification_rejects_score_maps_that_do_not_sum_to_one() -> Result<()> {
        let store = store();
        let id = store.insert_listing(&listing("ext-1"), &ListingMeta::default())?;
        let bad = ArchetypeScores {
            builder: 0.9,
            fixer: 0.5,
            operator: 0.0,
            translator: 0.0,
        };
        let err = store
            .record_classification(id, &bad, &[0.0; DIM], false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        Ok(())
    }

    #[test]
    fn embedding_dimension_mismatch_is_an_invariant_violation() -> Result<()> {
        let store = store();
        let id = store.insert_listing(&listing("ext-1"), &ListingMeta::default())?;
        let err = store
            .record_classification(id, &builder_scores(), &[1.0, 0.0], false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        Ok(())
    }

    #[test]
    fn only_one_batch_may_be_open() -> Result<()> {
        let store = store();
        let batch = store.open_batch(Archetype::Fixer, Archetype::Fixer)?;

        let err = store
            .open_batch(Archetype::Builder, Archetype::Builder)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);

        // No state change: the fixer batch still holds the lock.
        let open = store.open_batch_row()?.expect("open batch");
        assert_eq!(open.id, batch.id);

        store.close_batch(batch.id)?;
        store.open_batch(Archetype::Builder, Archetype::Builder)?;
        Ok(())
    }

    #[test]
    fn batch_requires_matching_profile_state() {
        let store = store();
        let err = store
            .open_batch(Archetype::Builder, Archetype::Fixer)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn application_against_intelligence_only_listing_is_rejected() -> Result<()> {
        let store = store();
        let id = classified_listing(&store, "ext-1");
        store.set_intelligence_only(id, true)?;
        let batch = store.open_batch(Archetype::Builder, Archetype::Builder)?;

        let err = store.record_application(&application_row(id, &batch)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        Ok(())
    }

    #[test]
    fn successful_emission_is_idempotent_per_listing_and_batch() -> Result<()> {
        let store = store();
        let id = classified_listing(&store, "ext-1");
        let batch = store.open_batch(Archetype::Builder, Archetype::Builder)?;

        let app = application_row(id, &batch);
        store.record_application(&app)?;
        // Re-emitting the same (listing, batch) changes nothing.
        store.record_application(&application_row(id, &batch))?;

        assert_eq!(store.batch(batch.id)?.app_count, 1);
        Ok(())
    }

    #[test]
    fn failed_submission_does_not_advance_the_count_and_can_be_retried() -> Result<()> {
        let store = store();
        let id = classified_listing(&store, "ext-1");
        let batch = store.open_batch(Archetype::Builder, Archetype::Builder)?;

        let mut failed = application_row(id, &batch);
        failed.submit_error = Some("submitter timeout".to_string());
        store.record_application(&failed)?;
        assert_eq!(store.batch(batch.id)?.app_count, 0);

        // Retry succeeds: same (listing, batch), error cleared, count advances.
        store.record_application(&application_row(id, &batch))?;
        assert_eq!(store.batch(batch.id)?.app_count, 1);
        Ok(())
    }

    #[test]
    fn outcome_never_downgrades() -> Result<()> {
        let store = store();
        let id = classified_listing(&store, "ext-1");
        let batch = store.open_batch(Archetype::Builder, Archetype::Builder)?;
        let app = application_row(id, &batch);
        store.record_application(&app)?;

        assert!(store.advance_outcome(app.id, OutcomeStage::Interview, Utc::now(), None)?);
        // Lower and equal priorities are both refused.
        assert!(!store.advance_outcome(app.id, OutcomeStage::Acknowledged, Utc::now(), None)?);
        assert!(!store.advance_outcome(app.id, OutcomeStage::Interview, Utc::now(), None)?);
        assert!(store.advance_outcome(app.id, OutcomeStage::Offer, Utc::now(), None)?);

        let stored = store.application(app.id)?.expect("application");
        assert_eq!(stored.outcome, OutcomeStage::Offer);
        Ok(())
    }

    #[test]
    fn duplicate_message_external_id_is_a_unique_conflict() -> Result<()> {
        let store = store();
        let message = Message {
            external_id: "msg-1".to_string(),
            received_at: Utc::now(),
            sender: "jane@woolworths.com.au".to_string(),
            sender_domain: "woolworths.com.au".to_string(),
            subject: "Next steps".to_string(),
            body: "We'd like to schedule a time.".to_string(),
            source_class: SenderClass::Direct,
            outcome: Some(OutcomeStage::Interview),
            outcome_confidence: 0.5,
            application_id: None,
            match_method: MatchMethod::Unmatched,
            needs_review: false,
            review_candidates: Vec::new(),
        };
        store.record_message(&message)?;
        let err = store.record_message(&message).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueConflict);
        Ok(())
    }

    #[test]
    fn confirm_match_updates_message_outcome_and_known_sender_together() -> Result<()> {
        let store = store();
        let id = classified_listing(&store, "ext-1");
        let batch = store.open_batch(Archetype::Builder, Archetype::Builder)?;
        let app = application_row(id, &batch);
        store.record_application(&app)?;

        let message = Message {
            external_id: "msg-1".to_string(),
            received_at: Utc::now(),
            sender: "jane@woolworths.com.au".to_string(),
            sender_domain: "woolworths.com.au".to_string(),
            subject: "Next steps".to_string(),
            body: "We'd like to schedule a time.".to_string(),
            source_class: SenderClass::Direct,
            outcome: Some(OutcomeStage::Interview),
            outcome_confidence: 0.5,
            application_id: None,
            match_method: MatchMethod::Unmatched,
            needs_review: true,
            review_candidates: vec![app.id],
        };
        store.record_message(&message)?;

        let sender = KnownSender {
            address: "jane@woolworths.com.au".to_string(),
            domain: "woolworths.com.au".to_string(),
            company: "Woolworths".to_string(),
            sender_class: SenderClass::Direct,
            first_seen: Utc::now(),
        };
        let advanced = store.confirm_match(
            "msg-1",
            app.id,
            MatchMethod::Cascade,
            Some(OutcomeStage::Interview),
            Some(&sender),
        )?;
        assert!(advanced);

        let stored = store.application(app.id)?.expect("application");
        assert_eq!(stored.outcome, OutcomeStage::Interview);
        assert_eq!(stored.outcome_message_id.as_deref(), Some("msg-1"));
        assert!(store.known_sender_by_domain("woolworths.com.au")?.is_some());
        assert!(store.messages_needing_review()?.is_empty());
        Ok(())
    }

    #[test]
    fn centroid_insert_is_idempotent_per_window() -> Result<()> {
        let store = store();
        let window_start = Utc::now() - Duration::days(30);
        let centroid = NewCentroid {
            archetype: Archetype::Builder,
            window_start,
            window_end: Utc::now(),
            jd_count: 7,
            shift: Some(0.07),
            gained_terms: vec!["lakehouse".to_string()],
            lost_terms: vec!["hadoop".to_string()],
            vector: vec![0.5; DIM],
        };
        assert!(store.insert_centroid(&centroid)?);
        assert!(!store.insert_centroid(&centroid)?);

        let (latest, vector) = store.latest_centroid(Archetype::Builder)?.expect("centroid");
        assert_eq!(latest.jd_count, 7);
        assert_eq!(vector.len(), DIM);
        Ok(())
    }

    #[test]
    fn embedding_reads_refuse_mismatched_model_versions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("quarry.db");
        let id = {
            let store = Store::open(&path, "model-a", DIM)?;
            let id = store.insert_listing(&listing("ext-1"), &ListingMeta::default())?;
            store.record_classification(id, &builder_scores(), &[1.0, 0.0, 0.0, 0.0], false)?;
            assert!(store.listing_embedding(id)?.is_some());
            id
        };

        // Reopen under a different model version: reads fail loudly until a
        // re-embedding pass updates the rows.
        let store = Store::open(&path, "model-b", DIM)?;
        let err = store.listing_embedding(id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert_eq!(store.listings_needing_reembed()?, vec![id]);

        let start = Utc::now() - Duration::days(1);
        let end = Utc::now() + Duration::days(1);
        let err = store
            .window_embeddings(Archetype::Builder, start, end)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);

        store.update_listing_embedding(id, &[0.0, 1.0, 0.0, 0.0])?;
        assert!(store.listing_embedding(id)?.is_some());
        assert!(store.listings_needing_reembed()?.is_empty());
        Ok(())
    }

    #[test]
    fn ghost_sweep_only_touches_old_submitted_applications() -> Result<()> {
        let store = store();
        let id = classified_listing(&store, "ext-1");
        let batch = store.open_batch(Archetype::Builder, Archetype::Builder)?;
        let mut app = application_row(id, &batch);
        app.submitted_at = Utc::now() - Duration::days(60);
        store.record_application(&app)?;

        let id2 = classified_listing(&store, "ext-2");
        let app2 = application_row(id2, &batch);
        store.record_application(&app2)?;

        let swept = store.ghost_sweep(Utc::now() - Duration::days(45))?;
        assert_eq!(swept, 1);
        assert_eq!(
            store.application(app.id)?.expect("app").outcome,
            OutcomeStage::Ghost
        );
        assert_eq!(
            store.application(app2.id)?.expect("app2").outcome,
            OutcomeStage::Submitted
        );
        Ok(())
    }

    #[test]
    fn queue_report_excludes_intelligence_only_and_applied_listings() -> Result<()> {
        let store = store();
        let queued = classified_listing(&store, "ext-q");
        let _ = queued;
        let intel = classified_listing(&store, "ext-i");
        store.set_intelligence_only(intel, true)?;
        let applied = classified_listing(&store, "ext-a");
        let batch = store.open_batch(Archetype::Builder, Archetype::Builder)?;
        store.record_application(&application_row(applied, &batch))?;

        let report = store.queue_report()?;
        let builder = report
            .per_archetype
            .iter()
            .find(|s| s.archetype == Archetype::Builder)
            .expect("builder line");
        assert_eq!(builder.count, 1);
        assert!((builder.avg_top_score - 0.7).abs() < 1e-9);
        assert_eq!(report.intelligence_only, 1);
        Ok(())
    }

    #[test]
    fn watermark_round_trips() -> Result<()> {
        let store = store();
        assert!(store.watermark("inbox")?.is_none());
        store.set_watermark("inbox", "msg-9")?;
        store.set_watermark("inbox", "msg-12")?;
        assert_eq!(store.watermark("inbox")?.as_deref(), Some("msg-12"));
        Ok(())
    }

    #[test]
    fn version_metrics_attribute_outcomes_to_version_ids() -> Result<()> {
        let store = store();
        let a = classified_listing(&store, "ext-a");
        let b = classified_listing(&store, "ext-b");
        let batch = store.open_batch(Archetype::Builder, Archetype::Builder)?;

        let mut app_a = application_row(a, &batch);
        app_a.version_id = "v1".to_string();
        store.record_application(&app_a)?;
        store.advance_outcome(app_a.id, OutcomeStage::Interview, Utc::now(), None)?;

        let mut app_b = application_row(b, &batch);
        app_b.version_id = "v2".to_string();
        store.record_application(&app_b)?;

        let metrics = store.version_metrics()?;
        let v1 = metrics.iter().find(|m| m.version_id == "v1").expect("v1");
        assert_eq!((v1.sent, v1.responses, v1.interviews), (1, 1, 1));
        let v2 = metrics.iter().find(|m| m.version_id == "v2").expect("v2");
        assert_eq!((v2.sent, v2.responses, v2.interviews), (1, 0, 0));
        Ok(())
    }
}
