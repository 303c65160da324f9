//! Batch coordination under the shared-profile invariant.
//!
//! Only one archetype's applications may be in flight at a time: the one
//! matching the externally advertised profile.  The "one open batch" rule is
//! enforced by the store's single-row lock, so it holds across hosts; this
//! crate sequences enqueue → open → emit → close around it and owns the
//! submitter seam.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use quarry_classify::SelectionDecision;
use quarry_store::{
    Application, Archetype, Batch, Listing, OutcomeStage, QueueReport, ResumeVariant, Store,
    StoreError, StoreResult,
};

/// Everything the external submitter needs to lodge one application.
#[derive(Debug, Clone)]
pub struct SubmissionPlan {
    pub listing_external_id: String,
    pub listing_title: String,
    pub company: String,
    pub variant: Archetype,
    /// Variant file path inside the version store.
    pub variant_path: String,
    /// Version identifier of the variant at emission time.
    pub version_id: String,
    /// Must equal the externally advertised profile state.
    pub profile_state: Archetype,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    /// Worth retrying: timeouts, 5xx, flaky residential link.
    #[error("transient submit failure: {0}")]
    Transient(String),
    /// Not worth retrying: revoked session, changed form schema.
    #[error("permanent submit failure: {0}")]
    Permanent(String),
}

/// The headless-browser collaborator on the residential host.  Single-flight;
/// the coordinator never parallelises submissions.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, plan: &SubmissionPlan) -> Result<(), SubmitError>;
}

#[derive(Debug)]
pub enum EmitOutcome {
    Submitted(Application),
    /// This (listing, batch) pair already went out; emission is idempotent.
    AlreadySubmitted(Application),
    /// Submitter failed; recorded with a recoverable-error marker and not
    /// counted against the batch.
    Failed { error: String },
}

pub struct BatchCoordinator {
    store: Arc<Store>,
    submitter: Arc<dyn Submitter>,
}

impl BatchCoordinator {
    pub fn new(store: Arc<Store>, submitter: Arc<dyn Submitter>) -> Self {
        Self { store, submitter }
    }

    /// Per-archetype queue depths and averages, plus the intelligence-only
    /// count; the `queue` CLI surface.
    pub fn list_queue(&self) -> StoreResult<QueueReport> {
        self.store.queue_report()
    }

    /// Open a batch.  `asserted_profile_state` is the caller's statement of
    /// what the external profile currently advertises.
    pub fn open_batch(
        &self,
        archetype: Archetype,
        asserted_profile_state: Archetype,
    ) -> StoreResult<Batch> {
        let batch = self.store.open_batch(archetype, asserted_profile_state)?;
        info!(batch = %batch.id, archetype = archetype.slug(), "batch opened");
        Ok(batch)
    }

    pub fn close_batch(&self, batch_id: Uuid) -> StoreResult<Batch> {
        let batch = self.store.close_batch(batch_id)?;
        info!(batch = %batch.id, applications = batch.app_count, "batch closed");
        Ok(batch)
    }

    pub fn open_batch_row(&self) -> StoreResult<Option<Batch>> {
        self.store.open_batch_row()
    }

    /// Emit one application: hand the plan to the submitter, and record the
    /// application iff it succeeds.  Idempotent per (listing, batch); a prior
    /// failed attempt is retried in place.
    pub async fn emit(
        &self,
        batch: &Batch,
        listing: &Listing,
        variant: &ResumeVariant,
        decision: &SelectionDecision,
    ) -> StoreResult<EmitOutcome> {
        if listing.intelligence_only {
            return Err(StoreError::Invariant(format!(
                "listing {} is intelligence-only and cannot be emitted",
                listing.external_id
            )));
        }
        if decision.archetype != batch.archetype {
            return Err(StoreError::Invariant(format!(
                "selected variant {} does not match open batch {}",
                decision.archetype.slug(),
                batch.archetype.slug()
            )));
        }

        if let Some(existing) = self.store.application_for(listing.id, batch.id)? {
            if existing.submit_error.is_none() {
                return Ok(EmitOutcome::AlreadySubmitted(existing));
            }
        }

        let plan = SubmissionPlan {
            listing_external_id: listing.external_id.clone(),
            listing_title: listing.title.clone(),
            company: listing.company.clone(),
            variant: variant.archetype,
            variant_path: variant.path.clone(),
            version_id: variant.version_id.clone(),
            profile_state: batch.profile_state,
        };

        let submit_result = self.submitter.submit(&plan).await;
        let application = Application {
            id: Uuid::new_v4(),
            listing_id: listing.id,
            variant: variant.archetype,
            version_id: variant.version_id.clone(),
            profile_state: batch.profile_state,
            batch_id: batch.id,
            submitted_at: Utc::now(),
            outcome: OutcomeStage::Submitted,
            outcome_at: None,
            outcome_message_id: None,
            submit_error: submit_result.as_ref().err().map(|e| e.to_string()),
            selection_rationale: decision.rationale.clone(),
        };
        self.store.record_application(&application)?;

        match submit_result {
            Ok(()) => {
                info!(
                    listing = %listing.external_id,
                    batch = %batch.id,
                    version = %application.version_id,
                    "application submitted"
                );
                Ok(EmitOutcome::Submitted(application))
            }
            Err(err) => {
                warn!(
                    listing = %listing.external_id,
                    batch = %batch.id,
                    %err,
                    "submission failed; recorded with recoverable-error marker"
                );
                Ok(EmitOutcome::Failed {
                    error: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use chrono::Utc;

    use quarry_classify::select_variant;
    use quarry_store::{ArchetypeScores, ErrorKind, ListingMeta, NewListing};

    use super::*;

    /// Scripted submitter: fails the first `fail_first` calls, then succeeds.
    struct ScriptedSubmitter {
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl ScriptedSubmitter {
        fn succeeding() -> Self {
            Self {
                fail_first: 0,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_once() -> Self {
            Self {
                fail_first: 1,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Submitter for ScriptedSubmitter {
        async fn submit(&self, _plan: &SubmissionPlan) -> Result<(), SubmitError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(SubmitError::Transient("browser timed out".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn fixture(submitter: ScriptedSubmitter) -> (Arc<Store>, BatchCoordinator, Listing) {
        let store = Arc::new(Store::open_in_memory("test-model", 4).expect("store"));
        let listing_id = store
            .insert_listing(
                &NewListing {
                    external_id: "ext-1".to_string(),
                    title: "Senior Data Engineer".to_string(),
                    company: "Acme".to_string(),
                    body: "Design and build a new platform.".to_string(),
                    first_seen: Utc::now(),
                    search_keyword: "data engineer".to_string(),
                },
                &ListingMeta::default(),
            )
            .expect("insert listing");
        let scores = ArchetypeScores {
            builder: 0.7,
            fixer: 0.2,
            operator: 0.05,
            translator: 0.05,
        };
        store
            .record_classification(listing_id, &scores, &[1.0, 0.0, 0.0, 0.0], false)
            .expect("classify");
        let listing = store.listing(listing_id).expect("listing");

        let coordinator = BatchCoordinator::new(store.clone(), Arc::new(submitter));
        (store, coordinator, listing)
    }

    fn builder_variant() -> ResumeVariant {
        ResumeVariant {
            archetype: Archetype::Builder,
            path: "resumes/builder.md".to_string(),
            version_id: "abc123".to_string(),
            alignment: Some(0.9),
            last_rewrite: None,
        }
    }

    fn builder_decision(listing: &Listing) -> SelectionDecision {
        let scores = listing.scores.expect("classified");
        select_variant(&scores, Some(0.9), 0.10, 0.15)
    }

    #[tokio::test]
    async fn emit_records_the_application_with_the_current_version_id() -> Result<()> {
        let (store, coordinator, listing) = fixture(ScriptedSubmitter::succeeding());
        let batch = coordinator.open_batch(Archetype::Builder, Archetype::Builder)?;

        let outcome = coordinator
            .emit(&batch, &listing, &builder_variant(), &builder_decision(&listing))
            .await?;
        let EmitOutcome::Submitted(application) = outcome else {
            panic!("expected submission");
        };
        assert_eq!(application.version_id, "abc123");
        assert_eq!(application.profile_state, Archetype::Builder);
        assert!(application.selection_rationale.contains("top=builder"));
        assert_eq!(store.batch(batch.id)?.app_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn second_emit_for_the_same_listing_is_a_no_op() -> Result<()> {
        let (store, coordinator, listing) = fixture(ScriptedSubmitter::succeeding());
        let batch = coordinator.open_batch(Archetype::Builder, Archetype::Builder)?;
        let decision = builder_decision(&listing);

        coordinator
            .emit(&batch, &listing, &builder_variant(), &decision)
            .await?;
        let second = coordinator
            .emit(&batch, &listing, &builder_variant(), &decision)
            .await?;
        assert!(matches!(second, EmitOutcome::AlreadySubmitted(_)));
        assert_eq!(store.batch(batch.id)?.app_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_submission_is_recorded_and_retryable() -> Result<()> {
        let (store, coordinator, listing) = fixture(ScriptedSubmitter::failing_once());
        let batch = coordinator.open_batch(Archetype::Builder, Archetype::Builder)?;
        let decision = builder_decision(&listing);

        let first = coordinator
            .emit(&batch, &listing, &builder_variant(), &decision)
            .await?;
        assert!(matches!(first, EmitOutcome::Failed { .. }));
        assert_eq!(store.batch(batch.id)?.app_count, 0);

        // The batch can still close, and the retry goes through.
        let retry = coordinator
            .emit(&batch, &listing, &builder_variant(), &decision)
            .await?;
        assert!(matches!(retry, EmitOutcome::Submitted(_)));
        assert_eq!(store.batch(batch.id)?.app_count, 1);
        coordinator.close_batch(batch.id)?;
        Ok(())
    }

    #[tokio::test]
    async fn opening_a_second_batch_fails_without_state_change() -> Result<()> {
        let (_store, coordinator, _listing) = fixture(ScriptedSubmitter::succeeding());
        let fixer = coordinator.open_batch(Archetype::Fixer, Archetype::Fixer)?;

        let err = coordinator
            .open_batch(Archetype::Builder, Archetype::Builder)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert_eq!(coordinator.open_batch_row()?.map(|b| b.id), Some(fixer.id));
        Ok(())
    }

    #[tokio::test]
    async fn emitting_a_mismatched_archetype_is_an_invariant_violation() -> Result<()> {
        let (_store, coordinator, listing) = fixture(ScriptedSubmitter::succeeding());
        let batch = coordinator.open_batch(Archetype::Fixer, Archetype::Fixer)?;

        let err = coordinator
            .emit(&batch, &listing, &builder_variant(), &builder_decision(&listing))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        Ok(())
    }
}
