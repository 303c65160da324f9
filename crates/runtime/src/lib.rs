//! Scheduler, collaborator interfaces, and pipeline glue.

mod interfaces;
mod jobs;
mod pipeline;

pub use interfaces::{GitVersionStore, InboxSource, VersionStore};
pub use jobs::{
    shutdown_channel, spawn_backup_job, spawn_classify_retry, spawn_drift_job, spawn_inbox_poll,
};
pub use pipeline::{
    ArchetypeDrift, DriftCycleReport, InboxStats, IngestOutcome, Pipeline, ProcessOutcome,
};
