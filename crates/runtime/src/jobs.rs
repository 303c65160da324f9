//! Background job loops.
//!
//! Each job is a spawned loop sleeping its interval inside `tokio::select!`
//! against a shared shutdown watch channel.  The loop body runs inline, so a
//! job is never concurrent with itself; a tick that arrives while the
//! previous run is still going is simply absorbed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::interfaces::InboxSource;
use crate::pipeline::Pipeline;

/// Shutdown signal shared by every job.  Flip to true to drain.
pub fn shutdown_channel() -> watch::Sender<bool> {
    let (tx, _rx) = watch::channel(false);
    tx
}

/// Inbox poll: fetch past the watermark, dedupe, parse, classify, match,
/// persist.
pub fn spawn_inbox_poll(
    pipeline: Arc<Pipeline>,
    inbox: Arc<dyn InboxSource>,
    shutdown_tx: &watch::Sender<bool>,
) {
    let mut rx = shutdown_tx.subscribe();
    let interval = Duration::from_secs(pipeline.config().scheduler.inbox_poll_minutes * 60);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match pipeline.poll_inbox(inbox.as_ref()).await {
                        Ok(stats) if stats.fetched > 0 => {
                            info!(fetched = stats.fetched, matched = stats.matched, "inbox poll tick");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "inbox poll failed; backing off to next tick"),
                    }
                }
                changed = rx.changed() => {
                    if changed.is_ok() && *rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Weekly centroid/drift/rewrite evaluation.
pub fn spawn_drift_job(pipeline: Arc<Pipeline>, shutdown_tx: &watch::Sender<bool>) {
    let mut rx = shutdown_tx.subscribe();
    let interval =
        Duration::from_secs(pipeline.config().scheduler.drift_interval_days * 24 * 60 * 60);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match pipeline.run_drift_cycle(Utc::now()).await {
                        Ok(report) => {
                            let recorded = report
                                .per_archetype
                                .iter()
                                .filter(|line| line.centroid_recorded)
                                .count();
                            info!(centroids = recorded, ghosted = report.ghosted, "drift cycle complete");
                        }
                        Err(err) => warn!(%err, "drift cycle failed"),
                    }
                }
                changed = rx.changed() => {
                    if changed.is_ok() && *rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Classification retry sweep for listings whose ingest hook failed.
pub fn spawn_classify_retry(pipeline: Arc<Pipeline>, shutdown_tx: &watch::Sender<bool>) {
    let mut rx = shutdown_tx.subscribe();
    let interval = Duration::from_secs(60);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match pipeline.retry_unclassified().await {
                        Ok(count) if count > 0 => info!(count, "reclassified held-back listings"),
                        Ok(_) => {}
                        Err(err) => warn!(%err, "classification retry sweep failed"),
                    }
                }
                changed = rx.changed() => {
                    if changed.is_ok() && *rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Point-in-time store snapshots.
pub fn spawn_backup_job(pipeline: Arc<Pipeline>, shutdown_tx: &watch::Sender<bool>) {
    let mut rx = shutdown_tx.subscribe();
    let interval =
        Duration::from_secs(pipeline.config().scheduler.backup_interval_hours * 60 * 60);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = pipeline.backup() {
                        warn!(%err, "store snapshot failed");
                    }
                }
                changed = rx.changed() => {
                    if changed.is_ok() && *rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
