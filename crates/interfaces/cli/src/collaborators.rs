//! Command-based collaborator adapters.
//!
//! The real submitter and inbox poller live on the residential host; here
//! they are reached as external processes speaking JSON on stdio, so any
//! implementation (headless browser wrapper, IMAP script) can be wired in
//! through configuration.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use quarry_batch::{SubmissionPlan, SubmitError, Submitter};
use quarry_runtime::InboxSource;
use quarry_store::NewMessage;

/// Generous deadline for a full headless-browser submission.
const SUBMIT_DEADLINE: Duration = Duration::from_secs(180);
const INBOX_DEADLINE: Duration = Duration::from_secs(60);

pub struct CommandSubmitter {
    command: String,
}

impl CommandSubmitter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Submitter for CommandSubmitter {
    async fn submit(&self, plan: &SubmissionPlan) -> Result<(), SubmitError> {
        let payload = json!({
            "listing_external_id": plan.listing_external_id,
            "listing_title": plan.listing_title,
            "company": plan.company,
            "variant": plan.variant.slug(),
            "variant_path": plan.variant_path,
            "version_id": plan.version_id,
            "profile_state": plan.profile_state.slug(),
        });

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SubmitError::Permanent(format!("spawning submitter: {e}")))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(payload.to_string().as_bytes())
                .await
                .map_err(|e| SubmitError::Transient(format!("writing plan: {e}")))?;
        }
        drop(child.stdin.take());

        let output = match tokio::time::timeout(SUBMIT_DEADLINE, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| SubmitError::Transient(e.to_string()))?,
            Err(_) => {
                return Err(SubmitError::Transient(format!(
                    "submitter exceeded {SUBMIT_DEADLINE:?}"
                )));
            }
        };

        match output.status.code() {
            Some(0) => {
                debug!(listing = %plan.listing_external_id, "submitter reported success");
                Ok(())
            }
            // Exit 2 is the submitter's contract for "do not retry".
            Some(2) => Err(SubmitError::Permanent(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            _ => Err(SubmitError::Transient(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }
}

pub struct CommandInbox {
    command: String,
}

impl CommandInbox {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl InboxSource for CommandInbox {
    async fn fetch_since(
        &self,
        watermark: Option<&str>,
        lookback: DateTime<Utc>,
    ) -> Result<Vec<NewMessage>> {
        let output = tokio::time::timeout(
            INBOX_DEADLINE,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&self.command)
                .env("QUARRY_WATERMARK", watermark.unwrap_or_default())
                .env("QUARRY_LOOKBACK", lookback.to_rfc3339())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .with_context(|| format!("inbox command exceeded {INBOX_DEADLINE:?}"))?
        .context("running inbox command")?;

        if !output.status.success() {
            bail!(
                "inbox command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let messages: Vec<NewMessage> =
            serde_json::from_slice(&output.stdout).context("decoding inbox output")?;
        Ok(messages)
    }
}
