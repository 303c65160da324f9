//! Contracts to the external collaborators the core consumes but does not
//! own: the inbox poller and the resume version store.  (The submitter seam
//! lives with the batch coordinator; the embedding model behind
//! `quarry_embed::Embedder`.)

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use quarry_store::{Archetype, NewMessage};

/// Yields raw messages in receive order, newer than the watermark, within a
/// short lookback window.
#[async_trait]
pub trait InboxSource: Send + Sync {
    async fn fetch_since(
        &self,
        watermark: Option<&str>,
        lookback: DateTime<Utc>,
    ) -> Result<Vec<NewMessage>>;
}

/// Addresses resume variants by (archetype, version identifier).  The core
/// never writes here; rewrites are committed externally.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Version identifier of the variant's current content.
    async fn current_version(&self, archetype: Archetype) -> Result<String>;

    /// Historical retrieval of the variant text at a given version.
    async fn read_version(&self, archetype: Archetype, version: &str) -> Result<String>;

    /// Path of the variant file inside the store.
    fn variant_path(&self, archetype: Archetype) -> String;
}

/// Version store backed by a plain git checkout: one markdown file per
/// archetype, version identifiers are commit hashes.
pub struct GitVersionStore {
    repo_path: PathBuf,
}

impl GitVersionStore {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let out = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .with_context(|| format!("running git {} in {}", args.join(" "), self.repo_path.display()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

#[async_trait]
impl VersionStore for GitVersionStore {
    async fn current_version(&self, archetype: Archetype) -> Result<String> {
        let path = self.variant_path(archetype);
        let hash = self
            .git(&["log", "-n", "1", "--format=%H", "--", &path])
            .await?;
        if hash.is_empty() {
            bail!("no committed version of {path}");
        }
        Ok(hash)
    }

    async fn read_version(&self, archetype: Archetype, version: &str) -> Result<String> {
        let path = self.variant_path(archetype);
        self.git(&["show", &format!("{version}:{path}")]).await
    }

    fn variant_path(&self, archetype: Archetype) -> String {
        format!("{}.md", archetype.slug())
    }
}
