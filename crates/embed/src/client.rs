//! Embedding-model client.
//!
//! The production implementation talks to an Ollama-compatible `/api/embed`
//! endpoint.  `HashEmbedder` is a deterministic offline fallback used when no
//! model service is reachable (and by tests): vectors are stable per input
//! but carry no semantic signal, so similarity terms simply stay quiet.

use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// A fixed-dimension text embedding backend.
///
/// `model_version()` tags every stored vector; the store refuses to read
/// vectors tagged with a different version.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn model_version(&self) -> &str;

    fn dimension(&self) -> usize;
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP client for an Ollama-compatible embedding endpoint, with an LRU
/// text→vector cache in front of it.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    timeout: Duration,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
        cache_size: usize,
    ) -> Self {
        let cache_size = NonZeroUsize::new(cache_size.max(1)).expect("max(1) is non-zero");
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            dimension,
            timeout,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    async fn request(&self, inputs: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let body = EmbedRequest {
            model: &self.model,
            input: inputs,
        };

        let response = tokio::time::timeout(
            self.timeout,
            self.client.post(&url).json(&body).send(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("embedding call timed out after {:?}", self.timeout))?
        .with_context(|| format!("POST {url}"))?;

        if !response.status().is_success() {
            bail!("embedding service returned {}", response.status());
        }

        let parsed: EmbedResponse = response.json().await.context("decoding embed response")?;
        for vector in &parsed.embeddings {
            if vector.len() != self.dimension {
                bail!(
                    "embedding service returned dimension {}, expected {}",
                    vector.len(),
                    self.dimension
                );
            }
        }
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(hit) = cache.get(text) {
                return Ok(hit.clone());
            }
        }

        let mut vectors = self.request(vec![text]).await?;
        let vector = vectors
            .pop()
            .context("embedding service returned no vectors")?;
        self.cache.lock().await.put(text.to_string(), vector.clone());
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // Serve cached entries, fetch the rest in one request.
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut missing: Vec<usize> = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for (idx, text) in texts.iter().enumerate() {
                match cache.get(text) {
                    Some(hit) => out[idx] = Some(hit.clone()),
                    None => missing.push(idx),
                }
            }
        }

        if !missing.is_empty() {
            let inputs: Vec<&str> = missing.iter().map(|&i| texts[i].as_str()).collect();
            let fetched = self.request(inputs).await?;
            if fetched.len() != missing.len() {
                bail!(
                    "embedding service returned {} vectors for {} inputs",
                    fetched.len(),
                    missing.len()
                );
            }
            let mut cache = self.cache.lock().await;
            for (&idx, vector) in missing.iter().zip(fetched.into_iter()) {
                cache.put(texts[idx].clone(), vector.clone());
                out[idx] = Some(vector);
            }
        }

        debug!(total = texts.len(), fetched = missing.len(), "embed batch served");
        Ok(out.into_iter().flatten().collect())
    }

    fn model_version(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic offline embedder: each token contributes a hashed unit
/// bump, so identical texts map to identical vectors.
pub struct HashEmbedder {
    dimension: usize,
    version: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            version: format!("hash-v1-{dimension}"),
        }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        use sha2::{Digest, Sha256};

        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 3)
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let slot = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dimension;
            let sign = if digest[4] % 2 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{Embedder, HashEmbedder};
    use crate::vector::cosine_similarity;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() -> Result<()> {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("migrate the legacy warehouse").await?;
        let b = embedder.embed("migrate the legacy warehouse").await?;
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_texts_are_more_similar_than_disjoint_ones() -> Result<()> {
        let embedder = HashEmbedder::new(256);
        let a = embedder.embed("migrate legacy warehouse to snowflake").await?;
        let b = embedder.embed("migrate aging warehouse to snowflake").await?;
        let c = embedder.embed("stakeholder workshops and reporting").await?;

        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        Ok(())
    }
}
