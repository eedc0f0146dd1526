// Aviary Engine — Embedder Capability
// Produces fixed-width vectors for events, entity names, learnings, and
// summaries. Two backends behind one enum: an HTTP client (Ollama or any
// OpenAI-compatible embeddings API) and a deterministic local hash embedder
// for offline mode and tests. Vectors are always stored with the producing
// provider id so that searches never mix embedding spaces.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::EmbeddingConfig;
use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Vectors plus the id of the backend that actually produced them.
/// When the primary degrades to the API fallback, the id follows.
#[derive(Debug, Clone)]
pub struct EmbedBatch {
    pub provider_id: String,
    pub vectors: Vec<Vec<f32>>,
}

// ── HTTP backend ───────────────────────────────────────────────────────────

/// Which wire shape the endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStyle {
    /// POST /api/embeddings { model, prompt } — one text per call.
    Ollama,
    /// POST /v1/embeddings { model, input: [...] } — batched.
    OpenAi,
}

pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    model: String,
    style: HttpStyle,
    dims: usize,
    /// Set once the first embed round-trips successfully.
    ready: AtomicBool,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, style: HttpStyle, dims: usize) -> Self {
        HttpEmbedder {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            style,
            dims,
            ready: AtomicBool::new(false),
        }
    }

    pub fn provider_id(&self) -> String {
        format!("{}@{}", self.model, self.dims)
    }

    pub async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let vectors = match self.style {
            HttpStyle::Ollama => {
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    out.push(self.embed_ollama(text).await?);
                }
                out
            }
            HttpStyle::OpenAi => self.embed_openai(texts).await?,
        };
        for v in &vectors {
            if v.len() != self.dims {
                return Err(EngineError::provider_permanent(
                    self.provider_id(),
                    format!("expected {} dims, got {}", self.dims, v.len()),
                ));
            }
        }
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!("[embedder] {} ready ({} dims)", self.provider_id(), self.dims);
        }
        Ok(vectors)
    }

    async fn embed_ollama(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| EngineError::provider_retryable(self.provider_id(), e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_error(&self.provider_id(), resp.status().as_u16()));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::provider_retryable(self.provider_id(), e.to_string()))?;
        parse_vector(&body["embedding"])
            .ok_or_else(|| EngineError::provider_permanent(self.provider_id(), "missing embedding"))
    }

    async fn embed_openai(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|e| EngineError::provider_retryable(self.provider_id(), e.to_string()))?;
        if !resp.status().is_success() {
            return Err(status_error(&self.provider_id(), resp.status().as_u16()));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::provider_retryable(self.provider_id(), e.to_string()))?;
        let data = body["data"]
            .as_array()
            .ok_or_else(|| EngineError::provider_permanent(self.provider_id(), "missing data"))?;
        let mut out = Vec::with_capacity(data.len());
        for item in data {
            out.push(parse_vector(&item["embedding"]).ok_or_else(|| {
                EngineError::provider_permanent(self.provider_id(), "missing embedding")
            })?);
        }
        Ok(out)
    }
}

fn status_error(provider: &str, status: u16) -> EngineError {
    if matches!(status, 408 | 429 | 500 | 502 | 503 | 529) {
        EngineError::provider_retryable(provider, format!("HTTP {}", status))
    } else {
        EngineError::provider_permanent(provider, format!("HTTP {}", status))
    }
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
}

// ── Hash backend ───────────────────────────────────────────────────────────

/// Deterministic local embedder: tokens and character trigrams are hashed
/// into a fixed-width signed accumulator, then L2-normalized. No model, no
/// network — identical input always yields the identical vector, which the
/// tests rely on.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        HashEmbedder { dims }
    }

    pub fn provider_id(&self) -> String {
        format!("hash@{}", self.dims)
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut acc = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            self.bump(&mut acc, token, 1.0);
            let chars: Vec<char> = token.chars().collect();
            for window in chars.windows(3) {
                let gram: String = window.iter().collect();
                self.bump(&mut acc, &gram, 0.5);
            }
        }
        let norm: f32 = acc.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 1e-8 {
            for x in acc.iter_mut() {
                *x /= norm;
            }
        }
        acc
    }

    fn bump(&self, acc: &mut [f32], token: &str, weight: f32) {
        let digest = Sha256::digest(token.as_bytes());
        let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % self.dims;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        acc[idx] += sign * weight;
    }
}

// ── Enum dispatch ──────────────────────────────────────────────────────────

pub enum AnyEmbedder {
    Http(HttpEmbedder),
    Hash(HashEmbedder),
}

impl AnyEmbedder {
    pub fn provider_id(&self) -> String {
        match self {
            AnyEmbedder::Http(e) => e.provider_id(),
            AnyEmbedder::Hash(e) => e.provider_id(),
        }
    }

    pub async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        match self {
            AnyEmbedder::Http(e) => e.embed(texts).await,
            AnyEmbedder::Hash(e) => Ok(texts.iter().map(|t| e.embed_one(t)).collect()),
        }
    }
}

/// The embedder the engine actually holds: a primary backend plus the
/// optional API fallback the config enables. Providers load lazily on the
/// first embed; a primary failure without fallback leaves the caller's
/// vector null (the event stays readable, just outside semantic search).
pub struct EmbedderStack {
    primary: AnyEmbedder,
    fallback: Option<AnyEmbedder>,
}

impl EmbedderStack {
    pub fn from_config(cfg: &EmbeddingConfig) -> Self {
        let primary = match cfg.backend.as_str() {
            "ollama" => AnyEmbedder::Http(HttpEmbedder::new(
                &cfg.base_url,
                &cfg.model,
                HttpStyle::Ollama,
                cfg.dims,
            )),
            "openai" => AnyEmbedder::Http(HttpEmbedder::new(
                &cfg.base_url,
                &cfg.model,
                HttpStyle::OpenAi,
                cfg.dims,
            )),
            _ => AnyEmbedder::Hash(HashEmbedder::new(cfg.dims)),
        };
        let fallback = if cfg.api_fallback && cfg.backend == "ollama" {
            // Local-first with remote degradation.
            Some(AnyEmbedder::Http(HttpEmbedder::new(
                &cfg.base_url,
                &cfg.model,
                HttpStyle::OpenAi,
                cfg.dims,
            )))
        } else {
            None
        };
        EmbedderStack { primary, fallback }
    }

    pub fn hash(dims: usize) -> Self {
        EmbedderStack { primary: AnyEmbedder::Hash(HashEmbedder::new(dims)), fallback: None }
    }

    /// The id new vectors will carry if the primary is healthy.
    pub fn provider_id(&self) -> String {
        self.primary.provider_id()
    }

    pub async fn embed(&self, texts: &[String]) -> EngineResult<EmbedBatch> {
        match self.primary.embed(texts).await {
            Ok(vectors) => Ok(EmbedBatch { provider_id: self.primary.provider_id(), vectors }),
            Err(primary_err) => {
                let Some(fallback) = &self.fallback else { return Err(primary_err) };
                warn!(
                    "[embedder] Primary failed ({}), degrading to API fallback",
                    primary_err
                );
                let vectors = fallback.embed(texts).await?;
                Ok(EmbedBatch { provider_id: fallback.provider_id(), vectors })
            }
        }
    }

    pub async fn embed_one(&self, text: &str) -> EngineResult<(String, Vec<f32>)> {
        let batch = self.embed(&[text.to_string()]).await?;
        let vector = batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::provider_permanent(batch.provider_id.clone(), "empty batch"))?;
        Ok((batch.provider_id, vector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::cosine_similarity;

    #[test]
    fn hash_embedder_is_deterministic() {
        let e = HashEmbedder::new(384);
        let a = e.embed_one("Alice prefers short summaries");
        let b = e.embed_one("Alice prefers short summaries");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn similar_text_scores_higher_than_unrelated() {
        let e = HashEmbedder::new(384);
        let a = e.embed_one("rust borrow checker ownership");
        let b = e.embed_one("rust ownership and the borrow checker");
        let c = e.embed_one("weekend gardening with tomatoes");
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashEmbedder::new(16);
        let v = e.embed_one("");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn stack_reports_provider_of_actual_backend() {
        let stack = EmbedderStack::hash(64);
        let batch = stack.embed(&["hello".into()]).await.unwrap();
        assert_eq!(batch.provider_id, "hash@64");
        assert_eq!(batch.vectors.len(), 1);
    }
}
