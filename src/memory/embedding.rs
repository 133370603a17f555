//! Embedding collaborator used by semantic search.
//!
//! The engine only needs `embed(text) -> Option<vector>` and a switch telling
//! whether vector search is available at all. `HttpEmbedder` talks to any
//! OpenAI-compatible `/embeddings` endpoint; `DisabledEmbedder` turns the
//! semantic layer off.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::error::Result;
use super::graph::Entity;
use super::storage::Database;

pub trait Embedder: Send + Sync {
    /// Embed `text`, or `None` when the embedding could not be produced.
    fn embed(&self, text: &str) -> Option<Vec<f32>>;

    fn vector_enabled(&self) -> bool;
}

/// Embedder used when no embedding endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledEmbedder;

impl Embedder for DisabledEmbedder {
    fn embed(&self, _text: &str) -> Option<Vec<f32>> {
        None
    }

    fn vector_enabled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Blocking client for OpenAI-compatible embedding APIs.
///
/// The HTTP client is built on first use so it is created on the blocking
/// thread that calls `embed`.
pub struct HttpEmbedder {
    config: HttpEmbedderConfig,
    client: OnceLock<reqwest::blocking::Client>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Option<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Some(client);
        }
        match reqwest::blocking::Client::builder()
            .timeout(self.config.timeout)
            .build()
        {
            Ok(client) => Some(self.client.get_or_init(|| client)),
            Err(err) => {
                warn!("Failed to build embedding HTTP client: {}", err);
                None
            }
        }
    }

    fn request(&self, text: &str) -> std::result::Result<Vec<f32>, String> {
        let client = self.client().ok_or("no HTTP client")?;
        let mut request = client.post(&self.config.endpoint).json(&EmbeddingRequest {
            model: &self.config.model,
            input: text,
        });
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("embedding endpoint returned {}", status));
        }
        let body: EmbeddingResponse = response.json().map_err(|e| e.to_string())?;
        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| "empty embedding result".to_string())
    }
}

impl Embedder for HttpEmbedder {
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.request(text) {
            Ok(vector) => {
                debug!(dimension = vector.len(), "Generated embedding");
                Some(vector)
            }
            Err(err) => {
                warn!("Embedding request failed: {}", err);
                None
            }
        }
    }

    fn vector_enabled(&self) -> bool {
        !self.config.endpoint.trim().is_empty()
    }
}

/// Text embedded for an entity.
pub fn entity_embedding_text(entity: &Entity) -> String {
    [
        Some(entity.name.as_str()),
        Some(entity.entity_type.as_str()),
        entity.aliases.as_deref(),
        entity.description.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|part| !part.trim().is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

/// Embed entities that have no stored vector yet. Returns how many were updated.
pub fn reindex_embeddings(db: &Database, embedder: &dyn Embedder, limit: usize) -> Result<usize> {
    if !embedder.vector_enabled() {
        return Ok(0);
    }
    let mut updated = 0;
    for entity in db.entities_missing_embeddings(limit)? {
        if embed_entity(db, embedder, &entity)? {
            updated += 1;
        } else {
            warn!(id = entity.id, "Skipping entity without embedding");
        }
    }
    debug!(updated, "Reindexed entity embeddings");
    Ok(updated)
}

/// Re-embed entities by id after their text changed; returns how many were stored.
///
/// Ids that no longer exist are skipped.
pub fn embed_entities(db: &Database, embedder: &dyn Embedder, ids: &[i64]) -> Result<usize> {
    if !embedder.vector_enabled() {
        return Ok(0);
    }
    let mut stored = 0;
    for &id in ids {
        let Some(entity) = db.get_entity(id)? else {
            continue;
        };
        if embed_entity(db, embedder, &entity)? {
            stored += 1;
        }
    }
    Ok(stored)
}

/// Embed and store one entity's vector; `false` when nothing was stored.
pub fn embed_entity(db: &Database, embedder: &dyn Embedder, entity: &Entity) -> Result<bool> {
    if !embedder.vector_enabled() {
        return Ok(false);
    }
    match embedder.embed(&entity_embedding_text(entity)) {
        Some(vector) => {
            db.set_entity_embedding(entity.id, &vector)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine distance (`1 - cosine similarity`); `None` for mismatched or zero vectors.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(1.0 - dot / (norm_a * norm_b))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    /// Embedder returning canned vectors keyed by exact text.
    #[derive(Default)]
    pub struct FixedEmbedder {
        pub vectors: HashMap<String, Vec<f32>>,
    }

    impl FixedEmbedder {
        pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
            self.vectors.insert(text.to_string(), vector);
            self
        }
    }

    impl Embedder for FixedEmbedder {
        fn embed(&self, text: &str) -> Option<Vec<f32>> {
            self.vectors.get(text).cloned()
        }

        fn vector_enabled(&self) -> bool {
            true
        }
    }
}
