//! services/api/src/adapters/index.rs
//!
//! The knowledge index adapter: a per-tenant semantic store over PostgreSQL.
//! Documents are chunked, embedded through the OpenAI-compatible embeddings
//! API and stored with tenant/category/source metadata; retrieval embeds the
//! query and ranks candidate chunks by cosine similarity in-process.
//!
//! Writes to one tenant's partition are serialized by a per-tenant async
//! mutex (concurrent chunk inserts into the same partition would interleave);
//! reads run concurrently with each other and with other tenants' writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use courseforge_core::ports::{KnowledgeIndexService, PortError, PortResult};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

/// Chunking parameters: roughly one embedding per ~1k characters with a
/// small overlap so sentences on a boundary stay retrievable.
const CHUNK_SIZE: usize = 1024;
const CHUNK_OVERLAP: usize = 50;

/// Candidate pool fetched per query before in-process ranking.
const CANDIDATE_LIMIT: i64 = 512;

/// A knowledge index adapter implementing the `KnowledgeIndexService` port.
#[derive(Clone)]
pub struct PgKnowledgeIndex {
    pool: PgPool,
    client: Client<OpenAIConfig>,
    embedding_model: String,
    tenant_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

#[derive(FromRow)]
struct ChunkRecord {
    source: String,
    content: String,
    embedding: Json<Vec<f32>>,
}

impl PgKnowledgeIndex {
    pub fn new(pool: PgPool, client: Client<OpenAIConfig>, embedding_model: String) -> Self {
        Self {
            pool,
            client,
            embedding_model,
            tenant_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, tenant_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.tenant_locks.lock().expect("tenant lock map poisoned");
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn embed(&self, inputs: Vec<String>) -> PortResult<Vec<Vec<f32>>> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.embedding_model)
            .input(inputs)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(response
            .data
            .into_iter()
            .map(|item| item.embedding)
            .collect())
    }
}

#[async_trait]
impl KnowledgeIndexService for PgKnowledgeIndex {
    async fn index(
        &self,
        tenant_id: &str,
        category: &str,
        source: &str,
        text: &str,
    ) -> PortResult<Vec<Uuid>> {
        if text.trim().is_empty() {
            warn!(tenant_id, source, "attempted to index empty text");
            return Ok(Vec::new());
        }

        let chunks = chunk_text(text, CHUNK_SIZE, CHUNK_OVERLAP);
        let embeddings = self.embed(chunks.clone()).await?;
        if embeddings.len() != chunks.len() {
            return Err(PortError::Unexpected(format!(
                "embedding count {} does not match chunk count {}",
                embeddings.len(),
                chunks.len()
            )));
        }

        let tenant_lock = self.lock_for(tenant_id);
        let _guard = tenant_lock.lock().await;

        let mut ids = Vec::with_capacity(chunks.len());
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO knowledge_chunks (id, tenant_id, category, source, content, embedding) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(id)
            .bind(tenant_id)
            .bind(category)
            .bind(source)
            .bind(&chunk)
            .bind(Json(&embedding))
            .execute(&mut *tx)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
            ids.push(id);
        }
        tx.commit()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        info!(tenant_id, category, chunks = ids.len(), "indexed document");
        Ok(ids)
    }

    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> PortResult<Vec<String>> {
        info!(tenant_id, query = %query.chars().take(50).collect::<String>(), "retrieving");
        let query_embedding = self
            .embed(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PortError::Unexpected("empty embedding response".to_string()))?;

        let records: Vec<ChunkRecord> = match category {
            Some(category) => {
                sqlx::query_as::<_, ChunkRecord>(
                    "SELECT source, content, embedding FROM knowledge_chunks \
                     WHERE tenant_id = $1 AND category = $2 \
                     ORDER BY created_at DESC LIMIT $3",
                )
                .bind(tenant_id)
                .bind(category)
                .bind(CANDIDATE_LIMIT)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, ChunkRecord>(
                    "SELECT source, content, embedding FROM knowledge_chunks \
                     WHERE tenant_id = $1 \
                     ORDER BY created_at DESC LIMIT $2",
                )
                .bind(tenant_id)
                .bind(CANDIDATE_LIMIT)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let mut scored: Vec<(f32, ChunkRecord)> = records
            .into_iter()
            .map(|record| {
                let score = cosine_similarity(&query_embedding, &record.embedding.0);
                (score, record)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(score, record)| {
                format!(
                    "**Relevance score:** {score:.2}\n**Source:** {}\n**Document:**\n{}",
                    record.source, record.content
                )
            })
            .collect())
    }
}

/// Splits text into overlapping chunks, preferring paragraph and whitespace
/// boundaries over mid-word cuts.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let hard_end = (start + chunk_size).min(chars.len());
        let mut end = hard_end;
        if hard_end < chars.len() {
            // Walk back to the nearest whitespace so words stay intact.
            let window_start = start + chunk_size / 2;
            if let Some(pos) = (window_start..hard_end).rev().find(|&i| chars[i].is_whitespace()) {
                end = pos;
            }
        }
        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        if end >= chars.len() {
            break;
        }
        // Step back by the overlap, but always make forward progress.
        let next_start = end.saturating_sub(overlap);
        start = if next_start > start { next_start } else { end };
    }
    chunks
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
