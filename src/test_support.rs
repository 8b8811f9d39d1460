//! Deterministic stand-ins for the network-backed providers.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;

use crate::chat::{ChatAgent, ChatRequest, ChatResponse};
use crate::config::EmbeddingCacheConfig;
use crate::embedding::Embedder;
use crate::embedding_cache::EmbeddingCache;

pub const WORD_DIMS: usize = 1024;

/// Bag-of-words embedder: each lowercase word bumps one hashed dimension.
pub struct WordEmbedder;

fn word_slot(word: &str) -> usize {
    // FNV-1a
    let mut h: u64 = 0xcbf29ce484222325;
    for b in word.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h % WORD_DIMS as u64) as usize
}

pub fn word_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; WORD_DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        v[word_slot(&word.to_lowercase())] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for WordEmbedder {
    fn model_name(&self) -> &str {
        "words"
    }
    fn dims(&self) -> usize {
        WORD_DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| word_vector(t)).collect())
    }
}

pub fn word_cache() -> Arc<EmbeddingCache> {
    Arc::new(EmbeddingCache::new(
        Arc::new(WordEmbedder),
        &EmbeddingCacheConfig::default(),
    ))
}

/// Answers with the question and the number of context chunks it was given.
pub struct EchoAgent;

#[async_trait]
impl ChatAgent for EchoAgent {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            answer: format!("{} [{} chunks]", req.question, req.chunks.len()),
        })
    }
}

/// A migrated database in a temporary directory; keep the `TempDir` alive.
pub async fn temp_pool() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = crate::db::connect_path(&tmp.path().join("cx.sqlite"))
        .await
        .unwrap();
    crate::migrate::run_migrations(&pool).await.unwrap();
    (tmp, pool)
}
