//! Chunk archives: stores of embedded [`TextChunk`]s searchable by similarity.
//!
//! | Engine | Type | Persistence |
//! |--------|------|-------------|
//! | `in-memory` | [`InMemoryChunkArchive`] | none; rebuilt from trained documents at startup |
//! | `sqlite` | [`SqliteChunkArchive`] | `archive_entries` table |
//! | `pinecone` | [`PineconeChunkArchive`] | a Pinecone index namespace |
//!
//! All embed a chunk's [`surrounding_context_string`](TextChunk::surrounding_context_string)
//! through the shared [`EmbeddingCache`]. The local engines answer queries
//! with a linear cosine-similarity scan; Pinecone ranks server-side. Every
//! engine finishes with [`order_and_apply_cutoff`].

pub mod memory;
pub mod pinecone;
pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::chunk::TextChunk;
use crate::config::Config;
use crate::embedding_cache::EmbeddingCache;

pub use memory::InMemoryChunkArchive;
pub use pinecone::PineconeChunkArchive;
pub use sqlite::SqliteChunkArchive;

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    /// Matches must score strictly above this.
    pub min_similarity: f32,
    /// Token budget for the returned chunks (the first match is always kept).
    pub cutoff_tokens: usize,
    pub max_chunks: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveMatch {
    pub chunk: TextChunk,
    pub score: f32,
}

#[async_trait]
pub trait ChunkArchive: Send + Sync {
    async fn import(&self, chunk: TextChunk) -> Result<()>;

    /// Imports all chunks of one document.
    async fn import_document(&self, document_id: &str, chunks: Vec<TextChunk>) -> Result<()> {
        for mut chunk in chunks {
            if chunk.metadata.document_id.is_none() {
                chunk.metadata.document_id = Some(document_id.to_string());
            }
            self.import(chunk).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()>;

    async fn retrieve(&self, req: &RetrievalRequest) -> Result<Vec<ArchiveMatch>>;

    /// Drops every chunk of the document; returns how many were removed.
    async fn remove_document(&self, document_id: &str) -> Result<usize>;

    async fn len(&self) -> Result<usize>;
}

/// Sorts by score (best first) and keeps matches while their combined
/// `est_tokens` fit in `cutoff_tokens`, up to `max_chunks`. The best match
/// is kept even if it alone exceeds the budget.
pub fn order_and_apply_cutoff(
    mut matches: Vec<ArchiveMatch>,
    cutoff_tokens: usize,
    max_chunks: Option<usize>,
) -> Vec<ArchiveMatch> {
    matches.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept = Vec::with_capacity(matches.len());
    let mut tokens = 0usize;
    for m in matches {
        if max_chunks.is_some_and(|max| kept.len() >= max) {
            break;
        }
        if !kept.is_empty() && tokens + m.chunk.est_tokens > cutoff_tokens {
            break;
        }
        tokens += m.chunk.est_tokens;
        kept.push(m);
    }
    kept
}

/// Builds the archive named by `[archive].engine`.
pub async fn create_archive(
    config: &Config,
    pool: &SqlitePool,
    cache: Arc<EmbeddingCache>,
) -> Result<Arc<dyn ChunkArchive>> {
    match config.archive.engine.as_str() {
        "in-memory" => Ok(Arc::new(InMemoryChunkArchive::new(cache))),
        "sqlite" => Ok(Arc::new(SqliteChunkArchive::new(
            pool.clone(),
            &config.archive.name,
            cache,
        ))),
        "pinecone" => Ok(Arc::new(PineconeChunkArchive::from_env(
            &config.archive.pinecone,
            cache,
        )?)),
        other => bail!("Unknown archive engine: {}", other),
    }
}
