use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{order_and_apply_cutoff, ArchiveMatch, ChunkArchive, RetrievalRequest};
use crate::chunk::TextChunk;
use crate::embedding::cosine_similarity;
use crate::embedding_cache::EmbeddingCache;

struct Entry {
    chunk: TextChunk,
    embedding: Vec<f32>,
}

/// Linear-scan archive held in process memory behind a single lock.
pub struct InMemoryChunkArchive {
    entries: Mutex<Vec<Entry>>,
    cache: Arc<EmbeddingCache>,
}

impl InMemoryChunkArchive {
    pub fn new(cache: Arc<EmbeddingCache>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            cache,
        }
    }

    /// A uniformly random stored chunk.
    pub async fn random_chunk(&self) -> Result<TextChunk> {
        let entries = self.entries.lock().await;
        if entries.is_empty() {
            bail!("No entries to select from.");
        }
        let idx = rand::random::<usize>() % entries.len();
        Ok(entries[idx].chunk.clone())
    }
}

#[async_trait]
impl ChunkArchive for InMemoryChunkArchive {
    async fn import(&self, chunk: TextChunk) -> Result<()> {
        // Embed before locking so imports don't serialise on the API.
        let embedding = self.cache.get(&chunk.surrounding_context_string()).await?;
        self.entries.lock().await.push(Entry { chunk, embedding });
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn retrieve(&self, req: &RetrievalRequest) -> Result<Vec<ArchiveMatch>> {
        let query = self.cache.get(&req.query).await?;

        let matches: Vec<ArchiveMatch> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter_map(|e| {
                    let score = cosine_similarity(&query, &e.embedding);
                    (score > req.min_similarity).then(|| ArchiveMatch {
                        chunk: e.chunk.clone(),
                        score,
                    })
                })
                .collect()
        };

        let found = matches.len();
        let kept = order_and_apply_cutoff(matches, req.cutoff_tokens, req.max_chunks);
        debug!(found, kept = kept.len(), "in-memory retrieval");
        Ok(kept)
    }

    async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.chunk.document_id() != Some(document_id));
        Ok(before - entries.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkMeta;
    use crate::test_support::word_cache;

    fn chunk(doc: &str, content: &str) -> TextChunk {
        let meta = ChunkMeta {
            document_id: Some(doc.to_string()),
            ..Default::default()
        };
        TextChunk::new(content, meta)
    }

    fn query(q: &str) -> RetrievalRequest {
        RetrievalRequest {
            query: q.to_string(),
            min_similarity: 0.0,
            cutoff_tokens: 1000,
            max_chunks: None,
        }
    }

    #[tokio::test]
    async fn retrieves_only_similar_chunks() {
        let archive = InMemoryChunkArchive::new(word_cache());
        archive.import(chunk("a", "red apples and green pears")).await.unwrap();
        archive.import(chunk("b", "diesel engines")).await.unwrap();

        let hits = archive.retrieve(&query("green pears")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.document_id(), Some("a"));
        assert!(hits[0].score > 0.5);
    }

    #[tokio::test]
    async fn identical_text_scores_one() {
        let archive = InMemoryChunkArchive::new(word_cache());
        archive.import(chunk("a", "red apples")).await.unwrap();
        let hits = archive.retrieve(&query("red apples")).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-5);

        // Strictly greater than the threshold.
        let mut req = query("red apples");
        req.min_similarity = 1.0;
        assert!(archive.retrieve(&req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_document_and_clear() {
        let archive = InMemoryChunkArchive::new(word_cache());
        archive
            .import_document("a", vec![TextChunk::new("one", ChunkMeta::default()), TextChunk::new("two", ChunkMeta::default())])
            .await
            .unwrap();
        archive.import(chunk("b", "three")).await.unwrap();
        assert_eq!(archive.len().await.unwrap(), 3);

        assert_eq!(archive.remove_document("a").await.unwrap(), 2);
        assert_eq!(archive.remove_document("a").await.unwrap(), 0);
        assert_eq!(archive.random_chunk().await.unwrap().content, "three");

        archive.clear().await.unwrap();
        assert_eq!(archive.len().await.unwrap(), 0);
        assert!(archive.random_chunk().await.is_err());
    }
}
