use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::debug;

use super::{order_and_apply_cutoff, ArchiveMatch, ChunkArchive, RetrievalRequest};
use crate::chunk::TextChunk;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::embedding_cache::EmbeddingCache;

/// Archive persisted in the `archive_entries` table, partitioned by name so
/// several archives can share one database.
pub struct SqliteChunkArchive {
    pool: SqlitePool,
    name: String,
    cache: Arc<EmbeddingCache>,
}

impl SqliteChunkArchive {
    pub fn new(pool: SqlitePool, name: &str, cache: Arc<EmbeddingCache>) -> Self {
        Self {
            pool,
            name: name.to_string(),
            cache,
        }
    }
}

#[async_trait]
impl ChunkArchive for SqliteChunkArchive {
    async fn import(&self, chunk: TextChunk) -> Result<()> {
        let embedding = self.cache.get(&chunk.surrounding_context_string()).await?;
        let chunk_json = serde_json::to_string(&chunk)?;

        sqlx::query(
            "INSERT INTO archive_entries (archive, document_id, seq_no, chunk_json, embedding) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.name)
        .bind(chunk.document_id().unwrap_or(""))
        .bind(chunk.seq_no as i64)
        .bind(&chunk_json)
        .bind(vec_to_blob(&embedding))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM archive_entries WHERE archive = ?")
            .bind(&self.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retrieve(&self, req: &RetrievalRequest) -> Result<Vec<ArchiveMatch>> {
        let query = self.cache.get(&req.query).await?;

        let rows = sqlx::query("SELECT chunk_json, embedding FROM archive_entries WHERE archive = ?")
            .bind(&self.name)
            .fetch_all(&self.pool)
            .await?;

        let mut matches = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let score = cosine_similarity(&query, &blob_to_vec(&blob));
            if score > req.min_similarity {
                let chunk_json: String = row.try_get("chunk_json")?;
                let chunk: TextChunk = serde_json::from_str(&chunk_json)?;
                matches.push(ArchiveMatch { chunk, score });
            }
        }

        let found = matches.len();
        let kept = order_and_apply_cutoff(matches, req.cutoff_tokens, req.max_chunks);
        debug!(archive = %self.name, scanned = rows.len(), found, kept = kept.len(), "sqlite retrieval");
        Ok(kept)
    }

    async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM archive_entries WHERE archive = ? AND document_id = ?")
            .bind(&self.name)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM archive_entries WHERE archive = ?")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkMeta;
    use crate::test_support::{temp_pool, word_cache};

    fn chunk(doc: &str, seq_no: u32, content: &str) -> TextChunk {
        let meta = ChunkMeta {
            document_id: Some(doc.to_string()),
            source_document: Some(format!("{}.txt", doc)),
            page_nos: [seq_no + 1].into_iter().collect(),
            ..Default::default()
        };
        let mut c = TextChunk::new(content, meta);
        c.seq_no = seq_no;
        c
    }

    #[tokio::test]
    async fn chunks_survive_a_new_handle() {
        let (_tmp, pool) = temp_pool().await;
        let archive = SqliteChunkArchive::new(pool.clone(), "main", word_cache());
        archive.import(chunk("a", 0, "red apples")).await.unwrap();
        archive.import(chunk("a", 1, "green pears")).await.unwrap();

        let reopened = SqliteChunkArchive::new(pool, "main", word_cache());
        let hits = reopened
            .retrieve(&RetrievalRequest {
                query: "green pears".to_string(),
                min_similarity: 0.3,
                cutoff_tokens: 1000,
                max_chunks: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.seq_no, 1);
        assert_eq!(hits[0].chunk.metadata.first_page(), Some(2));
    }

    #[tokio::test]
    async fn archives_are_partitioned_by_name() {
        let (_tmp, pool) = temp_pool().await;
        let main = SqliteChunkArchive::new(pool.clone(), "main", word_cache());
        let other = SqliteChunkArchive::new(pool, "other", word_cache());
        main.import(chunk("a", 0, "one")).await.unwrap();
        main.import(chunk("b", 0, "two")).await.unwrap();
        other.import(chunk("a", 0, "three")).await.unwrap();

        assert_eq!(main.remove_document("a").await.unwrap(), 1);
        assert_eq!(main.len().await.unwrap(), 1);
        assert_eq!(other.len().await.unwrap(), 1);

        main.clear().await.unwrap();
        assert_eq!(main.len().await.unwrap(), 0);
        assert_eq!(other.len().await.unwrap(), 1);
    }
}
