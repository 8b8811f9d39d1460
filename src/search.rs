//! Direct archive retrieval, without the chat model.

use anyhow::Result;

use crate::archive::{ChunkArchive, RetrievalRequest};
use crate::config::{AssistantConfig, Config};
use crate::dto::{SearchHitDto, SearchRequest};
use crate::error::ensure_valid;

/// Runs `req` against the archive. Unset thresholds fall back to the
/// assistant's configured values.
pub async fn search(
    archive: &dyn ChunkArchive,
    defaults: &AssistantConfig,
    req: &SearchRequest,
) -> Result<Vec<SearchHitDto>> {
    ensure_valid(!req.query.trim().is_empty(), "query must not be empty")?;
    let min_similarity = req.min_similarity.unwrap_or(defaults.min_similarity);
    ensure_valid(
        (0.0..=1.0).contains(&min_similarity),
        "min_similarity must be in [0.0, 1.0]",
    )?;

    let matches = archive
        .retrieve(&RetrievalRequest {
            query: req.query.clone(),
            min_similarity,
            cutoff_tokens: defaults.cutoff_context_tokens,
            max_chunks: req.max_chunks.or(defaults.max_chunks_per_ask),
        })
        .await?;

    Ok(matches
        .into_iter()
        .map(|m| SearchHitDto {
            document_id: m.chunk.document_id().unwrap_or_default().to_string(),
            source_document: m.chunk.metadata.source_document.clone(),
            seq_no: m.chunk.seq_no,
            score: m.score,
            content: m.chunk.content,
        })
        .collect())
}

/// `cx search`: prints ranked hits.
pub async fn run_search(config: &Config, archive: &dyn ChunkArchive, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    let hits = search(
        archive,
        &config.assistant,
        &SearchRequest {
            query: query.to_string(),
            min_similarity: None,
            max_chunks: limit,
        },
    )
    .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} #{}",
            i + 1,
            hit.score,
            hit.source_document.as_deref().unwrap_or(&hit.document_id),
            hit.seq_no
        );
        let preview: String = hit.content.chars().take(200).collect();
        println!("    {}", preview.replace('\n', " "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::InMemoryChunkArchive;
    use crate::chunk::TextChunk;
    use crate::error::CxError;
    use crate::test_support::word_cache;

    fn req(query: &str) -> SearchRequest {
        SearchRequest {
            query: query.to_string(),
            min_similarity: Some(0.0),
            max_chunks: None,
        }
    }

    #[tokio::test]
    async fn hits_carry_document_and_score() {
        let archive = InMemoryChunkArchive::new(word_cache());
        archive
            .import(TextChunk::from_text("harbour cranes lift containers"))
            .await
            .unwrap();
        let hits = search(&archive, &AssistantConfig::default(), &req("cranes"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id.len(), 32);
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn rejects_blank_query_and_bad_threshold() {
        let archive = InMemoryChunkArchive::new(word_cache());
        let err = search(&archive, &AssistantConfig::default(), &req(" "))
            .await
            .unwrap_err();
        assert!(matches!(CxError::find(&err), Some(CxError::Validation(_))));

        let mut bad = req("x");
        bad.min_similarity = Some(1.5);
        assert!(search(&archive, &AssistantConfig::default(), &bad).await.is_err());
    }
}
