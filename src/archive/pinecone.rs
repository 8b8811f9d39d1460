//! Pinecone-backed archive.
//!
//! Talks to an index's data-plane REST API (`[archive.pinecone].host`):
//!
//! | Operation | Request |
//! |-----------|---------|
//! | import | `POST /vectors/upsert`, one vector per chunk, id `{document_id}.{seq_no}` |
//! | retrieve | `POST /query` with `topK` and `includeMetadata` |
//! | remove_document | `POST /vectors/delete` filtered on `source == document_id` |
//! | clear | `POST /vectors/delete` with `deleteAll` |
//! | len | `POST /describe_index_stats`, the namespace's `vectorCount` |
//!
//! Each vector carries the chunk as JSON under `chunk` alongside the flat
//! `text`/`source`/`seq_no` fields, so vectors written by other tools can
//! still be read back.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use super::{order_and_apply_cutoff, ArchiveMatch, ChunkArchive, RetrievalRequest};
use crate::chunk::{ChunkMeta, TextChunk};
use crate::config::PineconeConfig;
use crate::embedding::post_json_with_retry;
use crate::embedding_cache::EmbeddingCache;

const API_VERSION: &str = "2025-01";

pub struct PineconeChunkArchive {
    host: String,
    namespace: String,
    top_k: usize,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
    gate: Semaphore,
    cache: Arc<EmbeddingCache>,
}

impl PineconeChunkArchive {
    pub fn new(config: &PineconeConfig, api_key: String, cache: Arc<EmbeddingCache>) -> Result<Self> {
        let host = config
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| anyhow!("archive.pinecone.host required for the pinecone engine"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            top_k: config.top_k,
            api_key,
            max_retries: config.max_retries,
            client,
            gate: Semaphore::new(config.max_concurrency.max(1)),
            cache,
        })
    }

    /// Requires `PINECONE_API_KEY` in the environment.
    pub fn from_env(config: &PineconeConfig, cache: Arc<EmbeddingCache>) -> Result<Self> {
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| anyhow!("PINECONE_API_KEY environment variable not set"))?;
        Self::new(config, api_key, cache)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let _permit = self.gate.acquire().await?;
        let url = format!("{}{}", self.host, path);
        post_json_with_retry(
            &self.client,
            "Pinecone",
            &url,
            &[("Api-Key", self.api_key.as_str()), ("X-Pinecone-API-Version", API_VERSION)],
            body,
            self.max_retries,
        )
        .await
    }

    /// Deletes matching vectors; a namespace that was never written to
    /// has nothing to delete.
    async fn delete(&self, body: &Value) -> Result<()> {
        match self.post("/vectors/delete", body).await {
            Err(e) if is_namespace_not_found(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

#[async_trait]
impl ChunkArchive for PineconeChunkArchive {
    async fn import(&self, chunk: TextChunk) -> Result<()> {
        let values = self.cache.get(&chunk.surrounding_context_string()).await?;
        let vector = vector_for(&chunk, values)?;
        self.post("/vectors/upsert", &upsert_body(&self.namespace, vec![vector]))
            .await?;
        Ok(())
    }

    async fn import_document(&self, document_id: &str, chunks: Vec<TextChunk>) -> Result<()> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for mut chunk in chunks {
            if chunk.metadata.document_id.is_none() {
                chunk.metadata.document_id = Some(document_id.to_string());
            }
            let values = self.cache.get(&chunk.surrounding_context_string()).await?;
            vectors.push(vector_for(&chunk, values)?);
        }
        // Upsert requests are capped at 2 MB.
        for batch in vectors.chunks(100) {
            self.post("/vectors/upsert", &upsert_body(&self.namespace, batch.to_vec()))
                .await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.delete(&json!({ "deleteAll": true, "namespace": self.namespace }))
            .await
    }

    async fn retrieve(&self, req: &RetrievalRequest) -> Result<Vec<ArchiveMatch>> {
        let query = self.cache.get(&req.query).await?;
        let json = self
            .post("/query", &query_body(&self.namespace, &query, self.top_k))
            .await?;
        let matches: Vec<ArchiveMatch> = parse_matches(&json)?
            .into_iter()
            .filter(|m| m.score > req.min_similarity)
            .collect();

        let found = matches.len();
        let kept = order_and_apply_cutoff(matches, req.cutoff_tokens, req.max_chunks);
        debug!(found, kept = kept.len(), namespace = %self.namespace, "pinecone retrieval");
        Ok(kept)
    }

    /// Pinecone does not report how many vectors a filtered delete
    /// removed, so this always returns 0.
    async fn remove_document(&self, document_id: &str) -> Result<usize> {
        self.delete(&delete_document_body(&self.namespace, document_id))
            .await?;
        Ok(0)
    }

    async fn len(&self) -> Result<usize> {
        let json = self.post("/describe_index_stats", &json!({})).await?;
        Ok(namespace_vector_count(&json, &self.namespace))
    }
}

fn vector_for(chunk: &TextChunk, values: Vec<f32>) -> Result<Value> {
    let Some(document_id) = chunk.document_id() else {
        bail!("Chunks need a document id to be stored in Pinecone");
    };

    let mut metadata = Map::new();
    metadata.insert("text".into(), json!(chunk.context_string()));
    metadata.insert("source".into(), json!(document_id));
    metadata.insert("seq_no".into(), json!(chunk.seq_no));
    if let Some(name) = &chunk.metadata.source_document {
        metadata.insert("source_document".into(), json!(name));
    }
    if let Some(group) = &chunk.metadata.source_document_group {
        metadata.insert("source_document_group".into(), json!(group));
    }
    metadata.insert("chunk".into(), json!(serde_json::to_string(chunk)?));

    Ok(json!({
        "id": format!("{}.{}", document_id, chunk.seq_no),
        "values": values,
        "metadata": metadata,
    }))
}

fn upsert_body(namespace: &str, vectors: Vec<Value>) -> Value {
    json!({ "vectors": vectors, "namespace": namespace })
}

fn query_body(namespace: &str, vector: &[f32], top_k: usize) -> Value {
    json!({
        "vector": vector,
        "topK": top_k,
        "namespace": namespace,
        "includeMetadata": true,
        "includeValues": false,
    })
}

fn delete_document_body(namespace: &str, document_id: &str) -> Value {
    json!({
        "filter": { "source": { "$eq": document_id } },
        "namespace": namespace,
    })
}

/// Reads `matches[]` back into chunks, preferring the stored chunk JSON.
fn parse_matches(json: &Value) -> Result<Vec<ArchiveMatch>> {
    let Some(matches) = json.get("matches").and_then(|m| m.as_array()) else {
        bail!("Invalid Pinecone response: missing matches array");
    };

    let mut out = Vec::with_capacity(matches.len());
    for m in matches {
        let score = m.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32;
        let metadata = m.get("metadata").cloned().unwrap_or(Value::Null);
        out.push(ArchiveMatch {
            chunk: chunk_from_metadata(&metadata),
            score,
        });
    }
    Ok(out)
}

fn chunk_from_metadata(metadata: &Value) -> TextChunk {
    let field = |name: &str| metadata.get(name).and_then(|v| v.as_str()).map(str::to_string);

    if let Some(chunk) = field("chunk").and_then(|c| serde_json::from_str::<TextChunk>(&c).ok()) {
        return chunk;
    }

    let content = field("text").unwrap_or_else(|| "<No content for this vector in Pinecone>".into());
    let meta = ChunkMeta {
        document_id: field("source"),
        source_document: field("source_document"),
        source_document_group: field("source_document_group"),
        ..Default::default()
    };
    let mut chunk = TextChunk::new(content, meta);
    if let Some(seq_no) = metadata.get("seq_no").and_then(|v| v.as_u64()) {
        chunk.seq_no = seq_no as u32;
    }
    chunk
}

fn namespace_vector_count(stats: &Value, namespace: &str) -> usize {
    stats
        .get("namespaces")
        .and_then(|n| n.get(namespace))
        .and_then(|n| n.get("vectorCount"))
        .and_then(|c| c.as_u64())
        .unwrap_or(0) as usize
}

fn is_namespace_not_found(err: &anyhow::Error) -> bool {
    err.to_string().contains("Namespace not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> TextChunk {
        let meta = ChunkMeta {
            document_id: Some("doc-1".into()),
            source_document: Some("manual.pdf".into()),
            ..Default::default()
        };
        let mut chunk = TextChunk::new("Cranes lift containers.", meta);
        chunk.seq_no = 3;
        chunk
    }

    #[test]
    fn vectors_are_keyed_by_document_and_sequence() {
        let v = vector_for(&chunk(), vec![0.5, 0.25]).unwrap();
        assert_eq!(v["id"], "doc-1.3");
        assert_eq!(v["values"], json!([0.5, 0.25]));
        assert_eq!(v["metadata"]["source"], "doc-1");
        assert_eq!(v["metadata"]["seq_no"], 3);
        assert_eq!(v["metadata"]["source_document"], "manual.pdf");
        assert!(v["metadata"].get("source_document_group").is_none());
    }

    #[test]
    fn chunks_without_a_document_are_rejected() {
        let orphan = TextChunk::new("loose text", ChunkMeta::default());
        assert!(vector_for(&orphan, vec![1.0]).is_err());
    }

    #[test]
    fn stored_chunk_round_trips_through_a_query_match() {
        let original = chunk();
        let v = vector_for(&original, vec![1.0]).unwrap();
        let response = json!({
            "matches": [{ "id": "doc-1.3", "score": 0.82, "metadata": v["metadata"] }],
            "namespace": "docs",
        });

        let matches = parse_matches(&response).unwrap();
        assert_eq!(matches.len(), 1);
        assert!((matches[0].score - 0.82).abs() < 1e-6);
        assert_eq!(matches[0].chunk, original);
    }

    #[test]
    fn foreign_vectors_fall_back_to_flat_fields() {
        let response = json!({
            "matches": [
                {
                    "id": "x",
                    "score": 0.5,
                    "metadata": { "text": "Berth 4", "source": "doc-9", "seq_no": 2 }
                },
                { "id": "y", "score": 0.4 }
            ]
        });

        let matches = parse_matches(&response).unwrap();
        assert_eq!(matches[0].chunk.content, "Berth 4");
        assert_eq!(matches[0].chunk.document_id(), Some("doc-9"));
        assert_eq!(matches[0].chunk.seq_no, 2);
        assert_eq!(
            matches[1].chunk.content,
            "<No content for this vector in Pinecone>"
        );
        assert!(parse_matches(&json!({})).is_err());
    }

    #[test]
    fn request_bodies() {
        let q = query_body("docs", &[0.1, 0.2], 25);
        assert_eq!(q["topK"], 25);
        assert_eq!(q["namespace"], "docs");
        assert_eq!(q["includeMetadata"], true);
        assert_eq!(q["includeValues"], false);

        let d = delete_document_body("docs", "doc-1");
        assert_eq!(d["filter"], json!({ "source": { "$eq": "doc-1" } }));

        let u = upsert_body("", vec![json!({ "id": "a" })]);
        assert_eq!(u["vectors"].as_array().unwrap().len(), 1);
        assert_eq!(u["namespace"], "");
    }

    #[test]
    fn counts_only_the_configured_namespace() {
        let stats = json!({
            "namespaces": {
                "": { "vectorCount": 7 },
                "docs": { "vectorCount": 3 }
            },
            "totalVectorCount": 10
        });
        assert_eq!(namespace_vector_count(&stats, "docs"), 3);
        assert_eq!(namespace_vector_count(&stats, ""), 7);
        assert_eq!(namespace_vector_count(&stats, "other"), 0);
    }

    #[test]
    fn missing_namespaces_are_recognised() {
        let err = anyhow!("Pinecone API error 404 Not Found: {{\"message\":\"Namespace not found\"}}");
        assert!(is_namespace_not_found(&err));
        assert!(!is_namespace_not_found(&anyhow!("Pinecone API error 401")));
    }

    #[test]
    fn blank_host_is_rejected() {
        let config = PineconeConfig::default();
        let err = PineconeChunkArchive::new(&config, "key".into(), crate::test_support::word_cache())
            .err()
            .unwrap();
        assert!(err.to_string().contains("archive.pinecone.host"));
    }
}
