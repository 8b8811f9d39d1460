//! Source document pipeline: upload → extract → split → archive.
//!
//! Processing runs one document at a time across the process (a single
//! permit [`Semaphore`]).
//!
//! Status flow of a processed document:
//!
//! ```text
//! PrivateBucket | QueuedForRetrain | Error → Training → TrainingDone → Done
//!                                                  ↘ Error ("<kind>: <message>")
//! ```

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{Caller, Permission};
use crate::archive::ChunkArchive;
use crate::chunk::{ChunkMeta, TextChunk};
use crate::config::SplitterConfig;
use crate::dto::{PresignRequest, PresignResponse, SourceDocumentForCreation};
use crate::error::{ensure_valid, CxError};
use crate::extract::{self, ExtractError};
use crate::models::{SourceDocument, SourceDocumentStatus};
use crate::repo::{nodes, source_documents};
use crate::splitter::{self, SplitRequest};
use crate::storage::{content_key, content_type_for, file_extension, StorageService};

pub struct Ingestor {
    pool: SqlitePool,
    storage: Arc<dyn StorageService>,
    archive: Arc<dyn ChunkArchive>,
    splitter: SplitterConfig,
    gate: Semaphore,
}

/// Result of processing one document.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub document_id: String,
    pub chunks: usize,
    pub warnings: Option<String>,
}

impl Ingestor {
    pub fn new(
        pool: SqlitePool,
        storage: Arc<dyn StorageService>,
        archive: Arc<dyn ChunkArchive>,
        splitter: SplitterConfig,
    ) -> Self {
        Self {
            pool,
            storage,
            archive,
            splitter,
            gate: Semaphore::new(1),
        }
    }

    pub fn archive(&self) -> &Arc<dyn ChunkArchive> {
        &self.archive
    }

    pub fn storage(&self) -> &Arc<dyn StorageService> {
        &self.storage
    }

    /// Stores the file under its content key, points the node at it and
    /// registers a new source document for it.
    pub async fn upload_document(
        &self,
        caller: &Caller,
        node_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<SourceDocument> {
        caller.must_have(Permission::ManageSourceDocuments)?;
        ensure_valid(!file_name.trim().is_empty(), "file name is required")?;
        ensure_valid(!bytes.is_empty(), "uploaded file is empty")?;
        nodes::get(&self.pool, node_id).await?;

        let key = content_key(bytes, file_name);
        let content_type = content_type_for(file_name);
        self.storage.put(&key, bytes, content_type).await?;
        nodes::set_storage(&self.pool, caller, node_id, &key, file_name).await?;

        let input = SourceDocumentForCreation {
            node_id: Some(node_id.to_string()),
            storage_key: Some(key.clone()),
            content_type: Some(content_type.to_string()),
            ..SourceDocumentForCreation::named(file_name)
        };
        let doc = source_documents::add(&self.pool, caller, &input).await?;
        info!(document = %doc.id, key = %key, bytes = bytes.len(), "uploaded source document");
        Ok(doc)
    }

    /// Reserves a storage key for a client-side upload to the node and
    /// returns a presigned URL for it.
    pub async fn presign_upload(
        &self,
        caller: &Caller,
        node_id: &str,
        req: &PresignRequest,
        expires_in: Duration,
    ) -> Result<PresignResponse> {
        ensure_valid(!req.file_name.trim().is_empty(), "file name is required")?;
        let method = req.method.to_ascii_uppercase();
        ensure_valid(
            matches!(method.as_str(), "PUT" | "GET"),
            format!("unsupported presign method {}", req.method),
        )?;

        let key = match file_extension(&req.file_name) {
            Some(ext) => format!("nodes/{}/{}.{}", node_id, Uuid::new_v4(), ext),
            None => format!("nodes/{}/{}", node_id, Uuid::new_v4()),
        };
        nodes::set_storage(&self.pool, caller, node_id, &key, &req.file_name).await?;
        let url = self.storage.presigned_url(&key, &method, expires_in)?;

        Ok(PresignResponse {
            key,
            url,
            method,
            expires_in_secs: expires_in.as_secs(),
        })
    }

    /// Extracts, splits and (re)imports the document into the archive.
    /// Failures drop the document's archive entries and are recorded on
    /// the document before being returned.
    pub async fn process_document(&self, caller: &Caller, id: &str) -> Result<ProcessReport> {
        caller.must_have(Permission::ManageSourceDocuments)?;
        let doc = source_documents::get(&self.pool, id).await?;

        let _permit = self.gate.acquire().await?;
        source_documents::set_status(&self.pool, id, SourceDocumentStatus::Training).await?;

        match self.train(&doc).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let error_text = format!("{}: {}", error_kind(&e), e);
                warn!(document = %id, error = %error_text, "processing failed");
                // A failed document must not answer questions, even partially imported.
                if let Err(cleanup) = self.archive.remove_document(id).await {
                    warn!(document = %id, error = %cleanup, "failed to drop partial import");
                }
                source_documents::mark_error(&self.pool, id, &error_text).await?;
                Err(e)
            }
        }
    }

    async fn train(&self, doc: &SourceDocument) -> Result<ProcessReport> {
        let text = match doc.extracted_text.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(text) => text.to_string(),
            None => self.extract(doc).await?,
        };

        let chunks = self.chunks_for(doc, &text).await;
        let warnings = chunks
            .is_empty()
            .then(|| "no text could be extracted".to_string());

        let removed = self.archive.remove_document(&doc.id).await?;
        let count = chunks.len();
        self.archive.import_document(&doc.id, chunks).await?;

        source_documents::set_status(&self.pool, &doc.id, SourceDocumentStatus::TrainingDone)
            .await?;
        source_documents::mark_trained(&self.pool, &doc.id, &text, warnings.as_deref()).await?;
        info!(document = %doc.id, chunks = count, replaced = removed, "trained source document");

        Ok(ProcessReport {
            document_id: doc.id.clone(),
            chunks: count,
            warnings,
        })
    }

    async fn extract(&self, doc: &SourceDocument) -> Result<String> {
        let key = doc.storage_key.as_deref().ok_or_else(|| {
            CxError::Validation(format!("source document {} has no stored file", doc.id))
        })?;
        let bytes = self.storage.get(key).await?;
        let content_type = doc
            .content_type
            .clone()
            .unwrap_or_else(|| content_type_for(&doc.name).to_string());
        Ok(extract::extract_text(&bytes, &content_type)?)
    }

    async fn chunks_for(&self, doc: &SourceDocument, text: &str) -> Vec<TextChunk> {
        let group = match &doc.node_id {
            Some(node_id) => nodes::get(&self.pool, node_id).await.ok().map(|n| n.name),
            None => None,
        };
        let meta = ChunkMeta {
            document_id: Some(doc.id.clone()),
            source_document: Some(doc.display_name.clone().unwrap_or_else(|| doc.name.clone())),
            source_document_group: group,
            description: doc.description.clone(),
            tags: doc.tags.clone(),
            ..Default::default()
        };
        splitter::split(&SplitRequest {
            document: text,
            meta,
            page_limit: self.splitter.page_limit.as_deref(),
            token_limit: self.splitter.segment_token_limit,
        })
    }

    /// Queues the document for retraining and drops its archive entries.
    pub async fn reset_document(&self, caller: &Caller, id: &str) -> Result<SourceDocument> {
        let doc = source_documents::reset(&self.pool, caller, id).await?;
        self.archive.remove_document(id).await?;
        Ok(doc)
    }

    /// Soft delete; the document stops answering questions immediately.
    pub async fn delete_document(&self, caller: &Caller, id: &str) -> Result<()> {
        source_documents::delete(&self.pool, caller, id).await?;
        let removed = self.archive.remove_document(id).await?;
        info!(document = %id, removed, "deleted source document");
        Ok(())
    }

    /// Hard delete. The stored file goes too unless another document
    /// shares its content key.
    pub async fn destroy_document(&self, caller: &Caller, id: &str) -> Result<()> {
        caller.must_have(Permission::ManageSourceDocuments)?;
        let doc = source_documents::get_any(&self.pool, id)
            .await?
            .ok_or_else(|| CxError::not_found("source document", id))?;

        source_documents::destroy(&self.pool, caller, id).await?;
        self.archive.remove_document(id).await?;

        if let Some(key) = &doc.storage_key {
            if source_documents::storage_key_refs(&self.pool, key, id).await? == 0 {
                self.storage.delete(key).await?;
            }
        }
        info!(document = %id, "destroyed source document");
        Ok(())
    }

    /// Re-imports every trained document from its stored extracted text.
    /// Returns the number of chunks imported.
    pub async fn rebuild_archive(&self) -> Result<usize> {
        self.archive.clear().await?;
        let mut total = 0;
        for id in source_documents::trained_ids(&self.pool).await? {
            let doc = source_documents::get(&self.pool, &id).await?;
            let Some(text) = doc.extracted_text.as_deref() else {
                continue;
            };
            let chunks = self.chunks_for(&doc, text).await;
            total += chunks.len();
            self.archive.import_document(&doc.id, chunks).await?;
        }
        info!(chunks = total, "rebuilt archive");
        Ok(total)
    }
}

/// Short name of what went wrong, for `error_text`.
fn error_kind(err: &anyhow::Error) -> &'static str {
    if let Some(e) = err.chain().find_map(|e| e.downcast_ref::<ExtractError>()) {
        return e.kind();
    }
    match CxError::find(err) {
        Some(CxError::Validation(_)) => "Validation",
        Some(CxError::Forbidden(_)) => "Forbidden",
        Some(CxError::NotFound { .. }) => "NotFound",
        Some(CxError::Conflict(_)) => "Conflict",
        Some(CxError::Disabled(_)) => "Disabled",
        None => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        let e: anyhow::Error = ExtractError::Pdf("bad xref".into()).into();
        assert_eq!(error_kind(&e), "PdfExtraction");
        let e: anyhow::Error = CxError::Disabled("embedding provider".into()).into();
        assert_eq!(error_kind(&e), "Disabled");
        assert_eq!(error_kind(&anyhow::anyhow!("boom")), "Error");
    }
}
