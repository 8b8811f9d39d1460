use anyhow::Result;
use sqlx::SqlitePool;

use crate::access::{Caller, Permission};
use crate::db::now_ts;
use crate::dto::{SourceDocumentFilter, SourceDocumentForCreation, SourceDocumentForUpdate};
use crate::error::{ensure_valid, CxError};
use crate::models::{MonthCount, SourceDocument, SourceDocumentStatus};

use super::{fill_missing_months, monthly_counts, new_id, nodes, SUMMARY_MONTHS};

pub async fn add(
    pool: &SqlitePool,
    caller: &Caller,
    input: &SourceDocumentForCreation,
) -> Result<SourceDocument> {
    caller.must_have(Permission::ManageSourceDocuments)?;
    ensure_valid(!input.name.trim().is_empty(), "source document name is required")?;
    if let Some(node_id) = &input.node_id {
        nodes::get(pool, node_id).await?;
    }

    let id = new_id();
    let now = now_ts();
    sqlx::query(
        "INSERT INTO source_documents (id, node_id, name, display_name, description, tags, language, \
         document_source_type, url, storage_key, content_type, status, is_trained, extracted_text, \
         created_on, created_by, last_modified_on, last_modified_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&input.node_id)
    .bind(input.name.trim())
    .bind(&input.display_name)
    .bind(&input.description)
    .bind(&input.tags)
    .bind(&input.language)
    .bind(input.document_source_type.name())
    .bind(&input.url)
    .bind(&input.storage_key)
    .bind(&input.content_type)
    .bind(input.status.name())
    .bind(&input.extracted_text)
    .bind(now)
    .bind(&caller.user_id)
    .bind(now)
    .bind(&caller.user_id)
    .execute(pool)
    .await?;

    get(pool, &id).await
}

pub async fn list(pool: &SqlitePool, filter: &SourceDocumentFilter) -> Result<Vec<SourceDocument>> {
    let rows = sqlx::query(
        "SELECT * FROM source_documents WHERE is_deleted = 0 \
         AND (? IS NULL OR status = ?) AND (? IS NULL OR node_id = ?) \
         ORDER BY created_on, rowid",
    )
    .bind(filter.status.map(|s| s.name()))
    .bind(filter.status.map(|s| s.name()))
    .bind(&filter.node_id)
    .bind(&filter.node_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(SourceDocument::from_row)
        .collect::<sqlx::Result<_>>()?)
}

/// Ids of live documents that finished training, oldest first.
pub async fn trained_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    Ok(sqlx::query_scalar(
        "SELECT id FROM source_documents WHERE is_deleted = 0 AND is_trained = 1 ORDER BY created_on, rowid",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<SourceDocument> {
    let row = sqlx::query("SELECT * FROM source_documents WHERE id = ? AND is_deleted = 0")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CxError::not_found("source document", id))?;
    Ok(SourceDocument::from_row(&row)?)
}

pub async fn update(
    pool: &SqlitePool,
    caller: &Caller,
    id: &str,
    input: &SourceDocumentForUpdate,
) -> Result<SourceDocument> {
    caller.must_have(Permission::ManageSourceDocuments)?;
    get(pool, id).await?;
    if let Some(node_id) = input.node_id.as_deref().filter(|n| !n.is_empty()) {
        nodes::get(pool, node_id).await?;
    }

    sqlx::query(
        "UPDATE source_documents SET \
         name = COALESCE(NULLIF(?, ''), name), \
         node_id = COALESCE(NULLIF(?, ''), node_id), \
         display_name = COALESCE(NULLIF(?, ''), display_name), \
         description = COALESCE(NULLIF(?, ''), description), \
         tags = COALESCE(NULLIF(?, ''), tags), \
         language = COALESCE(NULLIF(?, ''), language), \
         url = COALESCE(NULLIF(?, ''), url), \
         last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(input.name.as_deref().map(str::trim))
    .bind(&input.node_id)
    .bind(&input.display_name)
    .bind(&input.description)
    .bind(&input.tags)
    .bind(&input.language)
    .bind(&input.url)
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, id).await
}

pub async fn set_status(pool: &SqlitePool, id: &str, status: SourceDocumentStatus) -> Result<()> {
    sqlx::query("UPDATE source_documents SET status = ?, last_modified_on = ? WHERE id = ?")
        .bind(status.name())
        .bind(now_ts())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Stores the text a document was trained on and marks it done.
pub async fn mark_trained(
    pool: &SqlitePool,
    id: &str,
    extracted_text: &str,
    import_warnings: Option<&str>,
) -> Result<()> {
    let now = now_ts();
    sqlx::query(
        "UPDATE source_documents SET status = ?, is_trained = 1, extracted_text = ?, \
         import_warnings = ?, error_text = NULL, date_trained = ?, last_modified_on = ? WHERE id = ?",
    )
    .bind(SourceDocumentStatus::Done.name())
    .bind(extracted_text)
    .bind(import_warnings)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_error(pool: &SqlitePool, id: &str, error_text: &str) -> Result<()> {
    sqlx::query(
        "UPDATE source_documents SET status = ?, error_text = ?, last_modified_on = ? WHERE id = ?",
    )
    .bind(SourceDocumentStatus::Error.name())
    .bind(error_text)
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Queues a document for retraining and clears its training state.
pub async fn reset(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<SourceDocument> {
    caller.must_have(Permission::ManageSourceDocuments)?;
    get(pool, id).await?;
    sqlx::query(
        "UPDATE source_documents SET status = ?, is_trained = 0, error_text = NULL, \
         date_trained = NULL, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(SourceDocumentStatus::QueuedForRetrain.name())
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;
    get(pool, id).await
}

pub async fn delete(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<()> {
    caller.must_have(Permission::ManageSourceDocuments)?;
    get(pool, id).await?;
    sqlx::query(
        "UPDATE source_documents SET is_deleted = 1, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Removes the row entirely, including soft-deleted ones.
pub async fn destroy(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<()> {
    caller.must_have(Permission::ManageSourceDocuments)?;
    let result = sqlx::query("DELETE FROM source_documents WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(CxError::not_found("source document", id).into());
    }
    Ok(())
}

/// Loads a document row even if soft-deleted, for hard deletion cleanup.
pub async fn get_any(pool: &SqlitePool, id: &str) -> Result<Option<SourceDocument>> {
    let row = sqlx::query("SELECT * FROM source_documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(SourceDocument::from_row).transpose()?)
}

/// How many other documents (deleted or not) point at the same stored object.
pub async fn storage_key_refs(pool: &SqlitePool, storage_key: &str, excluding_id: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM source_documents WHERE storage_key = ? AND id != ?",
    )
    .bind(storage_key)
    .bind(excluding_id)
    .fetch_one(pool)
    .await?)
}

pub async fn count_summary(pool: &SqlitePool, caller: &Caller) -> Result<Vec<MonthCount>> {
    caller.must_have(Permission::ManageSourceDocuments)?;
    let counts = monthly_counts(pool, "source_documents").await?;
    Ok(fill_missing_months(&counts, SUMMARY_MONTHS))
}
