use anyhow::Result;
use sqlx::SqlitePool;

use crate::access::{Caller, Permission};
use crate::db::now_ts;
use crate::dto::{NodeForCreation, NodeForUpdate};
use crate::error::{ensure_valid, CxError};
use crate::models::Node;

use super::{new_id, projects};

pub async fn add(
    pool: &SqlitePool,
    caller: &Caller,
    project_id: &str,
    input: &NodeForCreation,
) -> Result<Node> {
    caller.must_have(Permission::ManageNodes)?;
    ensure_valid(!input.name.trim().is_empty(), "node name is required")?;
    projects::get(pool, project_id).await?;

    if let Some(parent_id) = &input.parent_id {
        let parent = get(pool, parent_id).await?;
        ensure_valid(
            parent.project_id == project_id,
            "parent node belongs to a different project",
        )?;
    }

    let id = new_id();
    let now = now_ts();
    sqlx::query(
        "INSERT INTO nodes (id, project_id, parent_id, name, display_name, description, author, \
         language, is_asset, url, keywords, tags, publication, \
         created_on, created_by, last_modified_on, last_modified_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(project_id)
    .bind(&input.parent_id)
    .bind(input.name.trim())
    .bind(&input.display_name)
    .bind(&input.description)
    .bind(&input.author)
    .bind(&input.language)
    .bind(input.is_asset)
    .bind(&input.url)
    .bind(&input.keywords)
    .bind(&input.tags)
    .bind(&input.publication)
    .bind(now)
    .bind(&caller.user_id)
    .bind(now)
    .bind(&caller.user_id)
    .execute(pool)
    .await?;

    get(pool, &id).await
}

pub async fn list_for_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<Node>> {
    projects::get(pool, project_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM nodes WHERE project_id = ? AND is_deleted = 0 ORDER BY name, created_on",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(Node::from_row).collect::<sqlx::Result<_>>()?)
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Node> {
    let row = sqlx::query("SELECT * FROM nodes WHERE id = ? AND is_deleted = 0")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CxError::not_found("node", id))?;
    Ok(Node::from_row(&row)?)
}

pub async fn update(pool: &SqlitePool, caller: &Caller, id: &str, input: &NodeForUpdate) -> Result<Node> {
    caller.must_have(Permission::ManageNodes)?;
    ensure_valid(!input.name.trim().is_empty(), "node name is required")?;
    get(pool, id).await?;

    sqlx::query(
        "UPDATE nodes SET name = ?, display_name = ?, description = ?, author = ?, language = ?, \
         is_asset = ?, url = ?, keywords = ?, tags = ?, publication = ?, \
         last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(input.name.trim())
    .bind(&input.display_name)
    .bind(&input.description)
    .bind(&input.author)
    .bind(&input.language)
    .bind(input.is_asset)
    .bind(&input.url)
    .bind(&input.keywords)
    .bind(&input.tags)
    .bind(&input.publication)
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, id).await
}

/// Moves a node under `parent_id`, or to the project root when `None`.
///
/// The new parent must live in the same project and must not be the node
/// itself or one of its descendants.
pub async fn update_parent(
    pool: &SqlitePool,
    caller: &Caller,
    id: &str,
    parent_id: Option<&str>,
) -> Result<Node> {
    caller.must_have(Permission::ManageNodes)?;
    let node = get(pool, id).await?;

    if let Some(parent_id) = parent_id {
        ensure_valid(parent_id != id, "a node cannot be its own parent")?;
        let parent = get(pool, parent_id).await?;
        ensure_valid(
            parent.project_id == node.project_id,
            "parent node belongs to a different project",
        )?;

        // Walk up from the new parent; reaching `id` means a cycle.
        let mut cursor = parent.parent_id.clone();
        while let Some(ancestor_id) = cursor {
            ensure_valid(ancestor_id != id, "a node cannot be moved under its own descendant")?;
            cursor = sqlx::query_scalar::<_, Option<String>>(
                "SELECT parent_id FROM nodes WHERE id = ?",
            )
            .bind(&ancestor_id)
            .fetch_optional(pool)
            .await?
            .flatten();
        }
    }

    sqlx::query(
        "UPDATE nodes SET parent_id = ?, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(parent_id)
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, id).await
}

/// Records where the node's uploaded file lives in object storage.
pub async fn set_storage(
    pool: &SqlitePool,
    caller: &Caller,
    id: &str,
    storage_key: &str,
    file_name: &str,
) -> Result<Node> {
    caller.must_have(Permission::ManageNodes)?;
    get(pool, id).await?;

    let file_ext = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    sqlx::query(
        "UPDATE nodes SET s3_key = ?, file_name = ?, display_name = COALESCE(display_name, ?), \
         file_ext = ?, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(storage_key)
    .bind(file_name)
    .bind(file_name)
    .bind(file_ext)
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, id).await
}

/// Soft-deletes the node and every node below it.
pub async fn delete(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<u64> {
    caller.must_have(Permission::ManageNodes)?;
    get(pool, id).await?;

    let result = sqlx::query(
        "WITH RECURSIVE subtree(id) AS ( \
             SELECT ? \
             UNION ALL \
             SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id \
         ) \
         UPDATE nodes SET is_deleted = 1, last_modified_on = ?, last_modified_by = ? \
         WHERE id IN (SELECT id FROM subtree) AND is_deleted = 0",
    )
    .bind(id)
    .bind(now_ts())
    .bind(&caller.user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
