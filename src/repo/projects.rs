use anyhow::Result;
use sqlx::SqlitePool;

use crate::access::{Caller, Permission};
use crate::db::now_ts;
use crate::dto::{Page, ProjectForCreation, ProjectForUpdate};
use crate::error::{ensure_valid, CxError};
use crate::models::Project;

use super::new_id;

pub async fn add(pool: &SqlitePool, caller: &Caller, input: &ProjectForCreation) -> Result<Project> {
    caller.must_have(Permission::ManageProjects)?;
    ensure_valid(!input.name.trim().is_empty(), "project name is required")?;

    let id = new_id();
    let now = now_ts();
    sqlx::query(
        "INSERT INTO projects (id, name, description, created_on, created_by, last_modified_on, last_modified_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(input.name.trim())
    .bind(&input.description)
    .bind(now)
    .bind(&caller.user_id)
    .bind(now)
    .bind(&caller.user_id)
    .execute(pool)
    .await?;

    get(pool, &id).await
}

/// Projects are visible to every authenticated caller.
pub async fn list(pool: &SqlitePool, page: Page) -> Result<Vec<Project>> {
    let rows = sqlx::query(
        "SELECT * FROM projects WHERE is_deleted = 0 ORDER BY name LIMIT ? OFFSET ?",
    )
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(Project::from_row)
        .collect::<sqlx::Result<_>>()?)
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Project> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ? AND is_deleted = 0")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CxError::not_found("project", id))?;
    Ok(Project::from_row(&row)?)
}

pub async fn update(
    pool: &SqlitePool,
    caller: &Caller,
    id: &str,
    input: &ProjectForUpdate,
) -> Result<Project> {
    caller.must_have(Permission::ManageProjects)?;
    ensure_valid(!input.name.trim().is_empty(), "project name is required")?;
    get(pool, id).await?;

    sqlx::query(
        "UPDATE projects SET name = ?, description = ?, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(input.name.trim())
    .bind(&input.description)
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, id).await
}

pub async fn delete(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<()> {
    caller.must_have(Permission::ManageProjects)?;
    get(pool, id).await?;
    sqlx::query(
        "UPDATE projects SET is_deleted = 1, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
