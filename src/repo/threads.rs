use anyhow::Result;
use sqlx::SqlitePool;
use tracing::debug;

use crate::access::{Caller, Permission};
use crate::db::now_ts;
use crate::dto::{Page, ThreadForCreation, ThreadForUpdate};
use crate::error::{ensure_valid, CxError};
use crate::models::Thread;

use super::new_id;

pub async fn create(pool: &SqlitePool, caller: &Caller, input: &ThreadForCreation) -> Result<Thread> {
    ensure_valid(!input.name.trim().is_empty(), "thread name is required")?;

    let id = new_id();
    let now = now_ts();
    sqlx::query(
        "INSERT INTO threads (id, name, has_pinned_messages, created_on, created_by, last_modified_on, last_modified_by) \
         VALUES (?, ?, 0, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(input.name.trim())
    .bind(now)
    .bind(&caller.user_id)
    .bind(now)
    .bind(&caller.user_id)
    .execute(pool)
    .await?;

    load(pool, &id).await
}

/// Threads owned by the caller, most recently modified first.
pub async fn list_for_caller(pool: &SqlitePool, caller: &Caller, page: Page) -> Result<Vec<Thread>> {
    let rows = sqlx::query(
        "SELECT * FROM threads WHERE created_by = ? AND is_deleted = 0 \
         ORDER BY last_modified_on DESC, created_on DESC LIMIT ? OFFSET ?",
    )
    .bind(&caller.user_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(Thread::from_row).collect::<sqlx::Result<_>>()?)
}

pub async fn list_all(pool: &SqlitePool, caller: &Caller, page: Page) -> Result<Vec<Thread>> {
    caller.must_have(Permission::ManageThreads)?;
    let rows = sqlx::query(
        "SELECT * FROM threads WHERE is_deleted = 0 \
         ORDER BY last_modified_on DESC, created_on DESC LIMIT ? OFFSET ?",
    )
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(Thread::from_row).collect::<sqlx::Result<_>>()?)
}

pub(crate) async fn load(pool: &SqlitePool, id: &str) -> Result<Thread> {
    let row = sqlx::query("SELECT * FROM threads WHERE id = ? AND is_deleted = 0")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CxError::not_found("thread", id))?;
    Ok(Thread::from_row(&row)?)
}

/// Loads a thread the caller owns (or may manage).
pub async fn get(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<Thread> {
    let thread = load(pool, id).await?;
    caller.must_own_or(thread.owner(), Permission::ManageThreads)?;
    Ok(thread)
}

pub async fn rename(
    pool: &SqlitePool,
    caller: &Caller,
    id: &str,
    input: &ThreadForUpdate,
) -> Result<Thread> {
    ensure_valid(!input.name.trim().is_empty(), "thread name is required")?;
    get(pool, caller, id).await?;

    sqlx::query(
        "UPDATE threads SET name = ?, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(input.name.trim())
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;

    load(pool, id).await
}

/// Soft-deletes the thread and all of its messages.
pub async fn delete(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<()> {
    get(pool, caller, id).await?;
    let now = now_ts();

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE messages SET is_deleted = 1, last_modified_on = ?, last_modified_by = ? \
         WHERE thread_id = ? AND is_deleted = 0",
    )
    .bind(now)
    .bind(&caller.user_id)
    .bind(id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE threads SET is_deleted = 1, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(now)
    .bind(&caller.user_id)
    .bind(id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Recomputes `has_pinned_messages` from the thread's live messages.
pub async fn refresh_pinned(pool: &SqlitePool, id: &str) -> Result<bool> {
    let pinned: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM messages WHERE thread_id = ? AND is_pinned = 1 AND is_deleted = 0",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;

    sqlx::query("UPDATE threads SET has_pinned_messages = ? WHERE id = ?")
        .bind(pinned)
        .bind(id)
        .execute(pool)
        .await?;
    debug!(thread_id = %id, pinned, "refreshed pinned flag");
    Ok(pinned)
}

/// Marks the thread as active so it sorts first in listings.
pub(crate) async fn touch(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<()> {
    sqlx::query("UPDATE threads SET last_modified_on = ?, last_modified_by = ? WHERE id = ?")
        .bind(now_ts())
        .bind(&caller.user_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
