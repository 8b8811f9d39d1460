use anyhow::Result;
use sqlx::SqlitePool;

use crate::access::{Caller, Permission};
use crate::db::now_ts;
use crate::dto::{MessageForCreation, MessageForUpdate};
use crate::error::{ensure_valid, CxError};
use crate::models::{FeedbackType, Message, MonthCount};

use super::{fill_missing_months, monthly_counts, new_id, threads, SUMMARY_MONTHS};

/// Appends a message to a thread. New messages never carry feedback.
pub async fn add(
    pool: &SqlitePool,
    caller: &Caller,
    thread_id: &str,
    input: &MessageForCreation,
) -> Result<Message> {
    ensure_valid(!input.content.is_empty(), "message content is required")?;
    threads::get(pool, caller, thread_id).await?;

    let id = new_id();
    let now = now_ts();
    let citations_json = serde_json::to_string(&input.citations)?;
    sqlx::query(
        "INSERT INTO messages (id, thread_id, content, content_type, message_type, feedback, \
         is_flagged, is_pinned, citations_json, created_on, created_by, last_modified_on, last_modified_by) \
         VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(thread_id)
    .bind(&input.content)
    .bind(input.content_type.name())
    .bind(input.message_type.name())
    .bind(FeedbackType::None.name())
    .bind(&citations_json)
    .bind(now)
    .bind(&caller.user_id)
    .bind(now)
    .bind(&caller.user_id)
    .execute(pool)
    .await?;

    threads::touch(pool, caller, thread_id).await?;
    load(pool, &id).await
}

/// Live messages of a thread in the order they were written.
pub async fn list_for_thread(pool: &SqlitePool, caller: &Caller, thread_id: &str) -> Result<Vec<Message>> {
    threads::get(pool, caller, thread_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM messages WHERE thread_id = ? AND is_deleted = 0 ORDER BY created_on, rowid",
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(Message::from_row).collect::<sqlx::Result<_>>()?)
}

async fn load(pool: &SqlitePool, id: &str) -> Result<Message> {
    let row = sqlx::query("SELECT * FROM messages WHERE id = ? AND is_deleted = 0")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CxError::not_found("message", id))?;
    Ok(Message::from_row(&row)?)
}

/// Loads a message if the caller owns its thread or may manage messages.
pub async fn get(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<Message> {
    let message = load(pool, id).await?;
    let thread = threads::load(pool, &message.thread_id).await?;
    caller.must_own_or(thread.owner(), Permission::ManageMessages)?;
    Ok(message)
}

pub async fn update(
    pool: &SqlitePool,
    caller: &Caller,
    id: &str,
    input: &MessageForUpdate,
) -> Result<Message> {
    let existing = get(pool, caller, id).await?;

    sqlx::query(
        "UPDATE messages SET content = ?, content_type = ?, message_type = ?, feedback = ?, \
         is_flagged = ?, is_pinned = ?, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(&input.content)
    .bind(input.content_type.name())
    .bind(input.message_type.name())
    .bind(input.feedback.name())
    .bind(input.is_flagged)
    .bind(input.is_pinned)
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;

    threads::refresh_pinned(pool, &existing.thread_id).await?;
    load(pool, id).await
}

pub async fn delete(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<()> {
    let existing = get(pool, caller, id).await?;
    sqlx::query(
        "UPDATE messages SET is_deleted = 1, last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;
    threads::refresh_pinned(pool, &existing.thread_id).await?;
    Ok(())
}

/// Message volume for the last six months that have data.
pub async fn summary(pool: &SqlitePool, caller: &Caller) -> Result<Vec<MonthCount>> {
    caller.must_have(Permission::ManageMessages)?;
    let counts = monthly_counts(pool, "messages").await?;
    Ok(fill_missing_months(&counts, SUMMARY_MONTHS))
}
