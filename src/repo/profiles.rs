use anyhow::Result;
use sqlx::SqlitePool;

use crate::access::{Caller, Permission};
use crate::db::now_ts;
use crate::dto::{Page, ProfileForCreation, ProfileForUpdate};
use crate::error::{ensure_valid, CxError};
use crate::models::Profile;

use super::new_id;

/// Creates the caller's profile. A user has at most one live profile.
pub async fn add(pool: &SqlitePool, caller: &Caller, input: &ProfileForCreation) -> Result<Profile> {
    ensure_valid(!input.name.trim().is_empty(), "profile name is required")?;

    if find_by_user(pool, &caller.user_id).await?.is_some() {
        return Err(CxError::Conflict(format!(
            "a profile already exists for user {}",
            caller.user_id
        ))
        .into());
    }

    let id = new_id();
    let now = now_ts();
    sqlx::query(
        "INSERT INTO profiles (id, user_id, name, address_line1, address_line2, address_line3, \
         city, postal_code, country, location_id, latitude, longitude, \
         created_on, created_by, last_modified_on, last_modified_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&caller.user_id)
    .bind(input.name.trim())
    .bind(&input.address_line1)
    .bind(&input.address_line2)
    .bind(&input.address_line3)
    .bind(&input.city)
    .bind(&input.postal_code)
    .bind(&input.country)
    .bind(&input.location_id)
    .bind(input.latitude)
    .bind(input.longitude)
    .bind(now)
    .bind(&caller.user_id)
    .bind(now)
    .bind(&caller.user_id)
    .execute(pool)
    .await?;

    get(pool, caller, &id).await
}

pub async fn list(pool: &SqlitePool, caller: &Caller, page: Page) -> Result<Vec<Profile>> {
    caller.must_have(Permission::ManageProfiles)?;
    let rows = sqlx::query(
        "SELECT * FROM profiles WHERE is_deleted = 0 ORDER BY name, created_on LIMIT ? OFFSET ?",
    )
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(Profile::from_row)
        .collect::<sqlx::Result<_>>()?)
}

/// The caller's own profile.
pub async fn by_user(pool: &SqlitePool, caller: &Caller) -> Result<Profile> {
    find_by_user(pool, &caller.user_id)
        .await?
        .ok_or_else(|| CxError::not_found("profile", caller.user_id.clone()).into())
}

async fn find_by_user(pool: &SqlitePool, user_id: &str) -> Result<Option<Profile>> {
    let row = sqlx::query("SELECT * FROM profiles WHERE user_id = ? AND is_deleted = 0 LIMIT 1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(Profile::from_row).transpose()?)
}

pub async fn get(pool: &SqlitePool, caller: &Caller, id: &str) -> Result<Profile> {
    let row = sqlx::query("SELECT * FROM profiles WHERE id = ? AND is_deleted = 0")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CxError::not_found("profile", id))?;
    let profile = Profile::from_row(&row)?;
    caller.must_own_or(&profile.user_id, Permission::ManageProfiles)?;
    Ok(profile)
}

pub async fn update(
    pool: &SqlitePool,
    caller: &Caller,
    id: &str,
    input: &ProfileForUpdate,
) -> Result<Profile> {
    ensure_valid(!input.name.trim().is_empty(), "profile name is required")?;
    get(pool, caller, id).await?;

    sqlx::query(
        "UPDATE profiles SET name = ?, address_line1 = ?, address_line2 = ?, address_line3 = ?, \
         city = ?, postal_code = ?, country = ?, location_id = ?, latitude = ?, longitude = ?, \
         last_modified_on = ?, last_modified_by = ? WHERE id = ?",
    )
    .bind(input.name.trim())
    .bind(&input.address_line1)
    .bind(&input.address_line2)
    .bind(&input.address_line3)
    .bind(&input.city)
    .bind(&input.postal_code)
    .bind(&input.country)
    .bind(&input.location_id)
    .bind(input.latitude)
    .bind(input.longitude)
    .bind(now_ts())
    .bind(&caller.user_id)
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, caller, id).await
}
