//! SQLite repositories, one module per aggregate.
//!
//! All functions take the pool and the [`Caller`](crate::access::Caller)
//! explicitly, enforce permissions before touching rows, and treat
//! soft-deleted rows as absent.

pub mod messages;
pub mod nodes;
pub mod profiles;
pub mod projects;
pub mod source_documents;
pub mod threads;

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use sqlx::{Row, SqlitePool};

use crate::models::MonthCount;

/// Number of months returned by the summary reports.
pub const SUMMARY_MONTHS: u32 = 6;

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Counts live rows of `table` per calendar month of `created_on`.
pub(crate) async fn monthly_counts(pool: &SqlitePool, table: &str) -> Result<Vec<MonthCount>> {
    let sql = format!(
        "SELECT CAST(strftime('%Y', created_on, 'unixepoch') AS INTEGER) AS year, \
                CAST(strftime('%m', created_on, 'unixepoch') AS INTEGER) AS month, \
                COUNT(*) AS total \
         FROM {} WHERE is_deleted = 0 GROUP BY year, month",
        table
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    let mut counts = Vec::with_capacity(rows.len());
    for row in rows {
        counts.push(MonthCount {
            year: row.try_get::<i64, _>("year")? as i32,
            month: row.try_get::<i64, _>("month")? as u32,
            count: row.try_get("total")?,
        });
    }
    Ok(counts)
}

/// Returns the `months` calendar months ending at the latest month in
/// `data`, oldest first, with zero counts for months without data.
/// Empty input stays empty.
pub fn fill_missing_months(data: &[MonthCount], months: u32) -> Vec<MonthCount> {
    let Some(latest) = data
        .iter()
        .filter_map(|d| NaiveDate::from_ymd_opt(d.year, d.month, 1))
        .max()
    else {
        return Vec::new();
    };

    let Some(mut date) = latest.checked_sub_months(chrono::Months::new(months.saturating_sub(1)))
    else {
        return Vec::new();
    };

    let mut filled = Vec::with_capacity(months as usize);
    while date <= latest {
        let count = data
            .iter()
            .find(|d| d.year == date.year() && d.month == date.month())
            .map(|d| d.count)
            .unwrap_or(0);
        filled.push(MonthCount {
            year: date.year(),
            month: date.month(),
            count,
        });
        match date.checked_add_months(chrono::Months::new(1)) {
            Some(next) => date = next,
            None => break,
        }
    }
    filled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mc(year: i32, month: u32, count: i64) -> MonthCount {
        MonthCount { year, month, count }
    }

    #[test]
    fn fill_missing_months_empty() {
        assert!(fill_missing_months(&[], 6).is_empty());
    }

    #[test]
    fn fill_missing_months_spans_year_boundary() {
        let data = vec![mc(2024, 2, 5), mc(2023, 11, 3)];
        let filled = fill_missing_months(&data, 6);
        assert_eq!(
            filled,
            vec![
                mc(2023, 9, 0),
                mc(2023, 10, 0),
                mc(2023, 11, 3),
                mc(2023, 12, 0),
                mc(2024, 1, 0),
                mc(2024, 2, 5),
            ]
        );
    }

    #[test]
    fn fill_missing_months_drops_older_data() {
        let data = vec![mc(2024, 8, 1), mc(2023, 1, 9)];
        let filled = fill_missing_months(&data, 6);
        assert_eq!(filled.len(), 6);
        assert_eq!(filled[0], mc(2024, 3, 0));
        assert!(filled.iter().all(|m| m.year == 2024));
    }
}
