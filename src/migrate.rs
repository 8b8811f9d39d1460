//! Idempotent schema creation. Every statement is `IF NOT EXISTS`, so
//! `cx init` and `cx serve` can both run it on every start.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

const AUDIT_COLUMNS: &str = "
            created_on INTEGER NOT NULL,
            created_by TEXT NOT NULL,
            last_modified_on INTEGER NOT NULL,
            last_modified_by TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0";

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let tables: [(&str, &str); 6] = [
        (
            "profiles",
            "id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            address_line1 TEXT,
            address_line2 TEXT,
            address_line3 TEXT,
            city TEXT,
            postal_code TEXT,
            country TEXT,
            location_id TEXT,
            latitude REAL,
            longitude REAL,",
        ),
        (
            "projects",
            "id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,",
        ),
        (
            "threads",
            "id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            has_pinned_messages INTEGER NOT NULL DEFAULT 0,",
        ),
        (
            "messages",
            "id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL REFERENCES threads(id),
            content TEXT NOT NULL,
            content_type TEXT NOT NULL,
            message_type TEXT NOT NULL,
            feedback TEXT NOT NULL DEFAULT 'None',
            is_flagged INTEGER NOT NULL DEFAULT 0,
            is_pinned INTEGER NOT NULL DEFAULT 0,
            citations_json TEXT NOT NULL DEFAULT '[]',",
        ),
        (
            "nodes",
            "id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            parent_id TEXT REFERENCES nodes(id),
            name TEXT NOT NULL,
            file_name TEXT,
            display_name TEXT,
            description TEXT,
            author TEXT,
            language TEXT,
            is_asset INTEGER NOT NULL DEFAULT 0,
            file_ext TEXT,
            url TEXT,
            s3_key TEXT,
            keywords TEXT,
            tags TEXT,
            publication TEXT,",
        ),
        (
            "source_documents",
            "id TEXT PRIMARY KEY,
            node_id TEXT REFERENCES nodes(id),
            name TEXT NOT NULL,
            display_name TEXT,
            description TEXT,
            tags TEXT,
            language TEXT,
            document_source_type TEXT NOT NULL DEFAULT 'Blob',
            url TEXT,
            storage_key TEXT,
            content_type TEXT,
            status TEXT NOT NULL,
            is_trained INTEGER NOT NULL DEFAULT 0,
            extracted_text TEXT,
            import_warnings TEXT,
            error_text TEXT,
            date_trained INTEGER,",
        ),
    ];

    for (name, columns) in tables {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n            {}{}\n        )",
            name, columns, AUDIT_COLUMNS
        );
        sqlx::query(&sql).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS archive_entries (
            archive TEXT NOT NULL,
            document_id TEXT NOT NULL,
            seq_no INTEGER NOT NULL,
            chunk_json TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_profiles_user_id ON profiles(user_id)",
        "CREATE INDEX IF NOT EXISTS idx_threads_created_by ON threads(created_by)",
        "CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id)",
        "CREATE INDEX IF NOT EXISTS idx_nodes_project_id ON nodes(project_id)",
        "CREATE INDEX IF NOT EXISTS idx_nodes_parent_id ON nodes(parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_source_documents_status ON source_documents(status)",
        "CREATE INDEX IF NOT EXISTS idx_archive_entries_doc ON archive_entries(archive, document_id)",
    ];
    for sql in indexes {
        sqlx::query(sql).execute(pool).await?;
    }

    info!("schema migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("cx.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('profiles','projects','threads','messages','nodes','source_documents','archive_entries')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 7);
    }
}
