use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create tables and indexes if missing. Idempotent.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    // One row per normalized record (email, attachment, document)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            source_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            parent_id TEXT,
            title TEXT,
            source_url TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_modified TEXT,
            content_type TEXT NOT NULL,
            body TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'processed',
            error TEXT,
            batch_file TEXT,
            one_drive_url TEXT,
            file_id TEXT,
            processed_at INTEGER NOT NULL,
            uploaded_at INTEGER,
            UNIQUE(source, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create checkpoints table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // conversation_id → last Responses API id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            previous_response_id TEXT NOT NULL,
            turns INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_source ON records(source)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_status ON records(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_parent ON records(parent_id)")
        .execute(pool)
        .await?;

    Ok(())
}
