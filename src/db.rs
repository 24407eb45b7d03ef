//! SQLite connection plus the record and checkpoint queries shared by `sync`,
//! `upload`, `export`, and `get`.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use crate::config::Config;
use crate::record::RecordMetadata;

pub const STATUS_PROCESSED: &str = "processed";
pub const STATUS_UPLOADED: &str = "uploaded";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_REMOVED: &str = "removed";

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Sync bookkeeping for one stored record.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: String,
    pub source: String,
    pub source_id: String,
    pub kind: String,
    pub parent_id: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: String,
    pub status: String,
    pub file_id: Option<String>,
    pub one_drive_url: Option<String>,
    pub error: Option<String>,
}

const STORED_COLUMNS: &str = "id, source, source_id, kind, parent_id, last_modified, \
    content_hash, status, file_id, one_drive_url, error";

fn stored_from_row(row: &SqliteRow) -> StoredRecord {
    StoredRecord {
        id: row.get("id"),
        source: row.get("source"),
        source_id: row.get("source_id"),
        kind: row.get("kind"),
        parent_id: row.get("parent_id"),
        last_modified: row.get("last_modified"),
        content_hash: row.get("content_hash"),
        status: row.get("status"),
        file_id: row.get("file_id"),
        one_drive_url: row.get("one_drive_url"),
        error: row.get("error"),
    }
}

pub async fn find_record(
    pool: &SqlitePool,
    source: &str,
    source_id: &str,
) -> Result<Option<StoredRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM records WHERE source = ? AND source_id = ?",
        STORED_COLUMNS
    ))
    .bind(source)
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(stored_from_row))
}

pub async fn find_record_by_id(pool: &SqlitePool, id: &str) -> Result<Option<StoredRecord>> {
    let row = sqlx::query(&format!("SELECT {} FROM records WHERE id = ?", STORED_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(stored_from_row))
}

/// Records whose `parent_id` is `parent`, i.e. an email's attachments.
pub async fn find_children(pool: &SqlitePool, parent: &str) -> Result<Vec<StoredRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM records WHERE parent_id = ? ORDER BY id",
        STORED_COLUMNS
    ))
    .bind(parent)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(stored_from_row).collect())
}

/// Normalized records with one of `statuses`, oldest first, with the
/// current vector store file id.
pub async fn load_records(
    pool: &SqlitePool,
    statuses: &[&str],
    source: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<(RecordMetadata, Option<String>)>> {
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let mut sql = format!(
        "SELECT id, metadata_json, file_id FROM records WHERE status IN ({})",
        placeholders
    );
    if source.is_some() {
        sql.push_str(" AND source = ?");
    }
    sql.push_str(" ORDER BY processed_at ASC, id ASC");
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }

    let mut query = sqlx::query(&sql);
    for status in statuses {
        query = query.bind(*status);
    }
    if let Some(s) = source {
        query = query.bind(s);
    }

    let rows = query.fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.get("id");
        let json: String = row.get("metadata_json");
        let record: RecordMetadata = serde_json::from_str(&json)
            .with_context(|| format!("Stored metadata for {} is not valid JSON", id))?;
        out.push((record, row.get("file_id")));
    }
    Ok(out)
}

pub async fn mark_uploaded(pool: &SqlitePool, id: &str, file_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE records SET status = ?, file_id = ?, error = NULL, uploaded_at = ? WHERE id = ?",
    )
    .bind(STATUS_UPLOADED)
    .bind(file_id)
    .bind(chrono::Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &SqlitePool, id: &str, error: &str) -> Result<()> {
    sqlx::query("UPDATE records SET status = ?, error = ? WHERE id = ?")
        .bind(STATUS_FAILED)
        .bind(crate::text::truncate_chars(error, 1000))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Flag a record whose latest upstream version could not be read. The
/// cleared hash makes the next sighting count as modified.
pub async fn mark_stale(pool: &SqlitePool, id: &str, error: &str) -> Result<()> {
    sqlx::query("UPDATE records SET status = ?, error = ?, content_hash = '' WHERE id = ?")
        .bind(STATUS_FAILED)
        .bind(crate::text::truncate_chars(error, 1000))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a record removed upstream. `file_id` is the vector store file that
/// still has to be deleted, if any.
pub async fn mark_removed(pool: &SqlitePool, id: &str, file_id: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE records SET status = ?, file_id = ?, error = NULL WHERE id = ?")
        .bind(STATUS_REMOVED)
        .bind(file_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Forget the vector store file of an uploaded record so it is uploaded again.
pub async fn reset_upload(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE records SET status = ?, file_id = NULL WHERE id = ?")
        .bind(STATUS_PROCESSED)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Removed records whose vector store file is still to be deleted.
pub async fn pending_removals(pool: &SqlitePool) -> Result<Vec<StoredRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM records WHERE status = ? AND file_id IS NOT NULL ORDER BY id",
        STORED_COLUMNS
    ))
    .bind(STATUS_REMOVED)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(stored_from_row).collect())
}

// ============ Checkpoints ============

pub async fn get_checkpoint(pool: &SqlitePool, source: &str) -> Result<Option<String>> {
    let cursor: Option<String> =
        sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
            .bind(source)
            .fetch_optional(pool)
            .await?;
    Ok(cursor)
}

pub async fn set_checkpoint(pool: &SqlitePool, source: &str, cursor: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
        "#,
    )
    .bind(source)
    .bind(cursor)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::ensure_schema(&pool).await.unwrap();
        pool
    }

    async fn insert(pool: &SqlitePool, id: &str, source_id: &str, parent: Option<&str>) {
        sqlx::query(
            "INSERT INTO records (id, source, source_id, kind, parent_id, created_at, updated_at, \
             content_type, body, metadata_json, content_hash, processed_at) \
             VALUES (?, 'mail', ?, 'email', ?, 0, 0, 'text/plain', '', '{}', 'h', 0)",
        )
        .bind(id)
        .bind(source_id)
        .bind(parent)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn checkpoint_upserts() {
        let pool = memory_pool().await;
        assert!(get_checkpoint(&pool, "mail").await.unwrap().is_none());
        set_checkpoint(&pool, "mail", "link-1").await.unwrap();
        set_checkpoint(&pool, "mail", "link-2").await.unwrap();
        assert_eq!(get_checkpoint(&pool, "mail").await.unwrap().as_deref(), Some("link-2"));
    }

    #[tokio::test]
    async fn upload_state_transitions() {
        let pool = memory_pool().await;
        insert(&pool, "e1", "m1", None).await;
        insert(&pool, "a1", "m1/x", Some("e1")).await;

        mark_uploaded(&pool, "e1", "file-1").await.unwrap();
        let e1 = find_record(&pool, "mail", "m1").await.unwrap().unwrap();
        assert_eq!(e1.status, STATUS_UPLOADED);
        assert_eq!(e1.file_id.as_deref(), Some("file-1"));

        let children = find_children(&pool, "e1").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].source_id, "m1/x");

        mark_failed(&pool, "a1", "boom").await.unwrap();
        let a1 = find_record(&pool, "mail", "m1/x").await.unwrap().unwrap();
        assert_eq!(a1.status, STATUS_FAILED);
        assert_eq!(a1.error.as_deref(), Some("boom"));

        // A removal that could not reach the vector store keeps its file id.
        mark_removed(&pool, "e1", Some("file-1")).await.unwrap();
        let pending = pending_removals(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "e1");

        mark_removed(&pool, "e1", None).await.unwrap();
        assert!(pending_removals(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_records_keep_their_file() {
        let pool = memory_pool().await;
        insert(&pool, "e1", "m1", None).await;
        mark_uploaded(&pool, "e1", "file-1").await.unwrap();
        mark_stale(&pool, "e1", "attachments: HTTP 403").await.unwrap();
        let e1 = find_record(&pool, "mail", "m1").await.unwrap().unwrap();
        assert_eq!(e1.status, STATUS_FAILED);
        assert_eq!(e1.content_hash, "");
        assert_eq!(e1.file_id.as_deref(), Some("file-1"));
        assert_eq!(e1.error.as_deref(), Some("attachments: HTTP 403"));
    }

    #[tokio::test]
    async fn reset_upload_clears_file_id() {
        let pool = memory_pool().await;
        insert(&pool, "e1", "m1", None).await;
        mark_uploaded(&pool, "e1", "file-1").await.unwrap();
        reset_upload(&pool, "e1").await.unwrap();
        let e1 = find_record(&pool, "mail", "m1").await.unwrap().unwrap();
        assert_eq!(e1.status, STATUS_PROCESSED);
        assert!(e1.file_id.is_none());
    }
}
