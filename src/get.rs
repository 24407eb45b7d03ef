//! Record lookup by document id, for `mrag get`.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::record::RecordMetadata;

/// A stored record with its sync and upload state.
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    pub record: RecordMetadata,
    pub source_id: String,
    pub status: String,
    pub error: Option<String>,
    pub file_id: Option<String>,
    pub batch_file: Option<String>,
    pub processed_at: String,
    pub uploaded_at: Option<String>,
}

pub async fn get_record(pool: &SqlitePool, id: &str) -> Result<RecordView> {
    let row = sqlx::query(
        "SELECT source_id, metadata_json, status, error, file_id, batch_file, processed_at, uploaded_at \
         FROM records WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        bail!("record not found: {}", id);
    };

    let metadata_json: String = row.get("metadata_json");
    let record: RecordMetadata = serde_json::from_str(&metadata_json)
        .with_context(|| format!("Stored metadata for {} is not valid JSON", id))?;
    let processed_at: i64 = row.get("processed_at");
    let uploaded_at: Option<i64> = row.get("uploaded_at");

    Ok(RecordView {
        record,
        source_id: row.get("source_id"),
        status: row.get("status"),
        error: row.get("error"),
        file_id: row.get("file_id"),
        batch_file: row.get("batch_file"),
        processed_at: format_ts_iso(processed_at),
        uploaded_at: uploaded_at.map(format_ts_iso),
    })
}

pub async fn run_get(config: &Config, id: &str, as_json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    crate::migrate::ensure_schema(&pool).await?;
    let view = get_record(&pool, id).await;
    pool.close().await;
    let view = view?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let r = &view.record;
    println!("--- Record ---");
    println!("id:           {}", r.document_id);
    println!("type:         {}", r.kind);
    println!("name:         {}", r.display_name());
    println!("source:       {}", r.source);
    println!("source_id:    {}", view.source_id);
    if let Some(parent) = &r.parent_email_id {
        println!("parent:       {}", parent);
    }
    if let Some(from) = &r.from {
        println!("from:         {}", from);
    }
    if !r.to.is_empty() {
        println!("to:           {}", r.to.join(", "));
    }
    if let Some(author) = &r.author {
        println!("author:       {}", author);
    }
    if let Some(created) = &r.created_at {
        println!("created_at:   {}", created);
    }
    if let Some(modified) = &r.last_modified {
        println!("modified:     {}", modified);
    }
    println!("content_type: {}", r.content_type);
    if let Some(url) = &r.source_url {
        println!("source_url:   {}", url);
    }
    if let Some(url) = &r.one_drive_url {
        println!("archived:     {}", url);
    }
    if !r.attachments.is_empty() {
        println!("attachments:  {}", r.attachments.join(", "));
    }
    println!();

    println!("--- Upload ---");
    println!("status:       {}", view.status);
    println!("processed_at: {}", view.processed_at);
    if let Some(file_id) = &view.file_id {
        println!("file_id:      {}", file_id);
    }
    if let Some(ts) = &view.uploaded_at {
        println!("uploaded_at:  {}", ts);
    }
    if let Some(err) = &view.error {
        println!("error:        {}", err);
    }
    if let Some(batch) = &view.batch_file {
        println!("batch_file:   {}", batch);
    }
    println!();

    println!("--- Text ---");
    println!("{}", r.text_content);

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
