//! `mrag upload pending`, `mrag upload rebuild`, and `mrag upload batch`.
//!
//! Nothing is fetched from Graph. `pending` and `rebuild` work from the
//! `records` table; `batch` replays a batch JSONL file.

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

use crate::batch::read_batch;
use crate::config::Config;
use crate::db;
use crate::record::RecordMetadata;
use crate::vector_store::VectorStoreClient;

#[derive(Debug, Default, Clone)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub failed: usize,
    pub cleaned: usize,
    pub errors: Vec<String>,
}

impl UploadSummary {
    fn print_errors(&self) {
        for err in &self.errors {
            println!("  error: {}", err);
        }
        if self.errors.is_empty() {
            println!("ok");
        }
    }
}

/// Upload records that are `processed` or `failed`, and delete vector store
/// files of records removed while uploads were skipped.
pub async fn run_upload_pending(
    config: &Config,
    limit: Option<usize>,
    dry_run: bool,
) -> Result<UploadSummary> {
    let pool = db::connect(config).await?;
    crate::migrate::ensure_schema(&pool).await?;

    if dry_run {
        let pending = db::load_records(&pool, PENDING, None, limit).await?;
        let removals = db::pending_removals(&pool).await?;
        println!("upload pending (dry-run)");
        println!("  to upload: {}", pending.len());
        println!("  to delete: {}", removals.len());
        pool.close().await;
        return Ok(UploadSummary::default());
    }

    let store = VectorStoreClient::from_env(&config.openai)?;
    let summary = upload_pending(&pool, &store, config.openai.upload_concurrency, limit).await?;
    pool.close().await;

    println!("upload pending");
    println!("  uploaded: {} ({} failed)", summary.uploaded, summary.failed);
    println!("  deleted: {}", summary.cleaned);
    summary.print_errors();
    Ok(summary)
}

const PENDING: &[&str] = &[db::STATUS_PROCESSED, db::STATUS_FAILED];

/// Delete leftover files of removed records, then upload up to `limit`
/// pending records.
pub async fn upload_pending(
    pool: &SqlitePool,
    store: &VectorStoreClient,
    concurrency: usize,
    limit: Option<usize>,
) -> Result<UploadSummary> {
    let pending = db::load_records(pool, PENDING, None, limit).await?;
    let removals = db::pending_removals(pool).await?;
    let mut summary = UploadSummary::default();

    for stored in &removals {
        let Some(file_id) = stored.file_id.as_deref() else {
            continue;
        };
        match store.remove_file(file_id).await {
            Ok(()) => {
                db::mark_removed(pool, &stored.id, None).await?;
                summary.cleaned += 1;
            }
            Err(e) => summary.errors.push(format!("remove {}: {}", stored.id, e)),
        }
    }

    upload_with_replace(pool, store, concurrency, pending, &mut summary).await?;
    Ok(summary)
}

/// Delete every file this tool uploaded and upload all live records again.
pub async fn run_upload_rebuild(config: &Config) -> Result<UploadSummary> {
    let pool = db::connect(config).await?;
    crate::migrate::ensure_schema(&pool).await?;
    let store = VectorStoreClient::from_env(&config.openai)?;

    let summary = rebuild(&pool, &store, config.openai.upload_concurrency).await?;
    pool.close().await;

    println!("upload rebuild");
    println!("  uploaded: {} ({} failed)", summary.uploaded, summary.failed);
    summary.print_errors();
    Ok(summary)
}

pub async fn rebuild(
    pool: &SqlitePool,
    store: &VectorStoreClient,
    concurrency: usize,
) -> Result<UploadSummary> {
    let records = db::load_records(
        pool,
        &[db::STATUS_PROCESSED, db::STATUS_UPLOADED, db::STATUS_FAILED],
        None,
        None,
    )
    .await?;
    tracing::info!(records = records.len(), "rebuilding vector store contents");

    let mut summary = UploadSummary::default();
    upload_with_replace(pool, store, concurrency, records, &mut summary).await?;
    Ok(summary)
}

/// Upload the records of a batch file. Records already tracked in the
/// database have their previous vector store file replaced and their state
/// updated; unknown records are uploaded as-is.
pub async fn run_upload_batch(config: &Config, path: &Path, dry_run: bool) -> Result<UploadSummary> {
    let records = read_batch(path)?;
    let pool = db::connect(config).await?;
    crate::migrate::ensure_schema(&pool).await?;

    let mut with_files = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for record in records {
        match db::find_record_by_id(&pool, &record.document_id).await? {
            Some(stored) if stored.status == db::STATUS_REMOVED => skipped += 1,
            Some(stored) => with_files.push((record, stored.file_id)),
            None => with_files.push((record, None)),
        }
    }

    if dry_run {
        println!("upload batch {} (dry-run)", path.display());
        println!("  to upload: {}", with_files.len());
        println!("  removed upstream: {}", skipped);
        pool.close().await;
        return Ok(UploadSummary::default());
    }

    let store = VectorStoreClient::from_env(&config.openai)?;
    let mut summary = UploadSummary::default();
    upload_with_replace(&pool, &store, config.openai.upload_concurrency, with_files, &mut summary).await?;
    pool.close().await;

    println!("upload batch {}", path.display());
    println!("  uploaded: {} ({} failed)", summary.uploaded, summary.failed);
    if skipped > 0 {
        println!("  skipped (removed upstream): {}", skipped);
    }
    summary.print_errors();
    Ok(summary)
}

/// Remove each record's current file (if any), then upload it.
async fn upload_with_replace(
    pool: &SqlitePool,
    store: &VectorStoreClient,
    concurrency: usize,
    records: Vec<(RecordMetadata, Option<String>)>,
    summary: &mut UploadSummary,
) -> Result<()> {
    let mut to_upload = Vec::with_capacity(records.len());
    for (record, file_id) in records {
        if let Some(file_id) = file_id {
            if let Err(e) = store.remove_file(&file_id).await {
                let message = format!("previous file {} not removed: {}", file_id, e);
                db::mark_failed(pool, &record.document_id, &message).await?;
                summary
                    .errors
                    .push(format!("remove {}: {}", record.document_id, e));
                summary.failed += 1;
                continue;
            }
            db::reset_upload(pool, &record.document_id).await?;
        }
        to_upload.push(record);
    }

    let stats = store.upload_records(&to_upload, concurrency).await;
    for (document_id, file_id) in &stats.uploaded {
        db::mark_uploaded(pool, document_id, file_id).await?;
    }
    for (document_id, error) in &stats.errors {
        if !document_id.is_empty() {
            db::mark_failed(pool, document_id, error).await?;
        }
        summary.errors.push(format!("upload {}: {}", document_id, error));
    }
    summary.uploaded += stats.success;
    summary.failed += stats.failed;
    Ok(())
}
