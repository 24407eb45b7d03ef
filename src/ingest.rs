//! Delta-sync pipeline.
//!
//! Coordinates one sync per connector:
//!
//! ```text
//! checkpoint → scan → filter → classify → batch file + records table
//!            → OneDrive archive (optional) → vector store upload → removals
//!            → checkpoint
//! ```
//!
//! Per-item failures (read, archive, upload, removal) are collected in the
//! [`SyncReport`] instead of aborting the run. Failed uploads stay in the
//! `records` table with `status = failed` for `mrag upload pending`. Items
//! the connector could not read hold the checkpoint back, so the next sync
//! sees them again; known records among them are flagged `failed` with a
//! cleared hash.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::batch::BatchWriter;
use crate::config::Config;
use crate::db::{self, StoredRecord};
use crate::graph::GraphClient;
use crate::models::{RecordKind, SourceItem};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::record::{archive_filename, iso, RecordMetadata};
use crate::traits::{Connector, ConnectorRegistry};
use crate::vector_store::VectorStoreClient;

#[derive(Debug, Default, Clone)]
pub struct SyncOptions {
    /// Ignore the stored checkpoint and rescan everything.
    pub full: bool,
    /// Classify and count, write nothing.
    pub dry_run: bool,
    /// `YYYY-MM-DD`, inclusive, on `updated_at`.
    pub since: Option<String>,
    /// `YYYY-MM-DD`, inclusive, on `updated_at`.
    pub until: Option<String>,
    pub limit: Option<usize>,
    /// Write batch files and records but do not touch the vector store.
    pub skip_upload: bool,
}

impl SyncOptions {
    /// Filtered runs see only part of the delta, so they must not move the
    /// checkpoint past the items they dropped.
    fn is_filtered(&self) -> bool {
        self.since.is_some() || self.until.is_some() || self.limit.is_some()
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub fetched: usize,
    pub new_items: usize,
    pub modified_items: usize,
    pub skipped_duplicates: usize,
    /// Items the connector saw but could not read.
    pub read_failures: usize,
    pub removed: usize,
    pub emails_processed: usize,
    pub documents_processed: usize,
    pub attachments_processed: usize,
    pub archived: usize,
    pub archive_failures: usize,
    pub upload_success: usize,
    pub upload_failures: usize,
    pub errors: Vec<String>,
    pub batch_file: Option<PathBuf>,
    pub checkpoint_saved: bool,
    pub dry_run: bool,
    pub duration_secs: f64,
}

impl SyncReport {
    pub fn print(&self) {
        if self.dry_run {
            println!("sync {} (dry-run)", self.source);
        } else {
            println!("sync {}", self.source);
        }
        println!("  fetched: {} items", self.fetched);
        println!("  new: {}", self.new_items);
        println!("  modified: {}", self.modified_items);
        println!("  unchanged: {}", self.skipped_duplicates);
        if self.read_failures > 0 {
            println!("  unreadable: {}", self.read_failures);
        }
        if self.dry_run {
            return;
        }
        println!("  removed: {}", self.removed);
        println!(
            "  processed: {} emails, {} documents, {} attachments",
            self.emails_processed, self.documents_processed, self.attachments_processed
        );
        if self.archived > 0 || self.archive_failures > 0 {
            println!(
                "  archived to onedrive: {} ({} failed)",
                self.archived, self.archive_failures
            );
        }
        println!(
            "  uploaded: {} ({} failed)",
            self.upload_success, self.upload_failures
        );
        if let Some(path) = &self.batch_file {
            println!("  batch file: {}", path.display());
        }
        println!(
            "  checkpoint: {}",
            if self.checkpoint_saved { "saved" } else { "unchanged" }
        );
        println!("  duration: {:.1}s", self.duration_secs);
        for err in &self.errors {
            println!("  error: {}", err);
        }
        if self.errors.is_empty() {
            println!("ok");
        }
    }
}

/// Resolve connectors and clients from `config` and the environment, then
/// sync each selected connector in turn.
///
/// `connector` is `all`, `mail`, `onedrive`, or `filesystem`.
pub async fn run_sync(
    config: &Config,
    connector: &str,
    options: &SyncOptions,
    reporter: &dyn SyncProgressReporter,
) -> Result<Vec<SyncReport>> {
    let wants_graph = matches!(connector, "all" | "mail" | "onedrive")
        || config.onedrive.processed_folder.is_some();
    let graph = if wants_graph {
        match GraphClient::from_config(&config.graph) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) if matches!(connector, "mail" | "onedrive") => {
                return Err(e.context("Microsoft Graph is not configured"));
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "microsoft graph unavailable");
                None
            }
        }
    } else {
        None
    };

    let registry = ConnectorRegistry::from_config(config, graph.clone());
    let selected: Vec<&dyn Connector> = if connector == "all" {
        registry.connectors().iter().map(|c| c.as_ref()).collect()
    } else {
        match registry.find(connector) {
            Some(c) => vec![c],
            None => bail!(
                "Unknown or unconfigured connector: '{}'. Available: all, mail, onedrive, filesystem",
                connector
            ),
        }
    };
    if selected.is_empty() {
        bail!("No connectors configured");
    }

    let uploader = if options.skip_upload || options.dry_run {
        None
    } else {
        Some(
            VectorStoreClient::from_env(&config.openai)
                .context("Vector store not configured (use --skip-upload to only write batch files)")?,
        )
    };
    let archive = if config.onedrive.processed_folder.is_some() {
        graph.as_deref()
    } else {
        None
    };

    let pool = db::connect(config).await?;
    crate::migrate::ensure_schema(&pool).await?;
    let mut reports = Vec::new();
    for c in selected {
        let result = sync_with(
            config,
            &pool,
            c,
            uploader.as_ref(),
            archive,
            options,
            reporter,
        )
        .await;
        match result {
            Ok(report) => reports.push(report),
            Err(e) if connector == "all" => {
                tracing::error!(connector = %c.name(), error = %format!("{:#}", e), "sync failed");
                reports.push(SyncReport {
                    source: c.source_label(),
                    errors: vec![format!("{:#}", e)],
                    ..Default::default()
                });
            }
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        }
    }

    pool.close().await;
    Ok(reports)
}

/// An item that differs from what is stored.
struct Change {
    item: SourceItem,
    existing: Option<StoredRecord>,
    content_hash: String,
    document_id: String,
}

/// Sync one connector against an open database.
pub async fn sync_with(
    config: &Config,
    pool: &SqlitePool,
    connector: &dyn Connector,
    uploader: Option<&VectorStoreClient>,
    archive: Option<&GraphClient>,
    options: &SyncOptions,
    reporter: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    let started = Instant::now();
    let label = connector.source_label();
    let mut report = SyncReport {
        source: label.clone(),
        dry_run: options.dry_run,
        ..Default::default()
    };

    // Load checkpoint
    let cursor = if options.full {
        None
    } else {
        db::get_checkpoint(pool, &label).await?
    };

    reporter.report(SyncProgressEvent::Discovering {
        connector: label.clone(),
    });
    let outcome = connector.scan(cursor.as_deref()).await?;
    let mut items = outcome.items;
    report.fetched = items.len();
    report.read_failures = outcome.failures.len();
    for failure in &outcome.failures {
        report
            .errors
            .push(format!("read {}: {}", failure.source_id, failure.error));
    }

    filter_by_date(&mut items, options.since.as_deref(), options.until.as_deref())?;
    if let Some(lim) = options.limit {
        items.truncate(lim);
    }

    // Classify against stored records
    let mut changes = Vec::new();
    for item in items {
        let content_hash = content_hash(&item);
        let existing = db::find_record(pool, &label, &item.source_id).await?;
        match &existing {
            Some(stored)
                if stored.status != db::STATUS_REMOVED
                    && stored.content_hash == content_hash
                    && stored.last_modified.as_deref() == Some(iso(&item.updated_at).as_str()) =>
            {
                report.skipped_duplicates += 1;
                continue;
            }
            Some(_) => report.modified_items += 1,
            None => report.new_items += 1,
        }
        let document_id = existing
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        changes.push(Change {
            item,
            existing,
            content_hash,
            document_id,
        });
    }

    if options.dry_run {
        report.duration_secs = started.elapsed().as_secs_f64();
        return Ok(report);
    }

    let mut records = normalize(pool, &label, &changes).await?;
    for record in &records {
        match record.kind {
            RecordKind::Email => report.emails_processed += 1,
            RecordKind::Document => report.documents_processed += 1,
            RecordKind::Attachment => report.attachments_processed += 1,
        }
    }

    // Batch file + records table
    if !records.is_empty() {
        let mut writer = BatchWriter::create(&config.output.dir, &label)?;
        for record in &records {
            writer.write(record)?;
        }
        let (path, _) = writer.finish()?;
        let total = changes.len() as u64;
        for (i, (change, record)) in changes.iter().zip(&records).enumerate() {
            upsert_record(pool, change, record, &path).await?;
            reporter.report(SyncProgressEvent::Processing {
                connector: label.clone(),
                n: i as u64 + 1,
                total,
            });
        }
        report.batch_file = Some(path);
    }

    // OneDrive archive
    if let (Some(graph), Some(folder)) = (archive, config.onedrive.processed_folder.as_deref()) {
        for record in records.iter_mut() {
            match archive_record(graph, folder, record).await {
                Ok(()) => {
                    update_metadata(pool, record).await?;
                    report.archived += 1;
                }
                Err(e) => {
                    tracing::warn!(document = %record.document_id, error = %format!("{:#}", e), "archive failed");
                    report.archive_failures += 1;
                }
            }
        }
    }

    // Vector store upload
    if let (Some(store), false) = (uploader, options.skip_upload) {
        // A record whose previous file survives is not uploaded again, or
        // the store would hold both versions.
        let mut blocked = HashSet::new();
        for (change, record) in changes.iter().zip(&records) {
            let Some(old_file) = change.existing.as_ref().and_then(|s| s.file_id.as_deref()) else {
                continue;
            };
            match store.remove_file(old_file).await {
                Ok(()) => db::reset_upload(pool, &record.document_id).await?,
                Err(e) => {
                    tracing::warn!(document = %record.document_id, file = %old_file, error = %e, "failed to remove previous version");
                    let message = format!("previous file {} not removed: {}", old_file, e);
                    db::mark_failed(pool, &record.document_id, &message).await?;
                    report
                        .errors
                        .push(format!("remove {}: {}", record.document_id, e));
                    report.upload_failures += 1;
                    blocked.insert(record.document_id.clone());
                }
            }
        }
        let uploadable: Vec<RecordMetadata> = records
            .iter()
            .filter(|r| !blocked.contains(&r.document_id))
            .cloned()
            .collect();

        let concurrency = config.openai.upload_concurrency.max(1);
        let total = uploadable.len() as u64;
        let mut done = 0u64;
        for batch in uploadable.chunks(concurrency) {
            let stats = store.upload_records(batch, concurrency).await;
            for (document_id, file_id) in &stats.uploaded {
                db::mark_uploaded(pool, document_id, file_id).await?;
            }
            for (document_id, error) in &stats.errors {
                if !document_id.is_empty() {
                    db::mark_failed(pool, document_id, error).await?;
                }
                report.errors.push(format!("upload {}: {}", document_id, error));
            }
            report.upload_success += stats.success;
            report.upload_failures += stats.failed;
            done += batch.len() as u64;
            reporter.report(SyncProgressEvent::Uploading {
                connector: label.clone(),
                n: done,
                total,
            });
        }
    }

    // Upstream deletions
    for source_id in &outcome.removed {
        let Some(stored) = db::find_record(pool, &label, source_id).await? else {
            continue;
        };
        let mut targets = db::find_children(pool, &stored.id).await?;
        targets.push(stored);
        for target in targets.iter().filter(|t| t.status != db::STATUS_REMOVED) {
            match remove_record(pool, uploader, target).await {
                Ok(()) => report.removed += 1,
                Err(e) => report
                    .errors
                    .push(format!("remove {}: {:#}", target.id, e)),
            }
        }
    }

    // Unreadable items: known records (or their owning email) are flagged so
    // the retry reprocesses them
    for failure in &outcome.failures {
        let owners = std::iter::once(&failure.source_id).chain(&failure.parent_source_id);
        for source_id in owners {
            if let Some(stored) = db::find_record(pool, &label, source_id).await? {
                db::mark_stale(pool, &stored.id, &failure.error).await?;
            }
        }
    }

    // Update checkpoint
    match outcome.cursor {
        Some(_) if !outcome.failures.is_empty() => tracing::warn!(
            source = %label,
            failed = outcome.failures.len(),
            "unreadable items, checkpoint not advanced"
        ),
        Some(c) if !options.is_filtered() => {
            db::set_checkpoint(pool, &label, &c).await?;
            report.checkpoint_saved = true;
        }
        Some(_) => tracing::info!(source = %label, "filtered run, checkpoint not advanced"),
        None => {}
    }

    report.duration_secs = started.elapsed().as_secs_f64();
    tracing::info!(
        source = %label,
        new = report.new_items,
        modified = report.modified_items,
        unchanged = report.skipped_duplicates,
        removed = report.removed,
        uploaded = report.upload_success,
        failed = report.upload_failures,
        "sync finished"
    );
    Ok(report)
}

fn filter_by_date(items: &mut Vec<SourceItem>, since: Option<&str>, until: Option<&str>) -> Result<()> {
    if let Some(since_str) = since {
        let since_ts = parse_day(since_str, "--since")?
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc().timestamp())
            .unwrap_or(i64::MIN);
        items.retain(|item| item.updated_at.timestamp() >= since_ts);
    }
    if let Some(until_str) = until {
        let until_ts = parse_day(until_str, "--until")?
            .and_hms_opt(23, 59, 59)
            .map(|d| d.and_utc().timestamp())
            .unwrap_or(i64::MAX);
        items.retain(|item| item.updated_at.timestamp() <= until_ts);
    }
    Ok(())
}

fn parse_day(s: &str, flag: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("{} expects YYYY-MM-DD, got '{}'", flag, s))
}

/// Hash of the content that matters for retrieval.
fn content_hash(item: &SourceItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.source.as_bytes());
    hasher.update(item.source_id.as_bytes());
    hasher.update(item.title.as_deref().unwrap_or("").as_bytes());
    hasher.update(item.filename.as_bytes());
    hasher.update(item.body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build records for all changes, linking attachments to their email.
async fn normalize(
    pool: &SqlitePool,
    label: &str,
    changes: &[Change],
) -> Result<Vec<RecordMetadata>> {
    let ids_in_batch: HashMap<&str, &str> = changes
        .iter()
        .map(|c| (c.item.source_id.as_str(), c.document_id.as_str()))
        .collect();

    let mut records = Vec::with_capacity(changes.len());
    for change in changes {
        let parent = match change.item.parent_source_id.as_deref() {
            Some(parent_sid) => match ids_in_batch.get(parent_sid) {
                Some(id) => Some(id.to_string()),
                None => db::find_record(pool, label, parent_sid).await?.map(|s| s.id),
            },
            None => None,
        };
        let mut record = RecordMetadata::from_item(&change.item, &change.document_id, parent.as_deref());
        record.one_drive_url = change.existing.as_ref().and_then(|s| s.one_drive_url.clone());
        records.push(record);
    }

    // Each email lists its attachments: new ones from this batch plus ones
    // already stored.
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for record in &records {
        if let Some(parent) = &record.parent_email_id {
            children
                .entry(parent.clone())
                .or_default()
                .push(record.document_id.clone());
        }
    }
    for record in records.iter_mut().filter(|r| r.kind == RecordKind::Email) {
        let mut ids = children.remove(&record.document_id).unwrap_or_default();
        for stored in db::find_children(pool, &record.document_id).await? {
            if stored.status != db::STATUS_REMOVED && !ids.contains(&stored.id) {
                ids.push(stored.id);
            }
        }
        ids.sort();
        record.attachments = ids;
    }

    Ok(records)
}

async fn upsert_record(
    pool: &SqlitePool,
    change: &Change,
    record: &RecordMetadata,
    batch_file: &std::path::Path,
) -> Result<()> {
    let item = &change.item;
    let metadata_json = serde_json::to_string(record)?;

    sqlx::query(
        r#"
        INSERT INTO records (id, source, source_id, kind, parent_id, title, source_url, created_at, updated_at, last_modified, content_type, body, metadata_json, content_hash, status, error, batch_file, one_drive_url, processed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)
        ON CONFLICT(source, source_id) DO UPDATE SET
            kind = excluded.kind,
            parent_id = excluded.parent_id,
            title = excluded.title,
            source_url = excluded.source_url,
            updated_at = excluded.updated_at,
            last_modified = excluded.last_modified,
            content_type = excluded.content_type,
            body = excluded.body,
            metadata_json = excluded.metadata_json,
            content_hash = excluded.content_hash,
            status = excluded.status,
            error = NULL,
            batch_file = excluded.batch_file,
            processed_at = excluded.processed_at
        "#,
    )
    .bind(&record.document_id)
    .bind(&record.source)
    .bind(&item.source_id)
    .bind(record.kind.as_str())
    .bind(&record.parent_email_id)
    .bind(record.display_name())
    .bind(&record.source_url)
    .bind(item.created_at.timestamp())
    .bind(item.updated_at.timestamp())
    .bind(&record.last_modified)
    .bind(&record.content_type)
    .bind(&record.text_content)
    .bind(&metadata_json)
    .bind(&change.content_hash)
    .bind(db::STATUS_PROCESSED)
    .bind(batch_file.to_string_lossy().to_string())
    .bind(&record.one_drive_url)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

async fn update_metadata(pool: &SqlitePool, record: &RecordMetadata) -> Result<()> {
    sqlx::query("UPDATE records SET metadata_json = ?, one_drive_url = ? WHERE id = ?")
        .bind(serde_json::to_string(record)?)
        .bind(&record.one_drive_url)
        .bind(&record.document_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Upload the record JSON to OneDrive and remember its web URL.
async fn archive_record(graph: &GraphClient, folder: &str, record: &mut RecordMetadata) -> Result<()> {
    let filename = archive_filename(record);
    let bytes = serde_json::to_vec_pretty(record)?;
    let uploaded = graph
        .upload(folder, &filename, bytes, "application/json")
        .await
        .with_context(|| format!("Failed to archive {}", filename))?;
    if let Some(url) = uploaded.web_url {
        record.one_drive_url = Some(url);
    }
    Ok(())
}

/// Delete a record's vector store file (when possible) and mark it removed.
/// Without an uploader the file id is kept so `upload pending` can clean up.
async fn remove_record(
    pool: &SqlitePool,
    uploader: Option<&VectorStoreClient>,
    target: &StoredRecord,
) -> Result<()> {
    let remaining = match (uploader, target.file_id.as_deref()) {
        (Some(store), Some(file_id)) => {
            store.remove_file(file_id).await?;
            None
        }
        (None, file_id) => file_id,
        (Some(_), None) => None,
    };
    db::mark_removed(pool, &target.id, remaining).await
}
