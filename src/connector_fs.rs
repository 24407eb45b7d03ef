//! Local folder connector.
//!
//! Useful for exported mail archives and shared drives mounted on disk. Files
//! go through the same extraction as OneDrive documents. The cursor is the
//! newest modification time seen (Unix seconds); later scans skip anything
//! not modified since.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::FilesystemConnectorConfig;
use crate::extract::{content_type_for, extract_core_properties, extract_text, is_unsupported};
use crate::models::{RecordKind, ScanFailure, ScanOutcome, SourceItem};
use crate::text::clean_text;
use crate::traits::Connector;

pub struct FilesystemConnector {
    config: FilesystemConnectorConfig,
}

impl FilesystemConnector {
    pub fn new(config: FilesystemConnectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for FilesystemConnector {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn description(&self) -> &str {
        "Documents from a local directory"
    }

    fn connector_type(&self) -> &str {
        "filesystem"
    }

    async fn scan(&self, cursor: Option<&str>) -> Result<ScanOutcome> {
        let since = cursor.and_then(|c| c.parse::<i64>().ok());
        scan_filesystem(&self.config, since)
    }
}

pub fn scan_filesystem(config: &FilesystemConnectorConfig, since: Option<i64>) -> Result<ScanOutcome> {
    let root = &config.root;
    if !root.exists() {
        bail!(
            "Filesystem connector root does not exist: {}",
            root.display()
        );
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/~$*".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut items = Vec::new();
    let mut failures = Vec::new();
    let mut newest = since.unwrap_or(0);

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let modified = modified_secs(path)?;
        newest = newest.max(modified);
        if since.is_some_and(|s| modified <= s) {
            continue;
        }

        match file_to_source_item(path, &rel_str, modified) {
            Ok(Some(item)) => items.push(item),
            Ok(None) => tracing::debug!(path = %rel_str, "no text extracted"),
            Err(e) if is_unsupported(&e) => {
                tracing::debug!(path = %rel_str, error = %e, "unsupported format")
            }
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "file failed");
                failures.push(ScanFailure::new(rel_str, &e));
            }
        }
    }

    // Sort for deterministic ordering
    items.sort_by(|a, b| a.source_id.cmp(&b.source_id));

    Ok(ScanOutcome {
        items,
        removed: Vec::new(),
        cursor: Some(newest.to_string()),
        failures,
    })
}

fn modified_secs(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)?
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    Ok(modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64)
}

fn file_to_source_item(path: &Path, relative_path: &str, modified: i64) -> Result<Option<SourceItem>> {
    let bytes = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let content_type = content_type_for(&filename).to_string();

    let body = clean_text(&extract_text(&bytes, &content_type)?);
    if body.is_empty() {
        return Ok(None);
    }

    let props = extract_core_properties(&bytes);
    let timestamp: DateTime<Utc> = Utc
        .timestamp_opt(modified, 0)
        .single()
        .unwrap_or_else(Utc::now);

    let mut tags: Vec<String> = relative_path.split('/').map(str::to_string).collect();
    tags.pop();

    Ok(Some(SourceItem {
        source: "filesystem".to_string(),
        source_id: relative_path.to_string(),
        kind: RecordKind::Document,
        parent_source_id: None,
        source_url: Some(format!("file://{}", path.display())),
        title: props.title.or_else(|| Some(filename.clone())),
        author: props.creator,
        created_at: timestamp,
        updated_at: timestamp,
        content_type,
        filename,
        size: bytes.len() as u64,
        body,
        mail: None,
        tags,
    }))
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
