//! OneDrive documents connector.
//!
//! Runs the drive delta query from the root and keeps files under
//! `[onedrive].folder` that pass the glob, extension, and size filters. Kept
//! files are downloaded by id and reduced to text. Files that fail the filter
//! are reported as removed, so a document moved out of the folder (or renamed
//! to an excluded extension) leaves the vector store. Ids that were never
//! synced are ignored downstream.
//!
//! # Configuration
//!
//! ```toml
//! [onedrive]
//! folder = "data_PMSA/documents_1"
//! include_globs = ["**"]
//! exclude_globs = ["**/drafts/**"]
//! max_file_bytes = 52428800
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use std::sync::Arc;

use crate::config::OneDriveConfig;
use crate::connector_fs::build_globset;
use crate::extract::{
    check_size, content_type_for, extract_core_properties, extract_text, is_unsupported,
};
use crate::graph::{normalize_path, GraphClient};
use crate::models::{DriveItem, RecordKind, ScanFailure, ScanOutcome, SourceItem};
use crate::text::clean_text;
use crate::traits::Connector;

pub struct OneDriveConnector {
    graph: Arc<GraphClient>,
    config: OneDriveConfig,
}

impl OneDriveConnector {
    pub fn new(graph: Arc<GraphClient>, config: OneDriveConfig) -> Self {
        Self { graph, config }
    }

    async fn document_item(&self, item: &DriveItem, relative: &str) -> Result<Option<SourceItem>> {
        let bytes = self.graph.download_item(&item.id).await?;

        let content_type = item
            .file
            .as_ref()
            .and_then(|f| f.mime_type.clone())
            .filter(|ct| ct != crate::extract::MIME_OCTET)
            .unwrap_or_else(|| content_type_for(&item.name).to_string());
        let body = clean_text(&extract_text(&bytes, &content_type)?);
        if body.is_empty() {
            return Ok(None);
        }

        let props = extract_core_properties(&bytes);
        let created = item.created_date_time.unwrap_or_else(Utc::now);
        let updated = item
            .last_modified_date_time
            .or_else(|| props.modified.as_deref().and_then(parse_timestamp))
            .unwrap_or(created);

        Ok(Some(SourceItem {
            source: self.source_label(),
            source_id: item.id.clone(),
            kind: RecordKind::Document,
            parent_source_id: None,
            source_url: item.web_url.clone(),
            title: props.title.or_else(|| Some(item.name.clone())),
            author: props.creator.or_else(|| {
                item.created_by
                    .as_ref()
                    .and_then(|c| c.user.as_ref())
                    .and_then(|u| u.display_name.clone())
            }),
            created_at: created,
            updated_at: updated,
            content_type,
            filename: item.name.clone(),
            size: bytes.len() as u64,
            body,
            mail: None,
            tags: tags_for(relative),
        }))
    }
}

#[async_trait]
impl Connector for OneDriveConnector {
    fn name(&self) -> &str {
        "onedrive"
    }

    fn description(&self) -> &str {
        "Documents from a OneDrive folder via Microsoft Graph"
    }

    fn connector_type(&self) -> &str {
        "onedrive"
    }

    async fn scan(&self, cursor: Option<&str>) -> Result<ScanOutcome> {
        let filter = DriveFilter::new(&self.config)?;
        let page = self.graph.drive_delta(cursor).await?;
        tracing::info!(
            entries = page.items.len(),
            removed = page.removed_ids.len(),
            restarted = page.restarted,
            "drive delta fetched"
        );

        let mut outcome = ScanOutcome {
            removed: page.removed_ids,
            cursor: page.delta_link,
            ..Default::default()
        };
        for entry in page.items.iter().filter(|i| i.is_file()) {
            let Some(relative) = filter.accept(entry) else {
                outcome.removed.push(entry.id.clone());
                continue;
            };
            match self.document_item(entry, &relative).await {
                Ok(Some(item)) => outcome.items.push(item),
                Ok(None) => tracing::debug!(path = %relative, "no text extracted"),
                Err(e) if is_unsupported(&e) => {
                    tracing::debug!(path = %relative, error = %e, "unsupported format")
                }
                Err(e) => {
                    tracing::warn!(path = %relative, error = %format!("{:#}", e), "document failed");
                    outcome.failures.push(ScanFailure::new(&entry.id, &e));
                }
            }
        }

        Ok(outcome)
    }
}

/// Folder, glob, and extension filter over drive items.
struct DriveFilter<'a> {
    folder: String,
    include: GlobSet,
    exclude: GlobSet,
    config: &'a OneDriveConfig,
}

impl<'a> DriveFilter<'a> {
    fn new(config: &'a OneDriveConfig) -> Result<Self> {
        Ok(Self {
            folder: normalize_path(&config.folder),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
            config,
        })
    }

    /// Path relative to the configured folder when the item is kept.
    /// Oversized files are dropped here rather than failed, since retrying
    /// cannot change their size.
    fn accept(&self, item: &DriveItem) -> Option<String> {
        let path = item.drive_path();
        let relative = if self.folder.is_empty() {
            path
        } else {
            path.strip_prefix(&self.folder)?.strip_prefix('/')?.to_string()
        };
        if self.exclude.is_match(&relative) || !self.include.is_match(&relative) {
            return None;
        }
        if !self.config.allows(&item.name) {
            return None;
        }
        if let Err(e) = check_size(item.size, self.config.max_file_bytes) {
            tracing::info!(path = %relative, error = %e, "skipping document");
            return None;
        }
        Some(relative)
    }
}

/// Subfolder names become tags: `finance/2025/q2.pdf` → `["finance", "2025"]`.
fn tags_for(relative: &str) -> Vec<String> {
    let mut parts: Vec<String> = relative.split('/').map(str::to_string).collect();
    parts.pop();
    parts
}

/// `dcterms:modified` values are RFC 3339.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_item(name: &str, parent: &str, size: u64) -> DriveItem {
        serde_json::from_value(serde_json::json!({
            "id": format!("id-{}", name),
            "name": name,
            "size": size,
            "file": {"mimeType": "application/pdf"},
            "parentReference": {"path": format!("/drive/root:/{}", parent)}
        }))
        .unwrap()
    }

    #[test]
    fn filter_keeps_files_under_folder() {
        let config = OneDriveConfig {
            exclude_globs: vec!["drafts/**".to_string()],
            ..OneDriveConfig::default()
        };
        let filter = DriveFilter::new(&config).unwrap();
        assert_eq!(
            filter.accept(&drive_item("q2.pdf", "data_PMSA/documents_1/finance", 10)),
            Some("finance/q2.pdf".to_string())
        );
        assert_eq!(filter.accept(&drive_item("x.pdf", "elsewhere", 10)), None);
        assert_eq!(
            filter.accept(&drive_item("x.pdf", "data_PMSA/documents_1/drafts", 10)),
            None
        );
        assert_eq!(
            filter.accept(&drive_item("setup.exe", "data_PMSA/documents_1", 10)),
            None
        );
        // a sibling folder sharing the prefix is not inside the folder
        assert_eq!(
            filter.accept(&drive_item("a.pdf", "data_PMSA/documents_10", 10)),
            None
        );
    }

    #[test]
    fn filter_drops_oversized_files() {
        let config = OneDriveConfig {
            max_file_bytes: 100,
            ..OneDriveConfig::default()
        };
        let filter = DriveFilter::new(&config).unwrap();
        assert!(filter
            .accept(&drive_item("small.pdf", "data_PMSA/documents_1", 100))
            .is_some());
        assert_eq!(
            filter.accept(&drive_item("big.pdf", "data_PMSA/documents_1", 101)),
            None
        );
    }

    #[test]
    fn tags_come_from_subfolders() {
        assert_eq!(tags_for("finance/2025/q2.pdf"), vec!["finance", "2025"]);
        assert!(tags_for("q2.pdf").is_empty());
    }

    #[test]
    fn timestamps_parse() {
        assert!(parse_timestamp("2025-03-01T10:00:00Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
