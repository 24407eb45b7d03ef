//! Core data models.
//!
//! [`SourceItem`] is what connectors produce; the pipeline turns it into a
//! [`RecordMetadata`](crate::record::RecordMetadata). The Graph views at the
//! bottom mirror only the JSON fields this crate reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Email,
    Document,
    Attachment,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Email => "email",
            RecordKind::Document => "document",
            RecordKind::Attachment => "attachment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(RecordKind::Email),
            "document" => Some(RecordKind::Document),
            "attachment" => Some(RecordKind::Attachment),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header fields carried by emails.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailFields {
    pub message_id: String,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub has_attachments: bool,
}

/// Raw item produced by a connector before normalization.
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Source label, e.g. `"mail"`, `"onedrive"`, `"filesystem"`.
    pub source: String,
    /// Stable id within the source (Graph id, relative path).
    pub source_id: String,
    pub kind: RecordKind,
    /// `source_id` of the owning email for attachments.
    pub parent_source_id: Option<String>,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_type: String,
    pub filename: String,
    pub size: u64,
    /// Cleaned plain text.
    pub body: String,
    pub mail: Option<MailFields>,
    pub tags: Vec<String>,
}

/// Result of one connector scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub items: Vec<SourceItem>,
    /// `source_id`s deleted upstream since the previous cursor.
    pub removed: Vec<String>,
    /// Cursor to persist once the items are handled.
    pub cursor: Option<String>,
    /// Items that changed upstream but could not be read.
    pub failures: Vec<ScanFailure>,
}

/// An item the connector saw but could not turn into a [`SourceItem`].
#[derive(Debug, Clone)]
pub struct ScanFailure {
    pub source_id: String,
    /// Owning email of a failed attachment.
    pub parent_source_id: Option<String>,
    pub error: String,
}

impl ScanFailure {
    pub fn new(source_id: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            source_id: source_id.into(),
            parent_source_id: None,
            error: format!("{:#}", error),
        }
    }
}

// ============ Microsoft Graph views ============

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub file: Option<FileFacet>,
    #[serde(default)]
    pub folder: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_reference: Option<ItemReference>,
    #[serde(default)]
    pub created_by: Option<IdentitySet>,
    #[serde(default, rename = "@removed")]
    pub removed: Option<serde_json::Value>,
}

impl DriveItem {
    pub fn is_file(&self) -> bool {
        self.file.is_some()
    }

    /// Drive-relative path of this item, e.g. `docs/reports/q2.pdf`.
    pub fn drive_path(&self) -> String {
        let parent = self
            .parent_reference
            .as_ref()
            .and_then(|p| p.path.as_deref())
            .map(|p| match p.find(':') {
                Some(idx) => &p[idx + 1..],
                None => p,
            })
            .unwrap_or("")
            .trim_matches('/');
        if parent.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", parent, self.name)
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ItemReference {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IdentitySet {
    #[serde(default)]
    pub user: Option<Identity>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MailMessage {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<ItemBody>,
    #[serde(default)]
    pub body_preview: Option<String>,
    #[serde(default)]
    pub from: Option<Recipient>,
    #[serde(default)]
    pub to_recipients: Vec<Recipient>,
    #[serde(default)]
    pub cc_recipients: Vec<Recipient>,
    #[serde(default)]
    pub received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub internet_message_id: Option<String>,
    #[serde(default)]
    pub web_link: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub importance: Option<String>,
    #[serde(default, rename = "@removed")]
    pub removed: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(default)]
    pub email_address: Option<EmailAddress>,
}

impl Recipient {
    pub fn address(&self) -> Option<String> {
        self.email_address
            .as_ref()
            .and_then(|e| e.address.clone())
            .filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EmailAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MailAttachment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_inline: bool,
    #[serde(default)]
    pub content_bytes: Option<String>,
    #[serde(default, rename = "@odata.type")]
    pub odata_type: Option<String>,
}

impl MailAttachment {
    /// Only `#microsoft.graph.fileAttachment` carries downloadable bytes.
    pub fn is_file_attachment(&self) -> bool {
        self.odata_type
            .as_deref()
            .map(|t| t.ends_with("fileAttachment"))
            .unwrap_or(true)
    }
}
