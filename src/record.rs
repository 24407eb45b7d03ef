//! Normalized record metadata.
//!
//! A [`RecordMetadata`] is the unit written to batch files, archived to
//! OneDrive, and uploaded to the vector store. Its JSON field names are the
//! on-disk format, so renaming a field is a format change.

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::models::{RecordKind, SourceItem};
use crate::text::truncate_chars;

/// Longest attribute string value the vector store accepts.
pub const MAX_ATTRIBUTE_CHARS: usize = 512;
/// Attribute keys allowed per vector store file.
pub const MAX_ATTRIBUTE_KEYS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordMetadata {
    pub document_id: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub filename: String,
    #[serde(default)]
    pub one_drive_url: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub size: u64,
    pub content_type: String,
    pub source: String,
    #[serde(default)]
    pub is_attachment: bool,
    #[serde(default)]
    pub parent_email_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    /// `document_id`s of this email's attachments.
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub text_content: String,
}

impl RecordMetadata {
    /// Normalize a connector item. `parent_document_id` is the resolved id of
    /// the owning email for attachments.
    pub fn from_item(
        item: &SourceItem,
        document_id: &str,
        parent_document_id: Option<&str>,
    ) -> Self {
        let created = iso(&item.created_at);
        let mail = item.mail.as_ref();

        Self {
            document_id: document_id.to_string(),
            kind: item.kind,
            filename: item.filename.clone(),
            one_drive_url: None,
            source_url: item.source_url.clone(),
            created_at: Some(created.clone()),
            size: item.size,
            content_type: item.content_type.clone(),
            source: item.source.clone(),
            is_attachment: item.kind == RecordKind::Attachment,
            parent_email_id: parent_document_id.map(str::to_string),
            message_id: mail.map(|m| m.message_id.clone()),
            subject: mail.map(|m| m.subject.clone()),
            from: mail.map(|m| m.from.clone()).filter(|f| !f.is_empty()),
            to: mail.map(|m| m.to.clone()).unwrap_or_default(),
            cc: mail.map(|m| m.cc.clone()).unwrap_or_default(),
            date: (item.kind == RecordKind::Email).then_some(created),
            title: item.title.clone(),
            author: item.author.clone(),
            last_modified: Some(iso(&item.updated_at)),
            attachments: Vec::new(),
            tags: item.tags.clone(),
            text_content: item.body.clone(),
        }
    }

    /// Best human label: subject, then title, then filename.
    pub fn display_name(&self) -> &str {
        self.subject
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.title.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or(&self.filename)
    }
}

/// RFC 3339 with second precision and a `Z` suffix.
pub fn iso(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The text body uploaded for a record. Emails carry their headers so the
/// model can answer "who sent ..." questions from the text alone.
pub fn record_text(record: &RecordMetadata) -> String {
    let mut out = String::new();
    match record.kind {
        RecordKind::Email => {
            out.push_str(&format!(
                "Subject: {}\n",
                record.subject.as_deref().unwrap_or("")
            ));
            out.push_str(&format!("From: {}\n", record.from.as_deref().unwrap_or("")));
            out.push_str(&format!("To: {}\n", record.to.join(", ")));
            if !record.cc.is_empty() {
                out.push_str(&format!("Cc: {}\n", record.cc.join(", ")));
            }
            out.push_str(&format!("Date: {}\n", record.date.as_deref().unwrap_or("")));
            out.push('\n');
        }
        RecordKind::Attachment => {
            out.push_str(&format!("Attachment: {}\n\n", record.filename));
        }
        RecordKind::Document => {
            if let Some(title) = record.title.as_deref().filter(|t| !t.is_empty()) {
                out.push_str(&format!("Title: {}\n\n", title));
            }
        }
    }
    out.push_str(&record.text_content);
    out
}

/// Vector store file attributes for a record.
///
/// String values are capped at [`MAX_ATTRIBUTE_CHARS`]; empty values are left
/// out; the result never exceeds [`MAX_ATTRIBUTE_KEYS`] keys.
pub fn build_attributes(record: &RecordMetadata) -> Map<String, Value> {
    let mut attrs = Map::new();
    let mut put = |key: &str, value: Option<&str>| {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            attrs.insert(
                key.to_string(),
                Value::String(truncate_chars(v, MAX_ATTRIBUTE_CHARS)),
            );
        }
    };

    put("type", Some(record.kind.as_str()));
    put("subject", record.subject.as_deref());
    put("from", record.from.as_deref());
    put("body", Some(record.text_content.as_str()));
    put("filename", Some(record.filename.as_str()));

    let recipients: Vec<&str> = record
        .to
        .iter()
        .chain(record.cc.iter())
        .map(String::as_str)
        .collect();
    put("recipients", Some(recipients.join(",").as_str()));

    if let (Some(c), Some(m)) = (&record.created_at, &record.last_modified) {
        put("date_created", Some(truncate_chars(c, 19).as_str()));
        put("date_modified", Some(truncate_chars(m, 19).as_str()));
    }

    put("rel", record.parent_email_id.as_deref());
    put("tags", Some(record.tags.join(",").as_str()));

    let source_id = record
        .one_drive_url
        .as_deref()
        .and_then(|u| u.trim_end_matches('/').rsplit('/').next());
    put("source_id", source_id);
    put("source", Some(record.source.as_str()));
    put("version", Some("v1"));

    // Present even when empty.
    attrs.insert(
        "extension".to_string(),
        Value::String(file_extension(&record.filename)),
    );

    while attrs.len() > MAX_ATTRIBUTE_KEYS {
        if let Some(last) = attrs.keys().next_back().cloned() {
            attrs.remove(&last);
        }
    }

    attrs
}

/// Archive name for an email: `{date[:10]}_{safe_subject}_{id}.json`.
pub fn processed_filename(record: &RecordMetadata) -> String {
    let date = record
        .date
        .as_deref()
        .or(record.created_at.as_deref())
        .map(|d| truncate_chars(d, 10))
        .unwrap_or_else(|| "undated".to_string());

    let safe_subject: String = record
        .display_name()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '_')
        .map(|c| if c == ' ' { '_' } else { c })
        .take(50)
        .collect();

    let id = record
        .message_id
        .as_deref()
        .filter(|m| !m.is_empty())
        .unwrap_or(&record.document_id);

    format!("{}_{}_{}.json", date, safe_subject, sanitize_filename(id))
}

/// `{YYYY-MM-DD}_{clean_text[:20]}{id[:8]}.{ext}`.
pub fn hybrid_filename(date: &DateTime<Utc>, text: &str, id: &str, ext: &str) -> String {
    let clean = truncate_chars(&sanitize_filename(text), 20);
    let short_id = truncate_chars(id, 8);
    let ext = ext.trim_start_matches('.');
    if ext.is_empty() {
        format!("{}_{}{}", date.format("%Y-%m-%d"), clean, short_id)
    } else {
        format!("{}_{}{}.{}", date.format("%Y-%m-%d"), clean, short_id, ext)
    }
}

/// Name under which a record's JSON is archived to OneDrive.
pub fn archive_filename(record: &RecordMetadata) -> String {
    match record.kind {
        RecordKind::Email => processed_filename(record),
        _ => {
            let date = record
                .last_modified
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            hybrid_filename(&date, record.display_name(), &record.document_id, "json")
        }
    }
}

/// Replace path-hostile characters and whitespace with `_`, collapse runs,
/// and trim leading/trailing `_`.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let mapped = if c.is_whitespace() || "\\/:*?\"<>|@#".contains(c) {
            '_'
        } else {
            c
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches('_').to_string()
}

pub fn is_valid_email(s: &str) -> bool {
    static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("valid regex")
    });
    EMAIL_RE.is_match(s)
}

/// Lower-case extension with its dot (`".pdf"`), or `""`.
pub fn file_extension(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}
