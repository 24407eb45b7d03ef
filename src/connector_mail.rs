//! Outlook mailbox connector.
//!
//! Walks one mail folder through the Graph message delta query. Each message
//! becomes an `Email` item; its file attachments (when enabled) become
//! `Attachment` items linked back through `parent_source_id`.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;

use crate::config::MailConfig;
use crate::extract::{check_size, content_type_for, extract_text, is_unsupported};
use crate::graph::GraphClient;
use crate::models::{
    MailAttachment, MailFields, MailMessage, RecordKind, Recipient, ScanFailure, ScanOutcome,
    SourceItem,
};
use crate::record::{file_extension, is_valid_email, sanitize_filename};
use crate::text::{clean_text, html_to_text, remove_quoted, remove_signature};
use crate::traits::Connector;

pub struct MailConnector {
    graph: Arc<GraphClient>,
    config: MailConfig,
    allowed_extensions: Vec<String>,
}

impl MailConnector {
    pub fn new(graph: Arc<GraphClient>, config: MailConfig, allowed_extensions: Vec<String>) -> Self {
        Self {
            graph,
            config,
            allowed_extensions,
        }
    }

    /// Attachment items of `message`. Listing or extraction failures are
    /// pushed to `failures` with the message as parent.
    async fn attachments_for(
        &self,
        message: &MailMessage,
        failures: &mut Vec<ScanFailure>,
    ) -> Vec<SourceItem> {
        let attachments = match self.graph.list_attachments(&message.id).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(message = %message.id, error = %e, "failed to list attachments");
                failures.push(ScanFailure::new(&message.id, &anyhow::Error::new(e)));
                return Vec::new();
            }
        };

        let mut items = Vec::new();
        for attachment in &attachments {
            match self.attachment_item(message, attachment) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) if is_unsupported(&e) => {
                    tracing::debug!(attachment = %attachment.name, error = %e, "unsupported format")
                }
                Err(e) => {
                    tracing::warn!(
                        message = %message.id,
                        attachment = %attachment.name,
                        error = %e,
                        "attachment failed"
                    );
                    failures.push(ScanFailure {
                        parent_source_id: Some(message.id.clone()),
                        ..ScanFailure::new(format!("{}/{}", message.id, attachment.id), &e)
                    });
                }
            }
        }
        items
    }

    /// `Ok(None)` for attachments that are filtered out rather than broken.
    fn attachment_item(
        &self,
        message: &MailMessage,
        attachment: &MailAttachment,
    ) -> Result<Option<SourceItem>> {
        if !attachment.is_file_attachment() || attachment.is_inline {
            return Ok(None);
        }
        let ext = file_extension(&attachment.name);
        if ext.is_empty() || !self.allowed_extensions.contains(&ext) {
            tracing::debug!(attachment = %attachment.name, "extension not allowed");
            return Ok(None);
        }
        let limit = self.config.max_attachment_bytes;
        if let Err(e) = check_size(attachment.size, limit) {
            tracing::info!(attachment = %attachment.name, error = %e, "skipping attachment");
            return Ok(None);
        }

        let Some(encoded) = attachment.content_bytes.as_deref() else {
            return Ok(None);
        };
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        if let Err(e) = check_size(bytes.len() as u64, limit) {
            tracing::info!(attachment = %attachment.name, error = %e, "skipping attachment");
            return Ok(None);
        }

        let content_type = attachment
            .content_type
            .clone()
            .filter(|ct| ct != crate::extract::MIME_OCTET)
            .unwrap_or_else(|| content_type_for(&attachment.name).to_string());
        let text = clean_text(&extract_text(&bytes, &content_type)?);
        if text.is_empty() {
            return Ok(None);
        }

        let received = message.received_date_time.unwrap_or_else(Utc::now);
        Ok(Some(SourceItem {
            source: self.source_label(),
            source_id: format!("{}/{}", message.id, attachment.id),
            kind: RecordKind::Attachment,
            parent_source_id: Some(message.id.clone()),
            source_url: message.web_link.clone(),
            title: Some(attachment.name.clone()),
            author: sender(message),
            created_at: received,
            updated_at: message.last_modified_date_time.unwrap_or(received),
            content_type,
            filename: attachment.name.clone(),
            size: bytes.len() as u64,
            body: text,
            mail: None,
            tags: message.categories.clone(),
        }))
    }
}

#[async_trait]
impl Connector for MailConnector {
    fn name(&self) -> &str {
        "mail"
    }

    fn description(&self) -> &str {
        "Outlook messages and their file attachments via Microsoft Graph"
    }

    fn connector_type(&self) -> &str {
        "mail"
    }

    async fn scan(&self, cursor: Option<&str>) -> Result<ScanOutcome> {
        let page = self.graph.messages_delta(&self.config.folder, cursor).await?;
        tracing::info!(
            folder = %self.config.folder,
            messages = page.items.len(),
            removed = page.removed_ids.len(),
            restarted = page.restarted,
            "mail delta fetched"
        );

        let mut items = Vec::new();
        let mut failures = Vec::new();
        for message in &page.items {
            items.push(message_item(&self.source_label(), message, &self.config));
            if self.config.include_attachments && message.has_attachments {
                items.extend(self.attachments_for(message, &mut failures).await);
            }
        }

        Ok(ScanOutcome {
            items,
            removed: page.removed_ids,
            cursor: page.delta_link,
            failures,
        })
    }
}

/// Turn a Graph message into an `Email` item with a cleaned body.
pub fn message_item(source: &str, message: &MailMessage, config: &MailConfig) -> SourceItem {
    let subject = message.subject.clone().unwrap_or_default();
    let received = message.received_date_time.unwrap_or_else(Utc::now);
    let body = message_body(message, config);

    let mail = MailFields {
        message_id: message
            .internet_message_id
            .as_deref()
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| message.id.clone()),
        subject: subject.clone(),
        from: message
            .from
            .as_ref()
            .and_then(|r| r.address())
            .unwrap_or_default(),
        to: addresses(&message.to_recipients),
        cc: addresses(&message.cc_recipients),
        has_attachments: message.has_attachments,
    };

    let stem = sanitize_filename(&subject);
    let filename = if stem.is_empty() {
        "message.eml".to_string()
    } else {
        format!("{}.eml", stem)
    };

    SourceItem {
        source: source.to_string(),
        source_id: message.id.clone(),
        kind: RecordKind::Email,
        parent_source_id: None,
        source_url: message.web_link.clone(),
        title: Some(subject).filter(|s| !s.is_empty()),
        author: sender(message),
        created_at: received,
        updated_at: message.last_modified_date_time.unwrap_or(received),
        content_type: crate::extract::MIME_EML.to_string(),
        filename,
        size: body.len() as u64,
        body,
        mail: Some(mail),
        tags: message.categories.clone(),
    }
}

fn message_body(message: &MailMessage, config: &MailConfig) -> String {
    let raw = match &message.body {
        Some(b) if b.content_type.as_deref().map(|t| t.eq_ignore_ascii_case("html")).unwrap_or(false) => {
            html_to_text(&b.content)
        }
        Some(b) if !b.content.trim().is_empty() => b.content.replace("\r\n", "\n"),
        _ => message.body_preview.clone().unwrap_or_default(),
    };

    let mut text = raw;
    if config.strip_quoted {
        text = remove_quoted(&text);
    }
    if config.strip_signatures {
        text = remove_signature(&text);
    }
    clean_text(&text)
}

/// Recipient addresses, dropping anything that is not a plain address
/// (distribution list names, `undisclosed-recipients`).
fn addresses(recipients: &[Recipient]) -> Vec<String> {
    recipients
        .iter()
        .filter_map(Recipient::address)
        .filter(|a| is_valid_email(a))
        .collect()
}

fn sender(message: &MailMessage) -> Option<String> {
    let email = message.from.as_ref()?.email_address.as_ref()?;
    email
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| email.address.clone())
}
