//! OpenAI Files + Vector Stores client.
//!
//! Uploading a record takes two calls: the text goes to `POST /files` as a
//! `.txt` file with `purpose=assistants`, then the file is attached to the
//! vector store together with its attributes. Both calls use the same
//! retry strategy as the Graph client:
//!
//! - HTTP 429 or 5xx → retry with exponential backoff
//! - HTTP 4xx (not 429) → fail immediately
//! - Network error → retry

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::task::JoinSet;

use crate::config::OpenAiConfig;
use crate::error::{backoff_delay, check_status, RemoteError};
use crate::record::{archive_filename, build_attributes, record_text, RecordMetadata};
use crate::text::split_by_tokens;

const SERVICE: &str = "openai";

/// Upload bodies are capped at this many estimated tokens.
const MAX_UPLOAD_TOKENS: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub document_id: String,
    pub file_id: String,
    pub vector_store_file_id: String,
}

/// Outcome of [`VectorStoreClient::upload_records`].
#[derive(Debug, Default)]
pub struct UploadStats {
    pub success: usize,
    pub failed: usize,
    /// `(document_id, file_id)` for every successful upload.
    pub uploaded: Vec<(String, String)>,
    /// `(document_id, error)` for every failure.
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub file_id: String,
    pub filename: String,
    pub score: f64,
    pub attributes: Map<String, Value>,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorStoreFile {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub attributes: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Deserialize)]
struct DataList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct RawHit {
    file_id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    attributes: Option<Map<String, Value>>,
    #[serde(default)]
    content: Vec<RawContent>,
}

#[derive(Deserialize)]
struct RawContent {
    #[serde(default)]
    text: String,
}

#[derive(Clone)]
pub struct VectorStoreClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    vector_store_id: String,
    max_retries: u32,
}

impl std::fmt::Debug for VectorStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStoreClient")
            .field("base_url", &self.base_url)
            .field("vector_store_id", &self.vector_store_id)
            .finish_non_exhaustive()
    }
}

impl VectorStoreClient {
    pub fn new(config: &OpenAiConfig, api_key: String, vector_store_id: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            vector_store_id,
            max_retries: config.max_retries,
        })
    }

    /// Build a client from `[openai]`, `OPENAI_API_KEY`, and
    /// `OPENAI_VECTOR_STORE_ID`.
    pub fn from_env(config: &OpenAiConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(RemoteError::MissingCredential("OPENAI_API_KEY"))?;
        let vector_store_id = config
            .vector_store_id()
            .ok_or(RemoteError::MissingCredential("OPENAI_VECTOR_STORE_ID"))?;
        Self::new(config, api_key, vector_store_id)
    }

    pub fn vector_store_id(&self) -> &str {
        &self.vector_store_id
    }

    // ============ Files ============

    /// Upload `text` as `{stem}.txt`; returns the file id.
    pub async fn upload_file(&self, stem: &str, text: &str) -> Result<String, RemoteError> {
        let url = format!("{}/files", self.base_url);
        let filename = format!("{}.txt", stem);
        let bytes = text.as_bytes().to_vec();
        let resp = self
            .execute(|http| {
                let part = Part::bytes(bytes.clone())
                    .file_name(filename.clone())
                    .mime_str("text/plain")
                    .unwrap_or_else(|_| Part::bytes(bytes.clone()).file_name(filename.clone()));
                let form = Form::new().text("purpose", "assistants").part("file", part);
                http.post(&url).multipart(form)
            })
            .await?;
        let created: IdOnly = decode(resp).await?;
        Ok(created.id)
    }

    /// Attach an uploaded file to the vector store with its attributes;
    /// returns the vector store file id.
    pub async fn attach_file(
        &self,
        file_id: &str,
        attributes: &Map<String, Value>,
    ) -> Result<String, RemoteError> {
        let url = format!("{}/vector_stores/{}/files", self.base_url, self.vector_store_id);
        let body = json!({ "file_id": file_id, "attributes": attributes });
        let resp = self.execute(|http| http.post(&url).json(&body)).await?;
        let attached: IdOnly = decode(resp).await?;
        Ok(attached.id)
    }

    /// Upload one record: text file plus attributes.
    pub async fn upload_record(&self, record: &RecordMetadata) -> Result<UploadedFile> {
        let archive = archive_filename(record);
        let stem = archive.strip_suffix(".json").unwrap_or(&archive);

        let mut text = record_text(record);
        if text.chars().count() > MAX_UPLOAD_TOKENS * 4 {
            tracing::warn!(document = %record.document_id, "record text truncated for upload");
            text = split_by_tokens(&text, MAX_UPLOAD_TOKENS, 0)
                .into_iter()
                .next()
                .unwrap_or_default();
        }

        let file_id = self
            .upload_file(stem, &text)
            .await
            .with_context(|| format!("Failed to upload file for {}", record.document_id))?;

        let attributes = build_attributes(record);
        match self.attach_file(&file_id, &attributes).await {
            Ok(vector_store_file_id) => {
                tracing::debug!(document = %record.document_id, file = %file_id, "uploaded");
                Ok(UploadedFile {
                    document_id: record.document_id.clone(),
                    file_id,
                    vector_store_file_id,
                })
            }
            Err(e) => {
                // Do not leave an orphaned file behind.
                if let Err(cleanup) = self.delete_file(&file_id).await {
                    tracing::warn!(file = %file_id, error = %cleanup, "failed to delete orphaned file");
                }
                Err(anyhow::Error::new(e)
                    .context(format!("Failed to attach file for {}", record.document_id)))
            }
        }
    }

    /// Upload records in batches of `concurrency`, each batch running
    /// concurrently. Failures are collected, not returned.
    pub async fn upload_records(
        &self,
        records: &[RecordMetadata],
        concurrency: usize,
    ) -> UploadStats {
        let mut stats = UploadStats::default();

        for batch in records.chunks(concurrency.max(1)) {
            let mut tasks = JoinSet::new();
            for record in batch {
                let client = self.clone();
                let record = record.clone();
                tasks.spawn(async move {
                    let result = client.upload_record(&record).await;
                    (record.document_id, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(uploaded))) => {
                        stats.success += 1;
                        stats.uploaded.push((uploaded.document_id, uploaded.file_id));
                    }
                    Ok((document_id, Err(e))) => {
                        tracing::warn!(document = %document_id, error = %format!("{:#}", e), "upload failed");
                        stats.failed += 1;
                        stats.errors.push((document_id, format!("{:#}", e)));
                    }
                    Err(e) => {
                        stats.failed += 1;
                        stats.errors.push((String::new(), format!("upload task failed: {}", e)));
                    }
                }
            }
        }

        stats
    }

    /// Detach a file from the vector store and delete it. Missing files count
    /// as removed.
    pub async fn remove_file(&self, file_id: &str) -> Result<(), RemoteError> {
        let url = format!(
            "{}/vector_stores/{}/files/{}",
            self.base_url, self.vector_store_id, file_id
        );
        ignore_not_found(self.execute(|http| http.delete(&url)).await)?;
        self.delete_file(file_id).await
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/files/{}", self.base_url, file_id);
        ignore_not_found(self.execute(|http| http.delete(&url)).await)
    }

    pub async fn list_files(&self, limit: u32) -> Result<Vec<VectorStoreFile>, RemoteError> {
        let url = format!("{}/vector_stores/{}/files", self.base_url, self.vector_store_id);
        let limit = limit.clamp(1, 100).to_string();
        let resp = self
            .execute(|http| http.get(&url).query(&[("limit", limit.as_str())]))
            .await?;
        let list: DataList<VectorStoreFile> = decode(resp).await?;
        Ok(list.data)
    }

    // ============ Search / Responses ============

    pub async fn search(
        &self,
        query: &str,
        max_results: u32,
        filters: Option<&Value>,
    ) -> Result<Vec<SearchHit>, RemoteError> {
        let url = format!("{}/vector_stores/{}/search", self.base_url, self.vector_store_id);
        let mut body = json!({ "query": query, "max_num_results": max_results });
        if let Some(f) = filters {
            body["filters"] = f.clone();
        }
        let resp = self.execute(|http| http.post(&url).json(&body)).await?;
        let list: DataList<RawHit> = decode(resp).await?;
        Ok(list
            .data
            .into_iter()
            .map(|hit| SearchHit {
                file_id: hit.file_id,
                filename: hit.filename,
                score: hit.score,
                attributes: hit.attributes.unwrap_or_default(),
                content: hit
                    .content
                    .into_iter()
                    .map(|c| c.text)
                    .collect::<Vec<_>>()
                    .join("\n"),
            })
            .collect())
    }

    /// `POST /responses` with a prepared request body.
    pub async fn create_response(&self, body: &Value) -> Result<Value, RemoteError> {
        let url = format!("{}/responses", self.base_url);
        let resp = self.execute(|http| http.post(&url).json(body)).await?;
        decode(resp).await
    }

    async fn execute<F>(&self, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let err = match build(&self.http).bearer_auth(&self.api_key).send().await {
                Ok(resp) => match check_status(SERVICE, resp).await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => e,
                },
                Err(e) => RemoteError::transport(SERVICE, e),
            };
            if !err.is_retryable() {
                return Err(err);
            }
            tracing::warn!(attempt, error = %err, "openai request failed");
            last_err = Some(err);
        }

        Err(last_err.unwrap_or_else(|| RemoteError::decode(SERVICE, "no attempt was made")))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
    resp.json::<T>()
        .await
        .map_err(|e| RemoteError::decode(SERVICE, e.to_string()))
}

fn ignore_not_found(result: Result<Response, RemoteError>) -> Result<(), RemoteError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => Ok(()),
        Err(e) => Err(e),
    }
}
