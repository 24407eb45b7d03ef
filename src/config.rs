//! TOML configuration.
//!
//! Secrets (Azure app credentials, the OpenAI key, the proxy token) are never
//! read from the file. They come from the environment at the point of use;
//! see [`crate::auth::GraphCredentials::from_env`] and
//! [`crate::vector_store::VectorStoreClient::from_env`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub onedrive: OneDriveConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

// ============ Microsoft Graph ============

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    /// Mailbox and drive owner (UPN or object id). `USER_EMAIL` wins when set.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_authority_url")]
    pub authority_url: String,
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_graph_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_graph_max_retries")]
    pub max_retries: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            user: None,
            authority_url: default_authority_url(),
            base_url: default_graph_base_url(),
            page_size: default_page_size(),
            timeout_secs: default_graph_timeout_secs(),
            max_retries: default_graph_max_retries(),
        }
    }
}

impl GraphConfig {
    /// Resolve the target user: `USER_EMAIL` first, then `[graph].user`.
    pub fn user(&self) -> Option<String> {
        std::env::var("USER_EMAIL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.user.clone())
    }
}

fn default_authority_url() -> String {
    "https://login.microsoftonline.com".to_string()
}
fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_page_size() -> u32 {
    50
}
fn default_graph_timeout_secs() -> u64 {
    30
}
fn default_graph_max_retries() -> u32 {
    3
}

// ============ Mail ============

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mail_folder")]
    pub folder: String,
    #[serde(default = "default_true")]
    pub include_attachments: bool,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
    #[serde(default = "default_true")]
    pub strip_signatures: bool,
    #[serde(default = "default_true")]
    pub strip_quoted: bool,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            folder: default_mail_folder(),
            include_attachments: true,
            max_attachment_bytes: default_max_attachment_bytes(),
            strip_signatures: true,
            strip_quoted: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_mail_folder() -> String {
    "inbox".to_string()
}
fn default_max_attachment_bytes() -> u64 {
    25 * 1024 * 1024
}

// ============ OneDrive ============

#[derive(Debug, Deserialize, Clone)]
pub struct OneDriveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_documents_folder")]
    pub folder: String,
    #[serde(default = "default_match_all")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// OneDrive folder that receives one normalized JSON file per record.
    #[serde(default)]
    pub processed_folder: Option<String>,
}

impl Default for OneDriveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            folder: default_documents_folder(),
            include_globs: default_match_all(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            allowed_extensions: default_allowed_extensions(),
            processed_folder: None,
        }
    }
}

impl OneDriveConfig {
    /// Whether `filename` carries one of the allowed extensions.
    pub fn allows(&self, filename: &str) -> bool {
        let ext = crate::record::file_extension(filename);
        !ext.is_empty() && self.allowed_extensions.iter().any(|a| a == &ext)
    }
}

fn default_documents_folder() -> String {
    "data_PMSA/documents_1".to_string()
}
fn default_match_all() -> Vec<String> {
    vec!["**".to_string()]
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_allowed_extensions() -> Vec<String> {
    [
        ".pdf", ".docx", ".doc", ".pptx", ".ppt", ".xlsx", ".xls", ".csv", ".txt", ".html",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ============ Local folders ============

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    pub filesystem: Option<FilesystemConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.pdf", "**/*.docx", "**/*.pptx", "**/*.xlsx", "**/*.csv", "**/*.txt", "**/*.md",
        "**/*.html",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ============ Output ============

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./data/batches")
}

// ============ OpenAI ============

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    /// `OPENAI_VECTOR_STORE_ID` wins when set.
    #[serde(default)]
    pub vector_store_id: Option<String>,
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    #[serde(default = "default_openai_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_openai_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            vector_store_id: None,
            upload_concurrency: default_upload_concurrency(),
            max_retries: default_openai_max_retries(),
            timeout_secs: default_openai_timeout_secs(),
        }
    }
}

impl OpenAiConfig {
    pub fn vector_store_id(&self) -> Option<String> {
        std::env::var("OPENAI_VECTOR_STORE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.vector_store_id.clone())
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_upload_concurrency() -> usize {
    10
}
fn default_openai_max_retries() -> u32 {
    5
}
fn default_openai_timeout_secs() -> u64 {
    60
}

// ============ Assistant ============

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default = "default_max_num_results")]
    pub max_num_results: u32,
    /// Classify each query (email / drive / mixed / data) and narrow the
    /// file search accordingly.
    #[serde(default)]
    pub route_by_intent: bool,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            instructions: default_instructions(),
            max_num_results: default_max_num_results(),
            route_by_intent: false,
        }
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_instructions() -> String {
    "You answer questions about the user's Microsoft 365 email and OneDrive documents. \
     Use the file_search tool, cite the files you rely on, and say so when the \
     documents do not contain the answer."
        .to_string()
}
fn default_max_num_results() -> u32 {
    8
}

// ============ Server ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.graph.page_size == 0 || config.graph.page_size > 999 {
        anyhow::bail!("graph.page_size must be in [1, 999]");
    }

    for (name, url) in [
        ("graph.authority_url", &config.graph.authority_url),
        ("graph.base_url", &config.graph.base_url),
        ("openai.base_url", &config.openai.base_url),
    ] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("{} must be an http(s) URL, got '{}'", name, url);
        }
    }

    if config.openai.upload_concurrency == 0 {
        anyhow::bail!("openai.upload_concurrency must be >= 1");
    }

    if !(1..=50).contains(&config.assistant.max_num_results) {
        anyhow::bail!("assistant.max_num_results must be in [1, 50]");
    }

    for ext in &config.onedrive.allowed_extensions {
        if !ext.starts_with('.') || ext.to_lowercase() != *ext {
            anyhow::bail!(
                "onedrive.allowed_extensions entries must be lower-case and start with '.', got '{}'",
                ext
            );
        }
    }

    Ok(config)
}
