//! Question answering over the vector store via the OpenAI Responses API.
//!
//! Every question becomes one `POST /responses` call with the `file_search`
//! tool pointed at the configured vector store. Multi-turn conversations are
//! chained with `previous_response_id`; the `conversations` table maps a
//! client-facing `conversation_id` to the last response id.
//!
//! [`Assistant::rag`] additionally turns `file_citation` annotations and the
//! included search results into typed [`Citation`]s and a confidence score.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::AssistantConfig;
use crate::error::RemoteError;
use crate::vector_store::VectorStoreClient;

/// Client mistakes; the HTTP layer maps these to 400.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("invalid filters: {0}")]
    InvalidFilters(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AskRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub query: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AskResponse {
    pub conversation_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RagRequest {
    #[serde(alias = "query")]
    pub prompt: String,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RagResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub confidence: f64,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Citation {
    Drive {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<u32>,
        file_id: String,
    },
    Email {
        source: String,
        subject: String,
        file_id: String,
    },
    Data {
        source: String,
        table: String,
        file_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Email,
    Drive,
    Mixed,
    Data,
}

impl Intent {
    /// Lenient parse of a model's one-word answer; anything unknown is `Mixed`.
    pub fn parse(s: &str) -> Self {
        let word = s
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        match word.as_str() {
            "email" => Intent::Email,
            "drive" => Intent::Drive,
            "data" => Intent::Data,
            _ => Intent::Mixed,
        }
    }

    fn filter(self) -> Option<Value> {
        match self {
            Intent::Email => Some(json!({ "type": "eq", "key": "type", "value": "email" })),
            Intent::Drive => Some(json!({ "type": "ne", "key": "type", "value": "email" })),
            Intent::Mixed | Intent::Data => None,
        }
    }
}

// ============ Responses API views ============

#[derive(Debug, Deserialize)]
struct ResponseBody {
    id: String,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<ContentPart>,
    },
    FileSearchCall {
        #[serde(default)]
        results: Option<Vec<FileSearchResult>>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    OutputText {
        text: String,
        #[serde(default)]
        annotations: Vec<Annotation>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Annotation {
    FileCitation {
        file_id: String,
        #[serde(default)]
        filename: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct FileSearchResult {
    file_id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    attributes: Option<Map<String, Value>>,
}

/// What one Responses call produced.
struct Turn {
    response_id: String,
    answer: String,
    /// `(file_id, filename)` in citation order, de-duplicated.
    cited: Vec<(String, String)>,
    results: Vec<FileSearchResult>,
}

impl Turn {
    fn from_value(value: Value) -> Result<Self, RemoteError> {
        let body: ResponseBody = serde_json::from_value(value)
            .map_err(|e| RemoteError::decode("openai", e.to_string()))?;

        let mut answer = String::new();
        let mut cited: Vec<(String, String)> = Vec::new();
        let mut results = Vec::new();
        for item in body.output {
            match item {
                OutputItem::Message { content } => {
                    for part in content {
                        let ContentPart::OutputText { text, annotations } = part else {
                            continue;
                        };
                        answer.push_str(&text);
                        for ann in annotations {
                            if let Annotation::FileCitation { file_id, filename } = ann {
                                if !cited.iter().any(|(id, _)| *id == file_id) {
                                    cited.push((file_id, filename.unwrap_or_default()));
                                }
                            }
                        }
                    }
                }
                OutputItem::FileSearchCall { results: Some(r) } => results.extend(r),
                _ => {}
            }
        }

        Ok(Self {
            response_id: body.id,
            answer: answer.trim().to_string(),
            cited,
            results,
        })
    }
}

// ============ Assistant ============

pub struct Assistant {
    store: VectorStoreClient,
    pool: SqlitePool,
    config: AssistantConfig,
}

impl Assistant {
    pub fn new(store: VectorStoreClient, pool: SqlitePool, config: AssistantConfig) -> Self {
        Self {
            store,
            pool,
            config,
        }
    }

    /// Plain question/answer turn.
    pub async fn ask(&self, conversation_id: Option<&str>, query: &str) -> Result<AskResponse> {
        if query.trim().is_empty() {
            return Err(QueryError::EmptyQuery.into());
        }
        let conversation_id = conversation_id
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let filters = self.intent_filter(query).await;
        let turn = self.respond(&conversation_id, query, filters).await?;
        Ok(AskResponse {
            conversation_id,
            answer: turn.answer,
        })
    }

    /// Question/answer turn returning the citation envelope.
    pub async fn rag(&self, request: &RagRequest) -> Result<RagResponse> {
        let query = request.prompt.trim();
        if query.is_empty() {
            return Err(QueryError::EmptyQuery.into());
        }
        let conversation_id = request
            .conversation_id
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let user_filters = match &request.filters {
            Some(f) => build_filters(f)?,
            None => None,
        };
        let filters = combine_filters(user_filters, self.intent_filter(query).await);

        let turn = self.respond(&conversation_id, query, filters).await?;
        let citations = citations(&turn);
        let confidence = confidence(&turn);
        Ok(RagResponse {
            answer: turn.answer,
            citations,
            confidence,
            conversation_id,
        })
    }

    /// Classify `query`; failures and unknown labels fall back to `Mixed`.
    pub async fn classify_intent(&self, query: &str) -> Intent {
        let body = json!({
            "model": self.config.model,
            "input": format!(
                "Classify the following user query into one of these categories: \
                 email, drive, mixed, or data.\n\nQuery: {}\n\nCategory:",
                query
            ),
        });
        match self.store.create_response(&body).await.and_then(Turn::from_value) {
            Ok(turn) => Intent::parse(&turn.answer),
            Err(e) => {
                tracing::warn!(error = %e, "intent classification failed");
                Intent::Mixed
            }
        }
    }

    async fn intent_filter(&self, query: &str) -> Option<Value> {
        if !self.config.route_by_intent {
            return None;
        }
        let intent = self.classify_intent(query).await;
        tracing::debug!(?intent, "routed query");
        intent.filter()
    }

    async fn respond(
        &self,
        conversation_id: &str,
        query: &str,
        filters: Option<Value>,
    ) -> Result<Turn> {
        let previous = previous_response(&self.pool, conversation_id).await?;
        let body = request_body(
            &self.config,
            self.store.vector_store_id(),
            query,
            previous.as_deref(),
            filters,
        );
        let turn = Turn::from_value(self.store.create_response(&body).await?)?;
        save_turn(&self.pool, conversation_id, &turn.response_id).await?;
        tracing::info!(
            conversation = %conversation_id,
            response = %turn.response_id,
            cited = turn.cited.len(),
            "answered"
        );
        Ok(turn)
    }
}

fn request_body(
    config: &AssistantConfig,
    vector_store_id: &str,
    query: &str,
    previous_response_id: Option<&str>,
    filters: Option<Value>,
) -> Value {
    let mut tool = json!({
        "type": "file_search",
        "vector_store_ids": [vector_store_id],
        "max_num_results": config.max_num_results,
    });
    if let Some(f) = filters {
        tool["filters"] = f;
    }
    let mut body = json!({
        "model": config.model,
        "instructions": config.instructions,
        "input": query,
        "tools": [tool],
        "include": ["file_search_call.results"],
    });
    if let Some(prev) = previous_response_id {
        body["previous_response_id"] = Value::String(prev.to_string());
    }
    body
}

// ============ Filters ============

/// Turn client filters into a vector store filter object.
///
/// An object carrying `type` is already a filter and is passed through. A
/// flat `{key: value}` map becomes `eq` comparisons joined with `and`.
/// `null` and `{}` mean no filter.
pub fn build_filters(filters: &Value) -> Result<Option<Value>, QueryError> {
    let map = match filters {
        Value::Null => return Ok(None),
        Value::Object(map) => map,
        other => {
            return Err(QueryError::InvalidFilters(format!(
                "expected an object, got {}",
                other
            )))
        }
    };
    if map.contains_key("type") && (map.contains_key("key") || map.contains_key("filters")) {
        return Ok(Some(filters.clone()));
    }

    let mut comparisons = Vec::with_capacity(map.len());
    for (key, value) in map {
        if !matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
            return Err(QueryError::InvalidFilters(format!(
                "value for '{}' must be a string, number, or boolean",
                key
            )));
        }
        comparisons.push(json!({ "type": "eq", "key": key, "value": value }));
    }

    Ok(match comparisons.len() {
        0 => None,
        1 => comparisons.pop(),
        _ => Some(json!({ "type": "and", "filters": comparisons })),
    })
}

/// `k=v` pairs from the command line as a flat filter map.
pub fn filters_from_pairs(pairs: &[String]) -> Result<Option<Value>, QueryError> {
    let mut map = Map::new();
    for pair in pairs {
        let (k, v) = pair
            .split_once('=')
            .filter(|(k, _)| !k.trim().is_empty())
            .ok_or_else(|| QueryError::InvalidFilters(format!("expected key=value, got '{}'", pair)))?;
        map.insert(k.trim().to_string(), Value::String(v.trim().to_string()));
    }
    build_filters(&Value::Object(map))
}

fn combine_filters(a: Option<Value>, b: Option<Value>) -> Option<Value> {
    match (a, b) {
        (Some(a), Some(b)) => Some(json!({ "type": "and", "filters": [a, b] })),
        (a, b) => a.or(b),
    }
}

// ============ Citations ============

const DATA_EXTENSIONS: &[&str] = &[".csv", ".xlsx", ".xls"];

fn attr<'a>(attrs: Option<&'a Map<String, Value>>, key: &str) -> Option<&'a str> {
    attrs
        .and_then(|a| a.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn citations(turn: &Turn) -> Vec<Citation> {
    turn.cited
        .iter()
        .map(|(file_id, cited_name)| {
            let hit = turn.results.iter().find(|r| r.file_id == *file_id);
            let attrs = hit.and_then(|h| h.attributes.as_ref());
            let filename = attr(attrs, "filename")
                .map(str::to_string)
                .or_else(|| hit.map(|h| h.filename.clone()).filter(|f| !f.is_empty()))
                .unwrap_or_else(|| cited_name.clone());

            let extension = attr(attrs, "extension").unwrap_or("");
            if DATA_EXTENSIONS.contains(&extension) {
                let table = filename
                    .rsplit_once('.')
                    .map(|(stem, _)| stem.to_string())
                    .unwrap_or_else(|| filename.clone());
                return Citation::Data {
                    source: filename,
                    table,
                    file_id: file_id.clone(),
                };
            }
            if attr(attrs, "type") == Some("email") {
                return Citation::Email {
                    source: "Outlook".to_string(),
                    subject: attr(attrs, "subject").unwrap_or("No subject").to_string(),
                    file_id: file_id.clone(),
                };
            }
            Citation::Drive {
                source: filename,
                page: None,
                file_id: file_id.clone(),
            }
        })
        .collect()
}

/// Mean score of cited results, else the best search score, else 0.
fn confidence(turn: &Turn) -> f64 {
    let cited: Vec<f64> = turn
        .cited
        .iter()
        .filter_map(|(id, _)| {
            turn.results
                .iter()
                .filter(|r| r.file_id == *id)
                .map(|r| r.score)
                .reduce(f64::max)
        })
        .collect();

    let raw = if !cited.is_empty() {
        cited.iter().sum::<f64>() / cited.len() as f64
    } else {
        turn.results.iter().map(|r| r.score).reduce(f64::max).unwrap_or(0.0)
    };
    (raw.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

/// Plain-text rendering: `answer [c1; c2]` plus a confidence line.
pub fn response_to_text(response: &RagResponse) -> String {
    let parts: Vec<String> = response
        .citations
        .iter()
        .map(|c| match c {
            Citation::Drive { source, page, .. } => match page {
                Some(p) => format!("{}, p.{} (drive)", source, p),
                None => format!("{} (drive)", source),
            },
            Citation::Email { subject, .. } => format!("Email: {} (Outlook)", subject),
            Citation::Data { table, .. } => format!("Table: {} (data)", table),
        })
        .collect();

    let mut out = response.answer.clone();
    if !parts.is_empty() {
        out.push_str(&format!(" [{}]", parts.join("; ")));
    }
    out.push_str(&format!("\nConfidence: {:.2}", response.confidence));
    out
}

// ============ CLI ============

/// `mrag ask`: one RAG turn, printed as text or JSON.
pub async fn run_ask(
    config: &crate::config::Config,
    query: &str,
    conversation_id: Option<String>,
    as_json: bool,
) -> Result<()> {
    let store = VectorStoreClient::from_env(&config.openai)?;
    let pool = crate::db::connect(config).await?;
    crate::migrate::ensure_schema(&pool).await?;
    let assistant = Assistant::new(store, pool.clone(), config.assistant.clone());

    let result = assistant
        .rag(&RagRequest {
            prompt: query.to_string(),
            filters: None,
            conversation_id,
        })
        .await;
    pool.close().await;
    let response = result?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response_to_text(&response));
        println!();
        println!("conversation: {}", response.conversation_id);
    }
    Ok(())
}

// ============ Conversations ============

pub async fn previous_response(pool: &SqlitePool, conversation_id: &str) -> Result<Option<String>> {
    let id: Option<String> =
        sqlx::query_scalar("SELECT previous_response_id FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(pool)
            .await?;
    Ok(id)
}

async fn save_turn(pool: &SqlitePool, conversation_id: &str, response_id: &str) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO conversations (id, previous_response_id, turns, created_at, updated_at)
        VALUES (?, ?, 1, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            previous_response_id = excluded.previous_response_id,
            turns = conversations.turns + 1,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(conversation_id)
    .bind(response_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}
