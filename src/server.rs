//! HTTP relay in front of the Responses API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Liveness (`{"status":"OK"}`) |
//! | `GET`  | `/health` | Version and configuration flags |
//! | `GET`  | `/openapi.json` | OpenAPI 3.1 description of the POST routes |
//! | `POST` | `/ask` | Question → answer, with conversation chaining |
//! | `POST` | `/rag` | Question → answer + citations + confidence |
//!
//! Both POST routes require `X-API-Key` to equal `PROXY_TOKEN`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `upstream_error` (502), `internal` (500).

use anyhow::{bail, Context};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::answer::{AskRequest, AskResponse, Assistant, QueryError, RagRequest, RagResponse};
use crate::auth::GraphCredentials;
use crate::config::{Config, OpenAiConfig};
use crate::db;
use crate::error::RemoteError;
use crate::vector_store::VectorStoreClient;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    assistant: Arc<Assistant>,
    proxy_token: Arc<str>,
    openai_configured: bool,
    vector_store_configured: bool,
}

impl AppState {
    pub fn new(assistant: Assistant, proxy_token: impl Into<Arc<str>>, openai: &OpenAiConfig) -> Self {
        Self {
            assistant: Arc::new(assistant),
            proxy_token: proxy_token.into(),
            openai_configured: std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.trim().is_empty()),
            vector_store_configured: openai.vector_store_id().is_some(),
        }
    }
}

/// Start the relay on `[server].bind`.
///
/// Refuses to start without `PROXY_TOKEN` or OpenAI credentials.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let proxy_token = std::env::var("PROXY_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty());
    let Some(proxy_token) = proxy_token else {
        bail!("PROXY_TOKEN is not set; refusing to serve /ask and /rag without an API key");
    };

    let store = VectorStoreClient::from_env(&config.openai)
        .context("OpenAI is not configured")?;
    let pool = db::connect(config).await?;
    crate::migrate::ensure_schema(&pool).await?;

    let assistant = Assistant::new(store, pool, config.assistant.clone());
    let app = build_router(config, AppState::new(assistant, proxy_token, &config.openai))?;

    tracing::info!(
        bind = %config.server.bind,
        graph_credentials = GraphCredentials::present(),
        "server starting"
    );
    println!("listening on http://{}", config.server.bind);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(config: &Config, state: AppState) -> anyhow::Result<Router> {
    Ok(Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/openapi.json", get(handle_openapi))
        .route("/ask", post(handle_ask))
        .route("/rag", post(handle_rag))
        .fallback(handle_not_found)
        .layer(cors_layer(&config.server.allowed_origins)?)
        .with_state(state))
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return Ok(layer.allow_origin(Any));
    }
    let values = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o.trim()).with_context(|| format!("Invalid CORS origin: {}", o))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(values)))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unauthorized() -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid API key")
}

/// Client mistakes → 400, OpenAI failures → 502, anything else → 500.
fn classify_error(err: anyhow::Error) -> AppError {
    if let Some(q) = err.downcast_ref::<QueryError>() {
        return bad_request(q.to_string());
    }
    if let Some(remote) = err.downcast_ref::<RemoteError>() {
        tracing::warn!(error = %remote, "upstream request failed");
        return AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", remote.to_string());
    }
    // The chain can name local paths and SQL; it stays in the log.
    tracing::error!(error = %format!("{:#}", err), "request failed");
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
}

fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let supplied = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if supplied.is_empty() || supplied != &*state.proxy_token {
        return Err(unauthorized());
    }
    Ok(())
}

// ============ GET / and /health ============

async fn handle_not_found() -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", "no such route")
}

async fn handle_root() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    openai_configured: bool,
    vector_store_configured: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        openai_configured: state.openai_configured,
        vector_store_configured: state.vector_store_configured,
    })
}

// ============ POST /ask and /rag ============

async fn handle_ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, AppError> {
    check_api_key(&state, &headers)?;
    let Json(body) = body.map_err(|e| bad_request(e.body_text()))?;
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let resp = state
        .assistant
        .ask(body.conversation_id.as_deref(), &body.query)
        .await
        .map_err(classify_error)?;
    Ok(Json(resp))
}

async fn handle_rag(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RagRequest>, JsonRejection>,
) -> Result<Json<RagResponse>, AppError> {
    check_api_key(&state, &headers)?;
    let Json(body) = body.map_err(|e| bad_request(e.body_text()))?;
    if body.prompt.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let resp = state.assistant.rag(&body).await.map_err(classify_error)?;
    Ok(Json(resp))
}

// ============ GET /openapi.json ============

async fn handle_openapi() -> Json<Value> {
    Json(openapi_document())
}

pub fn openapi_document() -> Value {
    let error_ref = json!({ "$ref": "#/components/schemas/Error" });
    let errors = json!({
        "400": { "description": "Empty query or invalid filters", "content": { "application/json": { "schema": error_ref } } },
        "401": { "description": "Invalid API key", "content": { "application/json": { "schema": error_ref } } },
        "502": { "description": "OpenAI request failed", "content": { "application/json": { "schema": error_ref } } }
    });

    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "m365-rag",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Questions over Microsoft 365 mail and OneDrive documents"
        },
        "security": [{ "ApiKeyAuth": [] }],
        "paths": {
            "/ask": {
                "post": {
                    "operationId": "ask",
                    "summary": "Ask a question and get an answer",
                    "requestBody": { "required": true, "content": { "application/json": {
                        "schema": { "$ref": "#/components/schemas/AskRequest" }
                    } } },
                    "responses": merge(json!({
                        "200": { "description": "Answer", "content": { "application/json": {
                            "schema": { "$ref": "#/components/schemas/AskResponse" }
                        } } }
                    }), &errors)
                }
            },
            "/rag": {
                "post": {
                    "operationId": "rag",
                    "summary": "Ask a question and get an answer with citations",
                    "requestBody": { "required": true, "content": { "application/json": {
                        "schema": { "$ref": "#/components/schemas/RagRequest" }
                    } } },
                    "responses": merge(json!({
                        "200": { "description": "Answer envelope", "content": { "application/json": {
                            "schema": { "$ref": "#/components/schemas/RagResponse" }
                        } } }
                    }), &errors)
                }
            }
        },
        "components": {
            "securitySchemes": {
                "ApiKeyAuth": { "type": "apiKey", "in": "header", "name": "X-API-Key" }
            },
            "schemas": {
                "AskRequest": {
                    "type": "object",
                    "required": ["query"],
                    "properties": {
                        "conversation_id": { "type": ["string", "null"], "description": "Omit to start a new conversation" },
                        "query": { "type": "string" }
                    }
                },
                "AskResponse": {
                    "type": "object",
                    "required": ["conversation_id", "answer"],
                    "properties": {
                        "conversation_id": { "type": "string" },
                        "answer": { "type": "string" }
                    }
                },
                "RagRequest": {
                    "type": "object",
                    "required": ["prompt"],
                    "properties": {
                        "prompt": { "type": "string", "description": "Also accepted as `query`" },
                        "filters": { "type": ["object", "null"], "description": "Flat key/value map or a vector store filter object" },
                        "conversation_id": { "type": ["string", "null"] }
                    }
                },
                "Citation": {
                    "type": "object",
                    "required": ["type", "file_id"],
                    "properties": {
                        "type": { "type": "string", "enum": ["drive", "email", "data"] },
                        "source": { "type": "string" },
                        "page": { "type": "integer" },
                        "subject": { "type": "string" },
                        "table": { "type": "string" },
                        "file_id": { "type": "string" }
                    }
                },
                "RagResponse": {
                    "type": "object",
                    "required": ["answer", "citations", "confidence", "conversation_id"],
                    "properties": {
                        "answer": { "type": "string" },
                        "citations": { "type": "array", "items": { "$ref": "#/components/schemas/Citation" } },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "conversation_id": { "type": "string" }
                    }
                },
                "Error": {
                    "type": "object",
                    "required": ["error"],
                    "properties": {
                        "error": {
                            "type": "object",
                            "required": ["code", "message"],
                            "properties": {
                                "code": { "type": "string" },
                                "message": { "type": "string" }
                            }
                        }
                    }
                }
            }
        }
    })
}

fn merge(mut base: Value, extra: &Value) -> Value {
    if let (Some(b), Some(e)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            b.insert(k.clone(), v.clone());
        }
    }
    base
}
