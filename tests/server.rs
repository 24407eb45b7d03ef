//! HTTP relay against a mocked OpenAI Responses endpoint.

use std::str::FromStr;

use m365_rag::answer::Assistant;
use m365_rag::config::{parse_config, AssistantConfig, Config, OpenAiConfig};
use m365_rag::migrate::ensure_schema;
use m365_rag::server::{build_router, AppState};
use m365_rag::vector_store::VectorStoreClient;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "s3cret";

/// Serve the router on an ephemeral port; returns its base URL.
async fn spawn_relay(openai: &MockServer) -> String {
    let config: Config = parse_config(
        r#"
[db]
path = "unused.sqlite"

[server]
allowed_origins = ["https://copilot.microsoft.com"]
"#,
    )
    .unwrap();

    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    ensure_schema(&pool).await.unwrap();

    let openai_config = OpenAiConfig {
        base_url: format!("{}/v1", openai.uri()),
        max_retries: 0,
        ..OpenAiConfig::default()
    };
    let store = VectorStoreClient::new(&openai_config, "sk-test".into(), "vs_1".into()).unwrap();
    let assistant = Assistant::new(store, pool, AssistantConfig::default());
    let state = AppState::new(assistant, TOKEN, &openai_config);
    let app = build_router(&config, state).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn answer(id: &str) -> Value {
    json!({
        "id": id,
        "output": [
            {
                "type": "file_search_call",
                "results": [
                    { "file_id": "file-mail", "filename": "a.txt", "score": 0.8,
                      "attributes": { "type": "email", "subject": "Q2 Results" } },
                    { "file_id": "file-doc", "filename": "b.txt", "score": 0.6,
                      "attributes": { "type": "document", "filename": "plan.pdf" } }
                ]
            },
            {
                "type": "message",
                "content": [{
                    "type": "output_text",
                    "text": "Revenue grew 12%.",
                    "annotations": [
                        { "type": "file_citation", "file_id": "file-mail", "filename": "a.txt", "index": 5 },
                        { "type": "file_citation", "file_id": "file-doc", "filename": "b.txt", "index": 9 }
                    ]
                }]
            }
        ]
    })
}

#[tokio::test]
async fn root_and_health_need_no_key() {
    let openai = MockServer::start().await;
    let base = spawn_relay(&openai).await;
    let http = reqwest::Client::new();

    let root: Value = http.get(&base).send().await.unwrap().json().await.unwrap();
    assert_eq!(root["status"], "OK");

    let health = http.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn openapi_is_served() {
    let openai = MockServer::start().await;
    let base = spawn_relay(&openai).await;
    let doc: Value = reqwest::get(format!("{}/openapi.json", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(doc["openapi"], "3.1.0");
    assert!(doc["paths"]["/rag"]["post"].is_object());
}

#[tokio::test]
async fn ask_requires_api_key() {
    let openai = MockServer::start().await;
    let base = spawn_relay(&openai).await;
    let http = reqwest::Client::new();

    let missing = http
        .post(format!("{}/ask", base))
        .json(&json!({ "query": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = http
        .post(format!("{}/ask", base))
        .header("x-api-key", "nope")
        .json(&json!({ "query": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);
    let body: Value = wrong.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn ask_answers_and_chains_conversation() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(body_partial_json(json!({ "previous_response_id": "resp_1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("resp_2")))
        .expect(1)
        .mount(&openai)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("resp_1")))
        .mount(&openai)
        .await;
    let base = spawn_relay(&openai).await;
    let http = reqwest::Client::new();

    let first: Value = http
        .post(format!("{}/ask", base))
        .header("x-api-key", TOKEN)
        .json(&json!({ "query": "How did Q2 go?" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["answer"], "Revenue grew 12%.");
    let conversation = first["conversation_id"].as_str().unwrap().to_string();
    assert!(!conversation.is_empty());

    let second = http
        .post(format!("{}/ask", base))
        .header("x-api-key", TOKEN)
        .json(&json!({ "query": "And Q3?", "conversation_id": conversation }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let second: Value = second.json().await.unwrap();
    assert_eq!(second["conversation_id"], conversation.as_str());
}

#[tokio::test]
async fn rag_returns_citations_and_confidence() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(body_partial_json(json!({
            "tools": [{
                "type": "file_search",
                "vector_store_ids": ["vs_1"],
                "filters": { "type": "eq", "key": "type", "value": "email" }
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer("resp_9")))
        .expect(1)
        .mount(&openai)
        .await;
    let base = spawn_relay(&openai).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/rag", base))
        .header("x-api-key", TOKEN)
        .json(&json!({ "prompt": "Q2 numbers", "filters": { "type": "email" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["answer"], "Revenue grew 12%.");
    assert_eq!(body["citations"][0]["type"], "email");
    assert_eq!(body["citations"][0]["subject"], "Q2 Results");
    assert_eq!(body["citations"][1]["type"], "drive");
    assert_eq!(body["confidence"], 0.7);
}

#[tokio::test]
async fn rag_rejects_bad_input() {
    let openai = MockServer::start().await;
    let base = spawn_relay(&openai).await;
    let http = reqwest::Client::new();

    let empty = http
        .post(format!("{}/rag", base))
        .header("x-api-key", TOKEN)
        .json(&json!({ "prompt": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), 400);

    let bad_filters = http
        .post(format!("{}/rag", base))
        .header("x-api-key", TOKEN)
        .json(&json!({ "prompt": "hi", "filters": [1, 2] }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_filters.status(), 400);

    let malformed = http
        .post(format!("{}/rag", base))
        .header("x-api-key", TOKEN)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);
    let body: Value = malformed.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn upstream_failure_is_bad_gateway() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&openai)
        .await;
    let base = spawn_relay(&openai).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/ask", base))
        .header("x-api-key", TOKEN)
        .json(&json!({ "query": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn unknown_route_is_json_404_and_cors_allows_configured_origin() {
    let openai = MockServer::start().await;
    let base = spawn_relay(&openai).await;
    let http = reqwest::Client::new();

    let missing = http.get(format!("{}/nope", base)).send().await.unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = http
        .get(&base)
        .header("origin", "https://copilot.microsoft.com")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("https://copilot.microsoft.com")
    );
}
