//! Mail and OneDrive delta syncs end to end against mocked Graph and OpenAI
//! endpoints.

use std::sync::Arc;

use base64::Engine;
use m365_rag::auth::GraphCredentials;
use m365_rag::config::{parse_config, Config, GraphConfig, OpenAiConfig};
use m365_rag::connector_mail::MailConnector;
use m365_rag::connector_onedrive::OneDriveConnector;
use m365_rag::db;
use m365_rag::graph::GraphClient;
use m365_rag::ingest::{sync_with, SyncOptions};
use m365_rag::migrate::ensure_schema;
use m365_rag::progress::ProgressMode;
use m365_rag::upload_cmd;
use m365_rag::vector_store::VectorStoreClient;
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER: &str = "alice@contoso.com";

struct Harness {
    _tmp: TempDir,
    config: Config,
    pool: SqlitePool,
    graph: Arc<GraphClient>,
    store: VectorStoreClient,
}

async fn harness(server: &MockServer) -> Harness {
    harness_with(server, "").await
}

/// `extra` is appended to the generated TOML.
async fn harness_with(server: &MockServer, extra: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config: Config = parse_config(&format!(
        r#"
[db]
path = "{root}/mrag.sqlite"

[output]
dir = "{root}/batches"

[openai]
upload_concurrency = 2
{extra}
"#,
        root = tmp.path().display(),
        extra = extra
    ))
    .unwrap();

    let pool = db::connect(&config).await.unwrap();
    ensure_schema(&pool).await.unwrap();

    Mock::given(method("POST"))
        .and(path("/t/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
    let graph_config = GraphConfig {
        user: None,
        authority_url: server.uri(),
        base_url: format!("{}/v1.0", server.uri()),
        page_size: 50,
        timeout_secs: 5,
        max_retries: 0,
    };
    let credentials = GraphCredentials {
        tenant_id: "t".into(),
        client_id: "c".into(),
        client_secret: "s".into(),
    };
    let graph = Arc::new(GraphClient::new(&graph_config, USER.into(), credentials).unwrap());

    let openai = OpenAiConfig {
        base_url: format!("{}/v1", server.uri()),
        max_retries: 0,
        ..OpenAiConfig::default()
    };
    let store = VectorStoreClient::new(&openai, "sk-test".into(), "vs_1".into()).unwrap();

    Harness {
        _tmp: tmp,
        config,
        pool,
        graph,
        store,
    }
}

fn connector(h: &Harness) -> MailConnector {
    MailConnector::new(
        h.graph.clone(),
        h.config.mail.clone(),
        vec![".txt".into(), ".pdf".into()],
    )
}

async fn mount_first_delta(server: &MockServer) {
    mount_messages(server).await;
    mount_attachments(server).await;
}

async fn mount_messages(server: &MockServer) {
    let next = format!("{}/v1.0/delta/next", server.uri());
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/users/{}/mailFolders/inbox/messages/delta", USER)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {
                    "id": "m1",
                    "subject": "Vendor contract",
                    "body": {"contentType": "text", "content": "The contract renews in March."},
                    "from": {"emailAddress": {"name": "Bob", "address": "bob@contoso.com"}},
                    "toRecipients": [{"emailAddress": {"address": "alice@contoso.com"}}],
                    "receivedDateTime": "2025-06-02T09:30:00Z",
                    "lastModifiedDateTime": "2025-06-02T09:30:00Z",
                    "hasAttachments": true
                },
                {
                    "id": "m2",
                    "subject": "Lunch",
                    "body": {"contentType": "text", "content": "Pizza on Friday."},
                    "from": {"emailAddress": {"address": "carol@contoso.com"}},
                    "receivedDateTime": "2025-06-03T11:00:00Z",
                    "lastModifiedDateTime": "2025-06-03T11:00:00Z",
                    "hasAttachments": false
                }
            ],
            "@odata.deltaLink": next
        })))
        .mount(server)
        .await;
}

async fn mount_attachments(server: &MockServer) {
    let content = base64::engine::general_purpose::STANDARD.encode("Renewal terms: 12 months.");
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/users/{}/messages/m1/attachments", USER)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {
                    "@odata.type": "#microsoft.graph.fileAttachment",
                    "id": "a1",
                    "name": "terms.txt",
                    "contentType": "text/plain",
                    "size": 25,
                    "isInline": false,
                    "contentBytes": content
                },
                {
                    "@odata.type": "#microsoft.graph.fileAttachment",
                    "id": "a2",
                    "name": "logo.png",
                    "contentType": "image/png",
                    "size": 4,
                    "isInline": true,
                    "contentBytes": "AAAA"
                }
            ]
        })))
        .mount(server)
        .await;
}

async fn mount_openai_uploads(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-1"})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/vector_stores/vs_1/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-1"})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn mail_sync_normalizes_uploads_and_checkpoints() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    mount_first_delta(&server).await;
    mount_openai_uploads(&server).await;

    let mail = connector(&h);
    let reporter = ProgressMode::Off.reporter();
    let report = sync_with(
        &h.config,
        &h.pool,
        &mail,
        Some(&h.store),
        None,
        &SyncOptions::default(),
        reporter.as_ref(),
    )
    .await
    .unwrap();

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.fetched, 3);
    assert_eq!(report.new_items, 3);
    assert_eq!(report.emails_processed, 2);
    assert_eq!(report.attachments_processed, 1);
    assert_eq!(report.upload_success, 3);
    assert!(report.checkpoint_saved);
    assert!(report.batch_file.as_ref().unwrap().exists());

    let checkpoint = db::get_checkpoint(&h.pool, "mail").await.unwrap().unwrap();
    assert!(checkpoint.ends_with("/v1.0/delta/next"));

    let email = db::find_record(&h.pool, "mail", "m1").await.unwrap().unwrap();
    let attachment = db::find_record(&h.pool, "mail", "m1/a1").await.unwrap().unwrap();
    assert_eq!(email.status, db::STATUS_UPLOADED);
    assert_eq!(email.file_id.as_deref(), Some("file-1"));
    assert_eq!(attachment.parent_id.as_deref(), Some(email.id.as_str()));

    let uploaded = db::load_records(&h.pool, &[db::STATUS_UPLOADED], Some("mail"), None)
        .await
        .unwrap();
    let (record, _) = uploaded
        .iter()
        .find(|(r, _)| r.document_id == email.id)
        .unwrap();
    assert_eq!(record.attachments, vec![attachment.id.clone()]);
    assert_eq!(record.from.as_deref(), Some("bob@contoso.com"));
    assert_eq!(record.text_content, "The contract renews in March.");
}

#[tokio::test]
async fn deleted_message_removes_email_and_attachments() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    mount_first_delta(&server).await;
    mount_openai_uploads(&server).await;

    let mail = connector(&h);
    let reporter = ProgressMode::Off.reporter();
    sync_with(
        &h.config,
        &h.pool,
        &mail,
        Some(&h.store),
        None,
        &SyncOptions::default(),
        reporter.as_ref(),
    )
    .await
    .unwrap();

    Mock::given(method("GET"))
        .and(path("/v1.0/delta/next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "m1", "@removed": {"reason": "deleted"}}],
            "@odata.deltaLink": format!("{}/v1.0/delta/after", server.uri())
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/v1/(vector_stores/vs_1/)?files/file-1$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deleted": true})))
        .expect(4)
        .mount(&server)
        .await;

    let report = sync_with(
        &h.config,
        &h.pool,
        &mail,
        Some(&h.store),
        None,
        &SyncOptions::default(),
        reporter.as_ref(),
    )
    .await
    .unwrap();

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.fetched, 0);
    assert_eq!(report.removed, 2);

    let email = db::find_record(&h.pool, "mail", "m1").await.unwrap().unwrap();
    let attachment = db::find_record(&h.pool, "mail", "m1/a1").await.unwrap().unwrap();
    assert_eq!(email.status, db::STATUS_REMOVED);
    assert_eq!(attachment.status, db::STATUS_REMOVED);
    assert!(email.file_id.is_none());

    let other = db::find_record(&h.pool, "mail", "m2").await.unwrap().unwrap();
    assert_eq!(other.status, db::STATUS_UPLOADED);

    let checkpoint = db::get_checkpoint(&h.pool, "mail").await.unwrap().unwrap();
    assert!(checkpoint.ends_with("/v1.0/delta/after"));
}

#[tokio::test]
async fn skip_upload_keeps_records_pending() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    mount_first_delta(&server).await;

    let mail = connector(&h);
    let reporter = ProgressMode::Off.reporter();
    let options = SyncOptions {
        skip_upload: true,
        ..SyncOptions::default()
    };
    let report = sync_with(&h.config, &h.pool, &mail, None, None, &options, reporter.as_ref())
        .await
        .unwrap();

    assert_eq!(report.new_items, 3);
    assert_eq!(report.upload_success, 0);
    let pending = db::load_records(&h.pool, &[db::STATUS_PROCESSED], None, None)
        .await
        .unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|(_, file_id)| file_id.is_none()));
}

#[tokio::test]
async fn failed_uploads_are_recorded() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    mount_first_delta(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/files"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "bad file"}
        })))
        .mount(&server)
        .await;

    let mail = connector(&h);
    let reporter = ProgressMode::Off.reporter();
    let report = sync_with(
        &h.config,
        &h.pool,
        &mail,
        Some(&h.store),
        None,
        &SyncOptions::default(),
        reporter.as_ref(),
    )
    .await
    .unwrap();

    assert_eq!(report.upload_failures, 3);
    assert_eq!(report.errors.len(), 3);
    let email = db::find_record(&h.pool, "mail", "m2").await.unwrap().unwrap();
    assert_eq!(email.status, db::STATUS_FAILED);
    assert!(email.error.is_some());
}

async fn sync(
    h: &Harness,
    connector: &dyn m365_rag::traits::Connector,
    archive: Option<&GraphClient>,
) -> m365_rag::ingest::SyncReport {
    let reporter = ProgressMode::Off.reporter();
    sync_with(
        &h.config,
        &h.pool,
        connector,
        Some(&h.store),
        archive,
        &SyncOptions::default(),
        reporter.as_ref(),
    )
    .await
    .unwrap()
}

async fn mount_vector_store_deletes(server: &MockServer, times: u64) {
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/v1/(vector_stores/vs_1/)?files/file-1$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deleted": true})))
        .expect(times)
        .mount(server)
        .await;
}

/// Second mail delta: m2's body was edited.
async fn mount_edited_lunch(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1.0/delta/next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{
                "id": "m2",
                "subject": "Lunch",
                "body": {"contentType": "text", "content": "Pizza moved to Thursday."},
                "from": {"emailAddress": {"address": "carol@contoso.com"}},
                "receivedDateTime": "2025-06-03T11:00:00Z",
                "lastModifiedDateTime": "2025-06-04T08:00:00Z",
                "hasAttachments": false
            }],
            "@odata.deltaLink": format!("{}/v1.0/delta/after", server.uri())
        })))
        .mount(server)
        .await;
}

fn drive_file(id: &str, name: &str, parent: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "size": 64,
        "file": {"mimeType": "text/plain"},
        "parentReference": {"path": format!("/drive/root:/{}", parent)},
        "webUrl": format!("https://contoso-my.sharepoint.com/{}", name),
        "createdDateTime": "2025-06-01T08:00:00Z",
        "lastModifiedDateTime": "2025-06-04T08:00:00Z"
    })
}

fn onedrive(h: &Harness) -> OneDriveConnector {
    OneDriveConnector::new(h.graph.clone(), h.config.onedrive.clone())
}

#[tokio::test]
async fn unreadable_attachments_hold_checkpoint_until_retry() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    mount_messages(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/users/{}/messages/m1/attachments", USER)))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_attachments(&server).await;
    mount_openai_uploads(&server).await;
    mount_vector_store_deletes(&server, 2).await;

    let mail = connector(&h);
    let first = sync(&h, &mail, None).await;
    assert_eq!(first.read_failures, 1);
    assert_eq!(first.errors.len(), 1);
    assert!(first.errors[0].contains("m1"), "{:?}", first.errors);
    assert!(first.errors[0].contains("403"), "{:?}", first.errors);
    assert_eq!(first.attachments_processed, 0);
    assert!(!first.checkpoint_saved);
    assert!(db::get_checkpoint(&h.pool, "mail").await.unwrap().is_none());

    let email = db::find_record(&h.pool, "mail", "m1").await.unwrap().unwrap();
    assert_eq!(email.status, db::STATUS_FAILED);
    assert_eq!(email.content_hash, "");
    assert!(email.error.as_deref().unwrap().contains("403"));

    // The delta is replayed: the email is rebuilt with its attachment.
    let second = sync(&h, &mail, None).await;
    assert!(second.errors.is_empty(), "{:?}", second.errors);
    assert_eq!(second.modified_items, 1);
    assert_eq!(second.new_items, 1);
    assert_eq!(second.skipped_duplicates, 1);
    assert_eq!(second.attachments_processed, 1);
    assert!(second.checkpoint_saved);

    let email = db::find_record(&h.pool, "mail", "m1").await.unwrap().unwrap();
    let attachment = db::find_record(&h.pool, "mail", "m1/a1").await.unwrap().unwrap();
    assert_eq!(email.status, db::STATUS_UPLOADED);
    assert_eq!(attachment.parent_id.as_deref(), Some(email.id.as_str()));
    let uploaded = db::load_records(&h.pool, &[db::STATUS_UPLOADED], Some("mail"), None)
        .await
        .unwrap();
    let (record, _) = uploaded
        .iter()
        .find(|(r, _)| r.document_id == email.id)
        .unwrap();
    assert_eq!(record.attachments, vec![attachment.id.clone()]);
}

#[tokio::test]
async fn onedrive_sync_downloads_archives_and_reports_failures() {
    let server = MockServer::start().await;
    let h = harness_with(&server, "[onedrive]\nprocessed_folder = \"processed\"\n").await;
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/users/{}/drive/root/delta", USER)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {"id": "fin", "name": "finance", "folder": {"childCount": 2},
                 "parentReference": {"path": "/drive/root:/data_PMSA/documents_1"}},
                drive_file("d1", "q2.txt", "data_PMSA/documents_1/finance"),
                drive_file("d2", "broken.txt", "data_PMSA/documents_1/finance"),
                drive_file("d9", "holiday.txt", "personal")
            ],
            "@odata.deltaLink": format!("{}/v1.0/drive/next", server.uri())
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/users/{}/drive/items/d1/content", USER)))
        .respond_with(ResponseTemplate::new(200).set_body_string("Q2 revenue closed at 4.2M."))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/users/{}/drive/items/d2/content", USER)))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/users/{}/drive/items/d9/content", USER)))
        .respond_with(ResponseTemplate::new(200).set_body_string("private"))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(format!(
            r"^/v1.0/users/{}/drive/root:/processed/[^/]+\.json:/content$",
            USER
        )))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "arch-1",
            "name": "archived.json",
            "webUrl": "https://contoso-my.sharepoint.com/processed/archived.json"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_openai_uploads(&server).await;

    let drive = onedrive(&h);
    let report = sync(&h, &drive, Some(h.graph.as_ref())).await;

    assert_eq!(report.fetched, 1);
    assert_eq!(report.documents_processed, 1);
    assert_eq!(report.archived, 1);
    assert_eq!(report.upload_success, 1);
    assert_eq!(report.read_failures, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("read d2:"), "{:?}", report.errors);
    assert!(!report.checkpoint_saved);

    let doc = db::find_record(&h.pool, "onedrive", "d1").await.unwrap().unwrap();
    assert_eq!(doc.status, db::STATUS_UPLOADED);
    assert_eq!(
        doc.one_drive_url.as_deref(),
        Some("https://contoso-my.sharepoint.com/processed/archived.json")
    );
    assert!(db::find_record(&h.pool, "onedrive", "d2").await.unwrap().is_none());
    assert!(db::find_record(&h.pool, "onedrive", "d9").await.unwrap().is_none());

    let uploaded = db::load_records(&h.pool, &[db::STATUS_UPLOADED], Some("onedrive"), None)
        .await
        .unwrap();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].0.text_content, "Q2 revenue closed at 4.2M.");
}

#[tokio::test]
async fn modified_record_replaces_previous_file() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    mount_first_delta(&server).await;
    mount_openai_uploads(&server).await;

    let mail = connector(&h);
    sync(&h, &mail, None).await;

    mount_edited_lunch(&server).await;
    mount_vector_store_deletes(&server, 2).await;
    Mock::given(method("POST"))
        .and(path("/v1/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-2"})))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    let report = sync(&h, &mail, None).await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.modified_items, 1);
    assert_eq!(report.upload_success, 1);

    let lunch = db::find_record(&h.pool, "mail", "m2").await.unwrap().unwrap();
    assert_eq!(lunch.status, db::STATUS_UPLOADED);
    assert_eq!(lunch.file_id.as_deref(), Some("file-2"));
    let contract = db::find_record(&h.pool, "mail", "m1").await.unwrap().unwrap();
    assert_eq!(contract.file_id.as_deref(), Some("file-1"));
}

#[tokio::test]
async fn surviving_previous_file_blocks_reupload() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    mount_first_delta(&server).await;
    mount_openai_uploads(&server).await;

    let mail = connector(&h);
    sync(&h, &mail, None).await;

    mount_edited_lunch(&server).await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/v1/(vector_stores/vs_1/)?files/file-1$"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"message": "not allowed"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-2"})))
        .with_priority(1)
        .expect(0)
        .mount(&server)
        .await;

    let report = sync(&h, &mail, None).await;
    assert_eq!(report.modified_items, 1);
    assert_eq!(report.upload_success, 0);
    assert_eq!(report.upload_failures, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("remove "), "{:?}", report.errors);
    assert!(report.checkpoint_saved);

    let lunch = db::find_record(&h.pool, "mail", "m2").await.unwrap().unwrap();
    assert_eq!(lunch.status, db::STATUS_FAILED);
    assert_eq!(lunch.file_id.as_deref(), Some("file-1"));
    assert!(lunch.error.as_deref().unwrap().contains("previous file file-1"));
}

#[tokio::test]
async fn expired_delta_link_resyncs_and_drops_moved_documents() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    let delta = format!("/v1.0/users/{}/drive/root/delta", USER);
    Mock::given(method("GET"))
        .and(path(delta.clone()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [drive_file("d1", "plan.txt", "data_PMSA/documents_1")],
            "@odata.deltaLink": format!("{}/v1.0/drive/next", server.uri())
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/users/{}/drive/items/d1/content", USER)))
        .respond_with(ResponseTemplate::new(200).set_body_string("Hiring plan for the autumn."))
        .mount(&server)
        .await;
    mount_openai_uploads(&server).await;

    let drive = onedrive(&h);
    let first = sync(&h, &drive, None).await;
    assert_eq!(first.upload_success, 1);
    assert!(first.checkpoint_saved);

    // The stored link has expired; the full delta shows d1 in another folder.
    Mock::given(method("GET"))
        .and(path("/v1.0/drive/next"))
        .respond_with(ResponseTemplate::new(410).set_body_json(json!({
            "error": {"code": "resyncRequired"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(delta))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [drive_file("d1", "plan.txt", "archive-2024")],
            "@odata.deltaLink": format!("{}/v1.0/drive/fresh", server.uri())
        })))
        .mount(&server)
        .await;
    mount_vector_store_deletes(&server, 2).await;

    let second = sync(&h, &drive, None).await;
    assert!(second.errors.is_empty(), "{:?}", second.errors);
    assert_eq!(second.fetched, 0);
    assert_eq!(second.removed, 1);
    assert!(second.checkpoint_saved);

    let doc = db::find_record(&h.pool, "onedrive", "d1").await.unwrap().unwrap();
    assert_eq!(doc.status, db::STATUS_REMOVED);
    assert!(doc.file_id.is_none());
    let checkpoint = db::get_checkpoint(&h.pool, "onedrive").await.unwrap().unwrap();
    assert!(checkpoint.ends_with("/v1.0/drive/fresh"));
}

#[tokio::test]
async fn upload_pending_then_rebuild() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    mount_first_delta(&server).await;

    let mail = connector(&h);
    let reporter = ProgressMode::Off.reporter();
    let options = SyncOptions {
        skip_upload: true,
        ..SyncOptions::default()
    };
    sync_with(&h.config, &h.pool, &mail, None, None, &options, reporter.as_ref())
        .await
        .unwrap();

    mount_openai_uploads(&server).await;
    let pending = upload_cmd::upload_pending(&h.pool, &h.store, 2, None).await.unwrap();
    assert!(pending.errors.is_empty(), "{:?}", pending.errors);
    assert_eq!(pending.uploaded, 3);
    assert_eq!(pending.cleaned, 0);
    let uploaded = db::load_records(&h.pool, &[db::STATUS_UPLOADED], None, None)
        .await
        .unwrap();
    assert_eq!(uploaded.len(), 3);
    assert!(uploaded.iter().all(|(_, f)| f.as_deref() == Some("file-1")));

    // Every record's file is deleted (store entry and file) and uploaded again.
    mount_vector_store_deletes(&server, 6).await;
    let rebuilt = upload_cmd::rebuild(&h.pool, &h.store, 2).await.unwrap();
    assert!(rebuilt.errors.is_empty(), "{:?}", rebuilt.errors);
    assert_eq!(rebuilt.uploaded, 3);
    assert!(db::load_records(&h.pool, &[db::STATUS_PROCESSED, db::STATUS_FAILED], None, None)
        .await
        .unwrap()
        .is_empty());
}
