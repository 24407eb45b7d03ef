//! `mrag archive clear`: delete the JSON files the sync archive step wrote to
//! `[onedrive].processed_folder`. Subfolders are left alone. Stored records
//! keep their `one_drive_url`; the next archived sync overwrites it.

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::graph::GraphClient;

#[derive(Debug, Default, Clone)]
pub struct ClearSummary {
    pub files: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
}

pub async fn run_archive_clear(config: &Config, dry_run: bool) -> Result<ClearSummary> {
    let Some(folder) = config.onedrive.processed_folder.as_deref() else {
        bail!("[onedrive].processed_folder is not set, there is no archive to clear");
    };
    let graph = GraphClient::from_config(&config.graph).context("Microsoft Graph is not configured")?;

    let summary = clear_folder(&graph, folder, dry_run).await?;
    if dry_run {
        println!("archive clear {} (dry-run)", folder);
        println!("  files: {}", summary.files);
        return Ok(summary);
    }

    println!("archive clear {}", folder);
    println!("  deleted: {} of {}", summary.deleted, summary.files);
    for err in &summary.errors {
        println!("  error: {}", err);
    }
    if summary.errors.is_empty() {
        println!("ok");
    }
    Ok(summary)
}

/// Delete every file directly inside `folder`. With `dry_run` only count them.
pub async fn clear_folder(graph: &GraphClient, folder: &str, dry_run: bool) -> Result<ClearSummary> {
    let children = graph
        .list_children(folder)
        .await
        .with_context(|| format!("Failed to list OneDrive folder {}", folder))?;

    let mut summary = ClearSummary::default();
    for item in children.iter().filter(|i| i.is_file()) {
        summary.files += 1;
        if dry_run {
            continue;
        }
        match graph.delete_item(&item.id).await {
            Ok(()) => summary.deleted += 1,
            Err(e) => summary.errors.push(format!("delete {}: {}", item.name, e)),
        }
    }
    tracing::info!(folder, files = summary.files, deleted = summary.deleted, "archive cleared");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::GraphCredentials;
    use crate::config::GraphConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn graph(server: &MockServer) -> GraphClient {
        Mock::given(method("POST"))
            .and(path("/t/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600
            })))
            .mount(server)
            .await;
        let config = GraphConfig {
            user: None,
            authority_url: server.uri(),
            base_url: format!("{}/v1.0", server.uri()),
            page_size: 10,
            timeout_secs: 5,
            max_retries: 0,
        };
        let creds = GraphCredentials {
            tenant_id: "t".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
        };
        GraphClient::new(&config, "alice@contoso.com".into(), creds).unwrap()
    }

    async fn mount_folder(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v1.0/users/alice@contoso.com/drive/root:/processed:/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {"id": "j1", "name": "2025-06-02_a_1.json", "file": {}},
                    {"id": "j2", "name": "2025-06-03_b_2.json", "file": {}},
                    {"id": "sub", "name": "old", "folder": {"childCount": 3}}
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn deletes_files_and_keeps_folders() {
        let server = MockServer::start().await;
        let graph = graph(&server).await;
        mount_folder(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/users/alice@contoso.com/drive/items/j1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/users/alice@contoso.com/drive/items/j2"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/users/alice@contoso.com/drive/items/sub"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let summary = clear_folder(&graph, "/processed/", false).await.unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("2025-06-03_b_2.json"));
    }

    #[tokio::test]
    async fn dry_run_only_counts() {
        let server = MockServer::start().await;
        let graph = graph(&server).await;
        mount_folder(&server).await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let summary = clear_folder(&graph, "processed", true).await.unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.deleted, 0);
    }
}
