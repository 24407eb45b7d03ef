//! `mrag sources`: configured connectors and whether they can be reached.

use anyhow::Result;

use crate::config::Config;
use crate::graph::GraphClient;
use crate::vector_store::VectorStoreClient;

#[derive(Debug, Clone, PartialEq)]
pub struct SourceStatus {
    pub name: String,
    pub status: String,
    pub healthy: bool,
}

impl SourceStatus {
    fn new(name: &str, status: impl Into<String>, healthy: bool) -> Self {
        Self {
            name: name.to_string(),
            status: status.into(),
            healthy,
        }
    }
}

/// Check every configured source. Remote checks are single cheap calls.
pub async fn check_sources(config: &Config) -> Vec<SourceStatus> {
    let mut out = Vec::new();

    let wants_graph = config.mail.enabled || config.onedrive.enabled;
    let graph = if wants_graph {
        match GraphClient::from_config(&config.graph) {
            Ok(g) => Some(g),
            Err(e) => {
                let reason = format!("NOT CONFIGURED ({:#})", e);
                if config.mail.enabled {
                    out.push(SourceStatus::new("mail", reason.clone(), false));
                }
                if config.onedrive.enabled {
                    out.push(SourceStatus::new("onedrive", reason, false));
                }
                None
            }
        }
    } else {
        None
    };

    if let Some(graph) = &graph {
        if config.mail.enabled {
            out.push(match graph.list_messages(1).await {
                Ok(_) => SourceStatus::new("mail", "OK", true),
                Err(e) => SourceStatus::new("mail", format!("ERROR ({})", e), false),
            });
        }
        if config.onedrive.enabled {
            out.push(match graph.list_children(&config.onedrive.folder).await {
                Ok(items) => SourceStatus::new("onedrive", format!("OK ({} items)", items.len()), true),
                Err(e) if e.status() == Some(reqwest::StatusCode::NOT_FOUND) => SourceStatus::new(
                    "onedrive",
                    format!("FOLDER NOT FOUND ({})", config.onedrive.folder),
                    false,
                ),
                Err(e) => SourceStatus::new("onedrive", format!("ERROR ({})", e), false),
            });
        }
        if let Some(folder) = &config.onedrive.processed_folder {
            out.push(match graph.file_exists(folder).await {
                Ok(true) => SourceStatus::new("archive", "OK", true),
                // Graph creates missing parent folders on upload.
                Ok(false) => SourceStatus::new("archive", format!("OK ({} created on first archive)", folder), true),
                Err(e) => SourceStatus::new("archive", format!("ERROR ({})", e), false),
            });
        }
    }
    if !config.mail.enabled {
        out.push(SourceStatus::new("mail", "DISABLED", false));
    }
    if !config.onedrive.enabled {
        out.push(SourceStatus::new("onedrive", "DISABLED", false));
    }

    out.push(match &config.connectors.filesystem {
        Some(fs) if fs.root.exists() => SourceStatus::new("filesystem", "OK", true),
        Some(_) => SourceStatus::new("filesystem", "NOT CONFIGURED (root does not exist)", false),
        None => SourceStatus::new("filesystem", "NOT CONFIGURED", false),
    });

    out.push(match VectorStoreClient::from_env(&config.openai) {
        Ok(store) => match store.list_files(1).await {
            Ok(_) => SourceStatus::new("vector_store", "OK", true),
            Err(e) => SourceStatus::new("vector_store", format!("ERROR ({})", e), false),
        },
        Err(e) => SourceStatus::new("vector_store", format!("NOT CONFIGURED ({:#})", e), false),
    });

    out
}

pub async fn list_sources(config: &Config) -> Result<()> {
    let statuses = check_sources(config).await;
    println!("{:<14} {:<8} STATUS", "SOURCE", "HEALTHY");
    for s in &statuses {
        println!("{:<14} {:<8} {}", s.name, s.healthy, s.status);
    }
    Ok(())
}
