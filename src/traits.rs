//! The connector seam.
//!
//! Every source (mailbox, OneDrive, local folder) implements [`Connector`];
//! the sync pipeline only sees trait objects pulled from a
//! [`ConnectorRegistry`].
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  ┌─────────┐ ┌──────────┐ ┌───────────┐  │
//! │  │  Mail   │ │ OneDrive │ │Filesystem │  │
//! │  └─────────┘ └──────────┘ └───────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!          sync_with() → batch → vector store
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::graph::GraphClient;
use crate::models::ScanOutcome;

/// A data source that produces items for the sync pipeline.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use m365_rag::models::ScanOutcome;
/// use m365_rag::traits::Connector;
///
/// pub struct EmptyConnector;
///
/// #[async_trait]
/// impl Connector for EmptyConnector {
///     fn name(&self) -> &str { "empty" }
///     fn description(&self) -> &str { "Produces nothing" }
///     fn connector_type(&self) -> &str { "custom" }
///
///     async fn scan(&self, _cursor: Option<&str>) -> Result<ScanOutcome> {
///         Ok(ScanOutcome::default())
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Instance name, used on the command line (`mrag sync <name>`).
    fn name(&self) -> &str;

    /// One-line description shown by `mrag sources`.
    fn description(&self) -> &str;

    /// `"mail"`, `"onedrive"`, `"filesystem"`, or `"custom"`.
    fn connector_type(&self) -> &str;

    /// Label stored in `records.source` and in checkpoints. Defaults to the
    /// instance name.
    fn source_label(&self) -> String {
        self.name().to_string()
    }

    /// Fetch everything changed since `cursor` (everything when `None`).
    ///
    /// The returned cursor is persisted by the caller after the items are
    /// handled, so a failed sync rescans the same window.
    async fn scan(&self, cursor: Option<&str>) -> Result<ScanOutcome>;
}

/// Registered connectors, in sync order.
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Registry with every connector enabled in `config`. Mail and OneDrive
    /// are only registered when a Graph client is available.
    pub fn from_config(config: &Config, graph: Option<Arc<GraphClient>>) -> Self {
        use crate::connector_fs::FilesystemConnector;
        use crate::connector_mail::MailConnector;
        use crate::connector_onedrive::OneDriveConnector;

        let mut registry = Self::new();

        if let Some(graph) = graph {
            if config.mail.enabled {
                registry.register(Box::new(MailConnector::new(
                    graph.clone(),
                    config.mail.clone(),
                    config.onedrive.allowed_extensions.clone(),
                )));
            }
            if config.onedrive.enabled {
                registry.register(Box::new(OneDriveConnector::new(
                    graph,
                    config.onedrive.clone(),
                )));
            }
        }
        if let Some(fs) = &config.connectors.filesystem {
            registry.register(Box::new(FilesystemConnector::new(fs.clone())));
        }

        registry
    }

    pub fn register(&mut self, connector: Box<dyn Connector>) {
        self.connectors.push(connector);
    }

    pub fn connectors(&self) -> &[Box<dyn Connector>] {
        &self.connectors
    }

    pub fn find(&self, name: &str) -> Option<&dyn Connector> {
        self.connectors
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
