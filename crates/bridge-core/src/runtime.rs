//! Startup sequence and the host-facing tool provider.

use crate::config::BridgeConfig;
use crate::credentials::CredentialManager;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::http::build_client;
use crate::loader::{LoadWarning, SpecLoader};
use crate::synthesizer::{SharedCatalog, ToolCatalog, synthesize};
use async_trait::async_trait;
use parking_lot::RwLock;
use rmcp::model::{CallToolResult, Tool};
use serde_json::Value;
use std::sync::Arc;

/// What an MCP host needs from a tool source.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Name and version reported in the MCP `initialize` response.
    fn server_info(&self) -> (String, String);

    fn list_tools(&self) -> Vec<Tool>;

    async fn call_tool(&self, name: &str, arguments: Value) -> CallToolResult;
}

#[derive(Debug, Clone, Default)]
struct SpecInfo {
    title: Option<String>,
    version: Option<String>,
    warnings: Vec<LoadWarning>,
}

/// A running bridge: authenticated, catalog built, ready to dispatch.
pub struct Bridge {
    credentials: Arc<CredentialManager>,
    loader: SpecLoader,
    catalog: SharedCatalog,
    dispatcher: Dispatcher,
    info: RwLock<SpecInfo>,
}

impl Bridge {
    /// Authenticate, load the API description, and build the tool catalog.
    ///
    /// Every step is fatal: the bridge is never returned with a partial catalog.
    ///
    /// # Errors
    ///
    /// Returns the first startup error: [`crate::BridgeError::Config`],
    /// [`crate::BridgeError::Authentication`], [`crate::BridgeError::SpecFetch`],
    /// [`crate::BridgeError::SpecParse`] or [`crate::BridgeError::CatalogConflict`].
    pub async fn start(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let client = build_client(&config)?;
        let credentials = Arc::new(CredentialManager::new(&config, client.clone())?);

        credentials.current().await?;

        let loader = SpecLoader::new(&config, client.clone(), credentials.clone())?;
        let spec = loader.load().await?;
        let catalog = synthesize(&spec.operations)?;
        tracing::info!(
            "Discovered {} tools from '{}'",
            catalog.len(),
            spec.title.as_deref().unwrap_or("untitled")
        );

        let catalog = SharedCatalog::new(catalog);
        let dispatcher = Dispatcher::new(&config, client, credentials.clone(), catalog.clone())?;

        Ok(Self {
            credentials,
            loader,
            catalog,
            dispatcher,
            info: RwLock::new(SpecInfo {
                title: spec.title,
                version: spec.version,
                warnings: spec.warnings,
            }),
        })
    }

    /// Re-fetch the API description and swap in a freshly synthesized catalog.
    ///
    /// On error the current catalog stays in place.
    ///
    /// # Errors
    ///
    /// Returns the load or synthesis error.
    pub async fn reload(&self) -> Result<usize> {
        let spec = self.loader.load().await?;
        let catalog = synthesize(&spec.operations)?;
        let count = catalog.len();
        let previous = self.catalog.replace(catalog);
        *self.info.write() = SpecInfo {
            title: spec.title,
            version: spec.version,
            warnings: spec.warnings,
        };
        tracing::info!("Reloaded tool catalog: {} tools (was {})", count, previous.len());
        Ok(count)
    }

    #[must_use]
    pub fn catalog(&self) -> Arc<ToolCatalog> {
        self.catalog.snapshot()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    /// Operations skipped by the last successful load.
    #[must_use]
    pub fn warnings(&self) -> Vec<LoadWarning> {
        self.info.read().warnings.clone()
    }

    #[must_use]
    pub fn spec_title(&self) -> Option<String> {
        self.info.read().title.clone()
    }
}

#[async_trait]
impl ToolProvider for Bridge {
    fn server_info(&self) -> (String, String) {
        let info = self.info.read();
        (
            info.title.clone().unwrap_or_else(|| "openapi-bridge".to_string()),
            info.version.clone().unwrap_or_else(|| "0.0.0".to_string()),
        )
    }

    fn list_tools(&self) -> Vec<Tool> {
        self.catalog.snapshot().to_tools()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> CallToolResult {
        self.dispatcher.call_tool(name, arguments).await
    }
}
