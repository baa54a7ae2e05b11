//! Registry of named session clients.
//!
//! Built once from the settings block; servers can be added later through
//! [`McpRegistry::add_server`] but are never removed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::client::McpClient;
use crate::config::{McpSettings, ServerTemplate};
use crate::error::{McpError, Result};
use crate::resolver::{ResolvedServers, ResolverDefaults, ServerMeta, build_server_configs};
use crate::session::Connector;

/// Runtime registration of a new server, as submitted by an operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddServerRequest {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub default_tool: Option<String>,
    pub homepage: Option<String>,
    pub tags: Vec<String>,
    /// Make the new server the registry default
    pub set_default: bool,
}

impl AddServerRequest {
    /// The request as a server template, ready for resolution.
    #[must_use]
    pub fn template(&self) -> ServerTemplate {
        ServerTemplate {
            name: self.name.trim().to_string(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            image: self.image.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            default_tool: self.default_tool.clone(),
            homepage: self.homepage.clone(),
            tags: self.tags.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<String, Arc<McpClient>>,
    metas: HashMap<String, ServerMeta>,
    default_name: String,
}

/// Named session clients plus the default server.
///
/// Servers can be added at runtime but never removed. Clients connect lazily,
/// so building a registry does not start any process.
pub struct McpRegistry {
    inner: RwLock<RegistryInner>,
    defaults: ResolverDefaults,
    connector: Arc<dyn Connector>,
}

impl McpRegistry {
    /// Resolve `settings` and create one client per server.
    ///
    /// # Errors
    /// Returns a configuration error if any server fails to resolve; no
    /// registry is produced in that case.
    pub fn from_settings(settings: &McpSettings, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::from_resolved(build_server_configs(settings)?, connector)
    }

    /// Create one client per already-resolved server.
    ///
    /// # Errors
    /// Returns a configuration error if a client cannot be created.
    pub fn from_resolved(resolved: ResolvedServers, connector: Arc<dyn Connector>) -> Result<Self> {
        let mut inner = RegistryInner {
            default_name: resolved.default_server,
            ..RegistryInner::default()
        };

        for config in resolved.servers {
            let name = config.name.clone();
            let meta = config.meta();
            tracing::info!(
                server = %name,
                command = %config.command,
                image = %config.image,
                "Registered MCP server"
            );
            inner
                .clients
                .insert(name.clone(), Arc::new(McpClient::new(config, Arc::clone(&connector))?));
            inner.metas.insert(name, meta);
        }

        Ok(Self {
            inner: RwLock::new(inner),
            defaults: resolved.defaults,
            connector,
        })
    }

    /// Metadata of every registered server, sorted by name.
    pub async fn list_servers(&self) -> Vec<ServerMeta> {
        let mut metas: Vec<_> = self.inner.read().await.metas.values().cloned().collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        metas
    }

    /// # Errors
    /// Returns `NotFound` for an unknown name.
    pub async fn client(&self, name: &str) -> Result<Arc<McpClient>> {
        self.inner
            .read()
            .await
            .clients
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::NotFound(name.to_string()))
    }

    /// # Errors
    /// Returns `NotFound` if the default server is not registered.
    pub async fn default_client(&self) -> Result<Arc<McpClient>> {
        let inner = self.inner.read().await;
        inner
            .clients
            .get(&inner.default_name)
            .cloned()
            .ok_or_else(|| McpError::NotFound(inner.default_name.clone()))
    }

    /// Client for `name`, or the default client when `name` is absent or blank.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown name.
    pub async fn client_or_default(&self, name: Option<&str>) -> Result<Arc<McpClient>> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => self.client(name).await,
            None => self.default_client().await,
        }
    }

    pub async fn default_server_name(&self) -> String {
        self.inner.read().await.default_name.clone()
    }

    /// Register a new server at runtime.
    ///
    /// The client is built outside the lock and, like every other client,
    /// connects on first use.
    ///
    /// # Errors
    /// Returns a configuration error for a blank name or unresolvable
    /// launch settings, and `AlreadyExists` if the name is taken.
    pub async fn add_server(&self, request: AddServerRequest) -> Result<ServerMeta> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(McpError::config("server name must not be empty"));
        }
        if self.inner.read().await.clients.contains_key(&name) {
            return Err(McpError::AlreadyExists(name));
        }

        let config = self.defaults.resolve_request(&request)?;
        let meta = config.meta();
        let client = Arc::new(McpClient::new(config, Arc::clone(&self.connector))?);

        let mut inner = self.inner.write().await;
        // Another registration may have won the race while we resolved.
        if inner.clients.contains_key(&name) {
            return Err(McpError::AlreadyExists(name));
        }
        inner.clients.insert(name.clone(), client);
        inner.metas.insert(name.clone(), meta.clone());
        if request.set_default {
            inner.default_name.clone_from(&name);
        }
        drop(inner);

        tracing::info!(
            server = %name,
            image = %meta.image,
            set_default = request.set_default,
            "Added MCP server"
        );
        Ok(meta)
    }

    /// Close every client. A failing client is logged and does not stop
    /// the others from closing.
    pub async fn close(&self) {
        let mut clients: Vec<_> = self
            .inner
            .read()
            .await
            .clients
            .iter()
            .map(|(name, client)| (name.clone(), Arc::clone(client)))
            .collect();
        clients.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, client) in clients {
            if let Err(e) = client.close().await {
                tracing::warn!(server = %name, error = %e, "Failed to close MCP client");
            }
        }
        tracing::info!("MCP registry closed");
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.clients.is_empty()
    }
}
