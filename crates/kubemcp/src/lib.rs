//! # kubemcp
//!
//! Multi-server MCP tool-invocation core for the kubemanage backend.
//!
//! Tool providers are external processes (usually `docker run` containers)
//! that speak the Model Context Protocol over their stdio. This crate resolves
//! their configuration, spawns them lazily, supervises the resulting sessions
//! and exposes everything through a registry that can be extended at runtime.
//!
//! ## Core Components
//!
//! - [`McpSettings`] / [`ServerTemplate`]: raw configuration as loaded from file
//! - [`build_server_configs`]: resolution into validated [`ServerConfig`]s
//! - [`McpClient`]: one lazily-connected, self-healing session per server
//! - [`McpRegistry`]: named clients plus the default server
//! - [`Connector`] / [`ToolSession`]: the transport seam, with
//!   [`ChildProcessConnector`] as the production implementation
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use kubemcp::{ChildProcessConnector, McpRegistry, McpSettings};
//! use serde_json::json;
//!
//! # async fn run() -> kubemcp::Result<()> {
//! let settings = McpSettings::from_toml_str(
//!     r#"
//!     [mcp]
//!     enable = true
//!     defaultTool = "search-arxiv"
//!
//!     [[mcp.servers]]
//!     name = "scholarly"
//!     image = "acme/mcp-scholarly:latest"
//!     "#,
//! )?;
//!
//! let registry = McpRegistry::from_settings(&settings, Arc::new(ChildProcessConnector))?;
//! let client = registry.default_client().await?;
//! let result = client.call_default_tool(json!({ "keyword": "raft" })).await?;
//! println!("{}", kubemcp::text_content(&result.content));
//!
//! registry.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod content;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod session;

pub use client::McpClient;
pub use config::{McpSettings, ServerTemplate, parse_duration};
pub use content::{collect_text, text_content};
pub use error::{McpError, Result};
pub use registry::{AddServerRequest, McpRegistry};
pub use resolver::{
    ClientIdentity, LaunchSpec, ResolvedServers, ResolverDefaults, ServerConfig, ServerMeta,
    build_server_configs,
};
pub use session::{ChildProcessConnector, Connector, SessionEnd, ToolSession};
