//! Error types for the MCP session manager.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by configuration resolution, session clients and the registry.
///
/// Every variant is `Clone` so a single failed connection attempt can be
/// reported to all callers that were waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum McpError {
    /// Invalid or incomplete configuration.
    ///
    /// Empty or duplicate server names, empty launch arguments, unparsable
    /// durations, unreadable configuration files.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The provider process could not be spawned or the handshake failed.
    #[error("Failed to connect to MCP server '{server}': {reason}")]
    Connect { server: String, reason: String },

    /// The handshake did not complete within the startup bound.
    #[error("Timed out connecting to MCP server '{server}' after {after:?}")]
    Timeout { server: String, after: Duration },

    /// The client was closed; no further connections are attempted.
    #[error("MCP client for '{0}' is closed")]
    Closed(String),

    /// The remote tool signaled failure, returned nothing, or was called
    /// with an invalid name or arguments.
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// The transport failed while a request was in flight.
    #[error("MCP server '{server}' request failed: {reason}")]
    Service { server: String, reason: String },

    /// Unknown server name.
    #[error("MCP server not found: {0}")]
    NotFound(String),

    /// A server with this name is already registered.
    #[error("MCP server already exists: {0}")]
    AlreadyExists(String),
}

impl McpError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether this error came from establishing (or refusing to establish) a session.
    #[must_use]
    pub const fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout { .. } | Self::Closed(_)
        )
    }
}

/// Result type alias using `McpError`.
pub type Result<T> = std::result::Result<T, McpError>;
