//! Transport seam between session clients and tool-provider processes.
//!
//! [`Connector`] turns a [`LaunchSpec`] into a live [`ToolSession`]. The
//! production connector spawns the provider as a child process and speaks MCP
//! over its stdio through `rmcp`.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rmcp::{
    RoleClient, ServiceExt,
    model::{CallToolRequestParams, CallToolResult, ClientInfo, JsonObject, Tool},
    service::{Peer, QuitReason, RunningServiceCancellationToken},
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use tokio::sync::watch;

use crate::error::{McpError, Result};
use crate::resolver::{ClientIdentity, LaunchSpec};

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Closed on request.
    Clean,
    /// The provider exited, the transport broke, or the supervisor died.
    Failed(String),
}

/// A live, connected handle to one tool-provider process.
#[async_trait]
pub trait ToolSession: Send + Sync {
    /// Fetch the provider's full tool catalog.
    async fn list_tools(&self) -> Result<Vec<Tool>>;

    /// Invoke `name` with the given arguments.
    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult>;

    /// Round-trip liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Tear the session down. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Resolves once the session has terminated, for whatever reason.
    async fn closed(&self) -> SessionEnd;
}

/// Establishes sessions. One call spawns at most one provider process.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        launch: &LaunchSpec,
        identity: &ClientIdentity,
    ) -> Result<Arc<dyn ToolSession>>;
}

/// Spawns the provider as a child process and connects over its stdio.
///
/// The child's stderr is inherited so provider diagnostics reach the
/// backend's own log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildProcessConnector;

#[async_trait]
impl Connector for ChildProcessConnector {
    async fn connect(
        &self,
        launch: &LaunchSpec,
        identity: &ClientIdentity,
    ) -> Result<Arc<dyn ToolSession>> {
        let connect_error = |reason: String| McpError::Connect {
            server: launch.server.clone(),
            reason,
        };

        tracing::debug!(
            server = %launch.server,
            command = %launch.command,
            args = ?launch.args,
            env_keys = ?launch.env.keys().collect::<Vec<_>>(),
            "Spawning MCP server process"
        );

        let cmd = tokio::process::Command::new(&launch.command).configure(|c| {
            c.args(&launch.args).envs(&launch.env).kill_on_drop(true);
        });
        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| connect_error(format!("failed to spawn '{}': {e}", launch.command)))?;

        let mut info = ClientInfo::default();
        info.client_info.name.clone_from(&identity.name);
        info.client_info.version.clone_from(&identity.version);

        let service = info
            .serve(transport)
            .await
            .map_err(|e| connect_error(format!("handshake failed: {e}")))?;

        if let Some(peer_info) = service.peer_info() {
            tracing::debug!(
                server = %launch.server,
                provider = %peer_info.server_info.name,
                provider_version = %peer_info.server_info.version,
                "MCP handshake complete"
            );
        }

        let peer = service.peer().clone();
        let cancel = service.cancellation_token();
        let (ended_tx, ended_rx) = watch::channel(None);

        // The running service is owned by this task until the session ends.
        tokio::spawn(async move {
            let end = match service.waiting().await {
                Ok(QuitReason::Cancelled) => SessionEnd::Clean,
                Ok(QuitReason::Closed) => {
                    SessionEnd::Failed("transport closed by provider".to_string())
                }
                Ok(other) => SessionEnd::Failed(format!("{other:?}")),
                Err(e) => SessionEnd::Failed(format!("session task failed: {e}")),
            };
            let _ = ended_tx.send(Some(end));
        });

        Ok(Arc::new(RmcpSession {
            server: launch.server.clone(),
            peer,
            cancel: Mutex::new(Some(cancel)),
            ended: ended_rx,
        }))
    }
}

struct RmcpSession {
    server: String,
    peer: Peer<RoleClient>,
    cancel: Mutex<Option<RunningServiceCancellationToken>>,
    ended: watch::Receiver<Option<SessionEnd>>,
}

impl RmcpSession {
    fn service_error(&self, reason: impl std::fmt::Display) -> McpError {
        McpError::Service {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ToolSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.peer
            .list_all_tools()
            .await
            .map_err(|e| self.service_error(e))
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        let request = CallToolRequestParams {
            meta: None,
            name: name.to_owned().into(),
            arguments,
            task: None,
        };

        self.peer
            .call_tool(request)
            .await
            .map_err(|e| self.service_error(e))
    }

    async fn ping(&self) -> Result<()> {
        self.peer
            .list_tools(None)
            .await
            .map(|_| ())
            .map_err(|e| self.service_error(e))
    }

    async fn close(&self) -> Result<()> {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    async fn closed(&self) -> SessionEnd {
        let mut ended = self.ended.clone();
        let end = match ended.wait_for(Option::is_some).await {
            Ok(end) => end.clone().unwrap_or(SessionEnd::Clean),
            Err(_) => SessionEnd::Failed("session supervisor dropped".to_string()),
        };
        end
    }
}


#[cfg(all(test, unix))]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::client::McpClient;
    use crate::resolver::ServerConfig;

    fn launch(command: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            server: "local".to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    fn identity() -> ClientIdentity {
        ClientIdentity {
            name: "kubemcp-test".to_string(),
            version: "0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_connect_error() {
        let err = ChildProcessConnector
            .connect(&launch("/nonexistent/bin", &[]), &identity())
            .await
            .err()
            .unwrap();

        match err {
            McpError::Connect { server, reason } => {
                assert_eq!(server, "local");
                assert!(reason.contains("failed to spawn '/nonexistent/bin'"), "{reason}");
            }
            other => unreachable!("expected a connect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exiting_process_fails_handshake() {
        let err = ChildProcessConnector
            .connect(&launch("true", &[]), &identity())
            .await
            .err()
            .unwrap();

        match err {
            McpError::Connect { reason, .. } => {
                assert!(reason.starts_with("handshake failed"), "{reason}");
            }
            other => unreachable!("expected a connect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silent_process_times_out() {
        let config = ServerConfig {
            name: "sleeper".to_string(),
            display_name: "sleeper".to_string(),
            description: String::new(),
            image: String::new(),
            homepage: String::new(),
            tags: Vec::new(),
            implementation_name: "kubemcp-test".to_string(),
            implementation_version: "0.0.1".to_string(),
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: BTreeMap::new(),
            startup_timeout: Duration::from_millis(300),
            keep_alive: Duration::ZERO,
            default_tool: None,
        };
        let client = McpClient::new(config, Arc::new(ChildProcessConnector)).unwrap();

        let started = Instant::now();
        let err = client.ensure_session(None).await.err().unwrap();

        assert_eq!(
            err,
            McpError::Timeout {
                server: "sleeper".to_string(),
                after: Duration::from_millis(300),
            }
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!client.is_connected().await);
    }
}
