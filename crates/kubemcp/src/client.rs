//! Session client: one lazily-connected, supervised session per named server.
//!
//! A client starts Disconnected. The first call that needs a session starts a
//! connection attempt; every concurrent caller awaits that same attempt, so a
//! server is never spawned twice at once. Once connected, a watcher task
//! supervises the session and returns the client to Disconnected when the
//! provider goes away, so the next call reconnects transparently. `close` is
//! terminal.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rmcp::model::{CallToolResult, Tool};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

use crate::content::text_content;
use crate::error::{McpError, Result};
use crate::resolver::{LaunchSpec, ServerConfig};
use crate::session::{Connector, SessionEnd, ToolSession};

type SharedAttempt = Shared<BoxFuture<'static, Result<Arc<dyn ToolSession>>>>;

enum Slot {
    Idle,
    Connecting {
        generation: u64,
        attempt: SharedAttempt,
        cancel: CancellationToken,
    },
    Connected {
        generation: u64,
        session: Arc<dyn ToolSession>,
        cancel: CancellationToken,
    },
}

struct SessionState {
    slot: Slot,
    next_generation: u64,
    closed: bool,
}

struct Inner {
    config: ServerConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Background tasks only hold weak references; stop them with the client.
        let state = self.state.get_mut();
        state.closed = true;
        if let Slot::Connecting { cancel, .. } | Slot::Connected { cancel, .. } = &state.slot {
            cancel.cancel();
        }
    }
}

/// Client for one named MCP server.
pub struct McpClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.inner.config.name)
            .field("command", &self.inner.config.command)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Create a client for `config`. No process is started until a session
    /// is needed.
    ///
    /// # Errors
    /// Returns a configuration error if the command is empty.
    pub fn new(config: ServerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        if config.command.trim().is_empty() {
            return Err(McpError::config(format!(
                "MCP server '{}' has no command configured",
                config.name
            )));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(SessionState {
                    slot: Slot::Idle,
                    next_generation: 0,
                    closed: false,
                }),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn default_tool_name(&self) -> Option<&str> {
        self.inner.config.default_tool.as_deref()
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.inner.state.lock().await.slot, Slot::Connected { .. })
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Return the live session, connecting first if necessary.
    ///
    /// The connection attempt is bounded by the server's startup timeout;
    /// `timeout` can only shorten that bound for this caller.
    ///
    /// # Errors
    /// Returns `Closed` if the client was closed, `Timeout` if the bound
    /// elapsed, or `Connect` if spawning or the handshake failed.
    pub async fn ensure_session(&self, timeout: Option<Duration>) -> Result<Arc<dyn ToolSession>> {
        let attempt = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(McpError::Closed(self.inner.config.name.clone()));
            }
            let pending = match &state.slot {
                Slot::Connected { session, .. } => return Ok(Arc::clone(session)),
                Slot::Connecting { attempt, .. } => Some(attempt.clone()),
                Slot::Idle => None,
            };
            match pending {
                Some(attempt) => attempt,
                None => {
                    let generation = state.next_generation;
                    state.next_generation += 1;
                    let cancel = CancellationToken::new();
                    let attempt = self.inner.start_attempt(
                        generation,
                        effective_bound(self.inner.config.startup_timeout, timeout),
                        cancel.clone(),
                    );
                    state.slot = Slot::Connecting {
                        generation,
                        attempt: attempt.clone(),
                        cancel,
                    };
                    attempt
                }
            }
        };

        match timeout {
            Some(after) => tokio::time::timeout(after, attempt)
                .await
                .map_err(|_| McpError::Timeout {
                    server: self.inner.config.name.clone(),
                    after,
                })?,
            None => attempt.await,
        }
    }

    /// Call `name` with a JSON object of arguments (`null` means none).
    ///
    /// # Errors
    /// Returns a `Tool` error for an empty name, non-object arguments, or a
    /// result flagged as an error (carrying the result's text); connection
    /// and transport errors are passed through.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        if name.trim().is_empty() {
            return Err(McpError::tool(name, "tool name must not be empty"));
        }
        let arguments = match arguments {
            Value::Null => None,
            Value::Object(map) => Some(map),
            other => {
                return Err(McpError::tool(
                    name,
                    format!("arguments must be a JSON object, got {other}"),
                ));
            }
        };

        let session = self.ensure_session(None).await?;

        tracing::debug!(server = %self.name(), tool = %name, "Calling MCP tool");
        let result = session.call_tool(name, arguments).await?;

        if result.is_error.unwrap_or(false) {
            return Err(McpError::tool(name, text_content(&result.content)));
        }
        Ok(result)
    }

    /// Call the server's configured default tool.
    ///
    /// # Errors
    /// Returns a `Tool` error if no default tool is configured, otherwise as
    /// [`McpClient::call_tool`].
    pub async fn call_default_tool(&self, arguments: Value) -> Result<CallToolResult> {
        let tool = self
            .default_tool_name()
            .ok_or_else(|| McpError::tool("", "no default tool configured"))?
            .to_string();
        self.call_tool(&tool, arguments).await
    }

    /// Query the provider's tool catalog. Every call goes to the provider.
    ///
    /// # Errors
    /// Returns connection or transport errors.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let session = self.ensure_session(None).await?;
        session.list_tools().await
    }

    /// Close the client. Idempotent.
    ///
    /// Cancels an in-flight connection attempt and closes the live session,
    /// if any. Tool calls already running are not interrupted; they fail on
    /// their own once the session is gone.
    ///
    /// # Errors
    /// Returns the error reported by the session while closing.
    pub async fn close(&self) -> Result<()> {
        let slot = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::replace(&mut state.slot, Slot::Idle)
        };

        match slot {
            Slot::Idle => Ok(()),
            Slot::Connecting { cancel, .. } => {
                cancel.cancel();
                Ok(())
            }
            Slot::Connected {
                session, cancel, ..
            } => {
                cancel.cancel();
                tracing::info!(server = %self.name(), "Closing MCP session");
                session.close().await
            }
        }
    }
}

fn effective_bound(startup_timeout: Duration, caller: Option<Duration>) -> Option<Duration> {
    let startup = (!startup_timeout.is_zero()).then_some(startup_timeout);
    match (startup, caller) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl Inner {
    /// Spawn the connection attempt. It runs to completion (or cancellation)
    /// independently of the callers awaiting it.
    fn start_attempt(
        self: &Arc<Self>,
        generation: u64,
        bound: Option<Duration>,
        cancel: CancellationToken,
    ) -> SharedAttempt {
        let weak = Arc::downgrade(self);
        let launch = LaunchSpec::from_config(&self.config);
        let identity = self.config.identity();
        let connector = Arc::clone(&self.connector);
        let server = self.config.name.clone();

        let task = tokio::spawn({
            let server = server.clone();
            async move {
                let connect = connector.connect(&launch, &identity);
                let outcome = tokio::select! {
                    () = cancel.cancelled() => Err(McpError::Closed(server.clone())),
                    outcome = with_bound(bound, connect) => outcome.unwrap_or_else(|| {
                        Err(McpError::Timeout {
                            server: server.clone(),
                            after: bound.unwrap_or_default(),
                        })
                    }),
                };

                match weak.upgrade() {
                    Some(inner) => inner.complete_attempt(generation, outcome, cancel).await,
                    None => {
                        if let Ok(session) = outcome {
                            let _ = session.close().await;
                        }
                        Err(McpError::Closed(server))
                    }
                }
            }
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(McpError::Connect {
                    server,
                    reason: format!("connection task failed: {e}"),
                })
            })
        }
        .boxed()
        .shared()
    }

    async fn complete_attempt(
        self: Arc<Self>,
        generation: u64,
        outcome: Result<Arc<dyn ToolSession>>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ToolSession>> {
        let mut state = self.state.lock().await;
        let current = matches!(
            state.slot,
            Slot::Connecting { generation: g, .. } if g == generation
        );

        match outcome {
            Ok(session) if current && !state.closed => {
                state.slot = Slot::Connected {
                    generation,
                    session: Arc::clone(&session),
                    cancel: cancel.clone(),
                };
                drop(state);

                tracing::info!(
                    server = %self.config.name,
                    impl_name = %self.config.implementation_name,
                    command = %self.config.command,
                    "MCP session established"
                );
                self.spawn_watcher(generation, Arc::clone(&session), cancel);
                Ok(session)
            }
            Ok(session) => {
                // Closed while the handshake was in flight.
                drop(state);
                let _ = session.close().await;
                Err(McpError::Closed(self.config.name.clone()))
            }
            Err(err) => {
                if current {
                    state.slot = Slot::Idle;
                }
                drop(state);
                tracing::warn!(server = %self.config.name, error = %err, "MCP connection failed");
                Err(err)
            }
        }
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        generation: u64,
        session: Arc<dyn ToolSession>,
        cancel: CancellationToken,
    ) {
        let weak = Arc::downgrade(self);
        let server = self.config.name.clone();
        let keep_alive = self.config.keep_alive;

        tokio::spawn(async move {
            let Some(end) = supervise(&server, session.as_ref(), &cancel, keep_alive).await else {
                tracing::debug!(server = %server, "MCP session watcher stopped by close");
                return;
            };

            release_session(&weak, generation).await;
            cancel.cancel();

            match end {
                SessionEnd::Failed(reason) => {
                    tracing::warn!(server = %server, error = %reason, "MCP session ended");
                }
                SessionEnd::Clean => {
                    tracing::info!(server = %server, "MCP session ended normally");
                }
            }
        });
    }
}

/// Wait for the session to end, probing it every `keep_alive`.
///
/// Each probe is bounded by `keep_alive`; a failed or unanswered probe closes
/// the session and ends supervision. Returns `None` when `cancel` fires first;
/// the session is closed on the way out.
async fn supervise(
    server: &str,
    session: &dyn ToolSession,
    cancel: &CancellationToken,
    keep_alive: Duration,
) -> Option<SessionEnd> {
    let mut ticker = (!keep_alive.is_zero())
        .then(|| tokio::time::interval_at(Instant::now() + keep_alive, keep_alive));

    loop {
        tokio::select! {
            end = session.closed() => return Some(end),
            () = cancel.cancelled() => {
                let _ = session.close().await;
                return None;
            }
            () = next_tick(&mut ticker) => {
                let failure = match tokio::time::timeout(keep_alive, session.ping()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => err.to_string(),
                    Err(_) => format!("no response within {keep_alive:?}"),
                };
                let _ = session.close().await;
                // A close racing the probe is not a provider failure.
                if cancel.is_cancelled() {
                    return None;
                }
                tracing::warn!(server = %server, error = %failure, "MCP keep-alive failed, closing session");
                return Some(SessionEnd::Failed(format!("keep-alive failed: {failure}")));
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn with_bound<F: std::future::Future>(bound: Option<Duration>, fut: F) -> Option<F::Output> {
    match bound {
        Some(after) => tokio::time::timeout(after, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Return the client to Disconnected if `generation` is still the live session.
async fn release_session(weak: &Weak<Inner>, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let mut state = inner.state.lock().await;
    if matches!(state.slot, Slot::Connected { generation: g, .. } if g == generation) {
        state.slot = Slot::Idle;
    }
}
