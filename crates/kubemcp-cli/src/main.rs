//! kubemcp - command-line front end for the MCP session registry
//!
//! Loads the MCP settings block, builds the registry and runs one command
//! against it. `serve` keeps the registry up until SIGINT/SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tracing::info;

use kubemcp::{AddServerRequest, ChildProcessConnector, McpRegistry, McpSettings, text_content};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the MCP configuration file
    /// Supports .toml, .yaml, .yml, and .json formats; the settings may be
    /// nested under an `mcp` key
    #[arg(long, short)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured servers
    Servers,
    /// List the tools a server exposes
    Tools {
        /// Server name (defaults to the default server)
        #[arg(long)]
        server: Option<String>,
    },
    /// Call a tool
    Call {
        /// Server name (defaults to the default server)
        #[arg(long)]
        server: Option<String>,
        /// Tool name (defaults to the server's default tool)
        tool: Option<String>,
        /// Tool arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// Register a server at runtime and print its metadata
    Add {
        /// Registration request as JSON, or `@path` to read it from a file
        #[arg(long)]
        request: String,
    },
    /// Keep the registry running until SIGINT or SIGTERM
    Serve,
}

/// Initializes structured logging with tracing.
///
/// `KUBEMCP_LOG_FORMAT=json` switches to machine-readable output; anything
/// else gives human-readable logs. Levels come from `RUST_LOG`.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let format = std::env::var("KUBEMCP_LOG_FORMAT")
        .unwrap_or_else(|_| "pretty".to_string())
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kubemcp=info,kubemcp_cli=info"));

    match format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let settings = McpSettings::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    if !settings.enable {
        info!("MCP is disabled, nothing to do");
        return Ok(());
    }

    let registry = Arc::new(
        McpRegistry::from_settings(&settings, Arc::new(ChildProcessConnector))
            .context("failed to initialize MCP registry")?,
    );
    info!(
        servers = registry.len().await,
        default_server = %registry.default_server_name().await,
        "MCP registry initialized"
    );

    let outcome = run(&registry, args.command).await;
    registry.close().await;
    outcome
}

async fn run(registry: &McpRegistry, command: Command) -> Result<()> {
    match command {
        Command::Servers => {
            let servers = registry.list_servers().await;
            println!("{}", serde_json::to_string_pretty(&servers)?);
        }
        Command::Tools { server } => {
            let client = registry.client_or_default(server.as_deref()).await?;
            let tools = client
                .list_tools()
                .await
                .with_context(|| format!("failed to list tools of '{}'", client.name()))?;
            for tool in tools {
                println!("{}\t{}", tool.name, tool.description.as_deref().unwrap_or(""));
            }
        }
        Command::Call { server, tool, args } => {
            let client = registry.client_or_default(server.as_deref()).await?;
            let arguments = match args {
                Some(raw) => serde_json::from_str(&raw).context("--args must be valid JSON")?,
                None => Value::Null,
            };
            let result = match tool {
                Some(tool) => client.call_tool(&tool, arguments).await,
                None => client.call_default_tool(arguments).await,
            }
            .with_context(|| format!("tool call on '{}' failed", client.name()))?;

            let text = text_content(&result.content);
            if text.is_empty() {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{text}");
            }
        }
        Command::Add { request } => {
            let request = read_request(&request)?;
            let meta = registry.add_server(request).await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Serve => wait_for_shutdown().await?,
    }
    Ok(())
}

fn read_request(raw: &str) -> Result<AddServerRequest> {
    let contents = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("failed to read request file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&contents).context("invalid server registration request")
}

async fn wait_for_shutdown() -> Result<()> {
    let mut signals = Signals::new([SIGTERM, SIGINT]).context("failed to install signal handlers")?;
    let handle = signals.handle();
    info!("Ready, waiting for SIGINT or SIGTERM");

    while let Some(signal) = signals.next().await {
        match signal {
            SIGTERM => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            SIGINT => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ => {}
        }
    }
    handle.close();
    Ok(())
}
