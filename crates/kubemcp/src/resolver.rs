//! Turns raw [`McpSettings`] into validated, fully-merged [`ServerConfig`]s.
//!
//! Precedence is always "most specific wins": a per-server value beats the
//! legacy global value, which beats the built-in fallback.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{McpSettings, ServerTemplate, parse_duration};
use crate::error::{McpError, Result};
use crate::registry::AddServerRequest;

pub const DEFAULT_IMPLEMENTATION_NAME: &str = "kubemanage-mcp-client";
pub const DEFAULT_IMPLEMENTATION_VERSION: &str = "0.1.0";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(45);

const DOCKER: &str = "docker";
const LEGACY_SERVER_NAME: &str = "default";
const DOCKER_ENV_ANCHORS: [&str; 4] = ["--rm", "-i", "-d", "-it"];

/// Fully-resolved launch configuration for one named tool provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub image: String,
    pub homepage: String,
    pub tags: Vec<String>,
    pub implementation_name: String,
    pub implementation_version: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub startup_timeout: Duration,
    pub keep_alive: Duration,
    pub default_tool: Option<String>,
}

impl ServerConfig {
    /// Read-only projection used for external listing.
    #[must_use]
    pub fn meta(&self) -> ServerMeta {
        ServerMeta {
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            default_tool: self.default_tool.clone().unwrap_or_default(),
            image: self.image.clone(),
            homepage: self.homepage.clone(),
            tags: self.tags.clone(),
        }
    }

    /// Identity announced to the provider during the handshake.
    #[must_use]
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            name: self.implementation_name.clone(),
            version: self.implementation_version.clone(),
        }
    }
}

/// Server information exposed to the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMeta {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub default_tool: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Client name and version sent in the MCP `initialize` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: String,
    pub version: String,
}

/// Globals recorded at startup and reused when servers are added at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverDefaults {
    pub env: BTreeMap<String, String>,
    pub default_tool: Option<String>,
    pub implementation_name: String,
    pub implementation_version: String,
    pub startup_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for ResolverDefaults {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            default_tool: None,
            implementation_name: DEFAULT_IMPLEMENTATION_NAME.to_string(),
            implementation_version: DEFAULT_IMPLEMENTATION_VERSION.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

/// Output of [`build_server_configs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServers {
    pub servers: Vec<ServerConfig>,
    pub default_server: String,
    pub defaults: ResolverDefaults,
}

/// Resolve every configured server and the default server name.
///
/// # Errors
///
/// Returns a configuration error if:
/// - no server templates and no legacy command are configured
/// - a duration string cannot be parsed
/// - a server has an empty name or no launch arguments
/// - two servers share a name
/// - the configured default server does not exist
pub fn build_server_configs(settings: &McpSettings) -> Result<ResolvedServers> {
    let templates = effective_templates(settings);
    if templates.is_empty() {
        return Err(McpError::config("no MCP servers configured"));
    }

    let defaults = ResolverDefaults::from_settings(settings)?;

    let mut seen = HashSet::new();
    let mut servers = Vec::with_capacity(templates.len());
    for template in &templates {
        let server = defaults.resolve(
            template,
            settings.command.as_deref(),
            &settings.args,
            &settings.env,
        )?;
        if !seen.insert(server.name.clone()) {
            return Err(McpError::config(format!(
                "duplicate MCP server name '{}'",
                server.name
            )));
        }
        servers.push(server);
    }

    let default_server = match non_blank(settings.default_server.as_deref()) {
        Some(name) if seen.contains(name) => name.to_string(),
        Some(name) => {
            return Err(McpError::config(format!(
                "default MCP server '{name}' is not configured"
            )));
        }
        None => servers[0].name.clone(),
    };

    Ok(ResolvedServers {
        servers,
        default_server,
        defaults,
    })
}

fn effective_templates(settings: &McpSettings) -> Vec<ServerTemplate> {
    if !settings.servers.is_empty() {
        return settings.servers.clone();
    }
    match non_blank(settings.command.as_deref()) {
        Some(command) => vec![ServerTemplate {
            name: LEGACY_SERVER_NAME.to_string(),
            display_name: Some("Default MCP Server".to_string()),
            description: Some(
                "Generated from the legacy single-command configuration".to_string(),
            ),
            command: Some(command.to_string()),
            args: settings.args.clone(),
            env: settings.env.clone(),
            default_tool: settings.default_tool.clone(),
            ..ServerTemplate::default()
        }],
        None => Vec::new(),
    }
}

impl ResolverDefaults {
    /// Record the globals of a settings block.
    ///
    /// # Errors
    /// Returns a configuration error if a duration string cannot be parsed.
    pub fn from_settings(settings: &McpSettings) -> Result<Self> {
        let startup_timeout =
            parse_optional_duration("startupTimeout", settings.startup_timeout.as_deref())?
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT);
        let keep_alive = parse_optional_duration("keepAlive", settings.keep_alive.as_deref())?
            .unwrap_or(DEFAULT_KEEP_ALIVE);

        Ok(Self {
            env: settings.env.clone(),
            default_tool: non_blank(settings.default_tool.as_deref()).map(String::from),
            implementation_name: non_blank(settings.implementation_name.as_deref())
                .unwrap_or(DEFAULT_IMPLEMENTATION_NAME)
                .to_string(),
            implementation_version: non_blank(settings.implementation_version.as_deref())
                .unwrap_or(DEFAULT_IMPLEMENTATION_VERSION)
                .to_string(),
            startup_timeout,
            keep_alive,
        })
    }

    /// Resolve a runtime registration request against the recorded globals.
    ///
    /// Legacy command/args are not consulted here; the request's env is
    /// merged over the recorded global env.
    ///
    /// # Errors
    /// Returns a configuration error if the name is blank or no launch
    /// arguments can be derived.
    pub fn resolve_request(&self, request: &AddServerRequest) -> Result<ServerConfig> {
        self.resolve(&request.template(), None, &[], &self.env)
    }

    fn resolve(
        &self,
        template: &ServerTemplate,
        legacy_command: Option<&str>,
        legacy_args: &[String],
        global_env: &BTreeMap<String, String>,
    ) -> Result<ServerConfig> {
        let name = template.name.trim();
        if name.is_empty() {
            return Err(McpError::config(
                "found an MCP server without a name, check the configuration",
            ));
        }

        let command = non_blank(template.command.as_deref())
            .or_else(|| non_blank(legacy_command))
            .unwrap_or(DOCKER)
            .to_string();

        let image = non_blank(template.image.as_deref());
        let args = if !template.args.is_empty() {
            template.args.clone()
        } else if !legacy_args.is_empty() {
            legacy_args.to_vec()
        } else if let Some(image) = image.filter(|_| command.eq_ignore_ascii_case(DOCKER)) {
            docker_run_args(image)
        } else {
            Vec::new()
        };
        if args.is_empty() {
            return Err(McpError::config(format!(
                "server {name} has no launch arguments"
            )));
        }

        let image = image.map_or_else(|| extract_image_from_args(&args), String::from);

        Ok(ServerConfig {
            name: name.to_string(),
            display_name: non_blank(template.display_name.as_deref())
                .unwrap_or(name)
                .to_string(),
            description: template.description.clone().unwrap_or_default(),
            image,
            homepage: template.homepage.clone().unwrap_or_default(),
            tags: template.tags.clone(),
            implementation_name: self.implementation_name.clone(),
            implementation_version: self.implementation_version.clone(),
            command,
            env: merge_env(global_env, &template.env),
            args,
            startup_timeout: self.startup_timeout,
            keep_alive: self.keep_alive,
            default_tool: non_blank(template.default_tool.as_deref())
                .map(String::from)
                .or_else(|| self.default_tool.clone()),
        })
    }
}

fn parse_optional_duration(field: &str, value: Option<&str>) -> Result<Option<Duration>> {
    non_blank(value)
        .map(|raw| {
            parse_duration(raw)
                .map_err(|e| McpError::config(format!("failed to parse mcp.{field}: {e}")))
        })
        .transpose()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn docker_run_args(image: &str) -> Vec<String> {
    ["run", "--rm", "-i", image].map(String::from).to_vec()
}

/// Overlay `local` on top of `global`; local keys win.
#[must_use]
pub fn merge_env(
    global: &BTreeMap<String, String>,
    local: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = global.clone();
    merged.extend(local.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Best-effort image reference: the last argument that is neither a flag
/// nor a `key=value` pair.
#[must_use]
pub fn extract_image_from_args(args: &[String]) -> String {
    args.iter()
        .rev()
        .find(|arg| !arg.starts_with('-') && !arg.contains('='))
        .cloned()
        .unwrap_or_default()
}

/// Final command line and process environment for one spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub server: String,
    pub command: String,
    pub args: Vec<String>,
    /// Variables added to the inherited process environment
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Render the launch of `config`.
    ///
    /// For `docker run ...` the environment is passed as `-e KEY=VALUE`
    /// arguments placed before the first `--rm`, `-i`, `-d` or `-it` (or
    /// right after `run`); the container would not see the host process
    /// environment otherwise. Every other command receives the variables
    /// on the spawned process.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        let is_docker_run = config.command == DOCKER
            && config.args.first().is_some_and(|arg| arg == "run");

        if !is_docker_run || config.env.is_empty() {
            return Self {
                server: config.name.clone(),
                command: config.command.clone(),
                args: config.args.clone(),
                env: if is_docker_run {
                    BTreeMap::new()
                } else {
                    config.env.clone()
                },
            };
        }

        Self {
            server: config.name.clone(),
            command: config.command.clone(),
            args: inject_docker_env(&config.args, &config.env),
            env: BTreeMap::new(),
        }
    }
}

fn inject_docker_env(args: &[String], env: &BTreeMap<String, String>) -> Vec<String> {
    let insert_at = args
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, arg)| DOCKER_ENV_ANCHORS.contains(&arg.as_str()))
        .map_or(1, |(i, _)| i);

    let mut rendered = Vec::with_capacity(args.len() + env.len() * 2);
    rendered.extend_from_slice(&args[..insert_at]);
    for (key, value) in env {
        rendered.push("-e".to_string());
        rendered.push(format!("{key}={value}"));
    }
    rendered.extend_from_slice(&args[insert_at..]);
    rendered
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn template(name: &str) -> ServerTemplate {
        ServerTemplate {
            name: name.to_string(),
            command: Some("uvx".to_string()),
            args: strings(&[name]),
            ..ServerTemplate::default()
        }
    }

    #[test]
    fn test_docker_env_injected_before_rm() {
        let settings = McpSettings {
            servers: vec![ServerTemplate {
                name: "scholarly".to_string(),
                command: Some("docker".to_string()),
                args: strings(&["run", "--rm", "-i", "img:tag"]),
                env: env(&[("A", "1")]),
                ..ServerTemplate::default()
            }],
            ..McpSettings::default()
        };

        let resolved = build_server_configs(&settings).unwrap();
        let config = &resolved.servers[0];
        assert_eq!(config.image, "img:tag");

        let launch = LaunchSpec::from_config(config);
        assert_eq!(
            launch.args,
            strings(&["run", "-e", "A=1", "--rm", "-i", "img:tag"])
        );
        assert!(launch.env.is_empty());
    }

    #[test]
    fn test_docker_env_injected_after_run_without_anchor() {
        let config = ServerConfig {
            env: env(&[("B", "2"), ("A", "1")]),
            args: strings(&["run", "--name", "x", "img"]),
            ..resolved_single("docker")
        };

        let launch = LaunchSpec::from_config(&config);
        assert_eq!(
            launch.args,
            strings(&["run", "-e", "A=1", "-e", "B=2", "--name", "x", "img"])
        );
    }

    #[test]
    fn test_docker_env_anchor_ignores_first_argument() {
        let config = ServerConfig {
            env: env(&[("K", "V")]),
            args: strings(&["run", "--network", "host", "-it", "img"]),
            ..resolved_single("docker")
        };

        let launch = LaunchSpec::from_config(&config);
        let e = launch.args.iter().position(|a| a == "-e").unwrap();
        let it = launch.args.iter().position(|a| a == "-it").unwrap();
        assert_eq!(launch.args[e + 1], "K=V");
        assert_eq!(e + 2, it);
    }

    #[test]
    fn test_non_docker_env_goes_to_process() {
        let config = ServerConfig {
            env: env(&[("TOKEN", "abc")]),
            ..resolved_single("npx")
        };

        let launch = LaunchSpec::from_config(&config);
        assert_eq!(launch.args, config.args);
        assert_eq!(launch.env, config.env);
    }

    #[test]
    fn test_docker_without_run_keeps_process_env() {
        let config = ServerConfig {
            env: env(&[("TOKEN", "abc")]),
            args: strings(&["exec", "-i", "container", "server"]),
            ..resolved_single("docker")
        };

        let launch = LaunchSpec::from_config(&config);
        assert_eq!(launch.args, config.args);
        assert_eq!(launch.env, config.env);
    }

    fn resolved_single(command: &str) -> ServerConfig {
        let settings = McpSettings {
            servers: vec![ServerTemplate {
                name: "one".to_string(),
                command: Some(command.to_string()),
                args: strings(&["run", "--rm", "-i", "img"]),
                ..ServerTemplate::default()
            }],
            ..McpSettings::default()
        };
        build_server_configs(&settings).unwrap().servers.remove(0)
    }

    #[test]
    fn test_env_precedence() {
        let settings = McpSettings {
            env: env(&[("SHARED", "global"), ("ONLY_GLOBAL", "g")]),
            servers: vec![ServerTemplate {
                env: env(&[("SHARED", "local")]),
                ..template("a")
            }],
            ..McpSettings::default()
        };

        let config = &build_server_configs(&settings).unwrap().servers[0];
        assert_eq!(config.env["SHARED"], "local");
        assert_eq!(config.env["ONLY_GLOBAL"], "g");
    }

    #[test]
    fn test_build_is_idempotent() {
        let settings = McpSettings {
            startup_timeout: Some("90s".to_string()),
            default_tool: Some("search".to_string()),
            env: env(&[("A", "1")]),
            servers: vec![template("a"), template("b")],
            ..McpSettings::default()
        };

        let first = build_server_configs(&settings).unwrap();
        let second = build_server_configs(&settings).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.servers[0].startup_timeout, Duration::from_secs(90));
        assert_eq!(first.servers[0].keep_alive, DEFAULT_KEEP_ALIVE);
    }

    #[test]
    fn test_legacy_command_synthesizes_default_server() {
        let settings = McpSettings {
            command: Some("docker".to_string()),
            args: strings(&["run", "--rm", "-i", "legacy/image:1"]),
            default_tool: Some("query".to_string()),
            ..McpSettings::default()
        };

        let resolved = build_server_configs(&settings).unwrap();
        assert_eq!(resolved.servers.len(), 1);
        assert_eq!(resolved.default_server, "default");

        let config = &resolved.servers[0];
        assert_eq!(config.name, "default");
        assert_eq!(config.image, "legacy/image:1");
        assert_eq!(config.default_tool.as_deref(), Some("query"));
        assert_eq!(config.implementation_name, DEFAULT_IMPLEMENTATION_NAME);
        assert_eq!(config.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
    }

    #[test]
    fn test_empty_settings_rejected() {
        let err = build_server_configs(&McpSettings::default()).unwrap_err();
        assert!(matches!(err, McpError::Config(_)));
    }

    #[test]
    fn test_image_synthesizes_docker_run() {
        let settings = McpSettings {
            servers: vec![ServerTemplate {
                name: "img".to_string(),
                image: Some("ghcr.io/acme/tool:2".to_string()),
                ..ServerTemplate::default()
            }],
            ..McpSettings::default()
        };

        let config = &build_server_configs(&settings).unwrap().servers[0];
        assert_eq!(config.command, "docker");
        assert_eq!(config.args, strings(&["run", "--rm", "-i", "ghcr.io/acme/tool:2"]));
        assert_eq!(config.image, "ghcr.io/acme/tool:2");
        assert_eq!(config.display_name, "img");
    }

    #[test]
    fn test_legacy_args_fill_template_without_args() {
        let settings = McpSettings {
            command: Some("node".to_string()),
            args: strings(&["server.js"]),
            servers: vec![ServerTemplate {
                name: "t".to_string(),
                ..ServerTemplate::default()
            }],
            ..McpSettings::default()
        };

        let config = &build_server_configs(&settings).unwrap().servers[0];
        assert_eq!(config.command, "node");
        assert_eq!(config.args, strings(&["server.js"]));
    }

    #[test]
    fn test_missing_args_names_server() {
        let settings = McpSettings {
            servers: vec![ServerTemplate {
                name: "bare".to_string(),
                command: Some("node".to_string()),
                ..ServerTemplate::default()
            }],
            ..McpSettings::default()
        };

        let err = build_server_configs(&settings).unwrap_err();
        assert!(err.to_string().contains("bare"));
    }

    #[test]
    fn test_empty_and_duplicate_names_rejected() {
        let unnamed = McpSettings {
            servers: vec![template("  ")],
            ..McpSettings::default()
        };
        assert!(build_server_configs(&unnamed).is_err());

        let duplicated = McpSettings {
            servers: vec![template("a"), template("a")],
            ..McpSettings::default()
        };
        let err = build_server_configs(&duplicated).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_default_server_selection() {
        let mut settings = McpSettings {
            servers: vec![template("a"), template("b")],
            ..McpSettings::default()
        };
        assert_eq!(build_server_configs(&settings).unwrap().default_server, "a");

        settings.default_server = Some("b".to_string());
        assert_eq!(build_server_configs(&settings).unwrap().default_server, "b");

        settings.default_server = Some("missing".to_string());
        assert!(build_server_configs(&settings).is_err());
    }

    #[test]
    fn test_bad_duration_rejected() {
        let settings = McpSettings {
            keep_alive: Some("forever".to_string()),
            servers: vec![template("a")],
            ..McpSettings::default()
        };

        let err = build_server_configs(&settings).unwrap_err();
        assert!(err.to_string().contains("keepAlive"));
    }

    #[test]
    fn test_default_tool_fallback() {
        let settings = McpSettings {
            default_tool: Some("global-tool".to_string()),
            servers: vec![
                template("a"),
                ServerTemplate {
                    default_tool: Some("own-tool".to_string()),
                    ..template("b")
                },
            ],
            ..McpSettings::default()
        };

        let resolved = build_server_configs(&settings).unwrap();
        assert_eq!(resolved.servers[0].default_tool.as_deref(), Some("global-tool"));
        assert_eq!(resolved.servers[1].default_tool.as_deref(), Some("own-tool"));
    }

    #[test]
    fn test_extract_image_from_args() {
        assert_eq!(
            extract_image_from_args(&strings(&["run", "--rm", "-e", "A=1", "repo/img:1", "--flag"])),
            "repo/img:1"
        );
        assert_eq!(extract_image_from_args(&strings(&["--only", "K=V"])), "");
    }

    #[test]
    fn test_resolve_request_uses_recorded_env() {
        let defaults = ResolverDefaults {
            env: env(&[("SHARED", "global"), ("KEEP", "yes")]),
            implementation_name: "impl".to_string(),
            ..ResolverDefaults::default()
        };
        let request = AddServerRequest {
            name: "dyn".to_string(),
            image: Some("acme/dyn:1".to_string()),
            env: env(&[("SHARED", "local")]),
            ..AddServerRequest::default()
        };

        let config = defaults.resolve_request(&request).unwrap();
        assert_eq!(config.command, "docker");
        assert_eq!(config.args, strings(&["run", "--rm", "-i", "acme/dyn:1"]));
        assert_eq!(config.env["SHARED"], "local");
        assert_eq!(config.env["KEEP"], "yes");
        assert_eq!(config.implementation_name, "impl");
    }

    #[test]
    fn test_meta_projection() {
        let config = ServerConfig {
            homepage: "https://example.com".to_string(),
            tags: strings(&["x"]),
            default_tool: Some("t".to_string()),
            ..resolved_single("docker")
        };

        let meta = config.meta();
        assert_eq!(meta.name, "one");
        assert_eq!(meta.default_tool, "t");
        assert_eq!(meta.image, "img");

        let json = serde_json::to_value(ServerConfig {
            homepage: String::new(),
            tags: Vec::new(),
            ..config
        }
        .meta())
        .unwrap();
        assert!(json.get("homepage").is_none());
        assert!(json.get("tags").is_none());
        assert_eq!(json["display_name"], "one");
    }
}
