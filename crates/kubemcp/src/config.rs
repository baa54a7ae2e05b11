//! Raw MCP configuration as it appears in the application's config file.
//!
//! These records are what the loading layer hands over; nothing here is
//! validated beyond deserialization. [`crate::resolver::build_server_configs`]
//! turns them into launchable [`crate::ServerConfig`] values.
//!
//! ## Example TOML Configuration
//!
//! ```toml
//! [mcp]
//! enable = true
//! implementationName = "kubemanage-mcp-client"
//! startupTimeout = "90s"
//! keepAlive = "45s"
//! defaultServer = "scholarly"
//! defaultTool = "search-arxiv"
//!
//! [mcp.env]
//! HTTP_PROXY = "http://proxy.internal:3128"
//!
//! [[mcp.servers]]
//! name = "scholarly"
//! displayName = "Scholarly search"
//! image = "ghcr.io/metorial/mcp-container--adityak74--mcp-scholarly--mcp-scholarly"
//! tags = ["papers", "search"]
//!
//! [[mcp.servers]]
//! name = "filesystem"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
//! ```
//!
//! The settings may also sit at the top level of the file without the
//! `mcp` table. Files are accepted as TOML, YAML or JSON; see
//! [`McpSettings::from_file`].
//!
//! ## Legacy single-command form
//!
//! Older deployments configured exactly one provider with top-level
//! `command`/`args`/`env`. When `servers` is empty these fields are turned
//! into a single server named `default`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{McpError, Result};

/// Global MCP settings block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct McpSettings {
    /// Whether the MCP subsystem should be started at all
    pub enable: bool,
    /// Client name announced to providers during the handshake
    pub implementation_name: Option<String>,
    /// Client version announced to providers during the handshake
    pub implementation_version: Option<String>,
    /// Startup bound as a duration string, e.g. `"20s"`
    pub startup_timeout: Option<String>,
    /// Liveness probe interval as a duration string, e.g. `"45s"`
    pub keep_alive: Option<String>,
    /// Server handed out by `default_client`
    pub default_server: Option<String>,
    /// Fallback default tool for servers that do not name one
    pub default_tool: Option<String>,
    /// Legacy single-server command
    pub command: Option<String>,
    /// Legacy single-server arguments
    pub args: Vec<String>,
    /// Environment shared by every server
    pub env: BTreeMap<String, String>,
    /// Per-server templates
    pub servers: Vec<ServerTemplate>,
}

/// One per-server template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerTemplate {
    pub name: String,
    #[serde(alias = "display_name")]
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    #[serde(alias = "default_tool")]
    pub default_tool: Option<String>,
    pub homepage: Option<String>,
    pub tags: Vec<String>,
}

/// Key under which the application nests the MCP block.
const SECTION_KEY: &str = "mcp";

impl McpSettings {
    /// Parse settings from a TOML document.
    ///
    /// The block may be nested under an `mcp` table or sit at the top level.
    ///
    /// # Errors
    /// Returns a configuration error if the document cannot be parsed.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let invalid = |e: toml::de::Error| McpError::config(format!("invalid TOML: {e}"));
        let mut table: toml::Table = toml::from_str(contents).map_err(invalid)?;
        let value = match table.remove(SECTION_KEY) {
            Some(section) => section,
            None => toml::Value::Table(table),
        };
        value.try_into().map_err(invalid)
    }

    /// Parse settings from a YAML document.
    ///
    /// # Errors
    /// Returns a configuration error if the document cannot be parsed.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let invalid = |e: serde_yaml::Error| McpError::config(format!("invalid YAML: {e}"));
        let mut value: serde_yaml::Value = serde_yaml::from_str(contents).map_err(invalid)?;
        if let Some(section) = value.get(SECTION_KEY) {
            value = section.clone();
        }
        serde_yaml::from_value(value).map_err(invalid)
    }

    /// Parse settings from a JSON document.
    ///
    /// # Errors
    /// Returns a configuration error if the document cannot be parsed.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let invalid = |e: serde_json::Error| McpError::config(format!("invalid JSON: {e}"));
        let mut value: serde_json::Value = serde_json::from_str(contents).map_err(invalid)?;
        if let Some(section) = value.get_mut(SECTION_KEY) {
            value = section.take();
        }
        serde_json::from_value(value).map_err(invalid)
    }

    /// Load from file based on extension
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or has an unsupported extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            McpError::config(format!("failed to read {}: {e}", path.display()))
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            Some("toml") => Self::from_toml_str(&contents),
            _ => Err(McpError::config(
                "Unsupported config file format. Use .yaml, .yml, .json, or .toml",
            )),
        }
    }
}

/// Parse a Go-style duration string such as `"300ms"`, `"1.5h"` or `"2h45m"`.
///
/// Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `"0"`
/// is accepted. Negative durations are rejected.
///
/// # Errors
/// Returns a configuration error if the string is malformed or overflows.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || McpError::config(format!("invalid duration '{input}'"));

    let mut rest = input.trim();
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    }
    if rest.starts_with('-') {
        return Err(McpError::config(format!(
            "negative duration '{input}' is not allowed"
        )));
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let (int_part, after_int) = rest.split_at(int_len);

        let (frac_part, after_number) = after_int.strip_prefix('.').map_or(("", after_int), |f| {
            let frac_len = f.find(|c: char| !c.is_ascii_digit()).unwrap_or(f.len());
            f.split_at(frac_len)
        });
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }

        let unit_len = after_number
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_number.len());
        let (unit, remaining) = after_number.split_at(unit_len);
        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => {
                return Err(McpError::config(format!(
                    "missing unit in duration '{input}'"
                )));
            }
            other => {
                return Err(McpError::config(format!(
                    "unknown unit '{other}' in duration '{input}'"
                )));
            }
        };

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let mut value = whole.checked_mul(scale).ok_or_else(invalid)?;

        // Only the first 18 fractional digits can still contribute at nanosecond scale.
        let frac_digits = &frac_part[..frac_part.len().min(18)];
        if !frac_digits.is_empty() {
            let numerator: u128 = frac_digits.parse().map_err(|_| invalid())?;
            let denominator = 10u128.pow(u32::try_from(frac_digits.len()).map_err(|_| invalid())?);
            value = value
                .checked_add(numerator * scale / denominator)
                .ok_or_else(invalid)?;
        }

        total = total.checked_add(value).ok_or_else(invalid)?;
        rest = remaining;
    }

    let nanos = u64::try_from(total).map_err(|_| invalid())?;
    Ok(Duration::from_nanos(nanos))
}
