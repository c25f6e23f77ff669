//! Profile loading: parses the `mcpServers` map that feeds `Orchestrator::initialize`
//! (spec §4.6, §1). Grounded on `config.rs`'s `Settings`/`MCPServerConfig`
//! shape, narrowed to load-only — the profile is authored externally, this
//! crate only needs to read it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::NcpError;
use crate::model::{Auth, Endpoint, TransportKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawServerConfig {
    #[serde(default)]
    transport: Option<TransportKind>,
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    auth: Option<Auth>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawProfile {
    #[serde(rename = "mcpServers")]
    mcp_servers: HashMap<String, RawServerConfig>,
}

/// Parse a profile document's raw JSON text into a list of `Endpoint`s.
/// Inference of `transport_kind` when omitted follows the common-sense
/// default any stdio-launcher config implies: a `command` means stdio, a
/// bare `url` means streamable http.
pub fn parse_profile(text: &str) -> Result<Vec<Endpoint>, NcpError> {
    let raw: RawProfile = serde_json::from_str(text)
        .map_err(|e| NcpError::ConfigInvalid(format!("invalid profile JSON: {e}")))?;

    let mut endpoints = Vec::with_capacity(raw.mcp_servers.len());
    for (name, cfg) in raw.mcp_servers {
        let transport_kind = cfg.transport.unwrap_or_else(|| {
            if !cfg.url.is_empty() {
                TransportKind::Http
            } else {
                TransportKind::Stdio
            }
        });

        if transport_kind == TransportKind::Stdio && cfg.command.trim().is_empty() {
            return Err(NcpError::ConfigInvalid(format!(
                "endpoint '{name}' uses stdio transport but has no command"
            )));
        }
        if transport_kind != TransportKind::Stdio && cfg.url.trim().is_empty() {
            return Err(NcpError::ConfigInvalid(format!(
                "endpoint '{name}' uses a network transport but has no url"
            )));
        }

        endpoints.push(Endpoint {
            name,
            transport_kind,
            command: cfg.command,
            args: cfg.args,
            env: cfg.env,
            url: cfg.url,
            auth: cfg.auth.unwrap_or_default(),
            enabled: cfg.enabled,
        });
    }

    endpoints.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(endpoints)
}

/// Convenience wrapper reading the profile from a file path.
pub fn load_profile_from_path(path: &Path) -> Result<Vec<Endpoint>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading profile at {:?}", path))?;
    parse_profile(&text).map_err(anyhow::Error::from)
}

impl From<NcpError> for anyhow::Error {
    fn from(e: NcpError) -> Self {
        anyhow::anyhow!(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stdio_endpoint() {
        let json = r#"{
            "mcpServers": {
                "git": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-git"],
                    "enabled": true
                }
            }
        }"#;
        let endpoints = parse_profile(json).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].name, "git");
        assert_eq!(endpoints[0].transport_kind, TransportKind::Stdio);
        assert!(endpoints[0].enabled);
    }

    #[test]
    fn infers_http_transport_from_url() {
        let json = r#"{
            "mcpServers": {
                "remote": { "url": "https://example.com/mcp" }
            }
        }"#;
        let endpoints = parse_profile(json).unwrap();
        assert_eq!(endpoints[0].transport_kind, TransportKind::Http);
    }

    #[test]
    fn defaults_enabled_to_true() {
        let json = r#"{
            "mcpServers": { "git": { "command": "git-mcp" } }
        }"#;
        let endpoints = parse_profile(json).unwrap();
        assert!(endpoints[0].enabled);
    }

    #[test]
    fn rejects_stdio_endpoint_without_command() {
        let json = r#"{
            "mcpServers": { "broken": { "transport": "stdio" } }
        }"#;
        let err = parse_profile(json).unwrap_err();
        assert!(matches!(err, NcpError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_http_endpoint_without_url() {
        let json = r#"{
            "mcpServers": { "broken": { "transport": "http" } }
        }"#;
        let err = parse_profile(json).unwrap_err();
        assert!(matches!(err, NcpError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_profile("not json").unwrap_err();
        assert!(matches!(err, NcpError::ConfigInvalid(_)));
    }

    #[test]
    fn endpoints_are_sorted_by_name() {
        let json = r#"{
            "mcpServers": {
                "zebra": { "command": "z" },
                "alpha": { "command": "a" }
            }
        }"#;
        let endpoints = parse_profile(json).unwrap();
        assert_eq!(endpoints[0].name, "alpha");
        assert_eq!(endpoints[1].name, "zebra");
    }
}
