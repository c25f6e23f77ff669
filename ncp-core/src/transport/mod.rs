//! Wire-level transport, spec §4.1. Grounded on `src-tauri/src/client.rs`'s
//! `ensure_rmcp_client`: the same three-branch construction (stdio via
//! `TokioChildProcess`, http via `StreamableHttpClientTransport`, sse via
//! `SseClientTransport`) against the same `rmcp` SDK, but exposed behind a
//! small local trait instead of the teacher's bare `ClientService` type
//! alias, so the Pool can hold `Box<dyn McpTransport>` and tests can swap in
//! a `MockTransport` without touching `rmcp`'s generics at all.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, CallToolResult, Prompt, Resource, Tool};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::ServiceExt;

use crate::model::{Auth, Endpoint, TransportKind};

/// What the Pool and Orchestrator need from a live connection to a
/// downstream MCP server. Deliberately narrower than `rmcp::Service` —
/// NCP only ever acts as a client toward downstreams.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>>;
    async fn list_resources(&self) -> Result<Vec<Resource>>;
    async fn list_prompts(&self) -> Result<Vec<Prompt>>;
    async fn call_tool(&self, name: &str, arguments: Option<serde_json::Value>) -> Result<CallToolResult>;
    async fn close(&self) -> Result<()>;
    fn peer_info(&self) -> Option<String>;
}

pub struct RmcpTransport {
    service: RunningService<RoleClient, ()>,
}

#[async_trait]
impl McpTransport for RmcpTransport {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let tools = self
            .service
            .list_all_tools()
            .await
            .context("rmcp list_tools")?;
        Ok(tools)
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        let resources = self
            .service
            .list_all_resources()
            .await
            .context("rmcp list_resources")?;
        Ok(resources)
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let prompts = self
            .service
            .list_all_prompts()
            .await
            .context("rmcp list_prompts")?;
        Ok(prompts)
    }

    async fn call_tool(&self, name: &str, arguments: Option<serde_json::Value>) -> Result<CallToolResult> {
        let args = match arguments {
            Some(serde_json::Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(anyhow!("tool arguments must be a JSON object, got {other}"));
            }
            None => None,
        };
        let result = self
            .service
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: args,
            })
            .await
            .context("rmcp call_tool")?;
        Ok(result)
    }

    async fn close(&self) -> Result<()> {
        self.service.cancellation_token().cancel();
        Ok(())
    }

    fn peer_info(&self) -> Option<String> {
        self.service
            .peer()
            .peer_info()
            .map(|info| format!("{} {}", info.server_info.name, info.server_info.version))
    }
}

/// Build a live transport for `endpoint`, following the teacher's
/// `ensure_rmcp_client` branch-per-transport-kind structure. Bearer auth is
/// applied as a default header on the underlying HTTP client for http/sse;
/// OAuth's bearer token is refreshed by the Pool before this is called
/// (spec §4.5 owns the refresh-before-expiry timing), so by the time we get
/// here `Auth::OAuth` has already been resolved to a bearer token by the
/// caller.
pub async fn connect(endpoint: &Endpoint, bearer_override: Option<&str>) -> Result<RmcpTransport> {
    tracing::info!(target = "transport", endpoint = %endpoint.name, kind = ?endpoint.transport_kind, "connecting");
    let service = match endpoint.transport_kind {
        TransportKind::Stdio => {
            if endpoint.command.trim().is_empty() {
                return Err(anyhow!("endpoint '{}' has no command", endpoint.name));
            }
            let mut command = tokio::process::Command::new(&endpoint.command);
            command.args(&endpoint.args);
            for (k, v) in &endpoint.env {
                command.env(k, v);
            }
            let transport = TokioChildProcess::new(command)
                .with_context(|| format!("spawning endpoint '{}'", endpoint.name))?;
            ().serve(transport)
                .await
                .with_context(|| format!("rmcp serve for '{}'", endpoint.name))?
        }
        TransportKind::Http => {
            if endpoint.url.trim().is_empty() {
                return Err(anyhow!("endpoint '{}' has no url", endpoint.name));
            }
            let client = build_http_client(endpoint, bearer_override)?;
            let transport = StreamableHttpClientTransport::with_client(
                client,
                rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig::with_uri(
                    endpoint.url.clone(),
                ),
            );
            ().serve(transport)
                .await
                .with_context(|| format!("rmcp serve for '{}'", endpoint.name))?
        }
        TransportKind::Sse => {
            if endpoint.url.trim().is_empty() {
                return Err(anyhow!("endpoint '{}' has no url", endpoint.name));
            }
            let client = build_http_client(endpoint, bearer_override)?;
            let transport = SseClientTransport::start_with_client(
                client,
                rmcp::transport::sse_client::SseClientConfig {
                    sse_endpoint: endpoint.url.clone().into(),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("sse start for '{}'", endpoint.name))?;
            ().serve(transport)
                .await
                .with_context(|| format!("rmcp serve for '{}'", endpoint.name))?
        }
    };
    tracing::info!(target = "transport", endpoint = %endpoint.name, "connected");
    Ok(RmcpTransport { service })
}

fn build_http_client(endpoint: &Endpoint, bearer_override: Option<&str>) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    let bearer = bearer_override.map(|s| s.to_string()).or_else(|| match &endpoint.auth {
        Auth::Bearer { token } => Some(token.clone()),
        _ => None,
    });
    if let Some(token) = bearer {
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .context("invalid bearer token header value")?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
    if let Auth::Basic { user, pass } = &endpoint.auth {
        let encoded = base64_basic(user, pass);
        let value = reqwest::header::HeaderValue::from_str(&format!("Basic {encoded}"))
            .context("invalid basic auth header value")?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .context("building http client")
}

fn base64_basic(user: &str, pass: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
}

/// Full-jitter backoff for the Pool's reconnect loop: `rand(0, min(cap, base * 2^attempt))`.
/// Policy lives here because it's shared between the sse transport's own
/// reconnects and the Pool's re-attach attempts after a `Failed` transition
/// (spec §4.5).
pub fn sse_backoff(attempt: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(500);
    const CAP: Duration = Duration::from_secs(30);
    let exp = BASE.as_millis().saturating_mul(1u128 << attempt.min(8));
    let capped = exp.min(CAP.as_millis());
    let jittered = rand::random::<u64>() % (capped as u64).max(1);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap() {
        for attempt in 0..20 {
            let d = sse_backoff(attempt);
            assert!(d <= Duration::from_secs(30));
        }
    }

    #[test]
    fn backoff_grows_with_attempt_on_average() {
        let early: u128 = (0..50).map(|_| sse_backoff(0).as_millis()).sum();
        let later: u128 = (0..50).map(|_| sse_backoff(5).as_millis()).sum();
        assert!(later > early);
    }
}
