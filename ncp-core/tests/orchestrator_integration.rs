//! End-to-end exercise of `Orchestrator::initialize`/`find`/`run` against a
//! `MockTransport`, grounded on the teacher's hand-rolled `MockTransport` in
//! `transport/intercepting.rs` (there: an `rmcp::transport::Transport`
//! double driven by channels; here: a direct `McpTransport` double, since
//! NCP's trait is the one the Pool actually depends on).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ncp_core::config_provider::ConfigProvider;
use ncp_core::embedding::EmbeddingCache;
use ncp_core::health::HealthMonitor;
use ncp_core::model::{Auth, Endpoint, TransportKind};
use ncp_core::pool::Connector;
use ncp_core::transport::McpTransport;
use ncp_core::Orchestrator;
use rmcp::model::{CallToolResult, Content, Prompt, Resource, Tool};
use serde_json::json;

struct MockTransport {
    tools: Vec<Tool>,
}

#[async_trait]
impl McpTransport for MockTransport {
    async fn list_tools(&self) -> anyhow::Result<Vec<Tool>> {
        Ok(self.tools.clone())
    }

    async fn list_resources(&self) -> anyhow::Result<Vec<Resource>> {
        Ok(Vec::new())
    }

    async fn list_prompts(&self) -> anyhow::Result<Vec<Prompt>> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, _arguments: Option<serde_json::Value>) -> anyhow::Result<CallToolResult> {
        if name == "boom" {
            return Err(anyhow::anyhow!("simulated downstream failure"));
        }
        Ok(CallToolResult {
            content: vec![Content::text(format!("ok:{name}"))],
            structured_content: None,
            is_error: Some(false),
            meta: None,
        })
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn peer_info(&self) -> Option<String> {
        Some("mock/1.0".into())
    }
}

struct MockConnector {
    tools: Vec<Tool>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> anyhow::Result<Arc<dyn McpTransport>> {
        Ok(Arc::new(MockTransport {
            tools: self.tools.clone(),
        }))
    }
}

fn make_tool(name: &str, description: &str) -> Tool {
    let schema = json!({"type": "object", "properties": {}})
        .as_object()
        .unwrap()
        .clone();
    Tool::new(name.to_string(), description.to_string(), schema)
}

fn stdio_endpoint(name: &str) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        transport_kind: TransportKind::Stdio,
        command: "mock-mcp-server".into(),
        args: Vec::new(),
        env: HashMap::new(),
        url: String::new(),
        auth: Auth::None,
        enabled: true,
    }
}

struct TempDirConfigProvider {
    _dir: tempfile::TempDir,
    path: std::path::PathBuf,
}

impl TempDirConfigProvider {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().to_path_buf();
        Self { _dir: dir, path }
    }
}

impl ConfigProvider for TempDirConfigProvider {
    fn base_dir(&self) -> std::path::PathBuf {
        self.path.clone()
    }
}

fn orchestrator_with(tools: Vec<Tool>) -> Orchestrator {
    let cp = TempDirConfigProvider::new();
    let health = HealthMonitor::load(&cp);
    let cache = EmbeddingCache::load(&cp, 256);
    let capability_cache = ncp_core::cache::CapabilityCache::load(&cp);
    let connector = Arc::new(MockConnector { tools });
    Orchestrator::with_connector(health, cache, capability_cache, connector)
}

#[tokio::test]
async fn initialize_indexes_tools_from_mocked_endpoint() {
    let orch = orchestrator_with(vec![
        make_tool("search_files", "search the local filesystem by name"),
        make_tool("send_email", "send an email to a recipient"),
    ]);

    orch.initialize(vec![stdio_endpoint("fs")]).await.unwrap();

    // Querying with the exact wording of a tool's own name+description
    // guarantees it scores highest regardless of the embedding provider's
    // internals — the hash provider has no notion of synonymy, only token
    // overlap, so this is the deterministic way to assert ranking here.
    let results = orch
        .find("search_files search the local filesystem by name", 1, false)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.tool_name, "search_files");
}

#[tokio::test]
async fn initialize_populates_the_capability_snapshot() {
    let orch = orchestrator_with(vec![make_tool("search_files", "search the local filesystem by name")]);
    orch.initialize(vec![stdio_endpoint("fs")]).await.unwrap();

    let snapshot = orch.capability_snapshot("fs").await.expect("snapshot present after attach");
    assert_eq!(snapshot.tools.len(), 1);
    assert_eq!(snapshot.tools[0].tool_name, "search_files");
    assert!(snapshot.tools[0].embedding.is_some());
}

#[tokio::test]
async fn run_dispatches_to_the_mocked_transport() {
    let orch = orchestrator_with(vec![make_tool("search_files", "search files")]);
    orch.initialize(vec![stdio_endpoint("fs")]).await.unwrap();

    let result = orch.run("fs:search_files", Some(json!({"query": "*.rs"}))).await.unwrap();
    assert!(!result.content.is_empty());
}

#[tokio::test]
async fn run_classifies_and_records_a_downstream_failure() {
    let orch = orchestrator_with(vec![make_tool("boom", "always fails")]);
    orch.initialize(vec![stdio_endpoint("fs")]).await.unwrap();

    let err = orch.run("fs:boom", None).await.unwrap_err();
    assert!(matches!(err, ncp_core::NcpError::NetworkError(_)));
}

#[tokio::test]
async fn three_consecutive_failures_disable_the_endpoint_for_find() {
    let orch = orchestrator_with(vec![make_tool("boom", "always fails")]);
    orch.initialize(vec![stdio_endpoint("fs")]).await.unwrap();

    for _ in 0..3 {
        let _ = orch.run("fs:boom", None).await;
    }

    let visible = orch.find("fails", 5, false).await.unwrap();
    assert!(visible.is_empty());

    // Disabling purges the endpoint from the discovery index outright (spec
    // §8, testable property #3), so even `include_disabled=true` now finds
    // nothing — there's nothing left in the index to include.
    let including_disabled = orch.find("fails", 5, true).await.unwrap();
    assert!(including_disabled.is_empty());
}

#[tokio::test]
async fn reset_makes_a_disabled_endpoint_visible_to_find_again() {
    let orch = orchestrator_with(vec![make_tool("boom", "always fails")]);
    orch.initialize(vec![stdio_endpoint("fs")]).await.unwrap();
    for _ in 0..3 {
        let _ = orch.run("fs:boom", None).await;
    }
    assert!(orch.find("fails", 5, false).await.unwrap().is_empty());

    orch.reset_endpoint("fs").await;

    assert_eq!(orch.find("fails", 5, false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cleanup_flushes_the_embedding_cache_without_error() {
    let orch = orchestrator_with(vec![make_tool("search_files", "search files")]);
    orch.initialize(vec![stdio_endpoint("fs")]).await.unwrap();
    orch.cleanup().await.unwrap();
}
