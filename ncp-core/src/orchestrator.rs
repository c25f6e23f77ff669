//! The Orchestrator, spec §4.6: the one object everything else composes
//! into. Grounded on `src-tauri/src/server.rs`'s `BouncerService`
//! (`aggregate_tools`/`select_target_server`/the `CallToolRequest` handler's
//! qualified-name split) generalized into `find`/`run`/`list_resources`/
//! `list_prompts`/`cleanup`. The teacher splits on `"::"`; this splits on
//! the first `:`, per spec §4.6.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::cache::CapabilityCache;
use crate::discovery::DiscoveryIndex;
use crate::embedding::{EmbeddingCache, EmbeddingProvider, HashEmbeddingProvider};
use crate::error::NcpError;
use crate::health::HealthMonitor;
use crate::logging::{Event, NoopPublisher, RpcEventPublisher};
use crate::model::{CapabilitySnapshot, Endpoint, PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use crate::pool::{Pool, PoolEvents};
use rmcp::model::CallToolResult;

const DEFAULT_INIT_BATCH_SIZE: usize = 8;

/// Attach timeout, spec §4.5: a downstream that never answers `initialize`/
/// `list_tools` must not block `Orchestrator::initialize` forever.
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request timeout, spec §5: the default applied to `run`, overridable
/// per call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The Pool notifies the Orchestrator through this narrow interface rather
/// than holding a back-reference to it (spec §9).
struct OrchestratorPoolEvents {
    health: Arc<HealthMonitor>,
    index: Arc<DiscoveryIndex>,
}

#[async_trait]
impl PoolEvents for OrchestratorPoolEvents {
    async fn on_capability_change(&self, endpoint_name: &str) {
        // The Pool fires this on every fresh connect, including a
        // hibernation reattach to an endpoint whose config hasn't changed.
        // Re-querying tools here would duplicate `attach_one`'s work for no
        // benefit in the common case, so this is observability only; a
        // config change is what actually invalidates the capability cache
        // (see `Endpoint::config_hash`), and that path already re-attaches.
        tracing::debug!(target = "orchestrator", endpoint = %endpoint_name, "capability change notified");
    }

    async fn on_health_event(&self, endpoint_name: &str, error: &NcpError) {
        let just_disabled = self
            .health
            .mark_failure(endpoint_name, &error.to_string(), error.classify())
            .await;
        if just_disabled {
            self.index.remove_endpoint(endpoint_name).await;
            tracing::info!(target = "orchestrator", endpoint = %endpoint_name, "endpoint disabled, purged from discovery index");
        }
    }
}

pub struct Orchestrator {
    endpoints: RwLock<HashMap<String, Endpoint>>,
    pool: Arc<Pool>,
    index: Arc<DiscoveryIndex>,
    health: Arc<HealthMonitor>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    embedding_cache: RwLock<EmbeddingCache>,
    capability_cache: CapabilityCache,
    logger: Arc<dyn RpcEventPublisher>,
}

impl Orchestrator {
    pub fn new(health: HealthMonitor, embedding_cache: EmbeddingCache, capability_cache: CapabilityCache) -> Self {
        Self::with_connector(
            health,
            embedding_cache,
            capability_cache,
            Arc::new(crate::pool::RmcpConnector::default()),
        )
    }

    /// Construct with a pluggable `Connector`, so tests can hand the Pool a
    /// connector that returns a `MockTransport` instead of ever spawning a
    /// real subprocess or opening a real socket.
    pub fn with_connector(
        health: HealthMonitor,
        embedding_cache: EmbeddingCache,
        capability_cache: CapabilityCache,
        connector: Arc<dyn crate::pool::Connector>,
    ) -> Self {
        let index = Arc::new(DiscoveryIndex::new());
        let health = Arc::new(health);
        let events = Arc::new(OrchestratorPoolEvents {
            health: health.clone(),
            index: index.clone(),
        });
        Self {
            endpoints: RwLock::new(HashMap::new()),
            pool: Arc::new(Pool::with_connector(events, connector)),
            index,
            health,
            embedding_provider: Arc::new(HashEmbeddingProvider::default()),
            embedding_cache: RwLock::new(embedding_cache),
            capability_cache,
            logger: Arc::new(NoopPublisher),
        }
    }

    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = provider;
        self
    }

    /// Wire in a concrete event sink (e.g. `ncp-logging`'s `DuckDbPublisher`).
    /// Without this, RPC events are simply discarded.
    pub fn with_logger(mut self, logger: Arc<dyn RpcEventPublisher>) -> Self {
        self.logger = logger;
        self
    }

    /// Record a failure and, the moment it trips the endpoint into
    /// `Disabled`, purge it from the discovery index so the index's
    /// descriptor count reflects reality on the very next reconciliation
    /// (spec §8, testable property #3) rather than relying on `find`'s
    /// query-time health filter to mask a stale entry.
    async fn record_failure_and_reconcile(&self, endpoint_name: &str, message: &str, class: Option<crate::error::FailureClass>) {
        let just_disabled = self.health.mark_failure(endpoint_name, message, class).await;
        if just_disabled {
            self.index.remove_endpoint(endpoint_name).await;
            tracing::info!(target = "orchestrator", endpoint = %endpoint_name, "endpoint disabled, purged from discovery index");
        }
    }

    /// Attach to every enabled endpoint in bounded-size batches and index
    /// whatever they advertise. Per-endpoint failures are recorded in the
    /// Health Monitor and do not abort the rest of the batch (spec §4.6).
    pub async fn initialize(&self, endpoints: Vec<Endpoint>) -> anyhow::Result<()> {
        self.initialize_cancellable(endpoints, &CancellationToken::new()).await
    }

    pub async fn initialize_cancellable(&self, endpoints: Vec<Endpoint>, cancel: &CancellationToken) -> anyhow::Result<()> {
        {
            let mut guard = self.endpoints.write().await;
            for e in &endpoints {
                guard.insert(e.name.clone(), e.clone());
            }
        }

        let enabled: Vec<Endpoint> = endpoints.into_iter().filter(|e| e.enabled).collect();
        for batch in enabled.chunks(DEFAULT_INIT_BATCH_SIZE) {
            if cancel.is_cancelled() {
                break;
            }
            let tasks = batch.iter().map(|endpoint| self.attach_one(endpoint, cancel));
            join_all(tasks).await;
        }
        Ok(())
    }

    async fn attach_one(&self, endpoint: &Endpoint, cancel: &CancellationToken) {
        let config_hash = endpoint.config_hash();
        let started_at = std::time::Instant::now();
        let mut event = Event::new("attach");
        event.endpoint_name = Some(endpoint.name.clone());

        if let Some(cached) = self.capability_cache.get_if_current(&endpoint.name, &config_hash).await {
            tracing::debug!(target = "orchestrator", endpoint = %endpoint.name, "capability cache hit, skipping re-query");
            let entries: Vec<(ToolDescriptor, Vec<f32>)> = cached
                .tools
                .iter()
                .map(|d| (d.clone(), d.embedding.clone().unwrap_or_default()))
                .collect();
            self.index.replace_endpoint(&endpoint.name, entries).await;
            event.duration_ms = Some(started_at.elapsed().as_millis() as i64);
            self.logger.log(event);
            return;
        }

        let fut = async {
            let transport = tokio::select! {
                _ = cancel.cancelled() => return Err(NcpError::Cancelled),
                result = tokio::time::timeout(DEFAULT_ATTACH_TIMEOUT, self.pool.get_or_connect(endpoint)) => {
                    match result {
                        Ok(inner) => inner?,
                        Err(_elapsed) => return Err(NcpError::Timeout),
                    }
                }
            };
            let tools = tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, transport.list_tools())
                .await
                .map_err(|_| NcpError::Timeout)?
                .map_err(NcpError::from)?;
            let resources = tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, transport.list_resources())
                .await
                .unwrap_or(Ok(Vec::new()))
                .unwrap_or_default();
            let prompts = tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, transport.list_prompts())
                .await
                .unwrap_or(Ok(Vec::new()))
                .unwrap_or_default();

            let mut descriptors: Vec<ToolDescriptor> = tools
                .into_iter()
                .map(|t| ToolDescriptor {
                    endpoint_name: endpoint.name.clone(),
                    tool_name: t.name.to_string(),
                    description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                    input_schema: serde_json::to_value(&*t.input_schema).unwrap_or(serde_json::json!({})),
                    embedding: None,
                })
                .collect();

            let mut entries: Vec<(ToolDescriptor, Vec<f32>)> = Vec::with_capacity(descriptors.len());
            for descriptor in descriptors.iter_mut() {
                if cancel.is_cancelled() {
                    return Err(NcpError::Cancelled);
                }
                let embedding = {
                    let cache = self.embedding_cache.read().await;
                    cache.get(self.embedding_provider.model_name(), &descriptor.embedding_cache_key()).cloned()
                };
                let embedding = match embedding {
                    Some(v) => v,
                    None => {
                        let v = self
                            .embedding_provider
                            .embed_text(&format!("{} {}", descriptor.tool_name, descriptor.description))
                            .await
                            .map_err(|e| NcpError::ProtocolError(e.to_string()))?;
                        let mut cache = self.embedding_cache.write().await;
                        cache.put(self.embedding_provider.model_name(), &descriptor.embedding_cache_key(), v.clone());
                        v
                    }
                };
                descriptor.embedding = Some(embedding.clone());
                entries.push((descriptor.clone(), embedding));
            }
            self.index.replace_endpoint(&endpoint.name, entries).await;

            let resource_descriptors: Vec<ResourceDescriptor> = resources
                .into_iter()
                .map(|r| ResourceDescriptor {
                    endpoint_name: endpoint.name.clone(),
                    uri: r.raw.uri.clone(),
                    name: r.raw.name.clone(),
                    description: r.raw.description.clone(),
                })
                .collect();
            let prompt_descriptors: Vec<PromptDescriptor> = prompts
                .into_iter()
                .map(|p| PromptDescriptor {
                    endpoint_name: endpoint.name.clone(),
                    prompt_name: p.name.clone(),
                    description: p.description.clone(),
                })
                .collect();

            let snapshot = CapabilitySnapshot {
                hash: config_hash,
                tools: descriptors,
                resources: resource_descriptors,
                prompts: prompt_descriptors,
                embedded_at: Some(chrono::Utc::now()),
            };
            self.capability_cache
                .put(&endpoint.name, snapshot)
                .await
                .map_err(|e| NcpError::ProtocolError(e.to_string()))?;

            self.health.mark_success(&endpoint.name).await;
            let _ = self.embedding_cache.read().await.flush();
            Ok::<(), NcpError>(())
        };

        event.duration_ms = None;
        match fut.await {
            Ok(()) => {
                event.ok = true;
            }
            Err(NcpError::Cancelled) => {
                // Cancellation abandons the in-flight attach without
                // recording a health failure — the endpoint's state is
                // untouched, not disabled.
                event.ok = false;
                event.error = Some("cancelled".into());
            }
            Err(e) => {
                tracing::warn!(target = "orchestrator", endpoint = %endpoint.name, error = %e, "attach failed");
                event.ok = false;
                event.error = Some(e.to_string());
                self.record_failure_and_reconcile(&endpoint.name, &e.to_string(), e.classify()).await;
            }
        }
        event.duration_ms = Some(started_at.elapsed().as_millis() as i64);
        self.logger.log(event);
    }

    /// Semantic search over the index, spec §4.4/§4.6. Endpoints currently
    /// disabled are excluded unless `include_disabled` is set.
    pub async fn find(&self, query: &str, limit: usize, include_disabled: bool) -> anyhow::Result<Vec<(ToolDescriptor, f32)>> {
        let query_vector = self.embedding_provider.embed_text(query).await?;
        let health = self.health.snapshot().await;
        let results = self
            .index
            .search(&query_vector, limit, |d| {
                include_disabled
                    || !matches!(
                        health.get(&d.endpoint_name).map(|r| r.status),
                        Some(crate::model::HealthStatus::Disabled)
                    )
            })
            .await;
        Ok(results)
    }

    /// Dispatch a qualified tool call (`endpoint:tool`), spec §4.6, applying
    /// the default per-request timeout.
    pub async fn run(&self, qualified_tool: &str, params: Option<serde_json::Value>) -> Result<CallToolResult, NcpError> {
        self.run_cancellable(qualified_tool, params, None, &CancellationToken::new()).await
    }

    /// As `run`, but threading a cancellation token and an optional
    /// per-call timeout override through every suspension point (spec §5).
    /// A cancelled call abandons the in-flight request only — the endpoint's
    /// connection and health state are left untouched, since the downstream
    /// itself never failed.
    pub async fn run_cancellable(
        &self,
        qualified_tool: &str,
        params: Option<serde_json::Value>,
        timeout_override: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult, NcpError> {
        let (endpoint_name, tool_name) = qualified_tool
            .split_once(':')
            .ok_or_else(|| NcpError::NotFound(format!("'{qualified_tool}' is not a qualified tool id")))?;

        if self.health.is_disabled(endpoint_name).await {
            return Err(NcpError::Unavailable(format!("endpoint '{endpoint_name}' is disabled")));
        }

        let endpoint = {
            let endpoints = self.endpoints.read().await;
            endpoints
                .get(endpoint_name)
                .cloned()
                .ok_or_else(|| NcpError::NotFound(format!("unknown endpoint '{endpoint_name}'")))?
        };

        let mut event = Event::new("run");
        event.endpoint_name = Some(endpoint_name.to_string());
        event.qualified_tool = Some(qualified_tool.to_string());
        let started_at = std::time::Instant::now();

        let transport = self.pool.get_or_connect_cancellable(&endpoint, cancel).await?;
        let deadline = timeout_override.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(NcpError::Cancelled),
            result = tokio::time::timeout(deadline, transport.call_tool(tool_name, params)) => {
                match result {
                    Ok(Ok(r)) => Ok(r),
                    Ok(Err(e)) => Err(NcpError::from(e)),
                    Err(_elapsed) => Err(NcpError::Timeout),
                }
            }
        };

        event.duration_ms = Some(started_at.elapsed().as_millis() as i64);
        match outcome {
            Ok(r) => {
                self.health.mark_success(endpoint_name).await;
                event.ok = true;
                self.logger.log(event);
                Ok(r)
            }
            Err(NcpError::Cancelled) => {
                event.ok = false;
                event.error = Some("cancelled".into());
                self.logger.log(event);
                Err(NcpError::Cancelled)
            }
            Err(classified) => {
                event.ok = false;
                event.error = Some(classified.to_string());
                self.logger.log(event);
                self.record_failure_and_reconcile(endpoint_name, &classified.to_string(), classified.classify())
                    .await;
                Err(classified)
            }
        }
    }

    /// Every resource advertised by a currently-attached, non-disabled
    /// endpoint, gathered from the capability snapshots taken at attach
    /// time. Mirrors `find`'s health filter — a disabled endpoint's
    /// resources and prompts must disappear alongside its tools.
    pub async fn list_resources(&self) -> Vec<ResourceDescriptor> {
        let names = self.enabled_endpoint_names().await;
        let mut out = Vec::new();
        for name in names {
            if let Some(snapshot) = self.capability_cache.get(&name).await {
                out.extend(snapshot.resources);
            }
        }
        out
    }

    pub async fn list_prompts(&self) -> Vec<PromptDescriptor> {
        let names = self.enabled_endpoint_names().await;
        let mut out = Vec::new();
        for name in names {
            if let Some(snapshot) = self.capability_cache.get(&name).await {
                out.extend(snapshot.prompts);
            }
        }
        out
    }

    async fn enabled_endpoint_names(&self) -> Vec<String> {
        let names: Vec<String> = self.endpoints.read().await.keys().cloned().collect();
        let health = self.health.snapshot().await;
        names
            .into_iter()
            .filter(|name| !matches!(health.get(name).map(|r| r.status), Some(crate::model::HealthStatus::Disabled)))
            .collect()
    }

    /// Operator-initiated reset of a sticky-disabled endpoint, spec §4.7.
    /// Repopulates the discovery index from the last known capability
    /// snapshot, since disabling purged it (spec §8, testable property #3) —
    /// without this the endpoint would stay invisible to `find` even after
    /// its health is cleared.
    pub async fn reset_endpoint(&self, endpoint_name: &str) {
        self.health.reset(endpoint_name).await;
        if let Some(snapshot) = self.capability_cache.get(endpoint_name).await {
            let entries: Vec<(ToolDescriptor, Vec<f32>)> = snapshot
                .tools
                .iter()
                .map(|d| (d.clone(), d.embedding.clone().unwrap_or_default()))
                .collect();
            self.index.replace_endpoint(endpoint_name, entries).await;
        }
    }

    pub async fn capability_snapshot(&self, endpoint_name: &str) -> Option<CapabilitySnapshot> {
        self.capability_cache.get(endpoint_name).await
    }

    /// Close every live connection, flush caches. Called on shutdown.
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        self.pool.shutdown_all().await;
        let cache = self.embedding_cache.read().await;
        cache.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_provider::TempConfigProvider;

    fn orchestrator() -> Orchestrator {
        let cp = TempConfigProvider::new();
        let health = HealthMonitor::load(&cp);
        let cache = EmbeddingCache::load(&cp, 256);
        let capability_cache = crate::cache::CapabilityCache::load(&cp);
        Orchestrator::new(health, cache, capability_cache)
    }

    #[tokio::test]
    async fn run_rejects_unqualified_tool_id() {
        let orch = orchestrator();
        let err = orch.run("not-qualified", None).await.unwrap_err();
        assert!(matches!(err, NcpError::NotFound(_)));
    }

    #[tokio::test]
    async fn run_rejects_unknown_endpoint() {
        let orch = orchestrator();
        let err = orch.run("ghost:tool", None).await.unwrap_err();
        assert!(matches!(err, NcpError::NotFound(_)));
    }

    #[tokio::test]
    async fn find_on_empty_index_returns_empty() {
        let orch = orchestrator();
        let results = orch.find("anything", 5, false).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn reset_endpoint_clears_disabled_state() {
        let orch = orchestrator();
        for _ in 0..3 {
            orch.health
                .mark_failure("ep", "boom", Some(crate::error::FailureClass::Fatal))
                .await;
        }
        assert!(orch.health.is_disabled("ep").await);
        orch.reset_endpoint("ep").await;
        assert!(!orch.health.is_disabled("ep").await);
    }

    #[tokio::test]
    async fn capability_snapshot_is_none_before_any_attach() {
        let orch = orchestrator();
        assert!(orch.capability_snapshot("ep").await.is_none());
    }

    #[tokio::test]
    async fn list_resources_and_prompts_are_empty_before_any_attach() {
        let orch = orchestrator();
        assert!(orch.list_resources().await.is_empty());
        assert!(orch.list_prompts().await.is_empty());
    }
}
