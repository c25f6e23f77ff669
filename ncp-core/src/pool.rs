//! Connection Pool, spec §4.5. Grounded on `src-tauri/src/client.rs`'s
//! `client_registry`/`ensure_rmcp_client`/`remove_rmcp_client`/
//! `shutdown_all_clients`, but instance-owned (`HashMap<String,
//! Mutex<ConnectionSlot>>`) instead of the teacher's `OnceLock` global, per
//! spec §9.
//!
//! "Concurrent callers await the same attach" is implemented by holding the
//! per-endpoint `tokio::sync::Mutex` for the full duration of the connect
//! attempt: the first caller to acquire it drives the connect, every other
//! caller's `lock().await` simply resolves once that attempt finishes and
//! observes the resulting state, rather than racing a second connect. This
//! gets the teacher's "single in-flight attach" behavior without a second
//! broadcast/shared-future mechanism.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::NcpError;
use crate::model::{ConnectionState, Endpoint};
use crate::oauth::OAuthTokenCache;
use crate::transport::{connect, sse_backoff, McpTransport};
use crate::validator::{validate_command, ValidationOutcome};

/// How the Pool turns an `Endpoint` into a live transport. The production
/// path (`RmcpConnector`) wraps `transport::connect`; tests substitute a
/// connector that hands back a `MockTransport` so Pool/Orchestrator
/// behavior is exercisable without a live subprocess, grounded on the
/// teacher's hand-rolled `MockTransport` test double in
/// `transport/intercepting.rs`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn McpTransport>>;
}

/// Resolves `Auth::OAuth` endpoints to a bearer token before delegating to
/// `transport::connect`; every other `Auth` variant passes straight through
/// and is handled by `build_http_client` as before.
#[derive(Default)]
pub struct RmcpConnector {
    oauth: OAuthTokenCache,
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn McpTransport>> {
        let bearer = self.oauth.bearer_token(&endpoint.name, &endpoint.auth).await?;
        let transport = connect(endpoint, bearer.as_deref()).await?;
        Ok(Arc::new(transport))
    }
}

/// Callback surface the Pool uses to notify the outside world, spec §9:
/// "narrow callback interface, no back-reference to the Orchestrator."
#[async_trait]
pub trait PoolEvents: Send + Sync {
    async fn on_capability_change(&self, endpoint_name: &str);
    async fn on_health_event(&self, endpoint_name: &str, error: &NcpError);
}

/// A `PoolEvents` that does nothing, for callers (and most tests) that
/// don't care about notifications.
pub struct NoopPoolEvents;

#[async_trait]
impl PoolEvents for NoopPoolEvents {
    async fn on_capability_change(&self, _endpoint_name: &str) {}
    async fn on_health_event(&self, _endpoint_name: &str, _error: &NcpError) {}
}

struct ConnectionSlot {
    state: ConnectionState,
    transport: Option<Arc<dyn McpTransport>>,
    last_used: Instant,
    attempt: u32,
    last_attempt_at: Option<Instant>,
}

impl Default for ConnectionSlot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            transport: None,
            last_used: Instant::now(),
            attempt: 0,
            last_attempt_at: None,
        }
    }
}

/// Idle duration after which a `Ready` connection is torn down to free
/// resources (spec §4.5's hibernation timer). The next `get_or_connect`
/// call simply reattaches.
pub const DEFAULT_IDLE_HIBERNATE: Duration = Duration::from_secs(5 * 60);

/// Attach timeout applied around every connect attempt, spec §4.5.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Pool {
    slots: Mutex<HashMap<String, Arc<Mutex<ConnectionSlot>>>>,
    idle_hibernate_after: Duration,
    events: Arc<dyn PoolEvents>,
    connector: Arc<dyn Connector>,
}

impl Pool {
    pub fn new(events: Arc<dyn PoolEvents>) -> Self {
        Self::with_connector(events, Arc::new(RmcpConnector::default()))
    }

    pub fn with_connector(events: Arc<dyn PoolEvents>, connector: Arc<dyn Connector>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle_hibernate_after: DEFAULT_IDLE_HIBERNATE,
            events,
            connector,
        }
    }

    pub fn with_idle_hibernate(events: Arc<dyn PoolEvents>, idle_hibernate_after: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle_hibernate_after,
            events,
            connector: Arc::new(RmcpConnector::default()),
        }
    }

    async fn slot_for(&self, name: &str) -> Arc<Mutex<ConnectionSlot>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConnectionSlot::default())))
            .clone()
    }

    /// Current lifecycle state, without triggering a connect.
    pub async fn state_of(&self, name: &str) -> ConnectionState {
        let slot = self.slot_for(name).await;
        let guard = slot.lock().await;
        guard.state
    }

    /// Return a ready transport for `endpoint`, connecting (or reconnecting
    /// after hibernation) if necessary. Validates stdio commands before ever
    /// spawning them (spec §4.2). Equivalent to
    /// `get_or_connect_cancellable` with a token that is never cancelled.
    pub async fn get_or_connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn McpTransport>, NcpError> {
        self.get_or_connect_cancellable(endpoint, &CancellationToken::new()).await
    }

    /// As `get_or_connect`, but the connect attempt is raced against
    /// `cancel` (spec §5). A cancelled attach returns the slot to `Idle`
    /// rather than `Failed` — cancellation is not itself a failure, and
    /// must not count toward the Health Monitor's disable threshold.
    pub async fn get_or_connect_cancellable(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn McpTransport>, NcpError> {
        if matches!(endpoint.transport_kind, crate::model::TransportKind::Stdio) {
            if let ValidationOutcome::Rejected(reason) = validate_command(&endpoint.command, &endpoint.args, &endpoint.env) {
                return Err(NcpError::CommandUnsafe(reason));
            }
        }

        let slot = self.slot_for(&endpoint.name).await;
        let mut guard = slot.lock().await;

        if let (ConnectionState::Ready, Some(t)) = (guard.state, guard.transport.clone()) {
            if guard.last_used.elapsed() < self.idle_hibernate_after {
                guard.last_used = Instant::now();
                return Ok(t);
            }
            let _ = t.close().await;
            guard.transport = None;
            guard.state = ConnectionState::Hibernated;
        }

        // A `Failed` slot is gated behind the backoff window for its attempt
        // count (spec §4.5): reattempts must not hammer a downstream that
        // just rejected us.
        if guard.state == ConnectionState::Failed {
            if let Some(last_attempt) = guard.last_attempt_at {
                let required = sse_backoff(guard.attempt.saturating_sub(1));
                if last_attempt.elapsed() < required {
                    return Err(NcpError::Unavailable(format!(
                        "endpoint '{}' is backing off after a failed attach",
                        endpoint.name
                    )));
                }
            }
        }

        guard.state = ConnectionState::Connecting;
        guard.last_attempt_at = Some(Instant::now());

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                guard.state = ConnectionState::Idle;
                return Err(NcpError::Cancelled);
            }
            outcome = tokio::time::timeout(DEFAULT_CONNECT_TIMEOUT, self.connector.connect(endpoint)) => {
                match outcome {
                    Ok(inner) => inner,
                    Err(_elapsed) => Err(anyhow::anyhow!("connect to '{}' timed out", endpoint.name)),
                }
            }
        };

        match result {
            Ok(transport) => {
                guard.state = ConnectionState::Ready;
                guard.transport = Some(transport.clone());
                guard.last_used = Instant::now();
                guard.attempt = 0;
                drop(guard);
                self.events.on_capability_change(&endpoint.name).await;
                Ok(transport)
            }
            Err(e) => {
                guard.state = ConnectionState::Failed;
                guard.attempt += 1;
                drop(guard);
                let classified = classify_connect_error(&e);
                self.events.on_health_event(&endpoint.name, &classified).await;
                Err(classified)
            }
        }
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let slot = self.slot_for(name).await;
        let mut guard = slot.lock().await;
        if let Some(t) = guard.transport.take() {
            t.close().await?;
        }
        guard.state = ConnectionState::Idle;
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        let slots = self.slots.lock().await;
        for slot in slots.values() {
            let mut guard = slot.lock().await;
            if let Some(t) = guard.transport.take() {
                let _ = t.close().await;
            }
            guard.state = ConnectionState::Idle;
        }
    }

    pub async fn endpoint_names(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }
}

fn classify_connect_error(e: &anyhow::Error) -> NcpError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("spawn") {
        NcpError::SpawnFailed(message)
    } else if lower.contains("auth") || lower.contains("401") || lower.contains("unauthorized") {
        NcpError::AuthFailed(message)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        NcpError::Timeout
    } else {
        NcpError::NetworkError(message)
    }
}

impl From<anyhow::Error> for NcpError {
    fn from(e: anyhow::Error) -> Self {
        classify_connect_error(&e)
    }
}
