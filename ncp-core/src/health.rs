//! Per-endpoint health bookkeeping, spec §4.7. Grounded on the teacher's
//! `overlay.rs` (`entry_mut`/`set_*` helpers over a lock-guarded map) for
//! the in-memory shape, generalized to the status lattice and
//! transition rules the spec defines, and on `config.rs`'s
//! load/save-with-`ConfigProvider` pattern for persistence.
//!
//! Instance-owned rather than the teacher's `OnceLock` global, per spec §9's
//! "orchestrator instances must be independently constructible for tests" —
//! the persisted JSON file is the one piece of genuinely global state
//! (spec §9 names it explicitly), everything in memory here is owned by
//! whichever `HealthMonitor` is constructed.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config_provider::{write_atomic, ConfigProvider};
use crate::error::FailureClass;
use crate::model::{HealthRecord, HealthStatus};

/// Consecutive transient/fatal failures before an endpoint is auto-disabled.
/// Disabling is sticky: it survives until an operator explicitly resets it
/// (spec §4.7, "disabled persists across restarts").
const DISABLE_AFTER_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Default, Serialize, Deserialize)]
struct PersistedHealth(HashMap<String, HealthRecord>);

pub struct HealthMonitor {
    path: PathBuf,
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl HealthMonitor {
    pub fn path_for(cp: &dyn ConfigProvider) -> PathBuf {
        cp.base_dir().join("health_state.json")
    }

    /// Load the persisted health state. A missing or corrupt file yields an
    /// empty map — same "read failure is non-fatal" idiom as
    /// `load_settings_with`'s `unwrap_or_default`.
    pub fn load(cp: &dyn ConfigProvider) -> Self {
        let path = Self::path_for(cp);
        let records = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<PersistedHealth>(&s).ok())
            .map(|p| p.0)
            .unwrap_or_default();
        Self {
            path,
            records: Mutex::new(records),
        }
    }

    async fn persist(&self, records: &HashMap<String, HealthRecord>) -> Result<()> {
        let content = serde_json::to_vec_pretty(&PersistedHealth(records.clone()))
            .context("serializing health state")?;
        write_atomic(&self.path, &content)
            .with_context(|| format!("writing health state to {:?}", self.path))
    }

    pub async fn status(&self, endpoint_name: &str) -> HealthStatus {
        self.records
            .lock()
            .await
            .get(endpoint_name)
            .map(|r| r.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub async fn record(&self, endpoint_name: &str) -> HealthRecord {
        self.records
            .lock()
            .await
            .get(endpoint_name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn mark_success(&self, endpoint_name: &str) {
        let mut guard = self.records.lock().await;
        let entry = guard.entry(endpoint_name.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.last_success_at = Some(Utc::now());
        if entry.status != HealthStatus::Disabled {
            entry.status = HealthStatus::Healthy;
        }
        let snapshot = guard.clone();
        drop(guard);
        let _ = self.persist(&snapshot).await;
    }

    /// Record a failure and advance the status lattice. `class: None` (spec
    /// §7's `not_found`/`cancelled`) does not count toward disabling at all.
    /// Returns `true` the moment this call trips the endpoint into
    /// `Disabled`, so callers can reconcile dependent state (the discovery
    /// index) exactly once, on the transition.
    pub async fn mark_failure(&self, endpoint_name: &str, message: &str, class: Option<FailureClass>) -> bool {
        let mut guard = self.records.lock().await;
        let entry = guard.entry(endpoint_name.to_string()).or_default();
        entry.last_error = Some(message.to_string());
        entry.last_error_at = Some(Utc::now());
        let was_disabled = entry.status == HealthStatus::Disabled;

        if class.is_some() {
            entry.rolling_error_count += 1;
            entry.consecutive_failures += 1;
        }

        if entry.status != HealthStatus::Disabled {
            entry.status = match entry.consecutive_failures {
                0 => entry.status,
                1 => HealthStatus::Degraded,
                2 => HealthStatus::Unhealthy,
                n if n >= DISABLE_AFTER_CONSECUTIVE_FAILURES => HealthStatus::Disabled,
                _ => entry.status,
            };
        }
        let just_disabled = !was_disabled && entry.status == HealthStatus::Disabled;

        let snapshot = guard.clone();
        drop(guard);
        let _ = self.persist(&snapshot).await;
        just_disabled
    }

    /// Operator-initiated reset, spec §4.7: clears a sticky disabled state
    /// so the Pool will try the endpoint again.
    pub async fn reset(&self, endpoint_name: &str) {
        let mut guard = self.records.lock().await;
        guard.insert(endpoint_name.to_string(), HealthRecord::default());
        let snapshot = guard.clone();
        drop(guard);
        let _ = self.persist(&snapshot).await;
    }

    pub async fn is_disabled(&self, endpoint_name: &str) -> bool {
        self.status(endpoint_name).await == HealthStatus::Disabled
    }

    pub async fn all_healthy(&self) -> bool {
        self.records
            .lock()
            .await
            .values()
            .all(|r| matches!(r.status, HealthStatus::Healthy | HealthStatus::Unknown))
    }

    pub async fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.records.lock().await.clone()
    }
}
