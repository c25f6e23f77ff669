//! Capability cache: `endpoint_name -> CapabilitySnapshot`, keyed by the
//! endpoint's config hash so a restart can skip re-querying a downstream
//! whose configuration hasn't changed (spec §6). Same
//! `ConfigProvider`-backed, atomic-rename persistence idiom as
//! `health.rs` and `embedding.rs`.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config_provider::{write_atomic, ConfigProvider};
use crate::model::CapabilitySnapshot;

#[derive(Default, Serialize, Deserialize)]
struct PersistedCache(HashMap<String, CapabilitySnapshot>);

pub struct CapabilityCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, CapabilitySnapshot>>,
}

impl CapabilityCache {
    pub fn path_for(cp: &dyn ConfigProvider) -> PathBuf {
        cp.base_dir().join("capability_cache.json")
    }

    pub fn load(cp: &dyn ConfigProvider) -> Self {
        let path = Self::path_for(cp);
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<PersistedCache>(&s).ok())
            .map(|p| p.0)
            .unwrap_or_default();
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    /// Look up the cached snapshot only if it matches the endpoint's
    /// current config hash; a mismatch means the endpoint changed since the
    /// snapshot was taken and the caller must re-query it.
    pub async fn get_if_current(&self, endpoint_name: &str, config_hash: &str) -> Option<CapabilitySnapshot> {
        let entries = self.entries.read().await;
        entries
            .get(endpoint_name)
            .filter(|snap| snap.hash == config_hash)
            .cloned()
    }

    /// Unconditional lookup, regardless of whether the config hash is still
    /// current — used to serve `list_resources`/`list_prompts`/
    /// `capability_snapshot` off the most recent attach.
    pub async fn get(&self, endpoint_name: &str) -> Option<CapabilitySnapshot> {
        self.entries.read().await.get(endpoint_name).cloned()
    }

    pub async fn put(&self, endpoint_name: &str, snapshot: CapabilitySnapshot) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(endpoint_name.to_string(), snapshot);
        let content = serde_json::to_vec_pretty(&PersistedCache(entries.clone()))
            .context("serializing capability cache")?;
        drop(entries);
        write_atomic(&self.path, &content)
            .with_context(|| format!("writing capability cache to {:?}", self.path))
    }

    pub async fn remove(&self, endpoint_name: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(endpoint_name);
    }
}
