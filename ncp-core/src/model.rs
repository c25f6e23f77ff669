use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Transport variant a configured downstream speaks. Named `transport_kind`
/// in spec §3; kept as a simple tag plus per-variant params on `Endpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

/// OAuth refresh bookkeeping. Held only in memory per spec §3 — never
/// serialized to the profile or any cache file.
#[derive(Debug, Clone, Default)]
pub struct OAuthRefreshState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<SystemTime>,
}

/// Tagged auth variant, spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Auth {
    None,
    Bearer {
        token: String,
    },
    Basic {
        user: String,
        pass: String,
    },
    OAuth {
        client_id: String,
        client_secret: Option<String>,
        device_url: String,
        token_url: String,
        scopes: Vec<String>,
        #[serde(skip)]
        refresh_state: Option<OAuthRefreshState>,
    },
}

impl Default for Auth {
    fn default() -> Self {
        Auth::None
    }
}

/// A configured downstream. Created at profile load, never mutated in
/// place — reconfiguration is "replace the Endpoint", per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub transport_kind: TransportKind,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub auth: Auth,
    pub enabled: bool,
}

impl Endpoint {
    /// A hash of everything that would change what's on the wire for this
    /// endpoint, used as the capability-cache key (spec §6).
    pub fn config_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.command.as_bytes());
        for a in &self.args {
            hasher.update(a.as_bytes());
        }
        hasher.update(self.url.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A named unit advertised by a downstream: tool, resource, or prompt.
/// `ToolDescriptor` is the only variant with execution semantics; resources
/// and prompts are passthrough-only per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub endpoint_name: String,
    pub tool_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl ToolDescriptor {
    /// `endpoint_name:tool_name`, per spec §4.6.
    pub fn qualified_id(&self) -> String {
        format!("{}:{}", self.endpoint_name, self.tool_name)
    }

    /// Key used to decide whether a cached embedding is still valid — spec
    /// §4.4: "(endpoint_name, tool_name, description, schema_hash)".
    pub fn embedding_cache_key(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.endpoint_name.as_bytes());
        hasher.update(self.tool_name.as_bytes());
        hasher.update(self.description.as_bytes());
        hasher.update(self.input_schema.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDescriptor {
    pub endpoint_name: String,
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptDescriptor {
    pub endpoint_name: String,
    pub prompt_name: String,
    pub description: Option<String>,
}

/// Snapshot of what a downstream advertised at attach time, plus the hash
/// used as a restart-skip cache key (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapabilitySnapshot {
    pub hash: String,
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    pub embedded_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Health status lattice, spec §3/§4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
    Unknown,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

/// Per-endpoint error bookkeeping, spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub rolling_error_count: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_success_at: Option<chrono::DateTime<chrono::Utc>>,
    pub consecutive_failures: u32,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            rolling_error_count: 0,
            last_error: None,
            last_error_at: None,
            last_success_at: None,
            consecutive_failures: 0,
        }
    }
}

/// Connection lifecycle state, spec §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Hibernated,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_id_joins_with_colon() {
        let d = ToolDescriptor {
            endpoint_name: "echo".into(),
            tool_name: "say".into(),
            description: "says things".into(),
            input_schema: serde_json::json!({"type": "object"}),
            embedding: None,
        };
        assert_eq!(d.qualified_id(), "echo:say");
    }

    #[test]
    fn embedding_cache_key_changes_with_schema() {
        let mut d = ToolDescriptor {
            endpoint_name: "echo".into(),
            tool_name: "say".into(),
            description: "says things".into(),
            input_schema: serde_json::json!({"type": "object"}),
            embedding: None,
        };
        let k1 = d.embedding_cache_key();
        d.input_schema = serde_json::json!({"type": "string"});
        let k2 = d.embedding_cache_key();
        assert_ne!(k1, k2);
    }

    #[test]
    fn config_hash_is_stable_for_identical_endpoints() {
        let e = Endpoint {
            name: "echo".into(),
            transport_kind: TransportKind::Stdio,
            command: "echo".into(),
            args: vec!["hi".into()],
            env: Default::default(),
            url: String::new(),
            auth: Auth::None,
            enabled: true,
        };
        assert_eq!(e.config_hash(), e.clone().config_hash());
    }
}
