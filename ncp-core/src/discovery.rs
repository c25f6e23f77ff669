//! Flat cosine-similarity search over tool descriptors, spec §4.4. Grounded
//! on `kotadb-kota-db/src/vector_index.rs` for the distance math, but a
//! brute-force scan rather than HNSW: the spec requires scoring every
//! descriptor on every query, and catalogs here are small enough that
//! approximate-neighbor indexing would be unneeded complexity.

use tokio::sync::RwLock;

use crate::model::ToolDescriptor;

#[derive(Debug, Clone)]
struct Entry {
    descriptor: ToolDescriptor,
    vector: Vec<f32>,
}

pub struct DiscoveryIndex {
    entries: RwLock<Vec<Entry>>,
}

impl Default for DiscoveryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Insert or replace the descriptor for `(endpoint_name, tool_name)`.
    /// The embedding is L2-normalized at insert so every similarity
    /// computation downstream is a plain dot product.
    pub async fn upsert(&self, descriptor: ToolDescriptor, embedding: Vec<f32>) {
        let vector = normalize(embedding);
        let key = (descriptor.endpoint_name.clone(), descriptor.tool_name.clone());
        let mut entries = self.entries.write().await;
        if let Some(slot) = entries
            .iter_mut()
            .find(|e| (e.descriptor.endpoint_name.clone(), e.descriptor.tool_name.clone()) == key)
        {
            slot.descriptor = descriptor;
            slot.vector = vector;
        } else {
            entries.push(Entry { descriptor, vector });
        }
    }

    /// Remove every descriptor belonging to `endpoint_name` — called when a
    /// downstream disconnects or is disabled (spec §4.7).
    pub async fn remove_endpoint(&self, endpoint_name: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.descriptor.endpoint_name != endpoint_name);
    }

    /// Atomically replace every descriptor belonging to `endpoint_name` with
    /// `new_entries`, under a single write lock. A refreshed capability
    /// snapshot that drops a tool must drop it from the index too — upserting
    /// the surviving descriptors one at a time would never purge the ones
    /// that disappeared between attaches.
    pub async fn replace_endpoint(&self, endpoint_name: &str, new_entries: Vec<(ToolDescriptor, Vec<f32>)>) {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.descriptor.endpoint_name != endpoint_name);
        for (descriptor, embedding) in new_entries {
            entries.push(Entry {
                descriptor,
                vector: normalize(embedding),
            });
        }
    }

    pub async fn remove(&self, endpoint_name: &str, tool_name: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|e| !(e.descriptor.endpoint_name == endpoint_name && e.descriptor.tool_name == tool_name));
    }

    /// Score every descriptor against `query_vector`, returning the top `k`
    /// by cosine similarity, highest first. Ties break deterministically by
    /// `(endpoint_name, tool_name)` so results are stable across runs.
    pub async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        include: impl Fn(&ToolDescriptor) -> bool,
    ) -> Vec<(ToolDescriptor, f32)> {
        let query = normalize(query_vector.to_vec());
        let entries = self.entries.read().await;
        let mut scored: Vec<(ToolDescriptor, f32)> = entries
            .iter()
            .filter(|e| include(&e.descriptor))
            .map(|e| (e.descriptor.clone(), cosine(&query, &e.vector)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.endpoint_name.cmp(&b.0.endpoint_name))
                .then_with(|| a.0.tool_name.cmp(&b.0.tool_name))
        });
        scored.truncate(k);
        scored
    }

    pub async fn stats(&self) -> DiscoveryStats {
        let entries = self.entries.read().await;
        DiscoveryStats {
            descriptor_count: entries.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub descriptor_count: usize,
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

/// Both vectors are assumed pre-normalized, so this is a plain dot product.
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(endpoint: &str, tool: &str) -> ToolDescriptor {
        ToolDescriptor {
            endpoint_name: endpoint.into(),
            tool_name: tool.into(),
            description: format!("{endpoint}/{tool}"),
            input_schema: serde_json::json!({"type": "object"}),
            embedding: None,
        }
    }

    #[tokio::test]
    async fn search_ranks_closer_vector_first() {
        let idx = DiscoveryIndex::new();
        idx.upsert(descriptor("fs", "read"), vec![1.0, 0.0, 0.0]).await;
        idx.upsert(descriptor("fs", "write"), vec![0.0, 1.0, 0.0]).await;

        let results = idx.search(&[0.9, 0.1, 0.0], 2, |_| true).await;
        assert_eq!(results[0].0.tool_name, "read");
        assert_eq!(results[1].0.tool_name, "write");
    }

    #[tokio::test]
    async fn search_respects_k() {
        let idx = DiscoveryIndex::new();
        idx.upsert(descriptor("fs", "read"), vec![1.0, 0.0]).await;
        idx.upsert(descriptor("fs", "write"), vec![0.0, 1.0]).await;
        idx.upsert(descriptor("fs", "list"), vec![0.7, 0.7]).await;

        let results = idx.search(&[1.0, 0.0], 1, |_| true).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.tool_name, "read");
    }

    #[tokio::test]
    async fn search_filter_excludes_endpoint() {
        let idx = DiscoveryIndex::new();
        idx.upsert(descriptor("fs", "read"), vec![1.0, 0.0]).await;
        idx.upsert(descriptor("disabled_ep", "read"), vec![1.0, 0.0]).await;

        let results = idx.search(&[1.0, 0.0], 5, |d| d.endpoint_name != "disabled_ep").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.endpoint_name, "fs");
    }

    #[tokio::test]
    async fn upsert_replaces_existing_entry() {
        let idx = DiscoveryIndex::new();
        idx.upsert(descriptor("fs", "read"), vec![1.0, 0.0]).await;
        idx.upsert(descriptor("fs", "read"), vec![0.0, 1.0]).await;
        assert_eq!(idx.stats().await.descriptor_count, 1);
        let results = idx.search(&[0.0, 1.0], 1, |_| true).await;
        assert!(results[0].1 > 0.9);
    }

    #[tokio::test]
    async fn remove_endpoint_drops_all_its_descriptors() {
        let idx = DiscoveryIndex::new();
        idx.upsert(descriptor("fs", "read"), vec![1.0, 0.0]).await;
        idx.upsert(descriptor("fs", "write"), vec![0.0, 1.0]).await;
        idx.upsert(descriptor("mail", "send"), vec![0.5, 0.5]).await;

        idx.remove_endpoint("fs").await;
        assert_eq!(idx.stats().await.descriptor_count, 1);
    }

    #[tokio::test]
    async fn replace_endpoint_drops_descriptors_missing_from_new_set() {
        let idx = DiscoveryIndex::new();
        idx.upsert(descriptor("fs", "read"), vec![1.0, 0.0]).await;
        idx.upsert(descriptor("fs", "write"), vec![0.0, 1.0]).await;
        idx.upsert(descriptor("mail", "send"), vec![0.5, 0.5]).await;

        idx.replace_endpoint("fs", vec![(descriptor("fs", "read"), vec![1.0, 0.0])]).await;

        assert_eq!(idx.stats().await.descriptor_count, 2);
        let results = idx.search(&[1.0, 0.0], 5, |d| d.endpoint_name == "fs").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.tool_name, "read");
    }

    #[tokio::test]
    async fn replace_endpoint_on_empty_set_clears_the_endpoint() {
        let idx = DiscoveryIndex::new();
        idx.upsert(descriptor("fs", "read"), vec![1.0, 0.0]).await;
        idx.replace_endpoint("fs", vec![]).await;
        assert_eq!(idx.stats().await.descriptor_count, 0);
    }

    #[tokio::test]
    async fn ties_break_deterministically_by_name() {
        let idx = DiscoveryIndex::new();
        idx.upsert(descriptor("b_ep", "tool"), vec![1.0, 0.0]).await;
        idx.upsert(descriptor("a_ep", "tool"), vec![1.0, 0.0]).await;

        let results = idx.search(&[1.0, 0.0], 2, |_| true).await;
        assert_eq!(results[0].0.endpoint_name, "a_ep");
        assert_eq!(results[1].0.endpoint_name, "b_ep");
    }
}
