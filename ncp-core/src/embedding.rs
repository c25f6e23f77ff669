//! Semantic embeddings for tool descriptors, grounded on kota-db's
//! `embeddings.rs` provider trait. Unlike kota-db, NCP ships only the
//! deterministic hash-based provider by default — it needs no model file
//! and is good enough to rank-order tool descriptions without a network
//! call, which matters since NCP runs embedded in a CLI tool's startup path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

use crate::config_provider::{write_atomic, ConfigProvider};

#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_texts(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| anyhow!("no embedding returned"))
    }

    fn dimension(&self) -> usize;
    fn model_name(&self) -> &str;
    fn max_batch_size(&self) -> usize;
}

/// Deterministic, model-free provider. Same technique as kota-db's
/// `LocalEmbeddingProvider` simulated embedding (hash the token position
/// into `[-0.5, 0.5)`), but seeded from the text's bytes so identical
/// descriptions always produce identical vectors, and semantically close
/// wording produces close-but-not-identical vectors via overlapping
/// token hashes.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    model_name: String,
    dimension: usize,
    max_batch_size: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            model_name: "ncp-hash-v1".to_string(),
            dimension,
            max_batch_size: 64,
        }
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self::new(256)
    }
}

fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut v = vec![0f32; dimension];
    if text.trim().is_empty() {
        return v;
    }
    for token in text.split_whitespace() {
        let mut hasher = Sha256::new();
        hasher.update(token.to_lowercase().as_bytes());
        let digest = hasher.finalize();
        for (i, slot) in v.iter_mut().enumerate() {
            let byte = digest[i % digest.len()];
            *slot += (byte as f32 / 255.0) - 0.5;
        }
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dimension)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// On-disk cache of `(provider_id, sha256(text)) -> embedding`, so restarts
/// don't re-embed an unchanged tool catalog. Persisted as little-endian f32
/// bytes behind an atomic rename, following `config.rs`'s
/// write-then-persist idiom upgraded to atomic per spec §6.
pub struct EmbeddingCache {
    path: PathBuf,
    entries: HashMap<String, Vec<f32>>,
}

fn cache_key(provider_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider_id.as_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl EmbeddingCache {
    pub fn path_for(cp: &dyn ConfigProvider) -> PathBuf {
        cp.base_dir().join("embedding_cache.bin")
    }

    /// Load the cache file if present; a missing or corrupt file yields an
    /// empty cache rather than an error (spec §6: cache rebuilds lazily).
    pub fn load(cp: &dyn ConfigProvider, dimension: usize) -> Self {
        let path = Self::path_for(cp);
        let entries = Self::read_entries(&path, dimension).unwrap_or_default();
        Self { path, entries }
    }

    fn read_entries(path: &Path, dimension: usize) -> Option<HashMap<String, Vec<f32>>> {
        let bytes = std::fs::read(path).ok()?;
        let mut entries = HashMap::new();
        let mut cursor = &bytes[..];
        while !cursor.is_empty() {
            if cursor.len() < 2 {
                break;
            }
            let key_len = u16::from_le_bytes([cursor[0], cursor[1]]) as usize;
            cursor = &cursor[2..];
            if cursor.len() < key_len {
                break;
            }
            let key = String::from_utf8(cursor[..key_len].to_vec()).ok()?;
            cursor = &cursor[key_len..];
            if cursor.len() < dimension * 4 {
                break;
            }
            let mut vec = Vec::with_capacity(dimension);
            for chunk in cursor[..dimension * 4].chunks_exact(4) {
                vec.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            cursor = &cursor[dimension * 4..];
            entries.insert(key, vec);
        }
        Some(entries)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, vec) in &self.entries {
            let key_bytes = key.as_bytes();
            out.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(key_bytes);
            for x in vec {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        out
    }

    pub fn get(&self, provider_id: &str, text: &str) -> Option<&Vec<f32>> {
        self.entries.get(&cache_key(provider_id, text))
    }

    pub fn put(&mut self, provider_id: &str, text: &str, embedding: Vec<f32>) {
        self.entries.insert(cache_key(provider_id, text), embedding);
    }

    pub fn flush(&self) -> Result<()> {
        write_atomic(&self.path, &self.serialize())
            .with_context(|| format!("writing embedding cache to {:?}", self.path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_provider::TempConfigProvider;

    #[tokio::test]
    async fn identical_text_yields_identical_vector() {
        let p = HashEmbeddingProvider::new(32);
        let a = p.embed_text("search the filesystem").await.unwrap();
        let b = p.embed_text("search the filesystem").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn different_text_yields_different_vector() {
        let p = HashEmbeddingProvider::new(32);
        let a = p.embed_text("search the filesystem").await.unwrap();
        let b = p.embed_text("send an email").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn empty_batch_returns_empty() {
        let p = HashEmbeddingProvider::new(32);
        let out = p.embed_texts(&[]).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let cp = TempConfigProvider::new();
        let mut cache = EmbeddingCache::load(&cp, 8);
        assert!(cache.is_empty());
        cache.put("hash-v1", "hello world", vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8]);
        cache.flush().unwrap();

        let reloaded = EmbeddingCache::load(&cp, 8);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(
            reloaded.get("hash-v1", "hello world").unwrap(),
            &vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8]
        );
    }

    #[test]
    fn missing_cache_file_loads_empty() {
        let cp = TempConfigProvider::new();
        let cache = EmbeddingCache::load(&cp, 16);
        assert!(cache.is_empty());
    }
}
