//! Semantic cache contract
//!
//! The cache itself is an external collaborator; the core only consumes
//! this lookup/store contract. Cache failures are never fatal: a lookup
//! error is a miss, a store error is logged and forgotten.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::TokenCounts;

/// Stored response entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub text: String,
    pub provider: String,
    pub confidence: f64,
    pub tokens: TokenCounts,
}

/// Result of a lookup. `similarity` is the cache's own score and is
/// recorded for auditing; threshold enforcement is the cache's job.
#[derive(Debug, Clone, Default)]
pub struct CacheLookup {
    pub hit: bool,
    pub entry: Option<CacheEntry>,
    pub similarity: Option<f64>,
}

#[derive(Debug, Error)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

/// Lookup/store contract consumed by the pipeline.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn lookup(
        &self,
        fingerprint: &[u8; 32],
        grounding_required: bool,
    ) -> Result<CacheLookup, CacheError>;

    /// Idempotent store.
    async fn store(&self, fingerprint: [u8; 32], entry: CacheEntry) -> Result<(), CacheError>;
}

/// Disabled cache: every lookup is a miss, every store a no-op.
pub struct NoopCache;

#[async_trait]
impl ResponseCache for NoopCache {
    async fn lookup(
        &self,
        _fingerprint: &[u8; 32],
        _grounding_required: bool,
    ) -> Result<CacheLookup, CacheError> {
        Ok(CacheLookup::default())
    }

    async fn store(&self, _fingerprint: [u8; 32], _entry: CacheEntry) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Exact-fingerprint in-memory cache for tests and dev mode. Grounded
/// requests never accept ungrounded entries, so entries are partitioned
/// by the grounding flag at store time via the fingerprint (the flag is
/// part of the fingerprint already).
pub struct MemoryCache {
    entries: DashMap<[u8; 32], CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn lookup(
        &self,
        fingerprint: &[u8; 32],
        _grounding_required: bool,
    ) -> Result<CacheLookup, CacheError> {
        match self.entries.get(fingerprint) {
            Some(entry) => Ok(CacheLookup {
                hit: true,
                entry: Some(entry.clone()),
                similarity: Some(1.0),
            }),
            None => Ok(CacheLookup::default()),
        }
    }

    async fn store(&self, fingerprint: [u8; 32], entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.insert(fingerprint, entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str) -> CacheEntry {
        CacheEntry {
            text: text.to_string(),
            provider: "fast-1".to_string(),
            confidence: 0.9,
            tokens: TokenCounts {
                prompt: 5,
                output: 10,
            },
        }
    }

    #[tokio::test]
    async fn store_then_lookup_hits_with_same_text() {
        let cache = MemoryCache::new();
        let fp = [7u8; 32];
        cache.store(fp, entry("cached answer")).await.unwrap();
        let lookup = cache.lookup(&fp, false).await.unwrap();
        assert!(lookup.hit);
        assert_eq!(lookup.entry.unwrap().text, "cached answer");
    }

    #[tokio::test]
    async fn store_is_idempotent() {
        let cache = MemoryCache::new();
        let fp = [1u8; 32];
        cache.store(fp, entry("a")).await.unwrap();
        cache.store(fp, entry("a")).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn miss_on_unknown_fingerprint() {
        let cache = MemoryCache::new();
        let lookup = cache.lookup(&[0u8; 32], false).await.unwrap();
        assert!(!lookup.hit);
        assert!(lookup.entry.is_none());
    }

    #[tokio::test]
    async fn noop_cache_never_hits() {
        let cache = NoopCache;
        cache.store([2u8; 32], entry("x")).await.unwrap();
        assert!(!cache.lookup(&[2u8; 32], false).await.unwrap().hit);
    }
}
