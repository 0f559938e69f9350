//! Accepted-SQL caching.
//!
//! Maps a normalized question plus the schema revision it was answered
//! against to the SQL the validator accepted. A hit lets the orchestrator
//! skip retrieval, synthesis and validation; execution still happens.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// A cached generation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSql {
    /// Accepted, normalized SQL.
    pub sql: String,
    /// Tables the context offered when the SQL was generated.
    pub relevant_tables: Vec<String>,
    /// Whether the full-schema fallback produced it.
    pub fallback_context: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedSql,
    cached_at: Instant,
}

/// Cache key: normalized question and schema revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub question: String,
    pub revision: u64,
}

impl CacheKey {
    pub fn new(question: &str, revision: u64) -> Self {
        Self {
            question: normalize_question(question),
            revision,
        }
    }
}

/// Lowercase with whitespace runs collapsed.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// TTL-bounded, size-bounded cache of accepted SQL.
#[derive(Debug, Clone)]
pub struct QueryCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    ttl: Duration,
    max_entries: usize,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl QueryCache {
    /// `max_entries == 0` disables caching.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            max_entries,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0 && !self.ttl.is_zero()
    }

    /// Cached SQL for `question` at `revision`, if present and fresh.
    pub async fn get(&self, question: &str, revision: u64) -> Option<CachedSql> {
        if !self.is_enabled() {
            return None;
        }
        let key = CacheKey::new(question, revision);
        let mut entries = self.entries.write().await;

        match entries.get(&key) {
            Some(entry) if entry.cached_at.elapsed() <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store accepted SQL. At capacity, expired entries go first, then the
    /// oldest one.
    pub async fn put(&self, question: &str, revision: u64, value: CachedSql) {
        if !self.is_enabled() {
            return;
        }
        let key = CacheKey::new(question, revision);
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, e| e.cached_at.elapsed() <= ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.cached_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop every entry.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Remove expired entries.
    pub async fn cleanup_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.cached_at.elapsed() <= ttl);
        before - entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let expired = entries
            .values()
            .filter(|e| e.cached_at.elapsed() > self.ttl)
            .count();
        CacheStats {
            total_entries: entries.len(),
            expired_entries: expired,
            valid_entries: entries.len() - expired,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub valid_entries: usize,
    pub hits: u64,
    pub misses: u64,
}
