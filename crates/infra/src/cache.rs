//! Query result cache port and its in-memory implementation.
//!
//! Cached values are stored as JSON; the query dispatcher serializes a
//! handler's output on the way in and deserializes it on the way out.
//!
//! The port makes no single-flight promise: concurrent misses on the same key
//! may each run their computation, and the last write wins.

use core::any::type_name;
use core::future::Future;
use core::pin::Pin;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use meridian_events::{CachePolicy, Query};

use crate::error::DispatchError;

/// Deferred computation of a cache miss.
pub type ComputeFuture<'a> = Pin<Box<dyn Future<Output = Result<JsonValue, DispatchError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache value (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Cache backend.
///
/// A failing computation is returned unchanged and nothing is stored.
#[async_trait]
pub trait CachePort: Send + Sync {
    async fn get_or_create<'a>(
        &self,
        key: &str,
        policy: &CachePolicy,
        compute: ComputeFuture<'a>,
    ) -> Result<JsonValue, DispatchError>;
}

/// Cache key of `query`: the policy's explicit key, or the query type name
/// followed by the query's canonical JSON.
pub fn cache_key<Q: Query>(query: &Q, policy: &CachePolicy) -> Result<String, CacheError> {
    if let Some(key) = &policy.key {
        return Ok(key.clone());
    }
    // `Value` keeps object keys sorted, so map-typed fields render deterministically.
    let content = serde_json::to_value(query)?;
    Ok(format!("{}:{}", type_name::<Q>(), content))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct CacheEntry {
    value: JsonValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Process-local cache honoring `CachePolicy::ttl`.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &str) -> Option<JsonValue> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries().len(),
        }
    }
}

#[async_trait]
impl CachePort for InMemoryCache {
    async fn get_or_create<'a>(
        &self,
        key: &str,
        policy: &CachePolicy,
        compute: ComputeFuture<'a>,
    ) -> Result<JsonValue, DispatchError> {
        if let Some(value) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache hit");
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "cache miss");

        let value = compute.await?;
        let entry = CacheEntry {
            value: value.clone(),
            expires_at: policy.ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries().insert(key.to_string(), entry);
        Ok(value)
    }
}
