// src/cache.rs
//! Process-wide TTL cache shared by every broker-facing operation.
//!
//! Values are kept as serialized JSON text. Every user shares one namespace,
//! so callers build keys with [`cache_key`] and always include the user id or
//! the instrument id.

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct CacheEntry {
    text: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
pub struct Cache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

/// Joins a namespace and its parameters into a cache key, e.g.
/// `holdings:user-42`.
pub fn cache_key(namespace: &str, parts: &[&str]) -> String {
    let mut key = namespace.to_string();
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored value, parsed as JSON when possible and as a plain
    /// string otherwise. Expired entries read as absent.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().await;
        let entry = entries.get(key).filter(|e| e.is_fresh(Instant::now()))?;
        match serde_json::from_str(&entry.text) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(entry.text.clone())),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_secs: u64) {
        match serde_json::to_string(value) {
            Ok(text) => self.set_raw(key, text, ttl_secs).await,
            Err(e) => warn!("Skipping cache write for {}: {}", key, e),
        }
    }

    pub async fn set_raw(&self, key: &str, text: String, ttl_secs: u64) {
        let entry = CacheEntry {
            text,
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    pub async fn del(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Purged {} expired cache entries", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
