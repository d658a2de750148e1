use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// Key/value store with per-key TTL.
///
/// Every component takes this seam instead of reaching for a process-global
/// cache, so tests can substitute an in-memory fake. Implementations must
/// swallow backend failures: a failed read is a miss and a failed write is
/// dropped, both at worst forcing a synchronous refresh upstream.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl: Duration);
    async fn delete(&self, key: &str);
}

struct Entry {
    value: Value,
    deadline: Instant,
}

/// In-process cache used in tests and single-node deployments.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(e) if Instant::now() < e.deadline => Some(e.value.clone()),
            _ => None,
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                deadline: Instant::now() + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }
}
