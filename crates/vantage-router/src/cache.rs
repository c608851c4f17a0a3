//! Routed-response cache - avoid burning tokens on repeated requests.
//!
//! Keyed by a SHA-256 hash of the model-relevant parts of a routing request
//! (domain, task, constraints, token estimate). Entries expire after a
//! configurable TTL and the map is LRU-bounded by `max_entries`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use vantage_types::RoutingRequest;

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub output: Value,
    pub model_id: String,
    pub provider_id: String,
}

struct CacheEntry {
    response: CachedResponse,
    created_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    hit_count: u64,
}

pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl_secs: i64,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl_secs: i64, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl_secs,
            max_entries,
        }
    }

    /// Deterministic cache key over the fields that determine the response.
    /// Workspace and user are deliberately excluded: identical work is
    /// identical work regardless of who asks.
    pub fn cache_key(request: &RoutingRequest) -> String {
        let normalized = json!({
            "domain": request.domain,
            "task": request.task,
            "constraints": request.constraints,
            "estimated_tokens": request.estimated_tokens,
        });
        let mut hasher = Sha256::new();
        hasher.update(normalized.to_string().as_bytes());
        format!("{:064x}", hasher.finalize())
    }

    /// Look up a cached response. Returns `None` on miss or if the entry has
    /// expired; expired entries are dropped on the spot.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().await;
        let cutoff = Utc::now() - Duration::seconds(self.ttl_secs);
        match entries.get_mut(key) {
            Some(entry) if entry.created_at > cutoff => {
                entry.accessed_at = Utc::now();
                entry.hit_count += 1;
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a response, evicting expired then least-recently-used entries.
    pub async fn put(&self, key: &str, response: CachedResponse) {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        entries.insert(
            key.to_string(),
            CacheEntry {
                response,
                created_at: now,
                accessed_at: now,
                hit_count: 0,
            },
        );

        let cutoff = now - Duration::seconds(self.ttl_secs);
        entries.retain(|_, e| e.created_at > cutoff);

        while entries.len() > self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.accessed_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// `(total_entries, total_hits)`.
    pub async fn stats(&self) -> (usize, u64) {
        let entries = self.entries.lock().await;
        let hits = entries.values().map(|e| e.hit_count).sum();
        (entries.len(), hits)
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_types::{Domain, Priority, RoutingConstraints};

    fn request(task: &str) -> RoutingRequest {
        RoutingRequest {
            domain: Domain::Code,
            task: task.to_string(),
            priority: Priority::Normal,
            constraints: RoutingConstraints::default(),
            workspace_id: "ws".to_string(),
            user_id: "user".to_string(),
            estimated_tokens: None,
        }
    }

    fn response() -> CachedResponse {
        CachedResponse {
            output: json!({"text": "done"}),
            model_id: "m1".to_string(),
            provider_id: "p1".to_string(),
        }
    }

    #[test]
    fn cache_key_is_deterministic_and_task_sensitive() {
        let k1 = ResponseCache::cache_key(&request("explain"));
        let k2 = ResponseCache::cache_key(&request("explain"));
        let k3 = ResponseCache::cache_key(&request("summarize"));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn cache_key_ignores_workspace_and_user() {
        let mut a = request("explain");
        a.workspace_id = "ws-a".to_string();
        let mut b = request("explain");
        b.workspace_id = "ws-b".to_string();
        b.user_id = "someone-else".to_string();
        assert_eq!(ResponseCache::cache_key(&a), ResponseCache::cache_key(&b));
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let cache = ResponseCache::new(60, 100);
        let key = ResponseCache::cache_key(&request("explain"));
        cache.put(&key, response()).await;
        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.model_id, "m1");
        assert_eq!(hit.output, json!({"text": "done"}));
    }

    #[tokio::test]
    async fn expired_entry_returns_none() {
        let cache = ResponseCache::new(0, 100); // 0 TTL expires instantly
        let key = ResponseCache::cache_key(&request("explain"));
        cache.put(&key, response()).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn lru_eviction_respects_max_entries() {
        let cache = ResponseCache::new(60, 3);
        for i in 0..5 {
            let key = ResponseCache::cache_key(&request(&format!("task {i}")));
            cache.put(&key, response()).await;
        }
        let (count, _) = cache.stats().await;
        assert!(count <= 3, "cache must not exceed max_entries");
    }

    #[tokio::test]
    async fn stats_track_hits() {
        let cache = ResponseCache::new(60, 100);
        let key = ResponseCache::cache_key(&request("explain"));
        cache.put(&key, response()).await;
        for _ in 0..4 {
            let _ = cache.get(&key).await;
        }
        let (_, hits) = cache.stats().await;
        assert_eq!(hits, 4);
    }
}
