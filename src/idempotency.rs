//! Response cache for idempotent retries of mutating endpoints.
//!
//! Keys are scoped as `method:path:client_key`, so a key reused across
//! endpoints cannot replay a foreign response. Only 2xx responses are
//! cached. The map and the LRU order live under one lock, and eviction
//! happens before insertion under that same lock - the capacity invariant
//! holds even with concurrent writers racing on a full cache.
//!
//! Expiry is enforced twice: lazily on read, and by a background sweeper
//! that runs every few minutes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::timestamp::UnixTimestamp;

/// Marker header appended to replayed responses.
pub const REPLAYED_HEADER: &str = "idempotency-replayed";

/// A cached response: status, selected headers, raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Entry {
    response: StoredResponse,
    cached_at: UnixTimestamp,
    expires_at: UnixTimestamp,
}

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<String, Entry>,
    /// Least-recently-used keys at the front.
    order: VecDeque<String>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
        }
        self.order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.map.remove(key);
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
        }
    }
}

/// Bounded LRU+TTL store of idempotent responses.
#[derive(Debug)]
pub struct IdempotencyStore {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl_seconds: u64,
}

/// Builds the scoped cache key for one request.
pub fn scoped_key(method: &str, path: &str, client_key: &str) -> String {
    format!("{method}:{path}:{client_key}")
}

impl IdempotencyStore {
    pub fn new(capacity: usize, ttl_seconds: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl_seconds,
        }
    }

    /// Looks up a cached response, dropping it when past expiry.
    pub fn get(&self, key: &str, now: UnixTimestamp) -> Option<StoredResponse> {
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        let entry = inner.map.get(key)?.clone();
        if entry.expires_at.is_expired_at(now) {
            inner.remove(key);
            return None;
        }
        inner.touch(key);
        Some(entry.response)
    }

    /// Caches a response under `key`. Non-2xx responses are ignored.
    ///
    /// When the cache is full the least-recently-used entry is evicted
    /// first, inside the same critical section as the insert.
    pub fn insert(&self, key: &str, response: StoredResponse, now: UnixTimestamp) {
        if !(200..300).contains(&response.status) {
            return;
        }
        let entry = Entry {
            response,
            cached_at: now,
            expires_at: now + self.ttl_seconds,
        };
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        if !inner.map.contains_key(key) {
            while inner.map.len() >= self.capacity {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.map.remove(&oldest);
            }
        }
        inner.map.insert(key.to_string(), entry);
        inner.touch(key);
    }

    /// Removes all entries past expiry.
    pub fn sweep(&self, now: UnixTimestamp) -> usize {
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, e)| e.expires_at.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("idempotency lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of an entry, for diagnostics.
    pub fn cached_at(&self, key: &str) -> Option<UnixTimestamp> {
        let inner = self.inner.lock().expect("idempotency lock poisoned");
        inner.map.get(key).map(|e| e.cached_at)
    }
}

/// Background sweeper loop; exits when `cancel` fires.
pub async fn run_sweeper(
    store: std::sync::Arc<IdempotencyStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Ok(now) = UnixTimestamp::try_now() else {
                    continue;
                };
                let removed = store.sweep(now);
                if removed > 0 {
                    tracing::debug!(removed, "idempotency sweep");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn response(status: u16, body: &str) -> StoredResponse {
        StoredResponse {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn hit_within_ttl_replays() {
        let store = IdempotencyStore::new(8, 60);
        let key = scoped_key("POST", "/cart/checkout", "abc");
        store.insert(&key, response(200, "ok"), UnixTimestamp(0));
        let replay = store.get(&key, UnixTimestamp(59)).unwrap();
        assert_eq!(replay.status, 200);
        assert_eq!(replay.body, b"ok");
    }

    #[test]
    fn expired_entry_is_dropped_on_read() {
        let store = IdempotencyStore::new(8, 60);
        let key = scoped_key("POST", "/cart/checkout", "abc");
        store.insert(&key, response(200, "ok"), UnixTimestamp(0));
        assert!(store.get(&key, UnixTimestamp(60)).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn non_2xx_not_cached() {
        let store = IdempotencyStore::new(8, 60);
        store.insert("k", response(402, "nope"), UnixTimestamp(0));
        assert!(store.is_empty());
    }

    #[test]
    fn scoped_keys_do_not_collide() {
        let store = IdempotencyStore::new(8, 60);
        let a = scoped_key("POST", "/cart/checkout", "same");
        let b = scoped_key("POST", "/card-session", "same");
        store.insert(&a, response(200, "cart"), UnixTimestamp(0));
        store.insert(&b, response(200, "session"), UnixTimestamp(0));
        assert_eq!(store.get(&a, UnixTimestamp(1)).unwrap().body, b"cart");
        assert_eq!(store.get(&b, UnixTimestamp(1)).unwrap().body, b"session");
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let store = IdempotencyStore::new(2, 60);
        store.insert("a", response(200, "a"), UnixTimestamp(0));
        store.insert("b", response(200, "b"), UnixTimestamp(1));
        // touch "a" so "b" becomes the LRU victim
        store.get("a", UnixTimestamp(2));
        store.insert("c", response(200, "c"), UnixTimestamp(3));
        assert!(store.get("b", UnixTimestamp(4)).is_none());
        assert!(store.get("a", UnixTimestamp(4)).is_some());
        assert!(store.get("c", UnixTimestamp(4)).is_some());
    }

    #[test]
    fn capacity_never_exceeded_under_concurrent_writers() {
        let store = Arc::new(IdempotencyStore::new(16, 600));
        let mut handles = Vec::new();
        for t in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("k{t}-{i}");
                    store.insert(&key, response(200, "x"), UnixTimestamp(i));
                    assert!(store.len() <= 16);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(store.len() <= 16);
    }

    #[test]
    fn overwrite_same_key_does_not_evict_neighbor() {
        let store = IdempotencyStore::new(2, 60);
        store.insert("a", response(200, "a1"), UnixTimestamp(0));
        store.insert("b", response(200, "b"), UnixTimestamp(0));
        store.insert("a", response(200, "a2"), UnixTimestamp(1));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a", UnixTimestamp(2)).unwrap().body, b"a2");
        assert!(store.get("b", UnixTimestamp(2)).is_some());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = IdempotencyStore::new(8, 60);
        store.insert("old", response(200, "old"), UnixTimestamp(0));
        store.insert("new", response(200, "new"), UnixTimestamp(30));
        assert_eq!(store.sweep(UnixTimestamp(60)), 1);
        assert!(store.get("new", UnixTimestamp(61)).is_some());
    }
}
