//! Latest-blockhash cache with single-flight refresh.
//!
//! Gasless builds need a recent blockhash on every request; fetching one per
//! request would hammer the RPC for a value that is identical across
//! concurrent builds. The cache holds the last fetched hash for a short TTL.
//! A stale value is never served: expired readers queue on the refresh lock
//! and the first one through re-fetches for everyone.

use solana_message::Hash;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use super::rpc::{ChainRpc, ChainRpcError};

#[derive(Debug, Clone, Copy)]
struct CachedHash {
    hash: Hash,
    fetched_at: Instant,
}

pub struct BlockhashCache {
    slot: RwLock<Option<CachedHash>>,
    /// Serializes refreshes so an expired cache triggers one RPC call, not a
    /// thundering herd.
    refresh: Mutex<()>,
    ttl: Duration,
}

impl BlockhashCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: RwLock::new(None),
            refresh: Mutex::new(()),
            ttl,
        }
    }

    fn fresh(&self, cached: &Option<CachedHash>) -> Option<Hash> {
        cached
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.hash)
    }

    /// Returns a blockhash no older than the TTL, refreshing if needed.
    pub async fn get(&self, rpc: &dyn ChainRpc) -> Result<Hash, ChainRpcError> {
        if let Some(hash) = self.fresh(&*self.slot.read().await) {
            return Ok(hash);
        }
        let _refresh_guard = self.refresh.lock().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(hash) = self.fresh(&*self.slot.read().await) {
            return Ok(hash);
        }
        let hash = rpc.latest_blockhash().await?;
        *self.slot.write().await = Some(CachedHash {
            hash,
            fetched_at: Instant::now(),
        });
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rail::chain::test_support::MockRpc;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn fresh_hash_is_served_from_cache() {
        let rpc = MockRpc::new();
        let cache = BlockhashCache::new(Duration::from_secs(1));
        let first = cache.get(&rpc).await.unwrap();
        let second = cache.get(&rpc).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(rpc.blockhash_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_hash_is_refetched() {
        let rpc = MockRpc::new();
        let cache = BlockhashCache::new(Duration::from_millis(10));
        cache.get(&rpc).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.get(&rpc).await.unwrap();
        assert_eq!(rpc.blockhash_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_refresh_once() {
        let rpc = Arc::new(MockRpc::new());
        let cache = Arc::new(BlockhashCache::new(Duration::from_secs(5)));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let rpc = Arc::clone(&rpc);
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache.get(rpc.as_ref()).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(rpc.blockhash_calls.load(Ordering::SeqCst), 1);
    }
}
