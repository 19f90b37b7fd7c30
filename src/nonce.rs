//! Single-use nonces gating signed admin actions.
//!
//! An admin lists pending refunds by signing `list-pending-refunds:<nonce>`;
//! the nonce is consumed on first successful use, so a captured request
//! cannot be replayed. Consumption is atomic under the map's shard lock.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, NotFoundKind};
use crate::timestamp::UnixTimestamp;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NonceId(pub String);

impl NonceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NonceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Nonce {
    pub id: NonceId,
    pub purpose: String,
    pub created_at: UnixTimestamp,
    pub expires_at: UnixTimestamp,
}

#[derive(Debug, Clone)]
struct NonceSlot {
    nonce: Nonce,
    used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConsumeError {
    #[error("nonce not found")]
    NotFound,
    #[error("nonce expired")]
    Expired,
    #[error("nonce already used")]
    AlreadyUsed,
}

impl From<ConsumeError> for GatewayError {
    fn from(value: ConsumeError) -> Self {
        match value {
            ConsumeError::NotFound => GatewayError::not_found(NotFoundKind::Nonce, "unknown"),
            ConsumeError::Expired => GatewayError::NonceExpired,
            ConsumeError::AlreadyUsed => GatewayError::NonceAlreadyUsed,
        }
    }
}

/// In-process nonce store with per-entry TTL.
#[derive(Debug)]
pub struct NonceStore {
    slots: DashMap<NonceId, NonceSlot>,
    ttl_seconds: u64,
}

impl NonceStore {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            slots: DashMap::new(),
            ttl_seconds,
        }
    }

    pub fn mint(&self, purpose: &str, now: UnixTimestamp) -> Nonce {
        let nonce = Nonce {
            id: NonceId(Uuid::new_v4().simple().to_string()),
            purpose: purpose.to_string(),
            created_at: now,
            expires_at: now + self.ttl_seconds,
        };
        self.slots.insert(
            nonce.id.clone(),
            NonceSlot {
                nonce: nonce.clone(),
                used: false,
            },
        );
        nonce
    }

    /// Marks a nonce as used. Exactly one caller can succeed; the entry
    /// stays behind (until swept) so replays report `AlreadyUsed` rather
    /// than `NotFound`.
    pub fn consume(&self, id: &NonceId, now: UnixTimestamp) -> Result<(), ConsumeError> {
        match self.slots.entry(id.clone()) {
            Entry::Vacant(_) => Err(ConsumeError::NotFound),
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.used {
                    return Err(ConsumeError::AlreadyUsed);
                }
                if slot.nonce.expires_at.is_expired_at(now) {
                    return Err(ConsumeError::Expired);
                }
                slot.used = true;
                Ok(())
            }
        }
    }

    /// Drops entries past expiry, used or not.
    pub fn sweep(&self, now: UnixTimestamp) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !slot.nonce.expires_at.is_expired_at(now));
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_consume_once() {
        let store = NonceStore::new(300);
        let nonce = store.mint("list-pending-refunds", UnixTimestamp(0));
        assert!(store.consume(&nonce.id, UnixTimestamp(10)).is_ok());
        assert_eq!(
            store.consume(&nonce.id, UnixTimestamp(11)),
            Err(ConsumeError::AlreadyUsed)
        );
    }

    #[test]
    fn unknown_nonce() {
        let store = NonceStore::new(300);
        assert_eq!(
            store.consume(&NonceId("missing".to_string()), UnixTimestamp(0)),
            Err(ConsumeError::NotFound)
        );
    }

    #[test]
    fn expiry_boundary() {
        let store = NonceStore::new(300);
        let nonce = store.mint("x", UnixTimestamp(0));
        assert_eq!(
            store.consume(&nonce.id, UnixTimestamp(300)),
            Err(ConsumeError::Expired)
        );
    }

    #[test]
    fn sweep_drops_expired() {
        let store = NonceStore::new(300);
        let _old = store.mint("x", UnixTimestamp(0));
        let fresh = store.mint("y", UnixTimestamp(200));
        assert_eq!(store.sweep(UnixTimestamp(300)), 1);
        assert!(store.consume(&fresh.id, UnixTimestamp(301)).is_ok());
    }

    #[test]
    fn concurrent_consume_admits_exactly_one() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = Arc::new(NonceStore::new(300));
        let nonce = store.mint("x", UnixTimestamp(0));
        let wins = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let wins = Arc::clone(&wins);
            let id = nonce.id.clone();
            handles.push(std::thread::spawn(move || {
                if store.consume(&id, UnixTimestamp(1)).is_ok() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
