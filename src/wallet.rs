//! Hot fee-payer wallets: selection, balance health, alerting.
//!
//! The pool holds a finite set of keypairs that sponsor native fees for
//! gasless payments. Selection is round-robin over healthy wallets, falling
//! back to the healthiest non-critical wallet when none qualifies. A
//! background monitor refreshes balances and emits at most one low-balance
//! alert per wallet per 24 hours, re-arming once the balance recovers.

use async_trait::async_trait;
use serde::Serialize;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signer::Signer;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::catalog::Rail;
use crate::error::GatewayError;
use crate::rail::chain::rpc::ChainRpc;
use crate::rail::{HealthProbe, HealthState, RailHealthReport};
use crate::timestamp::UnixTimestamp;

const ALERT_DEBOUNCE_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletClass {
    Healthy,
    Unhealthy,
    Critical,
}

/// Snapshot of one wallet for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WalletStatus {
    pub pubkey: String,
    pub class: WalletClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_lamports: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<UnixTimestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct WalletSlot {
    keypair: Arc<Keypair>,
    pubkey: Pubkey,
    balance: Option<u64>,
    checked_at: Option<UnixTimestamp>,
    last_error: Option<String>,
    alerted_at: Option<UnixTimestamp>,
}

struct PoolInner {
    wallets: Vec<WalletSlot>,
    cursor: usize,
}

pub struct FeePayerPool {
    inner: Mutex<PoolInner>,
    warn_threshold: u64,
    critical_threshold: u64,
}

impl FeePayerPool {
    pub fn new(keypairs: Vec<Keypair>, warn_threshold: u64, critical_threshold: u64) -> Self {
        let wallets = keypairs
            .into_iter()
            .map(|keypair| {
                let pubkey = keypair.pubkey();
                WalletSlot {
                    keypair: Arc::new(keypair),
                    pubkey,
                    balance: None,
                    checked_at: None,
                    last_error: None,
                    alerted_at: None,
                }
            })
            .collect();
        Self {
            inner: Mutex::new(PoolInner { wallets, cursor: 0 }),
            warn_threshold,
            critical_threshold,
        }
    }

    fn classify(&self, balance: Option<u64>) -> WalletClass {
        match balance {
            // An unchecked wallet is assumed usable until the monitor says
            // otherwise.
            None => WalletClass::Healthy,
            Some(balance) if balance >= self.warn_threshold => WalletClass::Healthy,
            Some(balance) if balance >= self.critical_threshold => WalletClass::Unhealthy,
            Some(_) => WalletClass::Critical,
        }
    }

    pub fn pubkeys(&self) -> Vec<Pubkey> {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner.wallets.iter().map(|w| w.pubkey).collect()
    }

    pub fn keypair_for(&self, pubkey: &Pubkey) -> Option<Arc<Keypair>> {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner
            .wallets
            .iter()
            .find(|w| w.pubkey == *pubkey)
            .map(|w| Arc::clone(&w.keypair))
    }

    /// Picks a fee payer: the hint when usable, else the first healthy
    /// wallet in round-robin order, else the healthiest non-critical one.
    pub fn select(&self, hint: Option<&str>) -> Result<Arc<Keypair>, GatewayError> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.wallets.is_empty() {
            return Err(GatewayError::Unsupported(
                "no fee payer wallets configured".to_string(),
            ));
        }

        if let Some(hint) = hint
            && let Some(slot) = inner.wallets.iter().find(|w| w.pubkey.to_string() == hint)
            && self.classify(slot.balance) != WalletClass::Critical
        {
            return Ok(Arc::clone(&slot.keypair));
        }

        let count = inner.wallets.len();
        for offset in 0..count {
            let index = (inner.cursor + offset) % count;
            if self.classify(inner.wallets[index].balance) == WalletClass::Healthy {
                inner.cursor = (index + 1) % count;
                return Ok(Arc::clone(&inner.wallets[index].keypair));
            }
        }

        let best = inner
            .wallets
            .iter()
            .filter(|w| self.classify(w.balance) != WalletClass::Critical)
            .max_by_key(|w| w.balance.unwrap_or(0))
            .map(|w| Arc::clone(&w.keypair));
        best.ok_or_else(|| {
            GatewayError::Internal("all fee payer wallets are critically low".to_string())
        })
    }

    /// Records a balance observation. Returns true when a low-balance alert
    /// should fire (at most once per wallet per 24 h; the debounce re-arms
    /// once the balance is back above the warn threshold).
    pub fn record_balance(&self, pubkey: &Pubkey, balance: u64, now: UnixTimestamp) -> bool {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let Some(slot) = inner.wallets.iter_mut().find(|w| w.pubkey == *pubkey) else {
            return false;
        };
        slot.balance = Some(balance);
        slot.checked_at = Some(now);
        slot.last_error = None;
        if balance >= self.warn_threshold {
            slot.alerted_at = None;
            return false;
        }
        let due = match slot.alerted_at {
            None => true,
            Some(last) => now.seconds_since_epoch() - last.seconds_since_epoch()
                >= ALERT_DEBOUNCE_SECONDS,
        };
        if due {
            slot.alerted_at = Some(now);
        }
        due
    }

    pub fn record_error(&self, pubkey: &Pubkey, error: String, now: UnixTimestamp) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if let Some(slot) = inner.wallets.iter_mut().find(|w| w.pubkey == *pubkey) {
            slot.last_error = Some(error);
            slot.checked_at = Some(now);
        }
    }

    pub fn statuses(&self) -> Vec<WalletStatus> {
        let inner = self.inner.lock().expect("pool lock poisoned");
        inner
            .wallets
            .iter()
            .map(|w| WalletStatus {
                pubkey: w.pubkey.to_string(),
                class: self.classify(w.balance),
                balance_lamports: w.balance,
                checked_at: w.checked_at,
                last_error: w.last_error.clone(),
            })
            .collect()
    }

    pub fn any_critical(&self) -> bool {
        self.statuses()
            .iter()
            .any(|s| s.class == WalletClass::Critical)
    }
}

/// Balance monitor loop. Stops when `cancel` fires.
pub async fn run_wallet_monitor(
    pool: Arc<FeePayerPool>,
    rpc: Arc<dyn ChainRpc>,
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
                for pubkey in pool.pubkeys() {
                    match rpc.get_balance(&pubkey).await {
                        Ok(balance) => {
                            if pool.record_balance(&pubkey, balance, now) {
                                tracing::warn!(
                                    wallet = %pubkey,
                                    balance,
                                    "fee payer balance below warn threshold"
                                );
                            }
                        }
                        Err(error) => {
                            tracing::warn!(wallet = %pubkey, error = %error, "balance check failed");
                            pool.record_error(&pubkey, error.to_string(), now);
                        }
                    }
                }
            }
        }
    }
}

/// Chain-rail health: degraded when any wallet is critical or the RPC probe
/// fails.
pub struct ChainHealth {
    pool: Arc<FeePayerPool>,
    rpc: Arc<dyn ChainRpc>,
}

impl ChainHealth {
    pub fn new(pool: Arc<FeePayerPool>, rpc: Arc<dyn ChainRpc>) -> Self {
        Self { pool, rpc }
    }
}

#[async_trait]
impl HealthProbe for ChainHealth {
    async fn health(&self) -> RailHealthReport {
        let rpc_ok = self.rpc.latest_blockhash().await.is_ok();
        let wallets = self.pool.statuses();
        let state = if rpc_ok && !self.pool.any_critical() {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        };
        RailHealthReport {
            rail: Rail::Chain,
            state,
            detail: Some(serde_json::json!({
                "rpc_reachable": rpc_ok,
                "wallets": wallets,
            })),
        }
    }
}
