//! Gateway configuration.
//!
//! A JSON file selected by `--config` (env `CONFIG`) carries everything:
//! bind address, chain and card rail settings, catalog, coupons, API keys.
//! Secret-bearing fields accept `$VAR` / `${VAR}` indirection so the file
//! itself can be committed.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::api_key::Tier;
use crate::catalog::Resource;
use crate::coupon::Coupon;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "railgate")]
#[command(about = "Unified payment gateway HTTP server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// A value that is either a literal or an environment variable reference
/// (`$VAR` or `${VAR}`), resolved at deserialization time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if let Some(inner) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
            return Some(inner.to_string());
        }
        let var = s.strip_prefix('$')?;
        (!var.is_empty() && var.chars().all(|c| c.is_alphanumeric() || c == '_'))
            .then(|| var.to_string())
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = if let Some(var) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var).map_err(|_| {
                serde::de::Error::custom(format!(
                    "environment variable '{var}' not found (referenced as '{s}')"
                ))
            })?
        } else {
            s
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("failed to parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

impl<T: Serialize> Serialize for LiteralOrEnv<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: LiteralOrEnv<Url>,
    #[serde(default = "chain_defaults::network")]
    pub network: String,
    #[serde(default = "chain_defaults::commitment")]
    pub commitment: String,
    /// SPL mint all chain prices settle in.
    pub mint: String,
    #[serde(default = "chain_defaults::mint_decimals")]
    pub mint_decimals: u8,
    /// Recipient token account for resources without their own.
    pub default_pay_to: String,
    #[serde(default = "chain_defaults::quote_ttl_seconds")]
    pub quote_ttl_seconds: u64,
    #[serde(default = "chain_defaults::blockhash_ttl_ms")]
    pub blockhash_ttl_ms: u64,
    #[serde(default = "chain_defaults::compute_unit_limit")]
    pub compute_unit_limit: u32,
    #[serde(default = "chain_defaults::compute_unit_price")]
    pub compute_unit_price: u64,
    /// Base58-encoded fee payer keypairs (or env references to them).
    #[serde(default)]
    pub fee_payers: Vec<LiteralOrEnv<String>>,
    #[serde(default = "chain_defaults::wallet_warn_lamports")]
    pub wallet_warn_lamports: u64,
    #[serde(default = "chain_defaults::wallet_critical_lamports")]
    pub wallet_critical_lamports: u64,
    #[serde(default = "chain_defaults::wallet_monitor_interval_seconds")]
    pub wallet_monitor_interval_seconds: u64,
}

mod chain_defaults {
    pub fn network() -> String {
        "solana".to_string()
    }
    pub fn commitment() -> String {
        "confirmed".to_string()
    }
    pub fn mint_decimals() -> u8 {
        6
    }
    pub fn quote_ttl_seconds() -> u64 {
        300
    }
    pub fn blockhash_ttl_ms() -> u64 {
        1_000
    }
    pub fn compute_unit_limit() -> u32 {
        100_000
    }
    pub fn compute_unit_price() -> u64 {
        1_000
    }
    pub fn wallet_warn_lamports() -> u64 {
        100_000_000
    }
    pub fn wallet_critical_lamports() -> u64 {
        10_000_000
    }
    pub fn wallet_monitor_interval_seconds() -> u64 {
        60
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardConfig {
    pub base_url: Url,
    pub secret_key: LiteralOrEnv<String>,
    pub webhook_secret: LiteralOrEnv<String>,
    pub success_url: String,
    pub cancel_url: String,
    #[serde(default = "card_defaults::signature_tolerance_seconds")]
    pub signature_tolerance_seconds: u64,
}

mod card_defaults {
    pub fn signature_tolerance_seconds() -> u64 {
        300
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "idempotency_defaults::capacity")]
    pub capacity: usize,
    #[serde(default = "idempotency_defaults::ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "idempotency_defaults::sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            capacity: idempotency_defaults::capacity(),
            ttl_seconds: idempotency_defaults::ttl_seconds(),
            sweep_interval_seconds: idempotency_defaults::sweep_interval_seconds(),
        }
    }
}

mod idempotency_defaults {
    pub fn capacity() -> usize {
        1_024
    }
    pub fn ttl_seconds() -> u64 {
        86_400
    }
    pub fn sweep_interval_seconds() -> u64 {
        300
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::port")]
    pub port: u16,
    #[serde(default = "config_defaults::host")]
    pub host: IpAddr,
    /// Optional prefix for every route (e.g. `/pay`).
    #[serde(default)]
    pub route_prefix: Option<String>,
    /// Postgres URL; absent means the in-memory ledger.
    #[serde(default)]
    pub database_url: Option<LiteralOrEnv<String>>,
    #[serde(default = "config_defaults::database_max_connections")]
    pub database_max_connections: u32,
    pub chain: ChainConfig,
    #[serde(default)]
    pub card: Option<CardConfig>,
    /// Base58 pubkey of the refund-admin wallet.
    pub admin_wallet: String,
    #[serde(default = "config_defaults::subscription_grace_seconds")]
    pub subscription_grace_seconds: u64,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default = "config_defaults::nonce_ttl_seconds")]
    pub nonce_ttl_seconds: u64,
    #[serde(default)]
    pub api_keys: HashMap<String, Tier>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub coupons: Vec<Coupon>,
}

mod config_defaults {
    use std::net::{IpAddr, Ipv4Addr};

    pub fn port() -> u16 {
        8080
    }
    pub fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
    pub fn database_max_connections() -> u32 {
        10
    }
    pub fn subscription_grace_seconds() -> u64 {
        86_400
    }
    pub fn nonce_ttl_seconds() -> u64 {
        600
    }
}

impl Config {
    /// Loads configuration from the file named by CLI args / `CONFIG`.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let args = CliArgs::parse();
        Self::from_path(&args.config)
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| format!("cannot parse config {}: {e}", path.display()))?;
        Ok(config)
    }
}
