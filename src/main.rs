//! Payment gateway HTTP entrypoint.
//!
//! Wires configuration → telemetry → stores → rails → router, then serves
//! until SIGTERM/SIGINT. Background loops (idempotency sweeper, wallet
//! monitor) run under the lifecycle manager and are joined before the
//! process exits; registered resources close in reverse acquisition order.

use axum::http::Method;
use dotenvy::dotenv;
use solana_commitment_config::CommitmentConfig;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;

use railgate::api_key::ApiKeyRegistry;
use railgate::catalog::{Catalog, Rail};
use railgate::config::Config;
use railgate::gasless::GaslessService;
use railgate::handlers::{self, AppState, CardState};
use railgate::idempotency::{self, IdempotencyStore};
use railgate::ledger::memory::MemoryLedger;
use railgate::ledger::sql::SqlLedger;
use railgate::ledger::Ledger;
use railgate::lifecycle::{Lifecycle, SigDown};
use railgate::nonce::NonceStore;
use railgate::pipeline::AuthorizationPipeline;
use railgate::quote::{ChainPricing, QuoteGenerator};
use railgate::rail::card::{CardProcessorClient, CardRail, ProcessorConfig};
use railgate::rail::chain::blockhash::BlockhashCache;
use railgate::rail::chain::rpc::{ChainRpc, SolanaRpc};
use railgate::rail::chain::ChainVerifier;
use railgate::rail::{RailCapabilities, RailRegistry};
use railgate::refund::RefundService;
use railgate::subscription::SubscriptionService;
use railgate::telemetry::Telemetry;
use railgate::wallet::{self, ChainHealth, FeePayerPool};

fn commitment(level: &str) -> CommitmentConfig {
    match level {
        "processed" => CommitmentConfig::processed(),
        "finalized" => CommitmentConfig::finalized(),
        _ => CommitmentConfig::confirmed(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;

    let mint = Pubkey::from_str(&config.chain.mint)
        .map_err(|_| format!("invalid mint pubkey: {}", config.chain.mint))?;

    // Ledger: Postgres when configured, otherwise in-memory.
    let ledger: Arc<dyn Ledger> = match &config.database_url {
        Some(url) => {
            let sql = SqlLedger::connect(url, config.database_max_connections).await?;
            sql.seed_coupons(&config.coupons).await?;
            tracing::info!("using postgres ledger");
            Arc::new(sql)
        }
        None => {
            tracing::info!("using in-memory ledger");
            Arc::new(MemoryLedger::with_coupons(config.coupons.clone()))
        }
    };

    let catalog = Arc::new(Catalog::new(config.resources.clone()));
    let rpc: Arc<dyn ChainRpc> = Arc::new(SolanaRpc::new(
        config.chain.rpc_url.to_string(),
        commitment(&config.chain.commitment),
    ));
    let blockhash = Arc::new(BlockhashCache::new(Duration::from_millis(
        config.chain.blockhash_ttl_ms,
    )));

    let fee_payers: Vec<Keypair> = config
        .chain
        .fee_payers
        .iter()
        .map(|secret| Keypair::from_base58_string(secret))
        .collect();
    let pool = Arc::new(FeePayerPool::new(
        fee_payers,
        config.chain.wallet_warn_lamports,
        config.chain.wallet_critical_lamports,
    ));

    let quotes = Arc::new(QuoteGenerator::new(
        Arc::clone(&catalog),
        Arc::clone(&ledger) as Arc<dyn railgate::ledger::CouponStore>,
        ChainPricing {
            network: config.chain.network.clone(),
            mint: config.chain.mint.clone(),
            default_pay_to: config.chain.default_pay_to.clone(),
            quote_ttl_seconds: config.chain.quote_ttl_seconds,
        },
    ));

    let nonces = Arc::new(NonceStore::new(config.nonce_ttl_seconds));
    let idempotency_store = Arc::new(IdempotencyStore::new(
        config.idempotency.capacity,
        config.idempotency.ttl_seconds,
    ));
    let refunds = Arc::new(RefundService::new(
        Arc::clone(&ledger),
        Arc::clone(&nonces),
        config.admin_wallet.clone(),
        config.chain.mint.clone(),
    ));
    let subscriptions = Arc::new(SubscriptionService::new(
        Arc::clone(&ledger) as Arc<dyn railgate::ledger::SubscriptionStore>,
        config.subscription_grace_seconds,
    ));

    // Chain rail: verify + gasless + health.
    let chain_verifier = Arc::new(ChainVerifier::new(Arc::clone(&rpc), mint));
    let gasless = Arc::new(GaslessService::new(
        Arc::clone(&rpc),
        Arc::clone(&pool),
        Arc::clone(&blockhash),
        mint,
        config.chain.mint_decimals,
        config.chain.compute_unit_limit,
        config.chain.compute_unit_price,
    ));
    let chain_health = Arc::new(ChainHealth::new(Arc::clone(&pool), Arc::clone(&rpc)));
    let mut rails = RailRegistry::new().register(
        Rail::Chain,
        RailCapabilities {
            verifier: chain_verifier,
            gasless: Some(gasless),
            health: Some(chain_health),
        },
    );

    // Card rail: verify only; gasless has no meaning there.
    let card = match &config.card {
        Some(card_config) => {
            let client = Arc::new(CardProcessorClient::new(ProcessorConfig {
                base_url: card_config.base_url.clone(),
                secret_key: card_config.secret_key.clone().into_inner(),
                webhook_secret: card_config.webhook_secret.clone().into_inner(),
                success_url: card_config.success_url.clone(),
                cancel_url: card_config.cancel_url.clone(),
            }));
            let rail = Arc::new(CardRail::new(
                Arc::clone(&ledger),
                Arc::clone(&subscriptions),
                Arc::clone(&catalog),
            ));
            rails = rails.register(
                Rail::Card,
                RailCapabilities {
                    verifier: Arc::clone(&rail) as Arc<dyn railgate::rail::ProofVerifier>,
                    gasless: None,
                    health: None,
                },
            );
            Some(Arc::new(CardState {
                rail,
                client,
                signature_tolerance_seconds: card_config.signature_tolerance_seconds,
            }))
        }
        None => None,
    };

    let pipeline = Arc::new(AuthorizationPipeline::new(
        rails.clone(),
        Arc::clone(&ledger),
        Arc::clone(&quotes),
        Arc::clone(&refunds),
        Arc::clone(&subscriptions),
        Arc::clone(&catalog),
    ));

    let state = AppState {
        catalog,
        ledger,
        quotes,
        pipeline,
        refunds,
        subscriptions,
        rails,
        idempotency: Arc::clone(&idempotency_store),
        nonces,
        api_keys: Arc::new(ApiKeyRegistry::new(config.api_keys.clone())),
        card,
    };

    let sig_down = SigDown::try_new()?;
    let lifecycle = Lifecycle::with_cancellation(sig_down.cancellation_token());

    lifecycle.spawn(idempotency::run_sweeper(
        Arc::clone(&idempotency_store),
        Duration::from_secs(config.idempotency.sweep_interval_seconds),
        lifecycle.cancellation_token(),
    ));
    lifecycle.spawn(wallet::run_wallet_monitor(
        pool,
        rpc,
        Duration::from_secs(config.chain.wallet_monitor_interval_seconds),
        lifecycle.cancellation_token(),
    ));

    let router = handlers::routes(state, config.route_prefix.as_deref())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("starting server at http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("failed to bind to {addr}: {e}");
        e
    })?;

    let cancel = lifecycle.cancellation_token();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    if let Err(error) = lifecycle.shutdown().await {
        tracing::error!(%error, "shutdown finished with error");
    }
    Ok(())
}
