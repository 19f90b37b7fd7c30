//! HTTP endpoints of the payment gateway.
//!
//! Handlers stay thin: parse, delegate to a service, render. The error
//! envelope and status mapping live in [`crate::error`]; version and tenant
//! negotiation run as middleware and stamp every response. Payment routes
//! get a 60 s deadline to tolerate chain confirmation; discovery and health
//! answer within 5 s.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;

use crate::api_key::ApiKeyRegistry;
use crate::api_version;
use crate::catalog::{CartId, CartItem, Catalog, Rail, RefundId, ResourceId};
use crate::coupon::{self, CouponCode};
use crate::discovery;
use crate::error::{ErrorBody, GatewayError, NotFoundKind};
use crate::idempotency::{IdempotencyStore, REPLAYED_HEADER, StoredResponse, scoped_key};
use crate::ledger::{CouponStore, Ledger, SettlementSignature, SubscriptionId};
use crate::nonce::{NonceId, NonceStore};
use crate::pipeline::AuthorizationPipeline;
use crate::quote::QuoteGenerator;
use crate::rail::card::{
    CardProcessorClient, CardRail, SessionLine, WebhookEvent, verify_webhook_signature,
};
use crate::rail::{HealthState, RailRegistry};
use crate::refund::RefundService;
use crate::signature::SignedRequest;
use crate::subscription::SubscriptionService;
use crate::tenancy;
use crate::timestamp::UnixTimestamp;

pub const PAYMENT_HEADER: &str = "x-payment";
pub const PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Everything the card rail needs beyond verification.
pub struct CardState {
    pub rail: Arc<CardRail>,
    pub client: Arc<CardProcessorClient>,
    pub signature_tolerance_seconds: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub ledger: Arc<dyn Ledger>,
    pub quotes: Arc<QuoteGenerator>,
    pub pipeline: Arc<AuthorizationPipeline>,
    pub refunds: Arc<RefundService>,
    pub subscriptions: Arc<SubscriptionService>,
    pub rails: RailRegistry,
    pub idempotency: Arc<IdempotencyStore>,
    pub nonces: Arc<NonceStore>,
    pub api_keys: Arc<ApiKeyRegistry>,
    pub card: Option<Arc<CardState>>,
}

fn now() -> Result<UnixTimestamp, GatewayError> {
    UnixTimestamp::try_now().map_err(|e| GatewayError::Internal(e.to_string()))
}

fn card_state(state: &AppState) -> Result<&Arc<CardState>, GatewayError> {
    state
        .card
        .as_ref()
        .ok_or_else(|| GatewayError::Unsupported("card rail is not configured".to_string()))
}

/// Pulls the `X-Signature` / `X-Message` / `X-Signer` triple.
fn signed_request(headers: &HeaderMap) -> Result<SignedRequest, GatewayError> {
    let get = |name: &str| -> Result<String, GatewayError> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::invalid_field(name, "missing header"))
    };
    Ok(SignedRequest {
        signature: get("x-signature")?,
        message: get("x-message")?,
        signer: get("x-signer")?,
    })
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Resolves API version, tenant, and key tier; stamps response headers.
async fn request_meta(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let headers = request.headers().clone();
    let version = api_version::negotiate(&headers);
    let tenant = tenancy::resolve(&headers);
    let tier = state.api_keys.tier(&headers);
    tracing::debug!(version = version.0, %tenant, ?tier, "request meta");

    let mut request = request;
    request.extensions_mut().insert(version);
    request.extensions_mut().insert(RequestTenant(tenant));
    request.extensions_mut().insert(tier);

    let mut response = next.run(request).await;
    api_version::apply_response_headers(response.headers_mut(), version);
    response
}

#[derive(Debug, Clone)]
pub struct RequestTenant(pub String);

fn panic_response(_: Box<dyn std::any::Any + Send + 'static>) -> Response {
    tracing::error!("handler panicked");
    let body = ErrorBody {
        code: "internal_error",
        message: "internal error".to_string(),
        details: None,
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn routes(state: AppState, route_prefix: Option<&str>) -> Router {
    let discovery_routes = Router::new()
        .route("/health", get(get_health))
        .route("/.well-known/payment-options", get(get_payment_options))
        .route("/.well-known/agent.json", get(get_agent_card))
        .route("/openapi.json", get(get_openapi))
        .route("/resources/list", post(post_resources_list))
        .route("/products", get(get_products))
        .layer(TimeoutLayer::new(Duration::from_secs(5)));

    let payment_routes = Router::new()
        .route("/quote", post(post_quote))
        .route("/cart/quote", post(post_cart_quote))
        .route("/verify", post(post_verify))
        .route("/cart/checkout", post(post_cart_checkout))
        .route("/card-session", post(post_card_session))
        .route("/gasless-transaction", post(post_gasless_build))
        .route("/gasless-transaction/submit", post(post_gasless_submit))
        .route("/refunds/request", post(post_refund_request))
        .route("/refunds/approve", post(post_refund_approve))
        .route("/refunds/deny", post(post_refund_deny))
        .route("/refunds/pending", post(post_refund_pending))
        .route("/nonce", post(post_nonce))
        .route("/coupons/validate", post(post_coupon_validate))
        .route("/subscription/create", post(post_subscription_create))
        .route("/subscription/quote", post(post_subscription_quote))
        .route("/subscription/status", post(post_subscription_status))
        .route("/subscription/cancel", post(post_subscription_cancel))
        .route("/subscription/reactivate", post(post_subscription_reactivate))
        .route("/subscription/change", post(post_subscription_change))
        .route("/subscription/portal", post(post_subscription_portal))
        .route("/webhook/card", post(post_card_webhook))
        .layer(TimeoutLayer::new(Duration::from_secs(60)));

    let router = discovery_routes
        .merge(payment_routes)
        .layer(middleware::from_fn_with_state(state.clone(), request_meta))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(crate::trace_id::TraceIdLayer)
        .with_state(state);

    match route_prefix {
        Some(prefix) if !prefix.is_empty() && prefix != "/" => {
            Router::new().nest(prefix, router)
        }
        _ => router,
    }
}

// ---------------------------------------------------------------------------
// Discovery & health
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<AppState>) -> Response {
    let reports = state.rails.health_reports().await;
    let degraded = reports.iter().any(|r| r.state == HealthState::Degraded);
    let body = json!({
        "status": if degraded { "degraded" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "rails": reports,
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn get_payment_options(State(state): State<AppState>) -> Response {
    let doc = discovery::payment_options(&state.catalog, state.quotes.pricing());
    let mut response = (StatusCode::OK, Json(doc)).into_response();
    response.headers_mut().insert(
        "cache-control",
        HeaderValue::from_static("public, max-age=300"),
    );
    response
}

async fn get_agent_card(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(discovery::agent_card(state.quotes.pricing()))).into_response()
}

async fn get_openapi() -> Response {
    (StatusCode::OK, Json(discovery::openapi_document())).into_response()
}

async fn post_resources_list(
    State(state): State<AppState>,
    Json(request): Json<discovery::JsonRpcRequest>,
) -> Response {
    (StatusCode::OK, Json(discovery::resources_list(&state.catalog, &request))).into_response()
}

#[derive(Serialize)]
struct ProductView {
    id: ResourceId,
    description: String,
    subscription: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    card_price: Option<String>,
    coupons_applied: Vec<CouponCode>,
}

/// `GET /products`: the catalog with effective (catalog-stage discounted)
/// prices per rail.
async fn get_products(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let now = now()?;
    let mut products = Vec::new();
    for resource in state.catalog.list() {
        let mut view = ProductView {
            id: resource.id.clone(),
            description: resource.description.clone(),
            subscription: resource.is_subscription(),
            chain_price: None,
            card_price: None,
            coupons_applied: Vec::new(),
        };
        if resource.crypto_price.is_some() {
            let (price, coupons) = state
                .quotes
                .effective_item_price(&resource, Rail::Chain, None, now)
                .await?;
            view.chain_price = Some(price.atomic.to_string());
            view.coupons_applied = coupons;
        }
        if resource.fiat_price.is_some() {
            let (price, _) = state
                .quotes
                .effective_item_price(&resource, Rail::Card, None, now)
                .await?;
            view.card_price = Some(price.atomic.to_string());
        }
        products.push(view);
    }
    Ok((StatusCode::OK, Json(json!({ "products": products }))).into_response())
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct QuoteBody {
    resource: String,
    #[serde(default)]
    coupon_code: Option<String>,
}

/// `POST /quote`: a chain-rail quote, answered as 402 Payment Required.
async fn post_quote(
    State(state): State<AppState>,
    Json(body): Json<QuoteBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let manual = body.coupon_code.as_deref().map(CouponCode::from);
    let resource_id = ResourceId(body.resource);
    let quote = state
        .quotes
        .quote_resource(&resource_id, Rail::Chain, manual.as_ref(), now)
        .await?;
    let resource = state
        .catalog
        .get(&resource_id)
        .ok_or_else(|| GatewayError::not_found(NotFoundKind::Resource, resource_id.as_str()))?;
    let requirements = state.quotes.payment_requirements(&quote, &resource.description);
    let body = json!({
        "accepts": [requirements],
        "quoteId": quote.id,
        "expiresAt": quote.expires_at,
        "couponsApplied": quote.coupons_applied,
    });
    Ok((StatusCode::PAYMENT_REQUIRED, Json(body)).into_response())
}

#[derive(Deserialize)]
struct CartQuoteBody {
    items: Vec<CartItem>,
    #[serde(default)]
    coupon_code: Option<String>,
}

/// `POST /cart/quote`: quote a cart, storing it under a `cart_` id.
async fn post_cart_quote(
    State(state): State<AppState>,
    Json(body): Json<CartQuoteBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let manual = body.coupon_code.as_deref().map(CouponCode::from);
    let (cart, quote) = state
        .quotes
        .quote_cart(body.items, Rail::Chain, manual.as_ref(), now)
        .await?;
    let requirements = state
        .quotes
        .payment_requirements(&quote, &format!("cart of {} items", cart.items.len()));
    let body = json!({
        "accepts": [requirements],
        "cartId": cart.id,
        "quoteId": quote.id,
        "expiresAt": quote.expires_at,
        "couponsApplied": quote.coupons_applied,
    });
    Ok((StatusCode::PAYMENT_REQUIRED, Json(body)).into_response())
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// `POST /verify`: unified verification, dispatched by the `X-PAYMENT`
/// payload. On success the settlement record rides back in
/// `X-PAYMENT-RESPONSE`.
async fn post_verify(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let payment = headers
        .get(PAYMENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::invalid_field(PAYMENT_HEADER, "missing header"))?;
    let receipt = state.pipeline.verify(payment, now).await?;
    let encoded = receipt.encode();
    let mut response = (StatusCode::OK, Json(json!(receipt))).into_response();
    if let Ok(value) = HeaderValue::from_str(&encoded) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(PAYMENT_RESPONSE_HEADER), value);
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Card checkout
// ---------------------------------------------------------------------------

/// Runs `work` under the idempotency cache when the caller supplied a key.
async fn with_idempotency<F, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    method: &str,
    path: &str,
    work: F,
) -> Result<Response, GatewayError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, serde_json::Value), GatewayError>>,
{
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|k| scoped_key(method, path, k));
    let now = now()?;
    if let Some(key) = &key
        && let Some(stored) = state.idempotency.get(key, now)
    {
        let mut response = Response::builder()
            .status(stored.status)
            .header("content-type", "application/json")
            .header(REPLAYED_HEADER, "true")
            .body(axum::body::Body::from(stored.body))
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        for (name, value) in &stored.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        return Ok(response);
    }

    let (status, body) = work().await?;
    let bytes = serde_json::to_vec(&body).map_err(|e| GatewayError::Internal(e.to_string()))?;
    if let Some(key) = &key {
        state.idempotency.insert(
            key,
            StoredResponse {
                status: status.as_u16(),
                headers: Vec::new(),
                body: bytes.clone(),
            },
            now,
        );
    }
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(bytes))
        .map_err(|e| GatewayError::Internal(e.to_string()))?)
}

#[derive(Deserialize)]
struct CardSessionBody {
    resource: String,
    #[serde(default)]
    coupon_code: Option<String>,
}

/// `POST /card-session`: single-item hosted checkout on the card rail.
/// Subscription-class resources open a subscription-mode session.
async fn post_card_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CardSessionBody>,
) -> Result<Response, GatewayError> {
    with_idempotency(&state, &headers, "POST", "/card-session", || async {
        let now = now()?;
        let card = card_state(&state)?;
        let resource_id = ResourceId(body.resource.clone());
        let resource = state.catalog.get(&resource_id).ok_or_else(|| {
            GatewayError::not_found(NotFoundKind::Resource, resource_id.as_str())
        })?;
        let manual = body.coupon_code.as_deref().map(CouponCode::from);
        let quote = state
            .quotes
            .quote_resource(&resource_id, Rail::Card, manual.as_ref(), now)
            .await?;
        let amount = quote.amount;
        let mode = if resource.is_subscription() {
            "subscription"
        } else {
            "payment"
        };
        // A configured processor price wins; otherwise the gateway prices
        // the line itself.
        let lines = vec![match &resource.fiat_processor_price_id {
            Some(price) => SessionLine {
                price: Some(price.clone()),
                name: None,
                currency: None,
                unit_amount: None,
                quantity: 1,
            },
            None => SessionLine {
                price: None,
                name: Some(resource.description.clone()),
                currency: Some(amount.asset.code.to_lowercase()),
                unit_amount: Some(amount.atomic),
                quantity: 1,
            },
        }];
        let metadata = json!({
            "resource_id": resource_id,
            "coupon_code": body.coupon_code,
        });
        let idempotency_key = headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        let session = card
            .client
            .create_checkout_session(mode, &lines, &metadata, idempotency_key)
            .await?;
        card.rail.register_session(&session.id, now);
        Ok((
            StatusCode::OK,
            json!({
                "sessionId": session.id,
                "url": session.url,
                "amount": amount,
            }),
        ))
    })
    .await
}

#[derive(Deserialize)]
struct CartCheckoutBody {
    items: Vec<CartItem>,
    #[serde(default)]
    coupon_code: Option<String>,
}

/// `POST /cart/checkout`: card-rail hosted checkout for a cart.
async fn post_cart_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CartCheckoutBody>,
) -> Result<Response, GatewayError> {
    with_idempotency(&state, &headers, "POST", "/cart/checkout", || async {
        let now = now()?;
        let card = card_state(&state)?;
        let manual = body.coupon_code.clone().map(|c| CouponCode(c));
        let (cart, quote) = state
            .quotes
            .quote_cart(body.items.clone(), Rail::Card, manual.as_ref(), now)
            .await?;
        // One priced line for the whole cart: the gateway's stacked total is
        // authoritative, not the processor's per-item math.
        let lines = vec![SessionLine {
            price: None,
            name: Some(format!("cart {}", cart.id)),
            currency: Some(quote.amount.asset.code.to_lowercase()),
            unit_amount: Some(quote.amount.atomic),
            quantity: 1,
        }];
        let metadata = json!({
            "cart_id": cart.id,
            "coupon_code": body.coupon_code,
        });
        let idempotency_key = headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        let session = card
            .client
            .create_checkout_session("payment", &lines, &metadata, idempotency_key)
            .await?;
        card.rail.register_session(&session.id, now);
        Ok((
            StatusCode::OK,
            json!({
                "sessionId": session.id,
                "url": session.url,
                "cartId": cart.id,
                "amount": quote.amount,
            }),
        ))
    })
    .await
}

// ---------------------------------------------------------------------------
// Gasless
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GaslessBuildBody {
    resource: String,
    user_wallet: String,
    #[serde(default)]
    fee_payer: Option<String>,
    #[serde(default)]
    coupon_code: Option<String>,
}

/// `POST /gasless-transaction`: build an unsigned fee-sponsored transfer
/// for a resource or a quoted cart.
async fn post_gasless_build(
    State(state): State<AppState>,
    Json(body): Json<GaslessBuildBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let subject = ResourceId(body.resource.clone());
    let (amount, pay_to, memo) = if subject.is_cart() {
        let stored = state.quotes.stored_cart(&CartId(subject.0.clone()), now)?;
        (
            stored.quote.amount,
            stored.quote.pay_to,
            stored.quote.memo,
        )
    } else {
        let manual = body.coupon_code.as_deref().map(CouponCode::from);
        let quote = state
            .quotes
            .quote_resource(&subject, Rail::Chain, manual.as_ref(), now)
            .await?;
        (quote.amount, quote.pay_to, quote.memo)
    };
    let builder = state.rails.gasless(Rail::Chain)?;
    let built = builder
        .build(&crate::rail::GaslessBuildRequest {
            user_wallet: body.user_wallet,
            amount,
            pay_to,
            memo,
            fee_payer_hint: body.fee_payer,
        })
        .await?;
    Ok((StatusCode::OK, Json(json!(built))).into_response())
}

#[derive(Deserialize)]
struct GaslessSubmitBody {
    transaction: String,
}

/// `POST /gasless-transaction/submit`: co-sign and broadcast.
async fn post_gasless_submit(
    State(state): State<AppState>,
    Json(body): Json<GaslessSubmitBody>,
) -> Result<Response, GatewayError> {
    let builder = state.rails.gasless(Rail::Chain)?;
    let signature = builder.submit(&body.transaction).await?;
    Ok((StatusCode::OK, Json(json!({ "signature": signature }))).into_response())
}

// ---------------------------------------------------------------------------
// Refunds
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RefundRequestBody {
    original_signature: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn post_refund_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefundRequestBody>,
) -> Result<Response, GatewayError> {
    let signed = signed_request(&headers)?;
    let refund = state
        .refunds
        .request(
            &signed,
            &SettlementSignature(body.original_signature),
            body.reason,
        )
        .await?;
    Ok((StatusCode::OK, Json(json!({ "refund": refund }))).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundActionBody {
    refund_id: String,
}

async fn post_refund_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefundActionBody>,
) -> Result<Response, GatewayError> {
    let signed = signed_request(&headers)?;
    let (refund, expectation) = state
        .refunds
        .approve(&signed, &RefundId(body.refund_id))
        .await?;
    // The approval answer carries the quote the settling transfer must
    // match, exact-amount.
    let body = json!({
        "refund": refund,
        "settlement": {
            "payTo": expectation.pay_to,
            "amount": expectation.amount.atomic.to_string(),
            "memo": expectation.memo,
        },
    });
    Ok((StatusCode::OK, Json(body)).into_response())
}

async fn post_refund_deny(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefundActionBody>,
) -> Result<Response, GatewayError> {
    let signed = signed_request(&headers)?;
    let refund = state
        .refunds
        .deny(&signed, &RefundId(body.refund_id))
        .await?;
    Ok((StatusCode::OK, Json(json!({ "refund": refund }))).into_response())
}

#[derive(Deserialize)]
struct RefundPendingBody {
    nonce: String,
}

async fn post_refund_pending(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefundPendingBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let signed = signed_request(&headers)?;
    let pending = state
        .refunds
        .list_pending(&signed, &NonceId(body.nonce), now)
        .await?;
    Ok((StatusCode::OK, Json(json!({ "refunds": pending }))).into_response())
}

#[derive(Deserialize)]
struct NonceBody {
    #[serde(default = "default_nonce_purpose")]
    purpose: String,
}

fn default_nonce_purpose() -> String {
    "admin".to_string()
}

async fn post_nonce(
    State(state): State<AppState>,
    Json(body): Json<NonceBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let nonce = state.nonces.mint(&body.purpose, now);
    Ok((StatusCode::OK, Json(json!(nonce))).into_response())
}

// ---------------------------------------------------------------------------
// Coupons
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CouponValidateBody {
    code: String,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    payment_method: Option<Rail>,
}

async fn post_coupon_validate(
    State(state): State<AppState>,
    Json(body): Json<CouponValidateBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let code = CouponCode(body.code);
    let coupon = state
        .ledger
        .get_coupon(&code)
        .await
        .map_err(GatewayError::from)?
        .ok_or_else(|| GatewayError::not_found(NotFoundKind::Coupon, code.as_str()))?;
    let product_id = body.product_id.map(ResourceId);
    match coupon::validate(&coupon, now, product_id.as_ref(), body.payment_method) {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({ "valid": true, "coupon": coupon })),
        )
            .into_response()),
        Err(reason) => Err(reason.into()),
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SubscriptionCreateBody {
    product_id: String,
    wallet: String,
}

/// `POST /subscription/create`: chain-rail subscription for a wallet.
/// Card-rail subscriptions are created through checkout sessions and
/// webhooks, not here.
async fn post_subscription_create(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionCreateBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let resource_id = ResourceId(body.product_id);
    let resource = state
        .catalog
        .get(&resource_id)
        .ok_or_else(|| GatewayError::not_found(NotFoundKind::Resource, resource_id.as_str()))?;
    let subscription = state
        .subscriptions
        .create_or_renew_chain(&body.wallet, &resource, now)
        .await?;
    Ok((StatusCode::OK, Json(json!({ "subscription": subscription }))).into_response())
}

#[derive(Deserialize)]
struct SubscriptionQuoteBody {
    product_id: String,
    #[serde(default)]
    coupon_code: Option<String>,
}

/// `POST /subscription/quote`: a chain-rail quote for one billing period.
async fn post_subscription_quote(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionQuoteBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let resource_id = ResourceId(body.product_id);
    let resource = state
        .catalog
        .get(&resource_id)
        .ok_or_else(|| GatewayError::not_found(NotFoundKind::Resource, resource_id.as_str()))?;
    if !resource.is_subscription() {
        return Err(GatewayError::SubscriptionState(format!(
            "{} is not a subscription product",
            resource.id
        )));
    }
    let manual = body.coupon_code.as_deref().map(CouponCode::from);
    let quote = state
        .quotes
        .quote_resource(&resource_id, Rail::Chain, manual.as_ref(), now)
        .await?;
    let requirements = state.quotes.payment_requirements(&quote, &resource.description);
    Ok((
        StatusCode::PAYMENT_REQUIRED,
        Json(json!({
            "accepts": [requirements],
            "quoteId": quote.id,
            "expiresAt": quote.expires_at,
        })),
    )
        .into_response())
}

#[derive(Deserialize)]
struct SubscriptionStatusBody {
    #[serde(default)]
    subscription_id: Option<String>,
    #[serde(default)]
    wallet: Option<String>,
    #[serde(default)]
    product_id: Option<String>,
}

async fn post_subscription_status(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionStatusBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    if let Some(id) = body.subscription_id {
        let subscription = state.subscriptions.status(&SubscriptionId(id)).await?;
        let access = SubscriptionService::grants_access(
            &subscription,
            now,
            state.subscriptions.grace_seconds(),
        );
        return Ok((
            StatusCode::OK,
            Json(json!({ "subscription": subscription, "hasAccess": access })),
        )
            .into_response());
    }
    let (Some(wallet), Some(product_id)) = (body.wallet, body.product_id) else {
        return Err(GatewayError::invalid_field(
            "subscription_id",
            "provide subscription_id or wallet + product_id",
        ));
    };
    let holder = crate::ledger::PayerRef::Wallet(wallet);
    let access = state
        .subscriptions
        .has_access(&holder, &ResourceId(product_id), now)
        .await?;
    Ok((StatusCode::OK, Json(json!({ "hasAccess": access }))).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionCancelBody {
    subscription_id: String,
    #[serde(default)]
    immediate: bool,
}

async fn post_subscription_cancel(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionCancelBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let subscription = state
        .subscriptions
        .cancel(&SubscriptionId(body.subscription_id), body.immediate, now)
        .await?;
    Ok((StatusCode::OK, Json(json!({ "subscription": subscription }))).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionIdBody {
    subscription_id: String,
}

async fn post_subscription_reactivate(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionIdBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let subscription = state
        .subscriptions
        .reactivate(&SubscriptionId(body.subscription_id), now)
        .await?;
    Ok((StatusCode::OK, Json(json!({ "subscription": subscription }))).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionChangeBody {
    subscription_id: String,
    new_product_id: String,
}

/// `POST /subscription/change`: move to a new product. On the card rail the
/// processor price moves first; only then is the local record updated.
async fn post_subscription_change(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionChangeBody>,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let id = SubscriptionId(body.subscription_id);
    let new_resource_id = ResourceId(body.new_product_id);
    let new_resource = state.catalog.get(&new_resource_id).ok_or_else(|| {
        GatewayError::not_found(NotFoundKind::Resource, new_resource_id.as_str())
    })?;
    let current = state.subscriptions.status(&id).await?;
    if current.rail == Rail::Card {
        let card = card_state(&state)?;
        let processor_subscription_id =
            current.processor_subscription_id.as_deref().ok_or_else(|| {
                GatewayError::Internal("card subscription lacks processor id".to_string())
            })?;
        let price_id = new_resource
            .subscription
            .as_ref()
            .and_then(|s| s.processor_price_id.as_deref())
            .ok_or_else(|| {
                GatewayError::SubscriptionState(format!(
                    "{new_resource_id} has no processor price"
                ))
            })?;
        card.client
            .update_subscription_price(processor_subscription_id, price_id)
            .await?;
    }
    let subscription = state.subscriptions.change(&id, &new_resource, now).await?;
    Ok((StatusCode::OK, Json(json!({ "subscription": subscription }))).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionPortalBody {
    customer_ref: String,
}

async fn post_subscription_portal(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionPortalBody>,
) -> Result<Response, GatewayError> {
    let card = card_state(&state)?;
    let portal = card.client.create_portal_session(&body.customer_ref).await?;
    Ok((StatusCode::OK, Json(json!({ "url": portal.url }))).into_response())
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// `POST /webhook/card`: signed processor events.
async fn post_card_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let now = now()?;
    let card = card_state(&state)?;
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::WebhookSignature)?;
    verify_webhook_signature(
        card.client.webhook_secret(),
        signature,
        &body,
        now,
        card.signature_tolerance_seconds,
    )?;
    let event = WebhookEvent::parse(&body)?;
    card.rail.handle_event(&event, now).await?;
    Ok((StatusCode::OK, Json(json!({ "received": true }))).into_response())
}
