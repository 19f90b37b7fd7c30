//! Discovery documents: payment options, agent card, OpenAPI contract, and
//! the JSON-RPC resource listing.
//!
//! These are static views rendered from the catalog and pricing
//! configuration. Agents and SDKs read them to configure payment flows
//! without out-of-band documentation.

use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::quote::ChainPricing;

/// `/.well-known/payment-options`: resources and the methods that pay for
/// them.
pub fn payment_options(catalog: &Catalog, pricing: &ChainPricing) -> Value {
    let resources: Vec<Value> = catalog
        .list()
        .iter()
        .map(|resource| {
            let mut methods = Vec::new();
            if resource.crypto_price.is_some() {
                methods.push("chain");
            }
            if resource.fiat_price.is_some() {
                methods.push("card");
            }
            json!({
                "id": resource.id,
                "description": resource.description,
                "methods": methods,
                "subscription": resource.is_subscription(),
            })
        })
        .collect();
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "network": pricing.network,
        "asset": pricing.mint,
        "quote_endpoint": "/quote",
        "verify_endpoint": "/verify",
        "resources": resources,
    })
}

/// `/.well-known/agent.json`: capability card for agent clients.
pub fn agent_card(pricing: &ChainPricing) -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Unified payment gateway over card and chain settlement rails",
        "capabilities": {
            "payments": {
                "protocol": "x402",
                "scheme": "exact",
                "network": pricing.network,
                "header": "X-PAYMENT",
                "response_header": "X-PAYMENT-RESPONSE",
            },
            "gasless": true,
            "subscriptions": true,
            "refunds": true,
        },
        "endpoints": {
            "quote": "/quote",
            "verify": "/verify",
            "gasless": "/gasless-transaction",
            "products": "/products",
        }
    })
}

/// `/openapi.json`: the contract document. Hand-maintained summary, not a
/// generated artifact.
pub fn openapi_document() -> Value {
    json!({
        "openapi": "3.0.3",
        "info": {
            "title": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/health": { "get": { "summary": "Liveness, rails, wallet summary" } },
            "/products": { "get": { "summary": "Catalog with effective prices" } },
            "/quote": { "post": { "summary": "Chain-rail quote", "responses": { "402": { "description": "Payment requirements" } } } },
            "/cart/quote": { "post": { "summary": "Cart quote", "responses": { "402": { "description": "Payment requirements" } } } },
            "/verify": { "post": { "summary": "Unified payment verification" } },
            "/cart/checkout": { "post": { "summary": "Card-rail cart checkout session" } },
            "/card-session": { "post": { "summary": "Card-rail single-item session" } },
            "/gasless-transaction": { "post": { "summary": "Build an unsigned fee-sponsored transaction" } },
            "/gasless-transaction/submit": { "post": { "summary": "Co-sign and broadcast a gasless transaction" } },
            "/refunds/request": { "post": { "summary": "User-signed refund request" } },
            "/refunds/approve": { "post": { "summary": "Admin-signed refund approval" } },
            "/refunds/deny": { "post": { "summary": "Admin-signed refund denial" } },
            "/refunds/pending": { "post": { "summary": "Admin listing of pending refunds" } },
            "/nonce": { "post": { "summary": "Mint a single-use admin nonce" } },
            "/coupons/validate": { "post": { "summary": "Validate a coupon" } },
            "/webhook/card": { "post": { "summary": "Card processor webhook" } },
        }
    })
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
}

/// `POST /resources/list`: JSON-RPC 2.0 resource enumeration.
pub fn resources_list(catalog: &Arc<Catalog>, request: &JsonRpcRequest) -> Value {
    if request.jsonrpc != "2.0" {
        return json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "error": { "code": -32600, "message": "invalid jsonrpc version" },
        });
    }
    if request.method != "resources/list" {
        return json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "error": { "code": -32601, "message": "method not found" },
        });
    }
    let resources: Vec<Value> = catalog
        .list()
        .iter()
        .map(|resource| {
            json!({
                "uri": format!("resource://{}", resource.id),
                "name": resource.id,
                "description": resource.description,
            })
        })
        .collect();
    json!({
        "jsonrpc": "2.0",
        "id": request.id,
        "result": { "resources": resources },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Resource, ResourceId};
    use crate::money::{AssetRef, Money};

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::new(vec![Resource {
            id: ResourceId::from("x"),
            description: "thing".to_string(),
            fiat_price: Some(Money::new(AssetRef::new("USD", 2), 100)),
            crypto_price: Some(Money::new(AssetRef::new("USDC", 6), 1_000_000)),
            fiat_processor_price_id: None,
            recipient_token_account: None,
            memo_template: "pay:{resource}".to_string(),
            metadata: serde_json::Value::Null,
            subscription: None,
        }]))
    }

    fn pricing() -> ChainPricing {
        ChainPricing {
            network: "solana".to_string(),
            mint: "Mint111".to_string(),
            default_pay_to: "PayTo111".to_string(),
            quote_ttl_seconds: 300,
        }
    }

    #[test]
    fn payment_options_lists_methods() {
        let doc = payment_options(&catalog(), &pricing());
        let resource = &doc["resources"][0];
        assert_eq!(resource["id"], "x");
        assert_eq!(resource["methods"], json!(["chain", "card"]));
    }

    #[test]
    fn resources_list_happy_and_error_paths() {
        let catalog = catalog();
        let ok = resources_list(
            &catalog,
            &JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                id: json!(1),
                method: "resources/list".to_string(),
            },
        );
        assert_eq!(ok["result"]["resources"][0]["uri"], "resource://x");

        let bad_method = resources_list(
            &catalog,
            &JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                id: json!(2),
                method: "nope".to_string(),
            },
        );
        assert_eq!(bad_method["error"]["code"], -32601);

        let bad_version = resources_list(
            &catalog,
            &JsonRpcRequest {
                jsonrpc: "1.0".to_string(),
                id: json!(3),
                method: "resources/list".to_string(),
            },
        );
        assert_eq!(bad_version["error"]["code"], -32600);
    }
}
