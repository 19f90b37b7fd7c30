//! API key tiers and the rate-limit bypasses they grant.

use axum::http::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
    Partner,
}

impl Tier {
    /// Enterprise and partner keys skip per-wallet and per-IP limits.
    pub fn bypasses_client_limits(&self) -> bool {
        matches!(self, Tier::Enterprise | Tier::Partner)
    }

    /// Partner keys additionally skip global limits.
    pub fn bypasses_global_limits(&self) -> bool {
        matches!(self, Tier::Partner)
    }
}

/// Key → tier mapping, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyRegistry {
    keys: HashMap<String, Tier>,
}

impl ApiKeyRegistry {
    pub fn new(keys: HashMap<String, Tier>) -> Self {
        Self { keys }
    }

    /// Resolves the tier for a request. No key, or an unknown key, is free
    /// tier - an invalid key must not be distinguishable from no key.
    pub fn tier(&self, headers: &HeaderMap) -> Tier {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|key| self.keys.get(key).copied())
            .unwrap_or(Tier::Free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::HeaderValue;

    fn registry() -> ApiKeyRegistry {
        ApiKeyRegistry::new(HashMap::from([
            ("key_pro".to_string(), Tier::Pro),
            ("key_ent".to_string(), Tier::Enterprise),
            ("key_partner".to_string(), Tier::Partner),
        ]))
    }

    fn with_key(key: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(API_KEY_HEADER, HeaderValue::from_str(key).unwrap());
        map
    }

    #[test]
    fn tier_resolution() {
        let registry = registry();
        assert_eq!(registry.tier(&HeaderMap::new()), Tier::Free);
        assert_eq!(registry.tier(&with_key("nope")), Tier::Free);
        assert_eq!(registry.tier(&with_key("key_pro")), Tier::Pro);
        assert_eq!(registry.tier(&with_key("key_partner")), Tier::Partner);
    }

    #[test]
    fn bypass_matrix() {
        assert!(!Tier::Free.bypasses_client_limits());
        assert!(!Tier::Pro.bypasses_client_limits());
        assert!(Tier::Enterprise.bypasses_client_limits());
        assert!(!Tier::Enterprise.bypasses_global_limits());
        assert!(Tier::Partner.bypasses_client_limits());
        assert!(Tier::Partner.bypasses_global_limits());
    }
}
