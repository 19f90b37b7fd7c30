//! Tenant resolution: explicit header, subdomain, or `default`.

use axum::http::header::HeaderMap;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const DEFAULT_TENANT: &str = "default";

/// Host labels that never identify a tenant.
const COMMON_LABELS: &[&str] = &["www", "api", "app", "localhost"];

/// Lowercases and strips everything outside `[a-z0-9_-]`, capped at 64
/// characters. An input that sanitizes to nothing yields the default tenant.
fn sanitize(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .take(64)
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn from_host(host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let mut labels = host.split('.');
    let first = labels.next()?;
    // A bare host ("localhost", an IP fragment) has no subdomain.
    labels.next()?;
    if COMMON_LABELS.contains(&first) || first.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    sanitize(first)
}

/// Resolves the tenant for a request.
pub fn resolve(headers: &HeaderMap) -> String {
    if let Some(value) = headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok())
        && let Some(tenant) = sanitize(value)
    {
        return tenant;
    }
    if let Some(host) = headers.get("host").and_then(|v| v.to_str().ok())
        && let Some(tenant) = from_host(host)
    {
        return tenant;
    }
    DEFAULT_TENANT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (key, value) in pairs {
            map.insert(
                axum::http::header::HeaderName::from_bytes(key.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn header_takes_precedence() {
        let tenant = resolve(&headers(&[
            ("x-tenant-id", "Acme Corp!"),
            ("host", "other.example.com"),
        ]));
        assert_eq!(tenant, "acmecorp");
    }

    #[test]
    fn subdomain_extraction_skips_common_labels() {
        assert_eq!(resolve(&headers(&[("host", "acme.example.com")])), "acme");
        assert_eq!(resolve(&headers(&[("host", "www.example.com")])), "default");
        assert_eq!(resolve(&headers(&[("host", "api.example.com:8080")])), "default");
    }

    #[test]
    fn bare_hosts_and_missing_headers_default() {
        assert_eq!(resolve(&headers(&[("host", "localhost:3000")])), "default");
        assert_eq!(resolve(&headers(&[])), "default");
    }

    #[test]
    fn sanitization_caps_length() {
        let long = "a".repeat(100);
        let tenant = resolve(&headers(&[("x-tenant-id", long.as_str())]));
        assert_eq!(tenant.len(), 64);
    }
}
