//! API version negotiation.
//!
//! URLs are stable across versions; the version travels in headers. Clients
//! may send `X-API-Version: 2`, `Accept: application/vnd.railgate.v2+json`,
//! or `Accept: application/json; version=2`. Responses echo the resolved
//! version and set `Vary`; deprecated versions additionally receive
//! `Deprecation`, `Sunset`, and `Warning` headers.

use axum::http::header::{HeaderMap, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;

pub const CURRENT_VERSION: u8 = 2;
pub const SUPPORTED_VERSIONS: &[u8] = &[1, 2];
const DEPRECATED_VERSIONS: &[u8] = &[1];
const V1_SUNSET: &str = "Sat, 01 Jan 2028 00:00:00 GMT";

pub const VERSION_HEADER: &str = "x-api-version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion(pub u8);

impl ApiVersion {
    pub fn is_deprecated(&self) -> bool {
        DEPRECATED_VERSIONS.contains(&self.0)
    }
}

static VENDOR_ACCEPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"application/vnd\.railgate\.v(\d+)\+json").expect("vendor accept regex")
});
static PARAM_ACCEPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r";\s*version=(\d+)").expect("accept version param regex"));

fn supported(candidate: u8) -> Option<ApiVersion> {
    SUPPORTED_VERSIONS
        .contains(&candidate)
        .then_some(ApiVersion(candidate))
}

/// Resolves the requested API version, defaulting to the current one.
/// Unknown versions fall back to the default rather than erroring: URLs are
/// stable and old clients keep working.
pub fn negotiate(headers: &HeaderMap) -> ApiVersion {
    if let Some(value) = headers.get(VERSION_HEADER).and_then(|v| v.to_str().ok())
        && let Ok(version) = value.trim().parse::<u8>()
        && let Some(version) = supported(version)
    {
        return version;
    }
    if let Some(accept) = headers.get("accept").and_then(|v| v.to_str().ok()) {
        if let Some(captures) = VENDOR_ACCEPT.captures(accept)
            && let Ok(version) = captures[1].parse::<u8>()
            && let Some(version) = supported(version)
        {
            return version;
        }
        if let Some(captures) = PARAM_ACCEPT.captures(accept)
            && let Ok(version) = captures[1].parse::<u8>()
            && let Some(version) = supported(version)
        {
            return version;
        }
    }
    ApiVersion(CURRENT_VERSION)
}

/// Stamps the version response headers onto `headers`.
pub fn apply_response_headers(headers: &mut HeaderMap, version: ApiVersion) {
    headers.insert(
        VERSION_HEADER,
        HeaderValue::from_str(&version.0.to_string()).expect("version header value"),
    );
    headers.insert(
        "vary",
        HeaderValue::from_static("X-API-Version, Accept"),
    );
    if version.is_deprecated() {
        headers.insert("deprecation", HeaderValue::from_static("true"));
        headers.insert("sunset", HeaderValue::from_static(V1_SUNSET));
        headers.insert(
            "warning",
            HeaderValue::from_static("299 - \"API version deprecated; migrate to v2\""),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn explicit_header_wins() {
        let version = negotiate(&headers(&[("x-api-version", "1")]));
        assert_eq!(version, ApiVersion(1));
    }

    #[test]
    fn vendor_media_type() {
        let version = negotiate(&headers(&[("accept", "application/vnd.railgate.v1+json")]));
        assert_eq!(version, ApiVersion(1));
    }

    #[test]
    fn accept_version_param() {
        let version = negotiate(&headers(&[("accept", "application/json; version=1")]));
        assert_eq!(version, ApiVersion(1));
    }

    #[test]
    fn default_and_unknown_fall_back_to_current() {
        assert_eq!(negotiate(&headers(&[])), ApiVersion(CURRENT_VERSION));
        assert_eq!(
            negotiate(&headers(&[("x-api-version", "99")])),
            ApiVersion(CURRENT_VERSION)
        );
    }

    #[test]
    fn deprecated_version_gets_sunset_headers() {
        let mut map = HeaderMap::new();
        apply_response_headers(&mut map, ApiVersion(1));
        assert_eq!(map.get("x-api-version").unwrap(), "1");
        assert_eq!(map.get("deprecation").unwrap(), "true");
        assert!(map.contains_key("sunset"));
        assert!(map.contains_key("warning"));

        let mut map = HeaderMap::new();
        apply_response_headers(&mut map, ApiVersion(2));
        assert!(!map.contains_key("deprecation"));
        assert!(map.contains_key("vary"));
    }
}
