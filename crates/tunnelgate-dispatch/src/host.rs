//! `Host` header parsing: subdomain extraction relative to a configured
//! base domain.

use http::HeaderMap;

/// Strip a trailing `:port` from a host header value.
pub fn normalize_host(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Case-insensitive `Host` header lookup.
pub fn extract_host_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(http::header::HOST)?.to_str().ok()
}

/// Pull the leftmost DNS label below `base_domain` out of `host`, or
/// `None` if `host` isn't a (strict) subdomain of `base_domain` at all
/// (bare apex, unrelated domain, or missing suffix).
pub fn extract_subdomain(host: &str, base_domain: &str) -> Option<String> {
    let host = normalize_host(host);
    let suffix = format!(".{base_domain}");
    let remainder = host.strip_suffix(&suffix)?;
    if remainder.is_empty() {
        return None;
    }
    remainder.split('.').next().map(str::to_string)
}
