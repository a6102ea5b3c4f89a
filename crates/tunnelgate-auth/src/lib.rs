//! Weak JWT-payload identity check used to gate the tunnel kill endpoint.
//!
//! This is **not** a security boundary. [`same_identity`] decodes the
//! payload segment of a JWT without verifying its signature and compares
//! a `name` claim; it only tells apart "this is probably the same client
//! that created the session" from "this is some other bearer token",
//! matching the interface the rest of the corpus expects from a stored
//! per-session secret, but deliberately not doing actual authentication.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::Value;
use tracing::trace;

/// Decode a JWT's payload segment (no signature check) and pull out its
/// `name` claim. Returns `None` on any malformed input.
fn decode_name_claim(token: &str) -> Option<String> {
    let payload_segment = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload_segment).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.get("name")?.as_str().map(str::to_owned)
}

/// Compare two JWTs by their decoded `name` claim, treating any decode
/// failure or a `None` `stored_secret` as "not the same identity".
pub fn same_identity(stored_secret: Option<&str>, bearer_token: &str) -> bool {
    let Some(stored_secret) = stored_secret else {
        trace!("kill auth rejected: session has no stored secret");
        return false;
    };

    match (
        decode_name_claim(stored_secret),
        decode_name_claim(bearer_token),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => {
            trace!("kill auth rejected: token did not decode to a name claim");
            false
        }
    }
}

/// Strip a case-insensitive `Bearer ` prefix from an `Authorization` header
/// value, returning the raw token.
pub fn extract_bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = header_value.splitn(2, ' ');
    let scheme = parts.next()?;
    let token = parts.next()?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}
