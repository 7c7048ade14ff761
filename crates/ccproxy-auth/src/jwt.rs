use base64::Engine;
use serde_json::Value;

/// Decode the claims segment of a JWT without verifying the signature.
///
/// ccproxy only mirrors tokens the vendor CLIs already store locally; the
/// claims are used for profile display, never for trust decisions.
pub fn decode_claims(token: &str) -> Option<Value> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .ok()?;
    serde_json::from_slice(&raw).ok()
}

/// `exp` claim as unix seconds, when present.
pub fn expiry(token: &str) -> Option<i64> {
    decode_claims(token)?.get("exp")?.as_i64()
}
