//! GitHub `X-Hub-Signature-256` verification

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Verifies that `body` was signed with `secret`.
///
/// `secret` is `None` only when unsigned webhooks were explicitly allowed at
/// startup; every such request is accepted and logged as degraded security.
/// A missing header is always rejected. The digest comparison runs in
/// constant time.
pub fn verify_signature(secret: Option<&str>, body: &[u8], signature_header: Option<&str>) -> bool {
    let Some(secret) = secret else {
        warn!("No webhook secret configured - skipping signature verification");
        return true;
    };

    let Some(signature_header) = signature_header else {
        return false;
    };

    // Expected format: "sha256=<lowercase hex>"
    let Some(provided_hex) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        debug!("Signature header without '{}' prefix", SIGNATURE_PREFIX);
        return false;
    };

    // Uppercase hex would decode fine but is not what the header format allows
    if provided_hex.bytes().any(|b| b.is_ascii_uppercase()) {
        return false;
    }

    let provided = match hex::decode(provided_hex) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Signature is not valid hex: {}", e);
            return false;
        }
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);

    mac.verify_slice(&provided).is_ok()
}

/// Renders the header value GitHub would send for `body`.
pub fn compute_signature(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}
