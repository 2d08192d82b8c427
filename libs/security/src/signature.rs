use anyhow::{Result, anyhow};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the provider's payload signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const PREFIX: &str = "sha256=";

fn digest(secret: &str, body: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("invalid HMAC key: {e}"))?;
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Signature header value the provider would send for `body`.
///
/// ```
/// let sig = security::compute_signature("app-secret", b"{}").unwrap();
/// assert!(sig.starts_with("sha256="));
/// assert!(security::verify_signature("app-secret", b"{}", Some(&sig)));
/// ```
pub fn compute_signature(secret: &str, body: &[u8]) -> Result<String> {
    Ok(format!("{PREFIX}{}", hex::encode(digest(secret, body)?)))
}

/// Checks `provided` against HMAC-SHA256 of the raw body.
///
/// A missing header, a header without the `sha256=` prefix, bad hex or a
/// digest mismatch all reject the delivery.
pub fn verify_signature(secret: &str, body: &[u8], provided: Option<&str>) -> bool {
    let Some(provided) = provided else {
        debug!("signature header missing");
        return false;
    };
    let Some(hex_part) = provided.trim().strip_prefix(PREFIX) else {
        debug!("signature header without sha256 prefix");
        return false;
    };
    let Ok(provided) = hex::decode(hex_part) else {
        debug!("signature header is not hex");
        return false;
    };
    let Ok(expected) = digest(secret, body) else {
        return false;
    };
    provided.len() == expected.len() && provided.ct_eq(&expected).into()
}
