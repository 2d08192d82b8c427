use subtle::ConstantTimeEq;
use tracing::warn;

/// Answers the provider's subscription handshake.
///
/// Returns the challenge to echo back when `provided` matches the configured
/// verify token; `None` rejects the handshake. An empty configured token never
/// matches.
///
/// ```
/// use security::accept_challenge;
///
/// assert_eq!(accept_challenge("verify-me", Some("verify-me"), Some("42")), Some("42".to_string()));
/// assert_eq!(accept_challenge("verify-me", Some("nope"), Some("42")), None);
/// ```
pub fn accept_challenge(
    expected: &str,
    provided: Option<&str>,
    challenge: Option<&str>,
) -> Option<String> {
    let provided = provided?;
    if expected.is_empty() || !bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        warn!("subscription handshake with wrong verify token");
        return None;
    }
    Some(challenge.unwrap_or_default().to_string())
}
