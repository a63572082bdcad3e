//! Signature verification for the enterprise chat webhook, decoupled from
//! any particular HTTP framework: callers hand in the raw header value(s)
//! and body bytes they already extracted. Mirrors the two auth modes
//! `relay_core::config::WebhookAuthMode` already names.

use hmac::{Hmac, Mac};
use relay_core::config::WebhookAuthMode;
use sha2::Sha256;

use crate::error::{EnterpriseError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Verifies `body` against `mode`. `signature_header` is the raw
/// `X-Hub-Signature-256`-style header value for [`WebhookAuthMode::HmacSha256`];
/// `authorization_header` is the raw `Authorization` header value for
/// [`WebhookAuthMode::BearerToken`]. Either may be `None` if the caller
/// didn't receive that header — verification then fails rather than
/// silently passing.
pub fn verify(
    mode: &WebhookAuthMode,
    secret: Option<&str>,
    signature_header: Option<&str>,
    authorization_header: Option<&str>,
    body: &[u8],
) -> Result<()> {
    match mode {
        WebhookAuthMode::HmacSha256 => verify_hmac_sha256(secret, signature_header, body),
        WebhookAuthMode::BearerToken => verify_bearer_token(secret, authorization_header),
        WebhookAuthMode::None => Ok(()),
    }
}

/// GitHub-style HMAC-SHA256: `sha256=<hex>`.
fn verify_hmac_sha256(secret: Option<&str>, signature_header: Option<&str>, body: &[u8]) -> Result<()> {
    let secret = secret.ok_or_else(|| {
        EnterpriseError::AuthFailed("no HMAC secret configured".to_string())
    })?;
    let sig_header = signature_header.ok_or_else(|| {
        EnterpriseError::AuthFailed("missing signature header".to_string())
    })?;
    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| EnterpriseError::AuthFailed("malformed signature header".to_string()))?;
    let expected = hex::decode(sig_hex)
        .map_err(|_| EnterpriseError::AuthFailed("signature header is not valid hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| EnterpriseError::AuthFailed("invalid HMAC key length".to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| EnterpriseError::AuthFailed("HMAC signature mismatch".to_string()))
}

/// Static bearer token in `Authorization: Bearer <token>`.
fn verify_bearer_token(secret: Option<&str>, authorization_header: Option<&str>) -> Result<()> {
    let expected = secret.ok_or_else(|| {
        EnterpriseError::AuthFailed("no bearer token configured".to_string())
    })?;
    let header = authorization_header.ok_or_else(|| {
        EnterpriseError::AuthFailed("missing Authorization header".to_string())
    })?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| EnterpriseError::AuthFailed("Authorization header must use Bearer scheme".to_string()))?;

    if token == expected {
        Ok(())
    } else {
        Err(EnterpriseError::AuthFailed("bearer token mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_mode_always_passes() {
        assert!(verify(&WebhookAuthMode::None, None, None, None, b"{}").is_ok());
    }

    #[test]
    fn hmac_mode_accepts_a_matching_signature() {
        let mut mac = HmacSha256::new_from_slice(b"shh").unwrap();
        mac.update(b"{\"a\":1}");
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={sig}");
        assert!(verify(
            &WebhookAuthMode::HmacSha256,
            Some("shh"),
            Some(&header),
            None,
            b"{\"a\":1}"
        )
        .is_ok());
    }

    #[test]
    fn hmac_mode_rejects_a_tampered_body() {
        let mut mac = HmacSha256::new_from_slice(b"shh").unwrap();
        mac.update(b"{\"a\":1}");
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={sig}");
        assert!(verify(
            &WebhookAuthMode::HmacSha256,
            Some("shh"),
            Some(&header),
            None,
            b"{\"a\":2}"
        )
        .is_err());
    }

    #[test]
    fn bearer_mode_rejects_wrong_token() {
        assert!(verify(
            &WebhookAuthMode::BearerToken,
            Some("correct-token"),
            None,
            Some("Bearer wrong-token"),
            b"{}"
        )
        .is_err());
    }

    #[test]
    fn bearer_mode_accepts_matching_token() {
        assert!(verify(
            &WebhookAuthMode::BearerToken,
            Some("correct-token"),
            None,
            Some("Bearer correct-token"),
            b"{}"
        )
        .is_ok());
    }
}
