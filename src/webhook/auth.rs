//! Webhook authentication.
//!
//! Requests carry an API key, a unix-seconds timestamp and an HMAC-SHA256
//! signature over `METHOD|PATH|TIMESTAMP|BODY`. Verification requires the
//! signature to match and the timestamp to sit within the configured skew
//! window, so captured requests cannot be replayed later.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::{AuthConfig, AuthType};

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("missing X-API-Key header")]
    MissingApiKey,
    #[error("API key mismatch")]
    BadApiKey,
    #[error("missing or malformed X-Timestamp header")]
    MissingTimestamp,
    #[error("timestamp outside the allowed skew window")]
    StaleTimestamp,
    #[error("missing X-Signature header")]
    MissingSignature,
    #[error("signature verification failed")]
    BadSignature,
}

/// Hex HMAC-SHA256 over the signing envelope.
pub fn sign(secret: &str, method: &str, path: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(method.as_bytes());
    mac.update(b"|");
    mac.update(path.as_bytes());
    mac.update(b"|");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b"|");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check.
fn verify_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    body: &[u8],
    signature_hex: &str,
) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(method.as_bytes());
    mac.update(b"|");
    mac.update(path.as_bytes());
    mac.update(b"|");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b"|");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Pieces of an inbound request that participate in authentication.
#[derive(Debug, Clone, Copy)]
pub struct RequestAuth<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub api_key: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

/// Verify an inbound request against the configured auth scheme.
pub fn verify_request(
    auth: &AuthConfig,
    request: &RequestAuth<'_>,
    now_unix: i64,
) -> Result<(), AuthFailure> {
    if auth.auth_type == AuthType::None {
        return Ok(());
    }

    if !auth.api_key.is_empty() {
        let presented = request.api_key.ok_or(AuthFailure::MissingApiKey)?;
        if presented != auth.api_key {
            return Err(AuthFailure::BadApiKey);
        }
    }

    if auth.enable_hmac {
        let timestamp: i64 = request
            .timestamp
            .and_then(|t| t.parse().ok())
            .ok_or(AuthFailure::MissingTimestamp)?;
        if (now_unix - timestamp).abs() > auth.timestamp_skew_secs {
            return Err(AuthFailure::StaleTimestamp);
        }
        let signature = request.signature.ok_or(AuthFailure::MissingSignature)?;
        if !verify_signature(
            &auth.shared_secret,
            request.method,
            request.path,
            timestamp,
            request.body,
            signature,
        ) {
            return Err(AuthFailure::BadSignature);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";
    const PATH: &str = "/webhook/results";
    const BODY: &[u8] = br#"{"jobId":"J"}"#;

    fn auth_config() -> AuthConfig {
        AuthConfig {
            api_key: "key-1".to_string(),
            shared_secret: SECRET.to_string(),
            enable_hmac: true,
            auth_type: AuthType::Hmac,
            timestamp_skew_secs: 300,
        }
    }

    fn signed_request<'a>(signature: &'a str, timestamp: &'a str) -> RequestAuth<'a> {
        RequestAuth {
            method: "POST",
            path: PATH,
            api_key: Some("key-1"),
            timestamp: Some(timestamp),
            signature: Some(signature),
            body: BODY,
        }
    }

    #[test]
    fn test_valid_signature_accepted() {
        let now = 1_700_000_000;
        let signature = sign(SECRET, "POST", PATH, now, BODY);
        let ts = now.to_string();
        let request = signed_request(&signature, &ts);
        assert_eq!(verify_request(&auth_config(), &request, now), Ok(()));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let now = 1_700_000_000;
        let signature = sign(SECRET, "POST", PATH, now, BODY);
        let ts = now.to_string();
        let mut request = signed_request(&signature, &ts);
        request.body = br#"{"jobId":"K"}"#;
        assert_eq!(
            verify_request(&auth_config(), &request, now),
            Err(AuthFailure::BadSignature)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = 1_700_000_000;
        let signature = sign("other-secret", "POST", PATH, now, BODY);
        let ts = now.to_string();
        let request = signed_request(&signature, &ts);
        assert_eq!(
            verify_request(&auth_config(), &request, now),
            Err(AuthFailure::BadSignature)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let now = 1_700_000_000;
        let old = now - 301;
        let signature = sign(SECRET, "POST", PATH, old, BODY);
        let ts = old.to_string();
        let request = signed_request(&signature, &ts);
        assert_eq!(
            verify_request(&auth_config(), &request, now),
            Err(AuthFailure::StaleTimestamp)
        );
    }

    #[test]
    fn test_timestamp_at_window_edge_accepted() {
        let now = 1_700_000_000;
        let edge = now - 300;
        let signature = sign(SECRET, "POST", PATH, edge, BODY);
        let ts = edge.to_string();
        let request = signed_request(&signature, &ts);
        assert_eq!(verify_request(&auth_config(), &request, now), Ok(()));
    }

    #[test]
    fn test_future_timestamp_within_skew_accepted() {
        let now = 1_700_000_000;
        let future = now + 100;
        let signature = sign(SECRET, "POST", PATH, future, BODY);
        let ts = future.to_string();
        let request = signed_request(&signature, &ts);
        assert_eq!(verify_request(&auth_config(), &request, now), Ok(()));
    }

    #[test]
    fn test_bad_api_key_rejected() {
        let now = 1_700_000_000;
        let signature = sign(SECRET, "POST", PATH, now, BODY);
        let ts = now.to_string();
        let mut request = signed_request(&signature, &ts);
        request.api_key = Some("wrong");
        assert_eq!(
            verify_request(&auth_config(), &request, now),
            Err(AuthFailure::BadApiKey)
        );
    }

    #[test]
    fn test_missing_headers_rejected() {
        let now = 1_700_000_000;
        let signature = sign(SECRET, "POST", PATH, now, BODY);
        let ts = now.to_string();

        let mut request = signed_request(&signature, &ts);
        request.api_key = None;
        assert_eq!(
            verify_request(&auth_config(), &request, now),
            Err(AuthFailure::MissingApiKey)
        );

        let mut request = signed_request(&signature, &ts);
        request.timestamp = None;
        assert_eq!(
            verify_request(&auth_config(), &request, now),
            Err(AuthFailure::MissingTimestamp)
        );

        let mut request = signed_request(&signature, &ts);
        request.signature = None;
        assert_eq!(
            verify_request(&auth_config(), &request, now),
            Err(AuthFailure::MissingSignature)
        );
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let now = 1_700_000_000;
        let ts = now.to_string();
        let request = signed_request("zz-not-hex", &ts);
        assert_eq!(
            verify_request(&auth_config(), &request, now),
            Err(AuthFailure::BadSignature)
        );
    }

    #[test]
    fn test_auth_type_none_accepts_anything() {
        let config = AuthConfig {
            auth_type: AuthType::None,
            ..auth_config()
        };
        let request = RequestAuth {
            method: "POST",
            path: PATH,
            api_key: None,
            timestamp: None,
            signature: None,
            body: BODY,
        };
        assert_eq!(verify_request(&config, &request, 0), Ok(()));
    }

    #[test]
    fn test_api_key_only_when_hmac_disabled() {
        let config = AuthConfig {
            enable_hmac: false,
            auth_type: AuthType::ApiKey,
            ..auth_config()
        };
        let request = RequestAuth {
            method: "POST",
            path: PATH,
            api_key: Some("key-1"),
            timestamp: None,
            signature: None,
            body: BODY,
        };
        assert_eq!(verify_request(&config, &request, 0), Ok(()));
    }
}
