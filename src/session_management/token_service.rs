//! HS512 session tokens.
//!
//! A token binds a `SessionKey` to an expiry. Validation never fails loudly: callers get
//! `None` and the reason is logged.

use crate::configuration::config::MIN_SECRET_BYTES;
use crate::error_handling::types::TokenError;
use crate::session_management::session::SessionKey;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    #[serde(rename = "resourceId", default, skip_serializing_if = "Option::is_none")]
    resource_id: Option<String>,
    #[serde(rename = "resourceType", default, skip_serializing_if = "Option::is_none")]
    resource_type: Option<String>,
    iat: i64,
    exp: i64,
    /// `exp` only has second precision.
    #[serde(rename = "expMs", default, skip_serializing_if = "Option::is_none")]
    exp_ms: Option<i64>,
}

pub struct SessionTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SessionTokenService {
    /// Builds the service around the HMAC secret. A short secret is a startup error.
    pub fn new(secret: &[u8]) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_BYTES {
            return Err(TokenError::KeyInitFailed(format!(
                "secret is {} bytes, at least {} are required",
                secret.len(),
                MIN_SECRET_BYTES
            )));
        }
        let mut validation = Validation::new(Algorithm::HS512);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        })
    }

    pub fn generate_token(&self, key: &SessionKey, ttl: Duration) -> Result<String, TokenError> {
        let issued_ms = Utc::now().timestamp_millis();
        let expires_ms = issued_ms.saturating_add(ttl.as_millis() as i64);
        let claims = SessionClaims {
            sub: key.user_id.to_string(),
            resource_id: Some(key.resource_id.to_string()),
            resource_type: Some(key.resource_type.clone()),
            iat: issued_ms / 1000,
            exp: (expires_ms + 999) / 1000,
            exp_ms: Some(expires_ms),
        };
        encode(&Header::new(Algorithm::HS512), &claims, &self.encoding_key)
            .map_err(|e| TokenError::SigningFailed(e.to_string()))
    }

    pub fn validate(&self, token: &str) -> Option<SessionKey> {
        let token = token.trim();
        if token.is_empty() {
            warn!("Rejected session token: empty");
            return None;
        }

        let claims = match decode::<SessionClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "expired",
                    ErrorKind::InvalidSignature => "invalid signature",
                    ErrorKind::InvalidAlgorithm => "unsupported algorithm",
                    ErrorKind::MissingRequiredClaim(_) => "missing required claims",
                    ErrorKind::InvalidToken
                    | ErrorKind::Base64(_)
                    | ErrorKind::Json(_)
                    | ErrorKind::Utf8(_) => "malformed",
                    _ => "unusable",
                };
                warn!("Rejected session token: {}", reason);
                debug!("Token decode error: {}", e);
                return None;
            }
        };

        if let Some(exp_ms) = claims.exp_ms {
            if Utc::now().timestamp_millis() >= exp_ms {
                warn!("Rejected session token: expired");
                return None;
            }
        }

        let (Some(resource_id), Some(resource_type)) = (claims.resource_id, claims.resource_type)
        else {
            warn!("Rejected session token: missing resource claims");
            return None;
        };
        let (Ok(user_id), Ok(resource_id)) =
            (Uuid::parse_str(&claims.sub), Uuid::parse_str(&resource_id))
        else {
            warn!("Rejected session token: malformed identifiers");
            return None;
        };
        if resource_type.is_empty() {
            warn!("Rejected session token: missing resource claims");
            return None;
        }

        Some(SessionKey {
            user_id,
            resource_id,
            resource_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"an-hmac-secret-that-is-long-enough-for-hs512-signing";

    fn key() -> SessionKey {
        SessionKey {
            user_id: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            resource_type: "SSH".to_string(),
        }
    }

    fn service() -> SessionTokenService {
        SessionTokenService::new(SECRET).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let service = service();
        for _ in 0..5 {
            let k = key();
            let token = service
                .generate_token(&k, Duration::from_secs(60))
                .unwrap();
            assert_eq!(service.validate(&token), Some(k));
        }
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let service = service();
        let token = service
            .generate_token(&key(), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(service.validate(&token), None);
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let token = service()
            .generate_token(&key(), Duration::from_secs(60))
            .unwrap();
        let other =
            SessionTokenService::new(b"a-different-secret-of-sufficient-length-0123456789")
                .unwrap();
        assert_eq!(other.validate(&token), None);
    }

    #[test]
    fn test_garbage_and_empty_are_rejected() {
        let service = service();
        assert_eq!(service.validate(""), None);
        assert_eq!(service.validate("   "), None);
        assert_eq!(service.validate("not.a.token"), None);
        assert_eq!(service.validate("abc"), None);
    }

    #[test]
    fn test_missing_resource_claims_are_rejected() {
        let claims = SessionClaims {
            sub: Uuid::new_v4().to_string(),
            resource_id: None,
            resource_type: Some("SSH".to_string()),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 60,
            exp_ms: None,
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert_eq!(service().validate(&token), None);
    }

    #[test]
    fn test_other_algorithm_is_rejected() {
        let k = key();
        let claims = SessionClaims {
            sub: k.user_id.to_string(),
            resource_id: Some(k.resource_id.to_string()),
            resource_type: Some(k.resource_type.clone()),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 60,
            exp_ms: None,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert_eq!(service().validate(&token), None);
    }

    #[test]
    fn test_short_secret_fails_initialization() {
        assert!(matches!(
            SessionTokenService::new(b"short"),
            Err(TokenError::KeyInitFailed(_))
        ));
    }
}
