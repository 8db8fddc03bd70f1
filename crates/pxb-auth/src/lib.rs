//! Bearer-token verification and the per-request identity context.
//!
//! Identity is an opaque subject (plus optional entity ID) extracted from an
//! HS256 bearer token. A development fallback accepts a well-known header
//! carrying an entity ID directly; it must stay disabled in production.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pxb_schemas::{BrokerError, Identity, Result};

/// Header honoured when dev-mode header auth is enabled.
pub const DEV_ENTITY_HEADER: &str = "x-pxbox-entity";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity_id: Option<Uuid>,
    exp: i64,
}

#[derive(Clone)]
pub struct TokenVerifier {
    secret: String,
    dev_header_enabled: bool,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>, dev_header_enabled: bool) -> Self {
        Self {
            secret: secret.into(),
            dev_header_enabled,
        }
    }

    /// Verify a bearer token and produce the caller identity.
    pub fn verify(&self, token: &str) -> Result<Identity> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| BrokerError::Unauthorized(format!("bearer verification failed: {e}")))?;
        Ok(Identity {
            subject: data.claims.sub,
            entity_id: data.claims.entity_id,
        })
    }

    /// Resolve identity from an `Authorization: Bearer ...` value and/or the
    /// dev entity header. A bearer credential always wins; the header only
    /// applies when none is present and dev mode is on.
    pub fn authenticate(
        &self,
        authorization: Option<&str>,
        dev_entity_header: Option<&str>,
    ) -> Result<Identity> {
        if let Some(auth) = authorization {
            let token = auth
                .strip_prefix("Bearer ")
                .or_else(|| auth.strip_prefix("bearer "))
                .ok_or_else(|| {
                    BrokerError::Unauthorized("authorization header is not a bearer token".into())
                })?;
            return self.verify(token.trim());
        }

        if self.dev_header_enabled {
            if let Some(raw) = dev_entity_header {
                let entity_id = Uuid::parse_str(raw.trim()).map_err(|_| {
                    BrokerError::Unauthorized(format!("bad {DEV_ENTITY_HEADER} header"))
                })?;
                return Ok(Identity {
                    subject: format!("dev:{entity_id}"),
                    entity_id: Some(entity_id),
                });
            }
        }

        Err(BrokerError::Unauthorized("missing bearer token".into()))
    }

    /// Issue a token. Used by tests and operator tooling; the broker itself
    /// only verifies.
    pub fn issue(
        &self,
        subject: &str,
        entity_id: Option<Uuid>,
        ttl_secs: i64,
    ) -> Result<String> {
        let claims = Claims {
            sub: subject.to_string(),
            entity_id,
            exp: Utc::now().timestamp() + ttl_secs,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| BrokerError::Internal(format!("token encode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_token() {
        let v = TokenVerifier::new("test-secret", false);
        let entity = Uuid::now_v7();
        let token = v.issue("agent:alpha", Some(entity), 60).unwrap();

        let id = v
            .authenticate(Some(&format!("Bearer {token}")), None)
            .unwrap();
        assert_eq!(id.subject, "agent:alpha");
        assert_eq!(id.entity_id, Some(entity));
    }

    #[test]
    fn wrong_secret_is_unauthorized() {
        let issuer = TokenVerifier::new("secret-a", false);
        let verifier = TokenVerifier::new("secret-b", false);
        let token = issuer.issue("agent:alpha", None, 60).unwrap();
        let err = verifier.verify(&token).unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn expired_token_is_unauthorized() {
        let v = TokenVerifier::new("test-secret", false);
        let token = v.issue("agent:alpha", None, -120).unwrap();
        assert!(v.verify(&token).is_err());
    }

    #[test]
    fn dev_header_only_when_enabled() {
        let entity = Uuid::now_v7();
        let raw = entity.to_string();

        let off = TokenVerifier::new("s", false);
        assert!(off.authenticate(None, Some(&raw)).is_err());

        let on = TokenVerifier::new("s", true);
        let id = on.authenticate(None, Some(&raw)).unwrap();
        assert_eq!(id.entity_id, Some(entity));
        assert!(id.subject.starts_with("dev:"));
    }

    #[test]
    fn missing_credentials_fail() {
        let v = TokenVerifier::new("s", true);
        let err = v.authenticate(None, None).unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }
}
