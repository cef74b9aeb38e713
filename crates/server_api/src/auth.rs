//! Bearer credential verification.
//!
//! Tokens are issued elsewhere; this side only decodes them into a user id.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{domain::UserId, error::ApiError};
use tracing::debug;

pub const MISSING_TOKEN: &str = "authentication token required";
pub const INVALID_TOKEN: &str = "invalid authentication token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: UserId,
    pub expires_at: Option<DateTime<Utc>>,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedIdentity, ApiError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default)]
    iat: i64,
}

/// HS256 verifier whose `sub` claim is the decimal user id.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedIdentity, ApiError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|error| {
            debug!(%error, "rejected bearer token");
            ApiError::unauthorized(INVALID_TOKEN)
        })?;
        let user_id = data
            .claims
            .sub
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| ApiError::unauthorized(INVALID_TOKEN))?;
        Ok(VerifiedIdentity {
            user_id,
            expires_at: DateTime::from_timestamp(data.claims.exp, 0),
        })
    }
}

/// Issues a token in the format `JwtVerifier` accepts. Operator tooling and tests only.
pub fn mint_token(
    secret: &str,
    user_id: UserId,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.0.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Extracts the credential from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
