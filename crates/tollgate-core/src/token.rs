//! Bearer token minting and verification.
//!
//! Tokens are HS256 JWTs with the claim set `{sub, role, iat, exp}`.
//! The role string is the only authoritative claim — capability sets are
//! reconstructed from it on every verify and never trusted from the
//! payload. Default lifetime is 24 hours.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::error::AuthError;

/// Signed claim set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id (lowercased username).
    pub sub: String,
    /// Role string; unknown values collapse to `observer` at verify time.
    pub role: String,
    /// Issued-at, seconds since epoch.
    pub iat: i64,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

/// Mints and verifies bearer tokens with a shared HS256 secret.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenSigner {
    /// Create a signer from a shared secret and token lifetime.
    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // No clock slack: an expired token is expired.
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    /// Mint a token for a principal.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenInvalid`] if signing fails.
    pub fn mint(&self, principal_id: &str, role: Role) -> Result<String, AuthError> {
        self.mint_with_role_str(principal_id, role.as_str())
    }

    /// Mint a token with a raw role string.
    ///
    /// Exists for tooling and tests; production paths go through
    /// [`TokenSigner::mint`] with a typed role.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenInvalid`] if signing fails.
    pub fn mint_with_role_str(&self, principal_id: &str, role: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        #[allow(clippy::cast_possible_wrap)]
        let claims = Claims {
            sub: principal_id.to_owned(),
            role: role.to_owned(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding).map_err(|e| {
            AuthError::TokenInvalid {
                reason: e.to_string(),
            }
        })
    }

    /// Decode and verify a token.
    ///
    /// # Errors
    ///
    /// - [`AuthError::TokenExpired`] if past `exp`.
    /// - [`AuthError::TokenInvalid`] for any other decode/signature failure.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::TokenInvalid {
                    reason: e.to_string(),
                },
            })
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_verify_roundtrip() {
        let signer = TokenSigner::new(b"secret", Duration::from_secs(3600));
        let token = signer.mint("alice", Role::Operator).unwrap();

        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.role, "operator");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let signer = TokenSigner::new(b"secret", Duration::from_secs(3600));
        let other = TokenSigner::new(b"different", Duration::from_secs(3600));

        let token = signer.mint("alice", Role::Admin).unwrap();
        assert!(matches!(
            other.verify(&token),
            Err(AuthError::TokenInvalid { .. })
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let signer = TokenSigner::new(b"secret", Duration::from_secs(3600));
        assert!(matches!(
            signer.verify("not-a-jwt"),
            Err(AuthError::TokenInvalid { .. })
        ));
    }

    #[test]
    fn expired_token_is_expired() {
        let signer = TokenSigner::new(b"secret", Duration::from_secs(3600));

        let now = Utc::now().timestamp();
        let stale = Claims {
            sub: "alice".to_owned(),
            role: "admin".to_owned(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token =
            jsonwebtoken::encode(&Header::default(), &stale, &EncodingKey::from_secret(b"secret"))
                .unwrap();

        assert!(matches!(signer.verify(&token), Err(AuthError::TokenExpired)));
    }
}
