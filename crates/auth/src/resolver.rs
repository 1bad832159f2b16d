//! Credential -> owner resolution.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use thiserror::Error;

use docflow_core::Owner;

use crate::claims::{validate_claims, JwtClaims, TokenValidationError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed or badly signed token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Claims(#[from] TokenValidationError),
}

/// Resolves a bearer credential to the caller's identity.
pub trait OwnerResolver: Send + Sync {
    fn resolve(&self, token: &str, now: DateTime<Utc>) -> Result<Owner, AuthError>;
}

/// HS256-signed JWTs with a shared secret.
#[derive(Clone)]
pub struct Hs256OwnerResolver {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Hs256OwnerResolver {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Mint a token for `owner`, valid for `ttl` from `now`.
    pub fn issue(&self, owner: &Owner, now: DateTime<Utc>, ttl: Duration) -> Result<String, AuthError> {
        let claims = JwtClaims::new(owner.as_str(), now, now + ttl);
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

impl std::fmt::Debug for Hs256OwnerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hs256OwnerResolver").finish_non_exhaustive()
    }
}

impl OwnerResolver for Hs256OwnerResolver {
    fn resolve(&self, token: &str, now: DateTime<Utc>) -> Result<Owner, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Time checks are done by `validate_claims` against the caller's clock.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = decode::<JwtClaims>(token, &self.decoding, &validation)?;
        validate_claims(&data.claims, now)?;

        Owner::new(data.claims.sub).map_err(|_| AuthError::Claims(TokenValidationError::EmptySubject))
    }
}
