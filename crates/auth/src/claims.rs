use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JWT claims model.
///
/// `sub` becomes the job owner verbatim. Timestamps are Unix seconds so that
/// tokens minted by other services interoperate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject / caller identity.
    pub sub: String,

    /// Issued-at (Unix seconds).
    pub iat: i64,

    /// Expiration (Unix seconds).
    pub exp: i64,
}

impl JwtClaims {
    pub fn new(sub: impl Into<String>, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            sub: sub.into(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expires_at <= issued_at)")]
    InvalidTimeWindow,

    #[error("token subject is empty")]
    EmptySubject,
}

/// Deterministically validate JWT claims.
///
/// Note: this validates the *claims* only. Signature verification happens in
/// the resolver.
pub fn validate_claims(claims: &JwtClaims, now: DateTime<Utc>) -> Result<(), TokenValidationError> {
    let now = now.timestamp();
    if claims.sub.trim().is_empty() {
        return Err(TokenValidationError::EmptySubject);
    }
    if claims.exp <= claims.iat {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.iat {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn accepts_token_inside_window() {
        let now = Utc::now();
        let claims = JwtClaims::new("user-1", now - Duration::minutes(1), now + Duration::minutes(5));
        assert_eq!(validate_claims(&claims, now), Ok(()));
    }

    #[test]
    fn rejects_expired_and_future_tokens() {
        let now = Utc::now();
        let expired = JwtClaims::new("u", now - Duration::minutes(10), now - Duration::minutes(1));
        assert_eq!(validate_claims(&expired, now), Err(TokenValidationError::Expired));

        let future = JwtClaims::new("u", now + Duration::minutes(1), now + Duration::minutes(10));
        assert_eq!(validate_claims(&future, now), Err(TokenValidationError::NotYetValid));
    }

    #[test]
    fn rejects_inverted_window_and_blank_subject() {
        let now = Utc::now();
        let inverted = JwtClaims::new("u", now, now - Duration::seconds(1));
        assert_eq!(
            validate_claims(&inverted, now),
            Err(TokenValidationError::InvalidTimeWindow)
        );

        let blank = JwtClaims::new(" ", now, now + Duration::minutes(1));
        assert_eq!(validate_claims(&blank, now), Err(TokenValidationError::EmptySubject));
    }
}
