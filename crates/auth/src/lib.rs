//! `docflow-auth`: resolves caller credentials to an opaque [`Owner`].
//!
//! The job pipeline never looks inside an owner; this crate is the only place
//! that knows owners come from signed bearer tokens.
//!
//! [`Owner`]: docflow_core::Owner

pub mod claims;
pub mod resolver;

pub use claims::{validate_claims, JwtClaims, TokenValidationError};
pub use resolver::{AuthError, Hs256OwnerResolver, OwnerResolver};
