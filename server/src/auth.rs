//! Bearer token verification for subscriber admission.
//!
//! Subscribers present an HMAC-signed JWT in the `Authorization` header of the
//! WebSocket upgrade request. Tokens are issued by the external credential
//! service; this module only verifies them.
//!
//! # Overview
//!
//! Verification works as follows:
//! 1. The header value must start with `Bearer ` followed by a non-empty token.
//!    Anything else is rejected before any cryptographic work is done.
//! 2. The token signature is checked against the shared secret (`HS256` only).
//! 3. The `exp` claim must be present and in the future.
//! 4. The subject (`username`, falling back to `sub`) and `role` claims must be
//!    present and non-empty.
//!
//! # Example
//!
//! ```rust
//! use livewire_server::auth::{extract_bearer, AuthError, TokenVerifier};
//!
//! let verifier = TokenVerifier::new(b"shared-secret");
//!
//! assert_eq!(extract_bearer(Some("Basic abc")), Err(AuthError::MalformedHeader));
//! assert!(verifier.verify("not-a-jwt").is_err());
//! ```

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix required on the `Authorization` header value.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Errors produced while verifying a subscriber credential.
///
/// Every variant maps to `401 Unauthorized`; the variants exist so the reason
/// can be logged without logging the token itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization` header was sent.
    #[error("missing authorization header")]
    MissingHeader,

    /// The header does not have the `Bearer <token>` shape.
    #[error("malformed authorization header")]
    MalformedHeader,

    /// The token failed to decode or its signature did not verify.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token's `exp` instant has passed.
    #[error("token expired")]
    Expired,

    /// A required identity claim is absent or empty.
    #[error("missing required claim: {0}")]
    MissingClaim(&'static str),
}

impl AuthError {
    /// Returns `true` if the request never carried a usable bearer token.
    ///
    /// These failures are detected without touching the token contents.
    pub fn is_header_error(&self) -> bool {
        matches!(self, Self::MissingHeader | Self::MalformedHeader)
    }
}

/// Claims carried by tokens from the credential service.
///
/// Only the fields the hub consumes are modelled. Additional claims are
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Login name of the subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Registered subject claim, used when `username` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Role granted to the subject (e.g. `admin`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Expiry as a Unix timestamp in seconds.
    pub exp: i64,
}

/// Verified identity of an admitted subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Subject identity (username).
    pub subject: String,

    /// Role claim.
    pub role: String,

    /// Expiry of the credential that admitted this subscriber.
    ///
    /// Informational only: admitted connections are not re-checked.
    pub expires_at: i64,
}

/// Stateless verifier over a single shared HMAC secret.
///
/// The decoding key and validation rules are built once at startup and never
/// mutated, so a verifier can be shared freely across tasks.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Creates a verifier for tokens signed with `secret` using `HS256`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verifies a raw token (without the `Bearer ` prefix).
    ///
    /// # Errors
    ///
    /// - [`AuthError::Expired`] if `exp` is in the past
    /// - [`AuthError::InvalidToken`] for bad signatures, wrong algorithms,
    ///   or undecodable tokens
    /// - [`AuthError::MissingClaim`] if the subject or role is missing or empty
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(err.to_string()),
            },
        )?;
        let claims = data.claims;

        // A token expiring this very second is already expired.
        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        let subject = non_empty(claims.username)
            .or_else(|| non_empty(claims.sub))
            .ok_or(AuthError::MissingClaim("username"))?;
        let role = non_empty(claims.role).ok_or(AuthError::MissingClaim("role"))?;

        Ok(Identity {
            subject,
            role,
            expires_at: claims.exp,
        })
    }

    /// Extracts the bearer token from a header value and verifies it.
    pub fn verify_header(&self, header: Option<&str>) -> Result<Identity, AuthError> {
        let token = extract_bearer(header)?;
        self.verify(token)
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("key", &"<redacted>")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

/// Extracts the token from an `Authorization` header value.
///
/// Only the exact `Bearer ` prefix is accepted, and the remainder must be
/// non-empty.
pub fn extract_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingHeader)?;
    match value.strip_prefix(BEARER_PREFIX) {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(AuthError::MalformedHeader),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
