//! Error types for the Livewire server.
//!
//! Each concern owns its own error enum; [`ServerError`] ties them together
//! for the HTTP surface and process bootstrap.
//!
//! # Error Types
//!
//! - [`ConfigError`] - Configuration errors (missing values, parse failures)
//! - [`AuthError`] - Subscriber credential rejected (`401`)
//! - [`DeliveryError`](crate::registry::DeliveryError) - A write to one
//!   subscriber failed; handled inside the registry and never surfaced here
//! - [`HubError`](crate::broadcast::HubError) - The ingestion queue is closed
//! - [`ServerError`] - Top-level server errors encompassing all failure modes
//!
//! # Example
//!
//! ```rust
//! use livewire_server::auth::AuthError;
//! use livewire_server::error::ServerError;
//!
//! let err: ServerError = AuthError::Expired.into();
//! assert!(err.is_client_error());
//! assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
//! ```

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub use crate::auth::AuthError;
pub use crate::config::ConfigError;

/// Top-level error type for the Livewire server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// The subscriber's credential was missing, malformed, or invalid.
    Auth(AuthError),

    /// The connection could not be upgraded to a WebSocket.
    ///
    /// No subscriber handle is created.
    Upgrade(String),

    /// Unexpected internal server error (listener bind or serve failure).
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(err) => write!(f, "authentication failed: {err}"),
            Self::Upgrade(msg) => write!(f, "websocket upgrade failed: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Auth(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl ServerError {
    /// Creates a new upgrade error.
    pub fn upgrade(message: impl Into<String>) -> Self {
        Self::Upgrade(message.into())
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the JSON error body.
    ///
    /// Deliberately coarse: the detailed cause is only logged.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Auth(err) if err.is_header_error() => "Missing or malformed Authorization header",
            Self::Auth(_) => "Invalid token",
            Self::Upgrade(_) => "Failed to upgrade to WebSocket",
            _ => "Internal server error",
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable reason.
    pub error: String,
}

impl ErrorResponse {
    /// Creates an error body.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(ErrorResponse::new(self.public_message())),
        )
            .into_response()
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
