//! HTTP route handlers for the Livewire server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws/live-data` - Authenticated WebSocket subscription endpoint
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The token verifier used to admit subscribers
//! - The subscriber registry the broadcast hub delivers to
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use livewire_server::config::Config;
//! use livewire_server::registry::SubscriberRegistry;
//! use livewire_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config, SubscriberRegistry::new());
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::error::ServerError;
use crate::registry::{DeliveryError, SubscriberHandle, SubscriberRegistry, SubscriberSink};

// ============================================================================
// Constants
// ============================================================================

/// Path of the live telemetry WebSocket endpoint.
pub const LIVE_DATA_PATH: &str = "/ws/live-data";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Cloned for each request handler; every field is cheap to clone and refers
/// to shared server-wide resources.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Verifier for subscriber bearer tokens.
    pub verifier: TokenVerifier,

    /// Live subscribers; shared with the broadcast hub.
    pub registry: SubscriberRegistry,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state, deriving the verifier from the configured
    /// secret.
    ///
    /// `registry` must be the same registry the broadcast hub delivers to.
    #[must_use]
    pub fn new(config: Config, registry: SubscriberRegistry) -> Self {
        let verifier = TokenVerifier::new(config.jwt_secret.as_bytes());
        Self::with_components(config, verifier, registry)
    }

    /// Creates application state with an explicit verifier.
    #[must_use]
    pub fn with_components(
        config: Config,
        verifier: TokenVerifier,
        registry: SubscriberRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            verifier,
            registry,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("verifier", &self.verifier)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// # Returns
///
/// An axum `Router` with the following routes:
/// - `GET /ws/live-data` - WebSocket subscription endpoint
/// - `GET /health` - Health check endpoint
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(LIVE_DATA_PATH, get(get_live_data))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// GET /ws/live-data - WebSocket Subscription
// ============================================================================

/// GET /ws/live-data - Admit a subscriber.
///
/// The `Authorization: Bearer <token>` header is checked before the upgrade
/// is attempted, so a bad credential is reported as `401` even when the
/// request is not a valid WebSocket handshake.
///
/// # WebSocket Protocol
///
/// Once connected, the server forwards every telemetry payload as a text
/// message (binary if the payload is not UTF-8). Anything the client sends is
/// ignored; a close frame or read error ends the subscription.
///
/// # Responses
///
/// - `101 Switching Protocols` - Upgrade successful, subscriber registered
/// - `401 Unauthorized` - Missing, malformed, or invalid token
/// - `500 Internal Server Error` - Valid token but the upgrade failed
async fn get_live_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let header = headers
        .get(AUTHORIZATION)
        .map(|value| value.to_str().unwrap_or_default());

    let identity = match state.verifier.verify_header(header) {
        Ok(identity) => identity,
        Err(err) => {
            debug!(reason = %err, "Rejected subscriber credential");
            return ServerError::from(err).into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(
                subject = %identity.subject,
                error = %rejection.body_text(),
                "WebSocket upgrade failed"
            );
            return ServerError::upgrade(rejection.body_text()).into_response();
        }
    };

    info!(
        subject = %identity.subject,
        role = %identity.role,
        "Subscriber connecting"
    );

    let registry = state.registry.clone();
    ws.on_failed_upgrade(|err| warn!(error = %err, "WebSocket handshake did not complete"))
        .on_upgrade(move |socket| handle_subscriber(socket, registry))
}

/// Wraps the write half of a socket as a hub sink.
fn subscriber_sink<S>(sender: S) -> SubscriberSink
where
    S: futures_util::Sink<Message, Error = axum::Error> + Send + 'static,
{
    Box::pin(
        sender
            .sink_map_err(DeliveryError::transport)
            .with(|payload: Bytes| future::ready(Ok::<_, DeliveryError>(frame(payload)))),
    )
}

/// Frames a payload: text when it is valid UTF-8, binary otherwise.
fn frame(payload: Bytes) -> Message {
    match std::str::from_utf8(&payload) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(payload),
    }
}

/// Handles an established WebSocket connection.
///
/// Registers the write half with the registry and drains the read half until
/// the peer goes away or the registry closes the handle. Either way the read
/// half is dropped on return, which releases the connection.
async fn handle_subscriber(socket: WebSocket, registry: SubscriberRegistry) {
    let (sender, mut receiver) = socket.split();
    let (handle, mut closed) = SubscriberHandle::with_close_signal(subscriber_sink(sender));
    let id = registry.add(handle).await;

    loop {
        let msg = tokio::select! {
            _ = &mut closed => {
                debug!(subscriber = %id, "Subscriber closed by hub, dropping connection");
                return;
            }
            msg = receiver.next() => msg,
        };

        match msg {
            Some(Ok(Message::Close(_))) | None => {
                debug!(subscriber = %id, "Subscriber disconnected");
                break;
            }
            Some(Ok(Message::Ping(data))) => {
                // axum answers pings itself
                trace!(subscriber = %id, data_len = data.len(), "Received ping");
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(subscriber = %id, error = %err, "Subscriber read error");
                break;
            }
        }
    }

    registry.remove(id).await;
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live subscribers.
    pub subscribers: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// No authentication required.
///
/// ```json
/// {
///   "status": "ok",
///   "subscribers": 3,
///   "uptime_seconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        subscribers: state.registry.len().await,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
