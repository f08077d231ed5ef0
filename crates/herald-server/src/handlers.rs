//! HTTP handlers for the Herald server.
//!
//! Routes:
//! - `GET /events/:recipient` - event stream for one recipient
//! - `POST /publish` - hand an event to the broker
//! - `GET /presence/:group/:entity` - join a group and stream its roster
//! - `GET /health` - liveness and counters

use crate::config::Config;
use crate::metrics;
use crate::sessions::{self, FrameStream};
use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use herald_core::{Broker, BrokerError, Entity, Event, Hub, HubError};
use herald_protocol::{codec, ProtocolError, PublishRequest};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Shared server state.
pub struct AppState {
    /// Event broker keyed by recipient id.
    pub broker: Broker<String>,
    /// Presence hub keyed by group and entity id.
    pub hub: Hub<String, String>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state, spawning the broker and hub workers.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (broker, _) = Broker::spawn(config.broker.broker_config());
        let (hub, _) = Hub::spawn(config.presence.hub_config());

        Self {
            broker,
            hub,
            config,
        }
    }
}

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A worker has stopped.
    #[error("Service unavailable")]
    Unavailable,

    /// The request cannot be turned into an event.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// The event would not fit in a single stream frame.
    #[error("Event of {0} bytes exceeds the frame limit of {max}", max = codec::MAX_FRAME_SIZE)]
    PayloadTooLarge(usize),
}

impl From<BrokerError> for ApiError {
    fn from(_: BrokerError) -> Self {
        ApiError::Unavailable
    }
}

impl From<HubError> for ApiError {
    fn from(_: HubError) -> Self {
        ApiError::Unavailable
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unavailable => {
                metrics::record_error("unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events/:recipient", get(events_handler))
        .route("/publish", post(publish_handler))
        .route("/presence/:group/:entity", get(presence_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP server until it fails or the process is interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Herald server listening on {}", addr);
    info!("Event streams: http://{}/events/{{recipient}}", addr);

    // Open streams never finish on their own, so shutdown does not wait
    // for them to drain.
    tokio::select! {
        served = axum::serve(listener, app(state)).into_future() => served?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let broker = state.broker.stats().await?;
    let hub = state.hub.stats().await?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "recipients": broker.target_count,
        "connections": broker.connection_count,
        "groups": hub.group_count,
        "members": hub.member_count,
    }))
    .into_response())
}

/// Stream events addressed to `recipient`.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Path(recipient): Path<String>,
) -> Result<Response, ApiError> {
    let stream =
        sessions::open_event_stream(&state.broker, recipient, state.config.heartbeat.interval())
            .await?;
    Ok(event_stream_response(stream))
}

/// Join a presence group. Query parameters become the member's metadata.
async fn presence_handler(
    State(state): State<Arc<AppState>>,
    Path((group, entity)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let mut member = Entity::new(entity);
    if !params.is_empty() {
        member = member.with_meta(Value::Object(
            params
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect(),
        ));
    }

    let stream = sessions::open_presence_stream(
        &state.hub,
        group,
        member,
        state.config.heartbeat.interval(),
    )
    .await?;
    Ok(event_stream_response(stream))
}

/// Hand an event to the broker.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PublishRequest>,
) -> Result<Response, ApiError> {
    if request.kind.contains(['\r', '\n']) {
        return Err(ApiError::BadRequest(
            "event type must be a single line".to_string(),
        ));
    }

    let payload = request
        .payload_bytes()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let event = Event::new(request.kind, request.targets, payload);

    // Sessions drop frames the codec refuses, so refuse them here instead.
    match codec::encode(&sessions::event_frame(&event)) {
        Ok(_) => {}
        Err(ProtocolError::FrameTooLarge(size)) => return Err(ApiError::PayloadTooLarge(size)),
        Err(e) => return Err(ApiError::BadRequest(e.to_string())),
    }

    metrics::record_publish(event.payload_size(), event.targets().len());
    debug!(kind = %event.kind(), targets = event.targets().len(), "Publish");

    state.broker.publish(event).await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response())
}

fn event_stream_response(stream: FrameStream) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
