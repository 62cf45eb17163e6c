//! HTTP surface for the dashboard UI.
//!
//! The UI renders buffers and alarms and drives subscriptions and alarm
//! completion; these handlers are its only way in.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness
//! - `GET /channels` - Channels that currently have a ring buffer
//! - `GET /channels/:id/samples` - Buffered samples of one channel
//! - `GET /alarms?state=ongoing|completed` - Ledger listing
//! - `POST /alarms/:id/complete` - One step of the completion workflow
//! - `PUT /subscription` - Publish a new server and channel list

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::alarm::{AlarmStore, CompletionResponse, CompletionStep, CompletionWorkflow};
use crate::model::{Alarm, AlarmState, ChannelId, Sample, ServerAddress, SubscriptionSet};
use crate::ring_buffer::RingBufferStore;
use crate::subscription::SubscriptionWatcher;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub buffers: RingBufferStore,
    pub alarms: Arc<Mutex<AlarmStore>>,
    pub workflow: Arc<Mutex<CompletionWorkflow>>,
    pub subscription_path: PathBuf,
    /// Port assumed for a published server spec without one.
    pub default_port: u16,
}

// ============================================================================
// Request and response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ChannelsResponse {
    pub channels: Vec<ChannelId>,
}

#[derive(Debug, Serialize)]
pub struct SamplesResponse {
    pub channel: ChannelId,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Deserialize)]
pub struct AlarmsQuery {
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AlarmsResponse {
    pub state: AlarmState,
    pub alarms: Vec<Alarm>,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    /// `host[:port]`
    pub server: String,
    pub channels: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /channels - List channels with a buffer on disk.
#[instrument(skip(state))]
pub async fn list_channels(
    State(state): State<AppState>,
) -> Result<Json<ChannelsResponse>, StatusCode> {
    match state.buffers.channels().await {
        Ok(channels) => {
            info!(count = channels.len(), "Channels listed");
            Ok(Json(ChannelsResponse { channels }))
        }
        Err(e) => {
            warn!(error = %e, "Failed to list channels");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /channels/:id/samples - Ordered samples of one channel.
///
/// # Response
///
/// ```json
/// {
///     "channel": "NET.STA1..CHA",
///     "samples": [{"timestamp": "2024-03-01T12:30:15Z", "value": -0.5}]
/// }
/// ```
///
/// `404` when the channel has no buffer, `400` for a malformed id.
#[instrument(skip(state))]
pub async fn get_samples(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SamplesResponse>, StatusCode> {
    let channel: ChannelId = id.parse().map_err(|e| {
        warn!(id = %id, error = %e, "Malformed channel id");
        StatusCode::BAD_REQUEST
    })?;

    match state.buffers.read(&channel).await {
        Ok(Some(samples)) => Ok(Json(SamplesResponse { channel, samples })),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(channel = %channel, error = %e, "Failed to read ring buffer");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /alarms - List one ledger section.
///
/// # Query Parameters
///
/// - `state` (optional): `ongoing` (default) or `completed`
#[instrument(skip(state))]
pub async fn list_alarms(
    State(state): State<AppState>,
    Query(query): Query<AlarmsQuery>,
) -> Result<Json<AlarmsResponse>, StatusCode> {
    let section = match query.state.as_deref() {
        None => AlarmState::Ongoing,
        Some(raw) => raw.parse::<AlarmState>().map_err(|e| {
            warn!(state = raw, error = %e, "Invalid alarm state filter");
            StatusCode::BAD_REQUEST
        })?,
    };

    let alarms = state.alarms.lock().await.list(section).to_vec();
    Ok(Json(AlarmsResponse {
        state: section,
        alarms,
    }))
}

/// POST /alarms/:id/complete - Advance the completion workflow for one alarm.
///
/// The first call answers `prompt`, the second `confirm`, the third
/// completes the alarm and answers `completed`. Unknown ids answer
/// `not_found` with status `404`.
#[instrument(skip(state))]
pub async fn complete_alarm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CompletionResponse>), StatusCode> {
    let mut workflow = state.workflow.lock().await;
    let mut alarms = state.alarms.lock().await;

    match workflow.request(&id, &mut alarms).await {
        Ok(response) => {
            info!(id = %id, step = ?response.step, "Completion request");
            let status = if response.step == CompletionStep::NotFound {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::OK
            };
            Ok((status, Json(response)))
        }
        Err(e) => {
            warn!(id = %id, error = %e, "Failed to persist alarm completion");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// PUT /subscription - Publish the server and channel list to ingest.
///
/// # Request Body
///
/// ```json
/// {
///     "server": "seis.example.org:18000",
///     "channels": ["NET.STA1..CHA", "G.SSB.00.BHZ"]
/// }
/// ```
///
/// Returns `202 Accepted`; the supervisor picks the change up on its next poll.
#[instrument(skip(state))]
pub async fn put_subscription(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionRequest>,
) -> StatusCode {
    let server = match ServerAddress::parse(&request.server, state.default_port) {
        Ok(server) => server,
        Err(e) => {
            warn!(error = %e, "Rejected subscription");
            return StatusCode::BAD_REQUEST;
        }
    };

    let mut channels: Vec<ChannelId> = Vec::with_capacity(request.channels.len());
    for raw in &request.channels {
        match raw.parse::<ChannelId>() {
            Ok(channel) if !channels.contains(&channel) => channels.push(channel),
            Ok(_) => {}
            Err(e) => {
                warn!(channel = %raw, error = %e, "Rejected subscription");
                return StatusCode::BAD_REQUEST;
            }
        }
    }

    let set = SubscriptionSet::new(server, channels);
    match SubscriptionWatcher::publish(&state.subscription_path, &set).await {
        Ok(()) => {
            info!(server = %set.server, channels = set.channels.len(), "Subscription published");
            StatusCode::ACCEPTED
        }
        Err(e) => {
            warn!(error = %e, "Failed to publish subscription");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Build the router with request tracing.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/channels", get(list_channels))
        .route("/channels/:id/samples", get(get_samples))
        .route("/alarms", get(list_alarms))
        .route("/alarms/:id/complete", post(complete_alarm))
        .route("/subscription", put(put_subscription))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
