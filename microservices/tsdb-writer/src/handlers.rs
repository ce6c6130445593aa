//! HTTP handlers for TSDB Writer API

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::coordinator::ResendState;
use crate::record::WriteRecord;
use crate::session::SessionSnapshot;
use crate::{AppState, Result};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Ready check response
#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub sink: bool,
    pub buffer_store: bool,
}

/// Stats response
#[derive(Serialize)]
pub struct StatsResponse {
    pub uptime_secs: u64,
    pub buffered_entries: usize,
    #[serde(flatten)]
    pub session: SessionSnapshot,
}

#[derive(Serialize)]
pub struct ResendResponse {
    pub started: bool,
    pub state: ResendState,
}

// ============================================
// Health & Metrics Handlers
// ============================================

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.config.service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let sink = state.influx.is_healthy().await;
    let buffer_store = state.session.buffer().list_keys().await.is_ok();
    let ready = sink && buffer_store && !state.session.is_closed();

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            sink,
            buffer_store,
        }),
    )
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    Ok(Json(StatsResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        buffered_entries: state.session.buffer().len().await?,
        session: state.session.snapshot(),
    }))
}

// ============================================
// Write Handlers
// ============================================

/// Write one record; a failed record comes back annotated with `failureInfo`
pub async fn write(State(state): State<AppState>, Json(record): Json<WriteRecord>) -> Response {
    match state.session.handle(record).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err((error, failed)) => {
            let status = error.status_code();
            if status.is_server_error() {
                tracing::warn!(code = error.error_code(), error = %error, "Write failed");
            }
            (status, Json(failed)).into_response()
        }
    }
}

/// Explicit healthy signal: start draining the failure buffer if idle
pub async fn resend(State(state): State<AppState>) -> Json<ResendResponse> {
    let started = state.session.signal_healthy();
    Json(ResendResponse {
        started,
        state: state.session.coordinator().state(),
    })
}
