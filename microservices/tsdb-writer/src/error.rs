//! Error types for TSDB Writer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use brivas_influx_sdk::InfluxError;
use serde_json::json;

use crate::encoder::EncodingError;
use crate::store::StoreError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// TSDB Writer error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No measurement name in the record and no default measurement configured")]
    MissingMeasurement,

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Sink flush failed: {0}")]
    SinkFlush(#[from] InfluxError),

    #[error("Failed-write buffer error: {0}")]
    BufferStore(#[from] StoreError),

    #[error("Write session is closed")]
    SessionClosed,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingMeasurement | Error::Encoding(_) => StatusCode::BAD_REQUEST,
            Error::SinkFlush(InfluxError::InvalidPoint(_)) => StatusCode::BAD_REQUEST,
            Error::SinkFlush(_) => StatusCode::BAD_GATEWAY,
            Error::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
            Error::BufferStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Error::MissingMeasurement => "MISSING_MEASUREMENT",
            Error::Encoding(_) => "ENCODING_ERROR",
            Error::SinkFlush(_) => "SINK_FLUSH_ERROR",
            Error::BufferStore(_) => "BUFFER_STORE_ERROR",
            Error::SessionClosed => "SESSION_CLOSED",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {:?}", self);
        }

        let body = Json(json!({
            "error": self.to_string(),
            "code": self.error_code(),
        }));

        (status, body).into_response()
    }
}
