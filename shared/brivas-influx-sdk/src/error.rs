//! Error types for InfluxDB SDK

/// Result type alias
pub type Result<T> = std::result::Result<T, InfluxError>;

/// InfluxDB client errors
#[derive(Debug, thiserror::Error)]
pub enum InfluxError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Write rejected with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Write API is closed")]
    Closed,
}

impl InfluxError {
    /// Whether resending the same batch later can succeed.
    ///
    /// Client-side rejections (malformed lines, auth) are not retryable,
    /// transport failures and server-side errors are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidPoint(_) | Self::Configuration(_) | Self::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(InfluxError::Connection("refused".into()).is_retryable());
        assert!(InfluxError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(InfluxError::Http { status: 429, message: String::new() }.is_retryable());
        assert!(!InfluxError::Http { status: 400, message: String::new() }.is_retryable());
        assert!(!InfluxError::Closed.is_retryable());
    }
}
