//! Configuration for TSDB Writer microservice

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use brivas_influx_sdk::{InfluxConfig, Precision, WriteOptions, WriteTarget};

/// Where failed batches are kept between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferBackend {
    /// One JSON file per batch under `buffer_dir`
    File,
    /// In-process only; lost on restart
    Memory,
}

impl FromStr for BufferBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("unknown buffer backend '{}'", other)),
        }
    }
}

/// TSDB Writer configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address
    pub host: String,
    /// HTTP port
    pub port: u16,
    pub service_name: String,
    /// InfluxDB base URL
    pub influx_url: String,
    pub influx_token: Option<String>,
    /// 2.x organization
    pub influx_org: String,
    /// 2.x bucket
    pub influx_bucket: String,
    /// 1.x database; selects the 1.x write endpoint when set
    pub influx_database: Option<String>,
    pub influx_retention_policy: Option<String>,
    pub precision: Precision,
    pub request_timeout_ms: u64,
    /// Maximum lines per write request
    pub batch_size: usize,
    /// Background flush period; 0 disables it
    pub flush_interval_ms: u64,
    /// Measurement used when a record names none
    pub default_measurement: Option<String>,
    pub buffer_backend: BufferBackend,
    pub buffer_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|v| !v.is_empty());

        Ok(Self {
            host: var("HOST", "0.0.0.0"),
            port: var("PORT", "8097").parse().context("PORT")?,
            service_name: var("SERVICE_NAME", "tsdb-writer"),
            influx_url: var("INFLUX_URL", "http://localhost:8086"),
            influx_token: optional("INFLUX_TOKEN"),
            influx_org: var("INFLUX_ORG", "brivas"),
            influx_bucket: var("INFLUX_BUCKET", "metrics"),
            influx_database: optional("INFLUX_DATABASE"),
            influx_retention_policy: optional("INFLUX_RETENTION_POLICY"),
            precision: var("INFLUX_PRECISION", "ms")
                .parse()
                .context("INFLUX_PRECISION")?,
            request_timeout_ms: var("INFLUX_TIMEOUT_MS", "10000")
                .parse()
                .context("INFLUX_TIMEOUT_MS")?,
            batch_size: var("WRITE_BATCH_SIZE", "1000")
                .parse()
                .context("WRITE_BATCH_SIZE")?,
            flush_interval_ms: var("WRITE_FLUSH_INTERVAL_MS", "1000")
                .parse()
                .context("WRITE_FLUSH_INTERVAL_MS")?,
            default_measurement: optional("DEFAULT_MEASUREMENT"),
            buffer_backend: var("BUFFER_BACKEND", "file")
                .parse()
                .context("BUFFER_BACKEND")?,
            buffer_dir: PathBuf::from(var("BUFFER_DIR", "./data/tsdb-writer-buffer")),
        })
    }

    /// Get socket address for binding
    pub fn bind_address(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }

    pub fn influx_config(&self) -> InfluxConfig {
        let target = match &self.influx_database {
            Some(database) => WriteTarget::V1 {
                database: database.clone(),
                retention_policy: self.influx_retention_policy.clone(),
            },
            None => WriteTarget::V2 {
                org: self.influx_org.clone(),
                bucket: self.influx_bucket.clone(),
            },
        };

        InfluxConfig {
            url: self.influx_url.clone(),
            token: self.influx_token.clone(),
            target,
            timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            precision: self.precision,
            batch_size: self.batch_size,
            flush_interval: (self.flush_interval_ms > 0)
                .then(|| Duration::from_millis(self.flush_interval_ms)),
        }
    }
}
