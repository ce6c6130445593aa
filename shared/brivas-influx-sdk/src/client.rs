//! InfluxDB HTTP write client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use tracing::{debug, instrument};

use crate::{InfluxError, Precision, Result, WriteBatch};

/// Where written points land
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteTarget {
    /// 2.x API: `/api/v2/write?org=..&bucket=..`
    V2 { org: String, bucket: String },
    /// 1.x API: `/write?db=..&rp=..`
    V1 {
        database: String,
        retention_policy: Option<String>,
    },
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: Option<String>,
    pub target: WriteTarget,
    pub timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: None,
            target: WriteTarget::V2 {
                org: "brivas".to_string(),
                bucket: "metrics".to_string(),
            },
            timeout: Duration::from_secs(10),
        }
    }
}

/// Sends serialized batches to the sink
#[async_trait]
pub trait LineTransport: Send + Sync {
    async fn send(&self, batch: &WriteBatch) -> Result<()>;
}

/// InfluxDB write client over HTTP
pub struct InfluxClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    target: WriteTarget,
    precision: Precision,
}

impl InfluxClient {
    /// Create a new client; no connection is made until the first write
    pub fn new(config: &InfluxConfig, precision: Precision) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InfluxError::Configuration(format!("HTTP client: {}", e)))?;

        let base_url = config.url.trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| InfluxError::Configuration(format!("Invalid URL '{}': {}", base_url, e)))?;

        Ok(Self {
            http,
            base_url,
            token: config.token.clone().filter(|t| !t.is_empty()),
            target: config.target.clone(),
            precision,
        })
    }

    /// Fully-qualified write endpoint including target and precision
    pub fn write_url(&self) -> Result<Url> {
        let parsed = match &self.target {
            WriteTarget::V2 { org, bucket } => Url::parse_with_params(
                &format!("{}/api/v2/write", self.base_url),
                &[
                    ("org", org.as_str()),
                    ("bucket", bucket.as_str()),
                    ("precision", self.precision.as_str()),
                ],
            ),
            WriteTarget::V1 {
                database,
                retention_policy,
            } => {
                let mut params = vec![("db", database.as_str())];
                if let Some(rp) = retention_policy.as_deref().filter(|rp| !rp.is_empty()) {
                    params.push(("rp", rp));
                }
                params.push(("precision", self.precision.as_v1_str()));
                Url::parse_with_params(&format!("{}/write", self.base_url), &params)
            }
        };

        parsed.map_err(|e| InfluxError::Configuration(e.to_string()))
    }

    /// Check whether the server answers its ping endpoint
    pub async fn is_healthy(&self) -> bool {
        match self.http.get(format!("{}/ping", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "InfluxDB ping failed");
                false
            }
        }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }
}

#[async_trait]
impl LineTransport for InfluxClient {
    #[instrument(skip(self, batch), fields(lines = batch.len()))]
    async fn send(&self, batch: &WriteBatch) -> Result<()> {
        let mut request = self
            .http
            .post(self.write_url()?)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(batch.body());

        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| InfluxError::Connection(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "Batch accepted");
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(InfluxError::Http {
            status: status.as_u16(),
            message,
        })
    }
}
