//! InfluxDB Write SDK for Brivas Platform
//!
//! Provides point types, line-protocol serialization and a buffered
//! write client for InfluxDB 1.x and 2.x write endpoints.

mod client;
mod error;
mod line;
mod types;
mod write_api;

pub use client::{InfluxClient, InfluxConfig, LineTransport, WriteTarget};
pub use error::{InfluxError, Result};
pub use types::*;
pub use write_api::{BufferedWriteApi, WriteApi, WriteHooks, WriteOptions};
