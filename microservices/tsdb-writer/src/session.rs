//! Write session
//!
//! Owns the sink, the failure buffer and the resend coordinator. Each
//! submission is encoded and written in a single sink call; failed batches reach
//! the buffer through the sink's failure hook, and every successful flush
//! asks the coordinator to drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use brivas_influx_sdk::{InfluxError, WriteApi, WriteBatch, WriteHooks};
use brivas_telemetry::{Counter, Histogram, HistogramSummary};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::buffer::FailureBuffer;
use crate::coordinator::{ResendCoordinator, ResendSnapshot};
use crate::encoder::PointEncoder;
use crate::record::{FailedRecord, WriteRecord};
use crate::store::KvStore;
use crate::{Error, Result};

/// Session counters, shared with the sink hooks
#[derive(Clone)]
pub struct SessionStats {
    pub submissions: Counter,
    pub points_written: Counter,
    pub rejected: Counter,
    pub flush_failures: Counter,
    pub failed_batches: Counter,
    pub buffered_batches: Counter,
    pub buffer_errors: Counter,
    pub non_retryable_batches: Counter,
    pub flush_latency_ms: Histogram,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            submissions: Counter::new("writer_submissions_total"),
            points_written: Counter::new("writer_points_written_total"),
            rejected: Counter::new("writer_rejected_total"),
            flush_failures: Counter::new("writer_flush_failures_total"),
            failed_batches: Counter::new("writer_failed_batches_total"),
            buffered_batches: Counter::new("writer_buffered_batches_total"),
            buffer_errors: Counter::new("writer_buffer_errors_total"),
            non_retryable_batches: Counter::new("writer_non_retryable_batches_total"),
            flush_latency_ms: Histogram::with_capacity("writer_flush_latency_ms", 4096),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub submissions: u64,
    pub points_written: u64,
    pub rejected: u64,
    pub flush_failures: u64,
    pub failed_batches: u64,
    pub buffered_batches: u64,
    pub buffer_errors: u64,
    pub non_retryable_batches: u64,
    pub pending_lines: usize,
    pub flush_latency_ms: HistogramSummary,
    pub resend: ResendSnapshot,
}

/// Sink callbacks: buffer what failed, drain on success
pub struct SessionHooks {
    buffer: FailureBuffer,
    coordinator: Arc<ResendCoordinator>,
    stats: SessionStats,
}

#[async_trait]
impl WriteHooks for SessionHooks {
    async fn on_write_failed(&self, error: &InfluxError, batch: &WriteBatch) {
        self.stats.failed_batches.inc();

        match self.buffer.store(batch).await {
            Ok(key) if !error.is_retryable() => {
                self.stats.buffered_batches.inc();
                self.stats.non_retryable_batches.inc();
                error!(
                    key = %key,
                    lines = batch.len(),
                    error = %error,
                    "Write refused by InfluxDB, buffered batch will keep failing until fixed"
                );
            }
            Ok(key) => {
                self.stats.buffered_batches.inc();
                warn!(
                    key = %key,
                    lines = batch.len(),
                    error = %error,
                    "Write failed, batch buffered for resend"
                );
            }
            Err(e) => {
                self.stats.buffer_errors.inc();
                error!(
                    lines = batch.len(),
                    write_error = %error,
                    error = %e,
                    "Could not buffer failed batch, data lost"
                );
            }
        }
    }

    async fn on_write_succeeded(&self) {
        self.coordinator.trigger();
    }
}

pub struct WriteSession {
    encoder: PointEncoder,
    sink: Arc<dyn WriteApi>,
    coordinator: Arc<ResendCoordinator>,
    stats: SessionStats,
    closed: AtomicBool,
}

impl WriteSession {
    /// Build a session around a sink created by `sink_factory`
    ///
    /// The factory receives the hooks the sink must call after each flush.
    pub fn new<F>(sink_factory: F, store: Arc<dyn KvStore>, encoder: PointEncoder) -> Self
    where
        F: FnOnce(Arc<dyn WriteHooks>) -> Arc<dyn WriteApi>,
    {
        let buffer = FailureBuffer::new(store);
        let coordinator = Arc::new(ResendCoordinator::new(buffer.clone()));
        let stats = SessionStats::default();

        let hooks = Arc::new(SessionHooks {
            buffer,
            coordinator: Arc::clone(&coordinator),
            stats: stats.clone(),
        });
        let sink = sink_factory(hooks);
        coordinator.attach(&sink);

        Self {
            encoder,
            sink,
            coordinator,
            stats,
            closed: AtomicBool::new(false),
        }
    }

    /// Encode and write one payload; returns the number of points
    ///
    /// Encoding errors are returned before anything reaches the sink. A write
    /// error is returned as well, while the unsent batch is buffered by the
    /// failure hook.
    pub async fn submit(&self, measurement: Option<&str>, payload: &Value) -> Result<usize> {
        let span = info_span!("submit", request_id = %Uuid::new_v4());
        self.submit_inner(measurement, payload).instrument(span).await
    }

    async fn submit_inner(&self, measurement: Option<&str>, payload: &Value) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.stats.submissions.inc();

        let points = self.encoder.encode(measurement, payload).map_err(|e| {
            self.stats.rejected.inc();
            debug!(error = %e, "Payload rejected");
            e
        })?;
        let count = points.len();

        let started = Instant::now();
        let written = self.sink.write_points(points).await;
        self.stats
            .flush_latency_ms
            .record(started.elapsed().as_secs_f64() * 1000.0);

        match written {
            Ok(()) => {
                self.stats.points_written.add(count as u64);
                debug!(points = count, "Submission flushed");
                Ok(count)
            }
            Err(InfluxError::Closed) => Err(Error::SessionClosed),
            Err(e @ InfluxError::InvalidPoint(_)) => {
                self.stats.rejected.inc();
                Err(Error::SinkFlush(e))
            }
            Err(e) => {
                self.stats.flush_failures.inc();
                Err(Error::SinkFlush(e))
            }
        }
    }

    /// Submit a record, returning it annotated with the error on failure
    pub async fn handle(&self, record: WriteRecord) -> std::result::Result<WriteRecord, (Error, FailedRecord)> {
        match self.submit(record.measurement.as_deref(), &record.payload).await {
            Ok(_) => Ok(record),
            Err(e) => {
                let failed = record.into_failed(e.to_string());
                Err((e, failed))
            }
        }
    }

    /// Sink is known to be healthy again; start a drain if idle
    pub fn signal_healthy(&self) -> bool {
        self.coordinator.trigger().is_some()
    }

    /// Stop accepting writes and close the sink after its last flush
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(pending = self.sink.pending_lines(), "Closing write session");
        self.sink.close().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn coordinator(&self) -> &Arc<ResendCoordinator> {
        &self.coordinator
    }

    pub fn buffer(&self) -> &FailureBuffer {
        self.coordinator.buffer()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            submissions: self.stats.submissions.get(),
            points_written: self.stats.points_written.get(),
            rejected: self.stats.rejected.get(),
            flush_failures: self.stats.flush_failures.get(),
            failed_batches: self.stats.failed_batches.get(),
            buffered_batches: self.stats.buffered_batches.get(),
            buffer_errors: self.stats.buffer_errors.get(),
            non_retryable_batches: self.stats.non_retryable_batches.get(),
            pending_lines: self.sink.pending_lines(),
            flush_latency_ms: self.stats.flush_latency_ms.summary(),
            resend: self.coordinator.snapshot(),
        }
    }
}
