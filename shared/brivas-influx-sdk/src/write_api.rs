//! Buffered write API with failure/success callbacks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::{InfluxError, LineTransport, Point, Precision, Result, WriteBatch};

/// Callbacks fired by a write API after each flush attempt
#[async_trait]
pub trait WriteHooks: Send + Sync {
    /// A batch could not be delivered; `batch` holds exactly the unsent lines
    async fn on_write_failed(&self, error: &InfluxError, batch: &WriteBatch);

    /// Every pending line of a flush was accepted by the server
    async fn on_write_succeeded(&self);
}

/// Sink-side write interface
#[async_trait]
pub trait WriteApi: Send + Sync {
    /// Serialize `points` and send them in the same flush
    ///
    /// Every point is serialized before anything is queued, so an invalid
    /// point leaves nothing behind. The result covers only the requests that
    /// carried these points; no other flush can pick them up.
    async fn write_points(&self, points: Vec<Point>) -> Result<()>;

    /// Append already-serialized lines to the pending buffer
    async fn write_raw_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Send everything queued by `write_raw_batch` and wait for the outcome
    async fn flush(&self) -> Result<()>;

    /// Reject further writes and flush what is left
    async fn close(&self) -> Result<()>;

    /// Number of serialized lines waiting for the next flush
    fn pending_lines(&self) -> usize;
}

/// Write behaviour settings
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub precision: Precision,
    /// Maximum lines per HTTP request
    pub batch_size: usize,
    /// Background flush period; `None` flushes only on request
    pub flush_interval: Option<Duration>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            precision: Precision::Milliseconds,
            batch_size: 1000,
            flush_interval: Some(Duration::from_secs(1)),
        }
    }
}

/// Write API that buffers lines and sends them in batches
///
/// Flushes are serialized. Points passed to [`WriteApi::write_points`] never
/// enter the shared pending buffer; they are sent by the call that wrote
/// them. Each request-sized chunk that fails is handed to
/// [`WriteHooks::on_write_failed`] on its own, so the hook always sees the
/// exact content that did not reach the server.
pub struct BufferedWriteApi {
    transport: Arc<dyn LineTransport>,
    hooks: Arc<dyn WriteHooks>,
    options: WriteOptions,
    pending: Mutex<Vec<String>>,
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl BufferedWriteApi {
    pub fn new(
        transport: Arc<dyn LineTransport>,
        hooks: Arc<dyn WriteHooks>,
        options: WriteOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            hooks,
            options: WriteOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            pending: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Start the periodic background flush, if an interval is configured
    ///
    /// The task holds only a weak reference and ends once the API is closed
    /// or dropped.
    pub fn start_periodic_flush(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.options.flush_interval?;
        let weak: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(api) = weak.upgrade() else { break };
                if api.is_closed() {
                    break;
                }
                if api.pending_lines() == 0 {
                    continue;
                }
                if let Err(e) = api.flush().await {
                    debug!(error = %e, "Periodic flush failed");
                }
            }
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(InfluxError::Closed);
        }
        Ok(())
    }

    /// Send queued lines, then `own`, under the flush lock
    ///
    /// Returns the outcome of `own` when it is non-empty, otherwise the
    /// outcome of the queued lines. The success hook fires only when both
    /// went through.
    async fn flush_with(&self, own: Vec<String>) -> Result<()> {
        let _flushing = self.flush_lock.lock().await;
        if !own.is_empty() && self.is_closed() {
            return Err(InfluxError::Closed);
        }

        let queued = std::mem::take(&mut *self.pending.lock());
        if queued.is_empty() && own.is_empty() {
            return Ok(());
        }

        let earlier = self.send_chunks(&queued).await;
        let submitted = self.send_chunks(&own).await;

        if earlier.is_ok() && submitted.is_ok() {
            self.hooks.on_write_succeeded().await;
        }

        if own.is_empty() {
            earlier
        } else {
            submitted
        }
    }

    /// Send `lines` in request-sized chunks, reporting each failed chunk
    async fn send_chunks(&self, lines: &[String]) -> Result<()> {
        let mut first_error = None;
        for chunk in lines.chunks(self.options.batch_size) {
            let batch = WriteBatch::new(chunk.to_vec());
            if let Err(e) = self.transport.send(&batch).await {
                warn!(lines = batch.len(), error = %e, "Write batch failed");
                self.hooks.on_write_failed(&e, &batch).await;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[async_trait]
impl WriteApi for BufferedWriteApi {
    async fn write_points(&self, points: Vec<Point>) -> Result<()> {
        self.ensure_open()?;
        let lines = points
            .iter()
            .map(|p| p.to_line_protocol(self.options.precision))
            .collect::<Result<Vec<_>>>()?;
        self.flush_with(lines).await
    }

    async fn write_raw_batch(&self, batch: WriteBatch) -> Result<()> {
        self.ensure_open()?;
        self.pending.lock().extend(batch.into_lines());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flush_with(Vec::new()).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(pending = self.pending_lines(), "Closing write API");
        self.flush_with(Vec::new()).await
    }

    fn pending_lines(&self) -> usize {
        self.pending.lock().len()
    }
}
