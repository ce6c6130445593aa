//! Resend coordinator
//!
//! Drains the failure buffer back into the sink once it is healthy again.
//! At most one drain pass runs at a time; a trigger that arrives while a
//! pass is active is dropped rather than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use brivas_influx_sdk::WriteApi;
use brivas_telemetry::Counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::FailureBuffer;
use crate::store::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResendState {
    Idle,
    Draining,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// Keys in the snapshot taken at the start of the pass
    pub keys: usize,
    /// Batches handed back to the sink
    pub replayed: usize,
    /// Entries that could not be read or re-enqueued
    pub failed: usize,
    /// Whether the closing flush succeeded
    pub flushed: bool,
    pub duration_ms: u64,
}

/// Holds the single-flight flag; releases it when dropped, including on panic
pub struct DrainGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ResendStats {
    pub passes: Counter,
    pub skipped: Counter,
    pub replayed: Counter,
    pub replay_failures: Counter,
}

impl Default for ResendStats {
    fn default() -> Self {
        Self {
            passes: Counter::new("resend_passes_total"),
            skipped: Counter::new("resend_triggers_skipped_total"),
            replayed: Counter::new("resend_batches_replayed_total"),
            replay_failures: Counter::new("resend_replay_failures_total"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResendSnapshot {
    pub state: ResendState,
    pub passes: u64,
    pub skipped_triggers: u64,
    pub replayed_batches: u64,
    pub replay_failures: u64,
    pub last_pass: Option<DrainReport>,
}

pub struct ResendCoordinator {
    buffer: FailureBuffer,
    sink: OnceLock<Weak<dyn WriteApi>>,
    draining: Arc<AtomicBool>,
    stats: ResendStats,
    last_report: Mutex<Option<DrainReport>>,
}

impl ResendCoordinator {
    pub fn new(buffer: FailureBuffer) -> Self {
        Self {
            buffer,
            sink: OnceLock::new(),
            draining: Arc::new(AtomicBool::new(false)),
            stats: ResendStats::default(),
            last_report: Mutex::new(None),
        }
    }

    /// Bind the sink that replayed batches are written to
    ///
    /// Only a weak reference is kept, since the sink's hooks own the
    /// coordinator. Returns false if a sink was already attached.
    pub fn attach(&self, sink: &Arc<dyn WriteApi>) -> bool {
        self.sink.set(Arc::downgrade(sink)).is_ok()
    }

    pub fn state(&self) -> ResendState {
        if self.is_draining() {
            ResendState::Draining
        } else {
            ResendState::Idle
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn buffer(&self) -> &FailureBuffer {
        &self.buffer
    }

    /// Move Idle -> Draining; `None` if a pass is already active
    pub fn try_begin(&self) -> Option<DrainGuard> {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard {
                flag: Arc::clone(&self.draining),
            })
    }

    /// Start a background drain pass unless one is already running
    ///
    /// Returns the task handle when a pass was started. Failures inside the
    /// pass are logged and never reach the caller.
    pub fn trigger(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let Some(guard) = self.try_begin() else {
            self.stats.skipped.inc();
            debug!("Resend already in progress, trigger dropped");
            return None;
        };

        let coordinator = Arc::clone(self);
        Some(tokio::spawn(async move {
            if let Err(e) = coordinator.run_pass(guard).await {
                error!(error = %e, "Resend pass aborted");
            }
        }))
    }

    /// Run a drain pass on the current task; `None` if one is already active
    pub async fn drain_now(&self) -> StoreResult<Option<DrainReport>> {
        match self.try_begin() {
            Some(guard) => self.run_pass(guard).await.map(Some),
            None => {
                self.stats.skipped.inc();
                Ok(None)
            }
        }
    }

    pub fn snapshot(&self) -> ResendSnapshot {
        ResendSnapshot {
            state: self.state(),
            passes: self.stats.passes.get(),
            skipped_triggers: self.stats.skipped.get(),
            replayed_batches: self.stats.replayed.get(),
            replay_failures: self.stats.replay_failures.get(),
            last_pass: self.last_report.lock().clone(),
        }
    }

    /// One pass over a snapshot of the buffered keys
    ///
    /// Each entry leaves the buffer before it is replayed. A replay that
    /// fails at the sink is re-buffered by the sink's failure hook under the
    /// same key. Keys stored after the snapshot wait for the next pass.
    async fn run_pass(&self, _guard: DrainGuard) -> StoreResult<DrainReport> {
        let started = Instant::now();
        self.stats.passes.inc();

        let Some(sink) = self.sink.get().and_then(Weak::upgrade) else {
            warn!("Resend requested with no live sink attached");
            return Ok(DrainReport::default());
        };

        let keys = self.buffer.list_keys().await?;
        let mut report = DrainReport {
            keys: keys.len(),
            ..Default::default()
        };

        if keys.is_empty() {
            debug!("Nothing buffered to resend");
            return Ok(self.finish(report, started));
        }

        info!(keys = keys.len(), "Resending buffered batches");

        for key in keys {
            let batch = match self.buffer.take(&key).await {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to take buffered batch");
                    report.failed += 1;
                    self.stats.replay_failures.inc();
                    continue;
                }
            };

            let lines = batch.len();
            match sink.write_raw_batch(batch.clone()).await {
                Ok(()) => {
                    debug!(key = %key, lines, "Batch re-enqueued");
                    report.replayed += 1;
                    self.stats.replayed.inc();
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Sink rejected replayed batch");
                    report.failed += 1;
                    self.stats.replay_failures.inc();
                    // never reached the sink's pending buffer, so no hook will re-store it
                    if let Err(e) = self.buffer.store(&batch).await {
                        error!(key = %key, error = %e, "Replayed batch lost");
                    }
                }
            }
        }

        // a pass that re-enqueued nothing has no closing flush to force
        if report.replayed > 0 {
            match sink.flush().await {
                Ok(()) => report.flushed = true,
                Err(e) => warn!(error = %e, "Final resend flush failed"),
            }
        }

        Ok(self.finish(report, started))
    }

    fn finish(&self, mut report: DrainReport, started: Instant) -> DrainReport {
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            keys = report.keys,
            replayed = report.replayed,
            failed = report.failed,
            flushed = report.flushed,
            duration_ms = report.duration_ms,
            "Resend pass complete"
        );
        *self.last_report.lock() = Some(report.clone());
        report
    }
}
