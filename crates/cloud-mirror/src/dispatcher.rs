//! Fetch/cancel dispatcher.
//!
//! Data requests are tracked in an in-flight table keyed by
//! `(transfer_key, request_key)`. Each entry carries a fresh fetch id, so a
//! cancel for a slot only ever reaches the fetch it was issued against and a
//! later request reusing the slot is never touched by a stale cancel.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::backing::BackingStore;
use crate::error::FetchError;
use crate::outcome::{FetchStatus, OperationOutcome};
use crate::placeholder::decode_identity;
use crate::reporter::{CompletionReporter, PendingRequest, RequestKind};
use crate::request::{ByteRange, CallbackInfo, CorrelationKey, RequestSlot};
use crate::stats::StatsCounters;
use crate::transfer::{TransferEngine, TransferJob, TransferRuntime, TransferSink};

/// Byte counters of one fetch.
#[derive(Debug)]
struct FetchProgress {
    /// Bytes the host has accepted.
    flushed: AtomicU64,
    /// `flushed` at the moment the cancel arrived; `u64::MAX` until then.
    cancelled_at: AtomicU64,
}

impl FetchProgress {
    fn new() -> Self {
        Self {
            flushed: AtomicU64::new(0),
            cancelled_at: AtomicU64::new(u64::MAX),
        }
    }

    /// Record the cancel snapshot. Only the first cancel counts.
    fn snapshot(&self) {
        let flushed: u64 = self.flushed.load(Ordering::Acquire);
        let _ = self.cancelled_at.compare_exchange(
            u64::MAX,
            flushed,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Bytes to report for a cancelled fetch.
    fn cancelled_bytes(&self, observed: u64) -> u64 {
        observed
            .min(self.flushed.load(Ordering::Acquire))
            .min(self.cancelled_at.load(Ordering::Acquire))
    }
}

/// One entry of the in-flight table.
struct InFlightFetch {
    fetch_id: u64,
    identity: Vec<u8>,
    token: CancellationToken,
    progress: Arc<FetchProgress>,
}

/// Result of admitting a fetch-data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAdmission {
    /// The transfer was launched; its outcome is reported when it ends.
    Launched { fetch_id: u64 },
    /// The request was answered immediately with a failure.
    Rejected(OperationOutcome),
}

/// Routes data requests to the transfer engine and cancels to their fetch.
pub struct FetchDispatcher {
    store: Arc<dyn BackingStore>,
    engine: Arc<dyn TransferEngine>,
    runtime: TransferRuntime,
    reporter: CompletionReporter,
    in_flight: Arc<DashMap<RequestSlot, InFlightFetch>>,
    /// Launched tasks that have not yet reported.
    active: Arc<AtomicUsize>,
    next_fetch_id: AtomicU64,
    stats: Arc<StatsCounters>,
}

impl FetchDispatcher {
    /// Create a dispatcher.
    ///
    /// # Arguments
    /// * `store` - Backing store identities resolve against
    /// * `engine` - Streams file data
    /// * `runtime` - Runtime the transfers run on
    /// * `reporter` - Sends chunk writes and final outcomes
    /// * `stats` - Shared counters
    pub fn new(
        store: Arc<dyn BackingStore>,
        engine: Arc<dyn TransferEngine>,
        runtime: TransferRuntime,
        reporter: CompletionReporter,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            store,
            engine,
            runtime,
            reporter,
            in_flight: Arc::new(DashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
            next_fetch_id: AtomicU64::new(1),
            stats,
        }
    }

    /// Start serving a fetch-data request.
    ///
    /// Returns as soon as the transfer is queued.
    ///
    /// # Arguments
    /// * `request` - Ticket of the request; consumed by the final report
    /// * `info` - Callback data carrying the identity
    ///
    /// # Returns
    /// Whether the transfer was launched or rejected on the spot.
    pub fn on_fetch_data(&self, request: PendingRequest, info: &CallbackInfo<'_>) -> FetchAdmission {
        let key: CorrelationKey = request.key();
        let range: ByteRange = match request.kind() {
            RequestKind::FetchData { range } => range,
            RequestKind::FetchPlaceholders => {
                return self.reject(request, "ticket is not a data request");
            }
        };

        let relative_path: String = match decode_identity(info.identity) {
            Ok(path) if !path.is_empty() => path,
            Ok(_) => return self.reject(request, "identity names the sync root"),
            Err(e) => return self.reject(request, &e.to_string()),
        };
        let source = match self.store.resolve(&relative_path) {
            Ok(source) => source,
            Err(e) => return self.reject(request, &e.to_string()),
        };

        let fetch_id: u64 = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let progress = Arc::new(FetchProgress::new());

        let admitted: bool = match self.in_flight.entry(key.slot()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(InFlightFetch {
                    fetch_id,
                    identity: info.identity.to_vec(),
                    token: token.clone(),
                    progress: progress.clone(),
                });
                true
            }
        };
        if !admitted {
            return self.reject(request, "request slot already has a fetch in flight");
        }

        StatsCounters::bump(&self.stats.fetches_started);
        tracing::debug!(
            "Fetch {} #{}: {} [{}..{})",
            key,
            fetch_id,
            relative_path,
            range.offset,
            range.end()
        );

        let job = TransferJob { key, source, range };
        let sink: Arc<dyn TransferSink> = Arc::new(HostSink {
            key,
            reporter: self.reporter.clone(),
            progress: progress.clone(),
            stats: self.stats.clone(),
        });
        let task = FetchTask {
            engine: self.engine.clone(),
            reporter: self.reporter.clone(),
            in_flight: self.in_flight.clone(),
            fetch_id,
            token,
            progress,
            _active: ActiveTask::enter(&self.active),
        };

        if let Err(e) = self.runtime.spawn(task.run(request, job, sink)) {
            // The task and its ticket were dropped, which reported the failure.
            self.in_flight.remove_if(&key.slot(), |_, entry| entry.fetch_id == fetch_id);
            tracing::error!("Fetch {} not started: {}", key, e);
            return FetchAdmission::Rejected(OperationOutcome::Fetch {
                status: FetchStatus::Failed,
                bytes_transferred: 0,
            });
        }

        FetchAdmission::Launched { fetch_id }
    }

    /// Cancel the fetch registered for the key's slot.
    ///
    /// A cancel that matches nothing (already finished, or a different
    /// identity) is ignored.
    pub fn on_cancel_fetch_data(&self, info: &CallbackInfo<'_>) {
        let key: CorrelationKey = info.key;
        StatsCounters::bump(&self.stats.cancels_received);

        let matched: bool = match self.in_flight.get(&key.slot()) {
            Some(entry) if entry.identity.as_slice() == info.identity => {
                entry.progress.snapshot();
                entry.token.cancel();
                tracing::debug!("Cancel {} reached fetch #{}", key, entry.fetch_id);
                true
            }
            Some(entry) => {
                tracing::debug!(
                    "Cancel {} ignored: fetch #{} is for a different file",
                    key,
                    entry.fetch_id
                );
                false
            }
            None => {
                tracing::debug!("Cancel {} ignored: no fetch in flight", key);
                false
            }
        };

        if !matched {
            StatsCounters::bump(&self.stats.cancels_ignored);
        }
    }

    /// Cancel every in-flight fetch.
    pub fn cancel_all(&self) {
        for entry in self.in_flight.iter() {
            entry.progress.snapshot();
            entry.token.cancel();
        }
    }

    /// Fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait until every launched fetch has reported its outcome.
    ///
    /// # Returns
    /// True if all reported before `timeout`.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline: Instant = Instant::now() + timeout;
        while self.active.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn reject(&self, request: PendingRequest, reason: &str) -> FetchAdmission {
        tracing::warn!("Fetch {} rejected: {}", request.key(), reason);
        let outcome: OperationOutcome = self.reporter.report_fetch_outcome(request, 0, FetchStatus::Failed);
        FetchAdmission::Rejected(outcome)
    }
}

// ============================================================================
// Transfer task
// ============================================================================

/// State a launched fetch carries onto the runtime.
struct FetchTask {
    engine: Arc<dyn TransferEngine>,
    reporter: CompletionReporter,
    in_flight: Arc<DashMap<RequestSlot, InFlightFetch>>,
    fetch_id: u64,
    token: CancellationToken,
    progress: Arc<FetchProgress>,
    /// Released after the outcome is reported, or when the task is dropped.
    _active: ActiveTask,
}

/// Counts a launched fetch until it goes away.
struct ActiveTask(Arc<AtomicUsize>);

impl ActiveTask {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active.clone())
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl FetchTask {
    async fn run(self, request: PendingRequest, job: TransferJob, sink: Arc<dyn TransferSink>) {
        let key: CorrelationKey = job.key;
        let result = AssertUnwindSafe(self.engine.copy(job, sink, self.token.clone()))
            .catch_unwind()
            .await;

        // Leave the table before looking at the token: a cancel that found
        // the entry has already set it.
        self.in_flight
            .remove_if(&key.slot(), |_, entry| entry.fetch_id == self.fetch_id);
        let cancelled: bool = self.token.is_cancelled();

        let (status, bytes) = match result {
            Ok(Ok(bytes)) if cancelled => (FetchStatus::Cancelled, self.progress.cancelled_bytes(bytes)),
            Ok(Ok(bytes)) => (FetchStatus::Completed, bytes),
            Ok(Err(FetchError::Cancelled { bytes_transferred })) => (
                FetchStatus::Cancelled,
                self.progress.cancelled_bytes(bytes_transferred),
            ),
            Ok(Err(e)) if cancelled => {
                tracing::debug!("Fetch {} failed after cancel: {}", key, e);
                let flushed: u64 = self.progress.flushed.load(Ordering::Acquire);
                (FetchStatus::Cancelled, self.progress.cancelled_bytes(flushed))
            }
            Ok(Err(e)) => {
                tracing::error!("Fetch {} failed: {}", key, e);
                (FetchStatus::Failed, self.progress.flushed.load(Ordering::Acquire))
            }
            Err(_) => {
                tracing::error!("Fetch {} panicked in the transfer engine", key);
                (FetchStatus::Failed, self.progress.flushed.load(Ordering::Acquire))
            }
        };

        self.reporter.report_fetch_outcome(request, bytes, status);
    }
}

/// Sink writing chunks to the host through the reporter.
struct HostSink {
    key: CorrelationKey,
    reporter: CompletionReporter,
    progress: Arc<FetchProgress>,
    stats: Arc<StatsCounters>,
}

impl TransferSink for HostSink {
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), FetchError> {
        self.reporter
            .transfer_data(&self.key, offset, data)
            .map_err(FetchError::Host)?;

        self.progress
            .flushed
            .fetch_add(data.len() as u64, Ordering::AcqRel);
        StatsCounters::add(&self.stats.bytes_transferred, data.len() as u64);
        Ok(())
    }

    fn progress(&self, total: u64, completed: u64) {
        self.reporter.report_progress(&self.key, total, completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_keeps_first_cancel() {
        let progress = FetchProgress::new();
        progress.flushed.store(100, Ordering::Release);
        progress.snapshot();
        progress.flushed.store(300, Ordering::Release);
        progress.snapshot();

        assert_eq!(progress.cancelled_at.load(Ordering::Acquire), 100);
        assert_eq!(progress.cancelled_bytes(300), 100);
    }

    #[test]
    fn test_cancelled_bytes_without_snapshot() {
        let progress = FetchProgress::new();
        progress.flushed.store(50, Ordering::Release);

        assert_eq!(progress.cancelled_bytes(80), 50);
        assert_eq!(progress.cancelled_bytes(20), 20);
    }
}
