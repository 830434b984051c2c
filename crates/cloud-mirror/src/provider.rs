//! Callback-facing provider.
//!
//! [`SyncProvider`] is what host adapters call. [`MirrorProvider`] is the
//! engine behind it. Each method is a boundary: a panic below it is caught
//! and turned into a failure outcome, and nothing unwinds into the host.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::dispatcher::{FetchAdmission, FetchDispatcher};
use crate::enumerator::DirectoryEnumerator;
use crate::error::EnumerationError;
use crate::outcome::{CompletionStatus, FetchStatus, OperationOutcome};
use crate::placeholder::{decode_identity, PlaceholderDescriptor};
use crate::reporter::{CompletionReporter, PendingRequest, PlaceholderStaging, RequestKind};
use crate::request::{ByteRange, CallbackInfo};
use crate::stats::StatsCounters;

/// Callbacks a sync-root host dispatches to.
pub trait SyncProvider: Send + Sync {
    /// Populate a directory. Returns once its completion has been reported.
    fn fetch_placeholders(&self, info: &CallbackInfo<'_>) -> OperationOutcome;

    /// Start streaming `range` of a file. Returns immediately; the outcome
    /// is reported when the transfer ends.
    ///
    /// # Returns
    /// `Success` if the transfer was launched.
    fn fetch_data(&self, info: &CallbackInfo<'_>, range: ByteRange) -> CompletionStatus;

    /// Cancel an in-flight fetch.
    fn cancel_fetch_data(&self, info: &CallbackInfo<'_>);
}

/// The placeholder engine.
pub struct MirrorProvider {
    enumerator: DirectoryEnumerator,
    dispatcher: FetchDispatcher,
    reporter: CompletionReporter,
    /// Enumeration critical section.
    staging: Mutex<PlaceholderStaging>,
    /// Cleared by `quiesce`. Callbacks hold a read guard while admitting work.
    accepting: RwLock<bool>,
    stats: Arc<StatsCounters>,
}

impl MirrorProvider {
    /// Assemble a provider.
    ///
    /// # Arguments
    /// * `enumerator` - Builds placeholders for a directory
    /// * `dispatcher` - Serves data and cancel requests
    /// * `reporter` - Sends completions to the host
    /// * `stats` - Shared counters
    pub fn new(
        enumerator: DirectoryEnumerator,
        dispatcher: FetchDispatcher,
        reporter: CompletionReporter,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            enumerator,
            dispatcher,
            reporter,
            staging: Mutex::new(PlaceholderStaging::new()),
            accepting: RwLock::new(true),
            stats,
        }
    }

    /// False once shutdown has begun.
    pub fn is_accepting(&self) -> bool {
        *self.accepting.read()
    }

    /// Stop admitting requests, cancel all transfers and wait for their
    /// outcomes to be reported.
    ///
    /// Callbacks arriving afterwards are failed immediately. The host
    /// registration must still be live so the outcomes can be delivered.
    ///
    /// # Returns
    /// True if every transfer finished before `timeout`.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        // Waits for callbacks that are mid-admission.
        *self.accepting.write() = false;

        self.dispatcher.cancel_all();
        let drained: bool = self.dispatcher.drain(timeout);
        if !drained {
            tracing::warn!(
                "{} transfers still running after {:?}",
                self.dispatcher.in_flight(),
                timeout
            );
        }
        drained
    }

    /// Enumerate and report under the staging lock.
    fn populate(&self, request: PendingRequest, info: &CallbackInfo<'_>) -> OperationOutcome {
        let mut staging = self.staging.lock();

        match self.placeholders_for(info.identity) {
            Ok(descriptors) => self
                .reporter
                .report_placeholders(&mut staging, request, &descriptors),
            Err(e) => {
                StatsCounters::bump(&self.stats.enumeration_failures);
                tracing::error!("Enumeration for {} failed: {}", request.key(), e);
                self.reporter
                    .report_placeholder_failure(request, CompletionStatus::Unsuccessful)
            }
        }
    }

    fn placeholders_for(&self, identity: &[u8]) -> Result<Vec<PlaceholderDescriptor>, EnumerationError> {
        let directory: String = decode_identity(identity)?;
        self.enumerator.enumerate(&directory)
    }

    fn fault(&self, callback: &str, info: &CallbackInfo<'_>) {
        StatsCounters::bump(&self.stats.callback_faults);
        tracing::error!("Panic in {} callback for {}", callback, info.key);
    }
}

impl SyncProvider for MirrorProvider {
    fn fetch_placeholders(&self, info: &CallbackInfo<'_>) -> OperationOutcome {
        StatsCounters::bump(&self.stats.enumerations);
        tracing::debug!(
            "Fetch placeholders {} path={:?} pid={:?}",
            info.key,
            info.normalized_path,
            info.process.map(|p| p.process_id)
        );

        let request: PendingRequest = self.reporter.open(info.key, RequestKind::FetchPlaceholders);
        let accepting = self.accepting.read();
        if !*accepting {
            tracing::debug!("Fetch placeholders {} refused: shutting down", info.key);
            return self
                .reporter
                .report_placeholder_failure(request, CompletionStatus::Unsuccessful);
        }

        match catch_unwind(AssertUnwindSafe(|| self.populate(request, info))) {
            Ok(outcome) => outcome,
            Err(_) => {
                self.fault("fetch-placeholders", info);
                OperationOutcome::Placeholders {
                    status: CompletionStatus::Unsuccessful,
                    entries_processed: 0,
                    total: 0,
                }
            }
        }
    }

    fn fetch_data(&self, info: &CallbackInfo<'_>, range: ByteRange) -> CompletionStatus {
        let request: PendingRequest = self.reporter.open(info.key, RequestKind::FetchData { range });
        let accepting = self.accepting.read();
        if !*accepting {
            tracing::debug!("Fetch data {} refused: shutting down", info.key);
            let outcome = self.reporter.report_fetch_outcome(request, 0, FetchStatus::Failed);
            return outcome.status();
        }

        match catch_unwind(AssertUnwindSafe(|| self.dispatcher.on_fetch_data(request, info))) {
            Ok(FetchAdmission::Launched { .. }) => CompletionStatus::Success,
            Ok(FetchAdmission::Rejected(outcome)) => outcome.status(),
            Err(_) => {
                self.fault("fetch-data", info);
                FetchStatus::Failed.completion_status()
            }
        }
    }

    fn cancel_fetch_data(&self, info: &CallbackInfo<'_>) {
        if catch_unwind(AssertUnwindSafe(|| self.dispatcher.on_cancel_fetch_data(info))).is_err() {
            self.fault("cancel-fetch-data", info);
        }
    }
}
