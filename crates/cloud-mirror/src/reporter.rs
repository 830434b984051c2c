//! Completion reporter.
//!
//! Every host request is answered exactly once. A request is opened as a
//! [`PendingRequest`] ticket, and the only ways to settle it consume the
//! ticket by value. A ticket dropped unsettled (early return, panic unwind,
//! runtime shutdown) submits a failure completion from its `Drop`.
//!
//! Placeholder lists are serialized into a [`PlaceholderStaging`] buffer that
//! the caller holds under the enumeration lock. Staging hands out a scoped
//! [`StagedBatch`]; dropping it releases the serialized contents on every
//! exit path.

use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::HostError;
use crate::host::{CompletionOp, ExecuteReceipt, ProviderSyncStatus, SyncRootHost};
use crate::outcome::{CompletionStatus, FetchStatus, OperationOutcome};
use crate::placeholder::{FileAttributes, FileTimes, PlaceholderDescriptor};
use crate::request::{ByteRange, CorrelationKey};
use crate::stats::StatsCounters;

// ============================================================================
// Pending requests
// ============================================================================

/// Kind of request a ticket answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    FetchPlaceholders,
    FetchData { range: ByteRange },
}

/// An open request that still owes the host one completion.
pub struct PendingRequest {
    key: CorrelationKey,
    kind: RequestKind,
    reporter: CompletionReporter,
    settled: bool,
}

impl PendingRequest {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Mark settled. Called before submission so a failing submit is never
    /// followed by a second report from `Drop`.
    fn settle(&mut self) -> CorrelationKey {
        self.settled = true;
        self.key
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;

        tracing::error!("Request {} dropped without a completion, reporting failure", self.key);

        let op: CompletionOp<'_> = match self.kind {
            RequestKind::FetchPlaceholders => CompletionOp::TransferPlaceholders {
                key: self.key,
                status: CompletionStatus::Unsuccessful,
                sync_status: ProviderSyncStatus::Full,
                batch: PlaceholderBatch::EMPTY,
            },
            RequestKind::FetchData { range } => {
                StatsCounters::bump(&self.reporter.stats.fetches_failed);
                CompletionOp::FetchComplete {
                    key: self.key,
                    range,
                    bytes_transferred: 0,
                    status: FetchStatus::Failed,
                }
            }
        };
        let _ = self.reporter.submit(op);
    }
}

// ============================================================================
// Staging buffer
// ============================================================================

/// Serialized metadata of one staged placeholder.
#[derive(Debug, Clone)]
pub struct StagedRecord {
    name: Range<usize>,
    identity: Range<usize>,
    is_directory: bool,
    size_bytes: u64,
    attributes: FileAttributes,
    times: FileTimes,
    in_sync: bool,
}

/// Shared staging area for placeholder transfers.
///
/// Identities and names of a whole batch are packed into two contiguous
/// buffers. Guarded by the provider's enumeration lock.
#[derive(Debug, Default)]
pub struct PlaceholderStaging {
    identities: Vec<u8>,
    names: String,
    records: Vec<StagedRecord>,
}

impl PlaceholderStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.identities.is_empty() && self.names.is_empty()
    }

    /// Serialize descriptors into the staging buffers.
    ///
    /// # Arguments
    /// * `descriptors` - Placeholders to serialize
    /// * `stats` - Counters for buffer accounting
    ///
    /// # Returns
    /// Scoped batch that releases the buffers when dropped.
    pub fn stage<'s>(
        &'s mut self,
        descriptors: &[PlaceholderDescriptor],
        stats: &'s StatsCounters,
    ) -> StagedBatch<'s> {
        self.clear();

        for descriptor in descriptors {
            let name_start: usize = self.names.len();
            self.names.push_str(descriptor.relative_path());

            let identity_start: usize = self.identities.len();
            self.identities.extend_from_slice(&descriptor.identity());

            self.records.push(StagedRecord {
                name: name_start..self.names.len(),
                identity: identity_start..self.identities.len(),
                is_directory: descriptor.is_directory(),
                size_bytes: descriptor.size_bytes(),
                attributes: descriptor.attributes(),
                times: descriptor.times(),
                in_sync: descriptor.in_sync(),
            });
        }

        let allocated: bool = !self.records.is_empty();
        if allocated {
            StatsCounters::bump(&stats.buffers_allocated);
        }

        StagedBatch {
            staging: self,
            stats,
            allocated,
        }
    }

    fn clear(&mut self) {
        self.identities.clear();
        self.names.clear();
        self.records.clear();
    }
}

/// Staged placeholders owned for the duration of one submission.
pub struct StagedBatch<'s> {
    staging: &'s mut PlaceholderStaging,
    stats: &'s StatsCounters,
    allocated: bool,
}

impl StagedBatch<'_> {
    /// Read-only view handed to the host.
    pub fn batch(&self) -> PlaceholderBatch<'_> {
        PlaceholderBatch {
            identities: &self.staging.identities,
            names: &self.staging.names,
            records: &self.staging.records,
        }
    }

    pub fn len(&self) -> usize {
        self.staging.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.records.is_empty()
    }
}

impl Drop for StagedBatch<'_> {
    fn drop(&mut self) {
        self.staging.clear();
        if self.allocated {
            StatsCounters::bump(&self.stats.buffers_released);
        }
    }
}

/// Borrowed view of a staged placeholder batch.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderBatch<'a> {
    identities: &'a [u8],
    names: &'a str,
    records: &'a [StagedRecord],
}

impl<'a> PlaceholderBatch<'a> {
    /// A batch with no placeholders. Submitted as a count of zero.
    pub const EMPTY: PlaceholderBatch<'static> = PlaceholderBatch {
        identities: &[],
        names: "",
        records: &[],
    };

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate staged placeholders in submission order.
    pub fn iter(&self) -> impl Iterator<Item = StagedPlaceholder<'a>> + 'a {
        let identities: &'a [u8] = self.identities;
        let names: &'a str = self.names;
        let records: &'a [StagedRecord] = self.records;

        records.iter().map(move |record| StagedPlaceholder {
            relative_name: &names[record.name.clone()],
            identity: &identities[record.identity.clone()],
            is_directory: record.is_directory,
            size_bytes: record.size_bytes,
            attributes: record.attributes,
            times: record.times,
            in_sync: record.in_sync,
        })
    }
}

/// One placeholder in wire form.
#[derive(Debug, Clone, Copy)]
pub struct StagedPlaceholder<'a> {
    pub relative_name: &'a str,
    /// UTF-16LE identity blob including the terminator.
    pub identity: &'a [u8],
    pub is_directory: bool,
    pub size_bytes: u64,
    pub attributes: FileAttributes,
    pub times: FileTimes,
    pub in_sync: bool,
}

// ============================================================================
// Reporter
// ============================================================================

/// Sends completion reports to the host.
#[derive(Clone)]
pub struct CompletionReporter {
    host: Arc<dyn SyncRootHost>,
    stats: Arc<StatsCounters>,
}

impl CompletionReporter {
    /// Create a reporter.
    ///
    /// # Arguments
    /// * `host` - Host adapter receiving completions
    /// * `stats` - Shared counters
    pub fn new(host: Arc<dyn SyncRootHost>, stats: Arc<StatsCounters>) -> Self {
        Self { host, stats }
    }

    /// Open a request that owes one completion.
    pub fn open(&self, key: CorrelationKey, kind: RequestKind) -> PendingRequest {
        PendingRequest {
            key,
            kind,
            reporter: self.clone(),
            settled: false,
        }
    }

    /// Report the placeholder list for a directory request.
    ///
    /// # Arguments
    /// * `staging` - Staging buffer, held under the enumeration lock
    /// * `request` - Ticket of the fetch-placeholders request
    /// * `descriptors` - Placeholders to transfer (may be empty)
    ///
    /// # Returns
    /// Outcome with the host's processed count.
    pub fn report_placeholders(
        &self,
        staging: &mut PlaceholderStaging,
        mut request: PendingRequest,
        descriptors: &[PlaceholderDescriptor],
    ) -> OperationOutcome {
        let total: u32 = match batch_total(descriptors.len()) {
            Some(total) => total,
            None => {
                tracing::error!(
                    "Placeholder batch for {} has {} entries, more than one completion can carry",
                    request.key(),
                    descriptors.len()
                );
                return self.report_placeholder_failure(request, CompletionStatus::Unsuccessful);
            }
        };

        let key: CorrelationKey = request.settle();
        let staged: StagedBatch<'_> = staging.stage(descriptors, &self.stats);

        let result = self.submit(CompletionOp::TransferPlaceholders {
            key,
            status: CompletionStatus::Success,
            sync_status: ProviderSyncStatus::Full,
            batch: staged.batch(),
        });
        drop(staged);

        match result {
            Ok(receipt) => {
                StatsCounters::add(&self.stats.placeholders_reported, total as u64);
                tracing::debug!(
                    "Placeholders completion {}: processed={} total={}",
                    key,
                    receipt.entries_processed,
                    total
                );
                OperationOutcome::Placeholders {
                    status: CompletionStatus::Success,
                    entries_processed: receipt.entries_processed,
                    total,
                }
            }
            Err(_) => OperationOutcome::Placeholders {
                status: CompletionStatus::Unsuccessful,
                entries_processed: 0,
                total,
            },
        }
    }

    /// Report a failed directory request: zero entries, failing status.
    pub fn report_placeholder_failure(
        &self,
        mut request: PendingRequest,
        status: CompletionStatus,
    ) -> OperationOutcome {
        let key: CorrelationKey = request.settle();
        let _ = self.submit(CompletionOp::TransferPlaceholders {
            key,
            status,
            sync_status: ProviderSyncStatus::Full,
            batch: PlaceholderBatch::EMPTY,
        });

        OperationOutcome::Placeholders {
            status,
            entries_processed: 0,
            total: 0,
        }
    }

    /// Report the final outcome of a data fetch.
    ///
    /// # Arguments
    /// * `request` - Ticket of the fetch-data request
    /// * `bytes_transferred` - Bytes flushed to the placeholder
    /// * `status` - Completed, cancelled or failed
    pub fn report_fetch_outcome(
        &self,
        mut request: PendingRequest,
        bytes_transferred: u64,
        status: FetchStatus,
    ) -> OperationOutcome {
        let key: CorrelationKey = request.settle();
        let range: ByteRange = match request.kind {
            RequestKind::FetchData { range } => range,
            RequestKind::FetchPlaceholders => ByteRange::default(),
        };

        let counter = match status {
            FetchStatus::Completed => &self.stats.fetches_completed,
            FetchStatus::Cancelled => &self.stats.fetches_cancelled,
            FetchStatus::Failed => &self.stats.fetches_failed,
        };
        StatsCounters::bump(counter);

        tracing::debug!("Fetch {} finished: {} after {} bytes", key, status, bytes_transferred);

        let _ = self.submit(CompletionOp::FetchComplete {
            key,
            range,
            bytes_transferred,
            status,
        });

        OperationOutcome::Fetch {
            status,
            bytes_transferred,
        }
    }

    /// Write one chunk of file data for an in-flight fetch.
    pub fn transfer_data(
        &self,
        key: &CorrelationKey,
        offset: u64,
        data: &[u8],
    ) -> Result<(), HostError> {
        self.host
            .execute(CompletionOp::TransferData {
                key: *key,
                offset,
                data,
            })
            .map(|_| ())
    }

    /// Report interim progress for an in-flight fetch.
    pub fn report_progress(&self, key: &CorrelationKey, total: u64, completed: u64) {
        if let Err(e) = self.host.report_progress(key, total, completed) {
            tracing::debug!("Progress report for {} rejected: {}", key, e);
        }
    }

    /// Submit a final completion, counting it and logging rejections.
    fn submit(&self, op: CompletionOp<'_>) -> Result<ExecuteReceipt, HostError> {
        let key: CorrelationKey = op.key();
        self.stats.completions_sent.fetch_add(1, Ordering::Relaxed);

        self.host.execute(op).map_err(|e| {
            StatsCounters::bump(&self.stats.completion_errors);
            tracing::error!("Completion for {} failed: {}", key, e);
            e
        })
    }
}

/// Entry count of a placeholder completion, if it fits the wire field.
fn batch_total(len: usize) -> Option<u32> {
    u32::try_from(len).ok()
}
