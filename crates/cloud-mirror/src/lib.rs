//! On-demand placeholder provider for cloud sync roots.
//!
//! A backing ("server") folder is projected into a sync-root ("client")
//! folder as placeholders. The host filesystem driver calls back into the
//! provider when an unmaterialized entry is touched: directory listings are
//! populated on first access, and file contents are streamed only when read.
//!
//! # Platform Support
//!
//! On Windows, [`CloudFilesHost`] drives the provider through the Cloud Files
//! API. [`LoopbackHost`] is an in-process host available everywhere; it
//! drives the same callbacks and records what the provider reports.
//!
//! # Architecture
//!
//! ```text
//! Layer 3: SyncRootHost (CloudFilesHost / LoopbackHost)
//! Layer 2: SyncProvider boundary (MirrorProvider, panics caught here)
//! Layer 1: DirectoryEnumerator, FetchDispatcher, CompletionReporter
//! Layer 0: BackingStore, PlaceholderDescriptor, TransferEngine
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cloud_mirror::{CloudMirror, LoopbackHost, MirrorOptions};
//!
//! let host = Arc::new(LoopbackHost::new());
//! let mirror = CloudMirror::new(MirrorOptions::new("server", "client"), host.clone())?;
//! let key = mirror.start()?;
//! host.fetch_placeholders(key, "")?;
//! mirror.stop();
//! ```

mod backing;
mod connection;
mod dispatcher;
mod enumerator;
mod error;
mod host;
mod mirror;
mod options;
mod outcome;
mod placeholder;
mod provider;
mod reporter;
mod request;
mod stats;
mod transfer;
mod util;

pub use backing::{resolve_under, BackingEntry, BackingStore, LocalBackingStore};
pub use connection::SyncRootConnection;
pub use dispatcher::{FetchAdmission, FetchDispatcher};
pub use enumerator::DirectoryEnumerator;
pub use error::{
    ConnectError, DisconnectError, EnumerationError, FetchError, HostError, IdentityError,
};
#[cfg(windows)]
pub use host::CloudFilesHost;
pub use host::{
    CallbackSlot, CallbackTable, CompletionOp, ConnectFlags, ExecuteReceipt, HostEvent,
    LoopbackHost, ProviderSyncStatus, ReceivedPlaceholder, SyncRootHost,
};
pub use mirror::CloudMirror;
pub use options::MirrorOptions;
pub use outcome::{CompletionStatus, FetchStatus, OperationOutcome};
pub use placeholder::{
    decode_identity, encode_identity, join_relative, FileAttributes, FileTimes,
    PlaceholderDescriptor,
};
pub use provider::{MirrorProvider, SyncProvider};
pub use reporter::{
    CompletionReporter, PendingRequest, PlaceholderBatch, PlaceholderStaging, RequestKind,
    StagedBatch, StagedPlaceholder,
};
pub use request::{
    ByteRange, CallbackInfo, ConnectionKey, CorrelationKey, ProcessInfo, RequestSlot,
};
pub use stats::{ProviderStats, ProviderStatsCollector, StatsCounters};
pub use transfer::{
    ChunkedFileCopier, TransferEngine, TransferJob, TransferRuntime, TransferSink,
    CHUNK_ALIGNMENT, DEFAULT_CHUNK_SIZE,
};
pub use util::systemtime_to_filetime;

/// Check whether the Cloud Files API host is available.
///
/// # Returns
/// True on Windows.
#[cfg(windows)]
pub fn cloud_files_available() -> bool {
    true
}

/// Check whether the Cloud Files API host is available.
///
/// # Returns
/// Always false on non-Windows platforms.
#[cfg(not(windows))]
pub fn cloud_files_available() -> bool {
    false
}
