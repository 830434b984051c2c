//! Host filesystem driver boundary.
//!
//! A [`SyncRootHost`] is the thin adapter between the engine and whatever
//! actually drives callbacks: the Windows Cloud Files API, or the in-process
//! [`LoopbackHost`]. Adapters translate raw callback data into
//! [`CallbackInfo`](crate::CallbackInfo) and call the registered
//! [`SyncProvider`]; they never contain engine logic.

#[cfg(windows)]
mod cfapi;
mod loopback;

#[cfg(windows)]
pub use cfapi::CloudFilesHost;
pub use loopback::{HostEvent, LoopbackHost, ReceivedPlaceholder};

use std::path::Path;
use std::sync::Arc;

use crate::error::HostError;
use crate::outcome::{CompletionStatus, FetchStatus};
use crate::provider::SyncProvider;
use crate::reporter::PlaceholderBatch;
use crate::request::{ByteRange, ConnectionKey, CorrelationKey};

/// Slots of the registered callback table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSlot {
    FetchPlaceholders,
    FetchData,
    CancelFetchData,
    /// Terminating sentinel.
    End,
}

/// The callback table registered once per sync root.
#[derive(Clone)]
pub struct CallbackTable {
    provider: Arc<dyn SyncProvider>,
}

impl CallbackTable {
    /// Fixed slot layout, sentinel last.
    pub const SLOTS: [CallbackSlot; 4] = [
        CallbackSlot::FetchPlaceholders,
        CallbackSlot::FetchData,
        CallbackSlot::CancelFetchData,
        CallbackSlot::End,
    ];

    /// Create a table dispatching to `provider`.
    pub fn new(provider: Arc<dyn SyncProvider>) -> Self {
        Self { provider }
    }

    /// Provider the callbacks dispatch to.
    pub fn provider(&self) -> &Arc<dyn SyncProvider> {
        &self.provider
    }

    pub fn slots(&self) -> &'static [CallbackSlot] {
        &Self::SLOTS
    }
}

/// Connection flags requested at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags {
    /// Every callback carries the originating process identity.
    pub require_process_info: bool,
    /// Every callback carries a fully-qualified path.
    pub require_full_file_path: bool,
}

impl Default for ConnectFlags {
    fn default() -> Self {
        Self {
            require_process_info: true,
            require_full_file_path: true,
        }
    }
}

/// Provider sync state reported alongside placeholder transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderSyncStatus {
    /// The provider has the full backing tree available.
    #[default]
    Full,
    /// The provider is still catching up with the backing tree.
    Incremental,
}

/// One completion call submitted to the host.
#[derive(Debug, Clone, Copy)]
pub enum CompletionOp<'a> {
    /// Response to a fetch-placeholders callback.
    TransferPlaceholders {
        key: CorrelationKey,
        status: CompletionStatus,
        sync_status: ProviderSyncStatus,
        batch: PlaceholderBatch<'a>,
    },
    /// One chunk of file data for a fetch-data callback.
    TransferData {
        key: CorrelationKey,
        offset: u64,
        data: &'a [u8],
    },
    /// Final outcome of a fetch-data callback.
    FetchComplete {
        key: CorrelationKey,
        /// Range originally requested.
        range: ByteRange,
        bytes_transferred: u64,
        status: FetchStatus,
    },
}

impl CompletionOp<'_> {
    /// Correlation key the operation answers.
    pub fn key(&self) -> CorrelationKey {
        match self {
            CompletionOp::TransferPlaceholders { key, .. }
            | CompletionOp::TransferData { key, .. }
            | CompletionOp::FetchComplete { key, .. } => *key,
        }
    }
}

/// What the host hands back after executing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteReceipt {
    /// Placeholders the host created (placeholder transfers only).
    pub entries_processed: u32,
}

/// Platform adapter for the host filesystem driver.
pub trait SyncRootHost: Send + Sync {
    /// Register the callback table against a sync root.
    ///
    /// # Arguments
    /// * `client_root` - Local sync-root directory
    /// * `table` - Callback table to register
    /// * `flags` - Connection flags
    ///
    /// # Returns
    /// Key of the new connection.
    fn connect(
        &self,
        client_root: &Path,
        table: CallbackTable,
        flags: ConnectFlags,
    ) -> Result<ConnectionKey, HostError>;

    /// Unregister the callback table for `key`.
    fn disconnect(&self, key: ConnectionKey) -> Result<(), HostError>;

    /// Submit a completion operation.
    fn execute(&self, op: CompletionOp<'_>) -> Result<ExecuteReceipt, HostError>;

    /// Report interim progress of a data transfer.
    fn report_progress(
        &self,
        key: &CorrelationKey,
        total: u64,
        completed: u64,
    ) -> Result<(), HostError>;
}
