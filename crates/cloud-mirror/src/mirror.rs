//! Mirror lifecycle.
//!
//! [`CloudMirror`] wires the backing store, provider and connection together
//! and owns them from `start` to `stop`.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::backing::{BackingStore, LocalBackingStore};
use crate::connection::SyncRootConnection;
use crate::dispatcher::FetchDispatcher;
use crate::enumerator::DirectoryEnumerator;
use crate::error::ConnectError;
use crate::host::{CallbackTable, SyncRootHost};
use crate::options::MirrorOptions;
use crate::provider::{MirrorProvider, SyncProvider};
use crate::reporter::CompletionReporter;
use crate::request::ConnectionKey;
use crate::stats::{ProviderStatsCollector, StatsCounters};
use crate::transfer::{ChunkedFileCopier, TransferEngine, TransferRuntime};

/// A backing folder projected into a sync root.
pub struct CloudMirror {
    options: MirrorOptions,
    host: Arc<dyn SyncRootHost>,
    store: Arc<dyn BackingStore>,
    engine: Arc<dyn TransferEngine>,
    connection: SyncRootConnection,
    /// Set while started.
    provider: Mutex<Option<Arc<MirrorProvider>>>,
    stats: Arc<StatsCounters>,
    start_time: Instant,
}

impl CloudMirror {
    /// Create a mirror. Nothing is registered until [`start`](Self::start).
    ///
    /// # Arguments
    /// * `options` - Mirror configuration
    /// * `host` - Host adapter to register with
    ///
    /// # Returns
    /// The mirror, or `InvalidOption` if the options fail validation.
    pub fn new(options: MirrorOptions, host: Arc<dyn SyncRootHost>) -> Result<Self, ConnectError> {
        options.validate()?;

        let store: Arc<dyn BackingStore> = Arc::new(LocalBackingStore::new(options.server_root.clone()));
        let engine: Arc<dyn TransferEngine> = Arc::new(ChunkedFileCopier::new(options.chunk_size));
        let connection = SyncRootConnection::new(host.clone(), options.client_root.clone(), options.connect_flags);

        Ok(Self {
            options,
            host,
            store,
            engine,
            connection,
            provider: Mutex::new(None),
            stats: Arc::new(StatsCounters::new()),
            start_time: Instant::now(),
        })
    }

    /// Replace the backing store.
    pub fn with_backing_store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the transfer engine.
    pub fn with_transfer_engine(mut self, engine: Arc<dyn TransferEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Build the provider and register it with the host.
    ///
    /// # Returns
    /// Connection key, or the reason the mirror could not connect. Nothing
    /// stays registered on failure.
    pub fn start(&self) -> Result<ConnectionKey, ConnectError> {
        let mut slot = self.provider.lock();
        if slot.is_some() || self.connection.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }

        if !self.store.root().is_dir() {
            let error = ConnectError::BackingRootMissing {
                path: self.store.root().display().to_string(),
            };
            tracing::error!("{}", error);
            return Err(error);
        }

        let runtime: TransferRuntime =
            TransferRuntime::new(self.options.transfer_worker_threads).map_err(ConnectError::Runtime)?;
        let reporter = CompletionReporter::new(self.host.clone(), self.stats.clone());
        let dispatcher = FetchDispatcher::new(
            self.store.clone(),
            self.engine.clone(),
            runtime,
            reporter.clone(),
            self.stats.clone(),
        );
        let enumerator = DirectoryEnumerator::new(self.store.clone(), self.options.project_directories);
        let provider: Arc<MirrorProvider> =
            Arc::new(MirrorProvider::new(enumerator, dispatcher, reporter, self.stats.clone()));

        let table = CallbackTable::new(provider.clone() as Arc<dyn SyncProvider>);
        let key: ConnectionKey = self.connection.connect(table)?;

        tracing::info!(
            "Mirroring {} into {}",
            self.store.root().display(),
            self.options.client_root.display()
        );
        *slot = Some(provider);
        Ok(key)
    }

    /// Wind down transfers, then unregister callbacks.
    ///
    /// Transfers in flight are cancelled and report their outcome while the
    /// registration is still live. Never fails; problems are logged.
    pub fn stop(&self) {
        let provider: Option<Arc<MirrorProvider>> = self.provider.lock().take();
        if let Some(provider) = provider {
            provider.quiesce(self.options.shutdown_timeout);
        }

        self.connection.disconnect();
    }

    pub fn is_started(&self) -> bool {
        self.provider.lock().is_some()
    }

    /// Key of the live connection, if started.
    pub fn connection_key(&self) -> Option<ConnectionKey> {
        self.connection.key()
    }

    pub fn options(&self) -> &MirrorOptions {
        &self.options
    }

    /// Get a stats collector for monitoring.
    ///
    /// The collector can be cloned and used from another thread.
    pub fn stats_collector(&self) -> ProviderStatsCollector {
        ProviderStatsCollector::new(self.stats.clone(), self.start_time)
    }
}

impl Drop for CloudMirror {
    fn drop(&mut self) {
        self.stop();
    }
}
