//! Sync-root connection lifecycle.
//!
//! ```text
//!                 connect()
//!  Disconnected ────────────► Connected
//!       ▲                         │
//!       └─────────────────────────┘
//!          disconnect() / drop
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ConnectError, DisconnectError};
use crate::host::{CallbackTable, ConnectFlags, SyncRootHost};
use crate::request::ConnectionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connected(ConnectionKey),
}

/// Owns the callback registration for one sync root.
///
/// Only this type connects or disconnects the registration.
pub struct SyncRootConnection {
    host: Arc<dyn SyncRootHost>,
    client_root: PathBuf,
    flags: ConnectFlags,
    state: Mutex<ConnectionState>,
}

impl SyncRootConnection {
    /// Create a disconnected handle.
    ///
    /// # Arguments
    /// * `host` - Host adapter to register with
    /// * `client_root` - Sync-root folder
    /// * `flags` - Connection flags
    pub fn new(host: Arc<dyn SyncRootHost>, client_root: impl Into<PathBuf>, flags: ConnectFlags) -> Self {
        Self {
            host,
            client_root: client_root.into(),
            flags,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn client_root(&self) -> &Path {
        &self.client_root
    }

    /// Key of the live registration, if connected.
    pub fn key(&self) -> Option<ConnectionKey> {
        match *self.state.lock() {
            ConnectionState::Connected(key) => Some(key),
            ConnectionState::Disconnected => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.key().is_some()
    }

    /// Register the callback table.
    ///
    /// # Arguments
    /// * `table` - Callbacks to register
    ///
    /// # Returns
    /// Connection key assigned by the host.
    pub fn connect(&self, table: CallbackTable) -> Result<ConnectionKey, ConnectError> {
        let mut state = self.state.lock();
        if let ConnectionState::Connected(_) = *state {
            return Err(ConnectError::AlreadyConnected);
        }

        if !self.client_root.is_dir() {
            let error = ConnectError::InvalidSyncRoot {
                path: self.client_root.display().to_string(),
            };
            tracing::error!("{}", error);
            return Err(error);
        }

        let key: ConnectionKey = self
            .host
            .connect(&self.client_root, table, self.flags)
            .map_err(|e| {
                let error = ConnectError::from(e);
                tracing::error!("{}", error);
                error
            })?;

        *state = ConnectionState::Connected(key);
        tracing::info!("Connected sync root {} ({})", self.client_root.display(), key);
        Ok(key)
    }

    /// Unregister the callback table.
    ///
    /// Failures (including an already-invalid registration) are logged and
    /// swallowed. The handle ends up disconnected either way.
    pub fn disconnect(&self) {
        let previous: ConnectionState = std::mem::replace(&mut *self.state.lock(), ConnectionState::Disconnected);
        let ConnectionState::Connected(key) = previous else {
            return;
        };

        match self.host.disconnect(key).map_err(DisconnectError::from) {
            Ok(()) => tracing::info!("Disconnected sync root {} ({})", self.client_root.display(), key),
            Err(e) => tracing::error!("{}", e),
        }
    }
}

impl Drop for SyncRootConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use crate::error::HostError;
    use crate::host::{CompletionOp, ExecuteReceipt};
    use crate::outcome::{CompletionStatus, OperationOutcome};
    use crate::provider::SyncProvider;
    use crate::request::{ByteRange, CallbackInfo, CorrelationKey};

    #[derive(Default)]
    struct CountingHost {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        reject_connect: bool,
        reject_disconnect: bool,
    }

    impl SyncRootHost for CountingHost {
        fn connect(&self, _: &Path, _: CallbackTable, _: ConnectFlags) -> Result<ConnectionKey, HostError> {
            if self.reject_connect {
                return Err(HostError::api("CfConnectSyncRoot", 0x8007_0005));
            }
            Ok(ConnectionKey(self.connects.fetch_add(1, Ordering::SeqCst) as i64 + 1))
        }

        fn disconnect(&self, key: ConnectionKey) -> Result<(), HostError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.reject_disconnect {
                return Err(HostError::NotConnected(key.0));
            }
            Ok(())
        }

        fn execute(&self, _: CompletionOp<'_>) -> Result<ExecuteReceipt, HostError> {
            Ok(ExecuteReceipt::default())
        }

        fn report_progress(&self, _: &CorrelationKey, _: u64, _: u64) -> Result<(), HostError> {
            Ok(())
        }
    }

    struct NullProvider;

    impl SyncProvider for NullProvider {
        fn fetch_placeholders(&self, _: &CallbackInfo<'_>) -> OperationOutcome {
            OperationOutcome::Placeholders {
                status: CompletionStatus::Success,
                entries_processed: 0,
                total: 0,
            }
        }

        fn fetch_data(&self, _: &CallbackInfo<'_>, _: ByteRange) -> CompletionStatus {
            CompletionStatus::Success
        }

        fn cancel_fetch_data(&self, _: &CallbackInfo<'_>) {}
    }

    fn table() -> CallbackTable {
        CallbackTable::new(Arc::new(NullProvider))
    }

    #[test]
    fn test_connect_then_reject_second_connect() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(CountingHost::default());
        let connection = SyncRootConnection::new(host.clone(), dir.path(), ConnectFlags::default());

        assert_eq!(connection.connect(table()).unwrap(), ConnectionKey(1));
        assert!(matches!(connection.connect(table()), Err(ConnectError::AlreadyConnected)));
        assert_eq!(host.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_root_never_reaches_host() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(CountingHost::default());
        let connection = SyncRootConnection::new(host.clone(), dir.path().join("nope"), ConnectFlags::default());

        assert!(matches!(connection.connect(table()), Err(ConnectError::InvalidSyncRoot { .. })));
        assert_eq!(host.connects.load(Ordering::SeqCst), 0);
        assert!(!connection.is_connected());
    }

    #[test]
    fn test_host_rejection_propagates() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(CountingHost {
            reject_connect: true,
            ..Default::default()
        });
        let connection = SyncRootConnection::new(host, dir.path(), ConnectFlags::default());

        assert!(matches!(connection.connect(table()), Err(ConnectError::Rejected(_))));
        assert!(!connection.is_connected());
    }

    #[test]
    fn test_disconnect_failure_swallowed() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(CountingHost {
            reject_disconnect: true,
            ..Default::default()
        });
        let connection = SyncRootConnection::new(host.clone(), dir.path(), ConnectFlags::default());
        connection.connect(table()).unwrap();

        connection.disconnect();
        connection.disconnect();

        assert!(!connection.is_connected());
        assert_eq!(host.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_disconnects() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(CountingHost::default());
        {
            let connection = SyncRootConnection::new(host.clone(), dir.path(), ConnectFlags::default());
            connection.connect(table()).unwrap();
        }

        assert_eq!(host.disconnects.load(Ordering::SeqCst), 1);
    }
}
