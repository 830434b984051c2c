//! In-process host.
//!
//! Plays the part of the filesystem driver without one: it keeps the
//! registered callback tables, issues callbacks on request and records
//! every operation the provider submits. Used on platforms without the
//! Cloud Files API and throughout the tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::HostError;
use crate::host::{CallbackTable, CompletionOp, ConnectFlags, ExecuteReceipt, ProviderSyncStatus, SyncRootHost};
use crate::outcome::{CompletionStatus, FetchStatus, OperationOutcome};
use crate::placeholder::{encode_identity, FileAttributes};
use crate::provider::SyncProvider;
use crate::request::{ByteRange, CallbackInfo, ConnectionKey, CorrelationKey, ProcessInfo};

/// Called after each data chunk is accepted: `(host, key, offset, length)`.
pub type DataHook = Arc<dyn Fn(&LoopbackHost, &CorrelationKey, u64, usize) + Send + Sync>;

/// Something the provider did to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Connected {
        key: ConnectionKey,
        client_root: PathBuf,
    },
    Disconnected {
        key: ConnectionKey,
    },
    Placeholders {
        key: CorrelationKey,
        status: CompletionStatus,
        sync_status: ProviderSyncStatus,
        count: usize,
    },
    Data {
        key: CorrelationKey,
        offset: u64,
        length: usize,
    },
    FetchComplete {
        key: CorrelationKey,
        status: FetchStatus,
        bytes_transferred: u64,
    },
    Progress {
        key: CorrelationKey,
        total: u64,
        completed: u64,
    },
}

impl HostEvent {
    /// True for the single final report of a request.
    pub fn is_completion(&self) -> bool {
        matches!(self, HostEvent::Placeholders { .. } | HostEvent::FetchComplete { .. })
    }

    /// Request key the event answers, if any.
    pub fn request(&self) -> Option<CorrelationKey> {
        match self {
            HostEvent::Placeholders { key, .. }
            | HostEvent::Data { key, .. }
            | HostEvent::FetchComplete { key, .. }
            | HostEvent::Progress { key, .. } => Some(*key),
            HostEvent::Connected { .. } | HostEvent::Disconnected { .. } => None,
        }
    }
}

/// A placeholder the host "created".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPlaceholder {
    pub request: CorrelationKey,
    pub relative_name: String,
    pub identity: Vec<u8>,
    pub is_directory: bool,
    pub size_bytes: u64,
    pub attributes: FileAttributes,
    pub in_sync: bool,
}

struct Registration {
    client_root: PathBuf,
    table: CallbackTable,
}

#[derive(Default)]
struct LoopbackState {
    registrations: HashMap<i64, Registration>,
    events: Vec<HostEvent>,
    placeholders: Vec<ReceivedPlaceholder>,
    data_hook: Option<DataHook>,
    reject_connect: Option<String>,
}

/// Host that lives in the same process as the provider.
pub struct LoopbackHost {
    state: Mutex<LoopbackState>,
    completed: Condvar,
    next_connection: AtomicI64,
    next_transfer: AtomicI64,
    next_request: AtomicI64,
}

impl Default for LoopbackHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState::default()),
            completed: Condvar::new(),
            next_connection: AtomicI64::new(0x1000),
            next_transfer: AtomicI64::new(1),
            next_request: AtomicI64::new(1),
        }
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Install a hook run after every accepted data chunk.
    pub fn set_data_hook(&self, hook: DataHook) {
        self.state.lock().data_hook = Some(hook);
    }

    /// Make every later `connect` fail with `reason`.
    pub fn reject_connections(&self, reason: impl Into<String>) {
        self.state.lock().reject_connect = Some(reason.into());
    }

    /// Drop a registration behind the provider's back, as if the driver
    /// had torn it down.
    pub fn invalidate_registration(&self, key: ConnectionKey) -> bool {
        let removed: Option<Registration> = self.state.lock().registrations.remove(&key.0);
        removed.is_some()
    }

    // ------------------------------------------------------------------------
    // Driving callbacks
    // ------------------------------------------------------------------------

    /// A fresh correlation key on a connection.
    pub fn next_key(&self, connection: ConnectionKey) -> CorrelationKey {
        CorrelationKey::new(
            connection,
            self.next_transfer.fetch_add(1, Ordering::Relaxed),
            self.next_request.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Issue a fetch-placeholders callback for a directory.
    ///
    /// # Arguments
    /// * `connection` - Registration to call into
    /// * `directory` - Directory relative to the sync root; empty for the root
    ///
    /// # Returns
    /// Key of the request and the provider's outcome.
    pub fn fetch_placeholders(
        &self,
        connection: ConnectionKey,
        directory: &str,
    ) -> Result<(CorrelationKey, OperationOutcome), HostError> {
        let (provider, client_root) = self.provider(connection)?;
        let key: CorrelationKey = self.next_key(connection);
        let identity: Vec<u8> = if directory.is_empty() {
            Vec::new()
        } else {
            encode_identity(directory)
        };

        let normalized: String = client_root.join(directory).display().to_string();
        let process = ProcessInfo {
            process_id: std::process::id(),
            image_path: None,
        };
        let info = CallbackInfo {
            key,
            identity: &identity,
            normalized_path: Some(&normalized),
            process: Some(&process),
        };

        Ok((key, provider.fetch_placeholders(&info)))
    }

    /// Issue a fetch-data callback.
    ///
    /// # Arguments
    /// * `key` - Correlation key of the request
    /// * `identity` - Identity blob of the file
    /// * `range` - Bytes wanted
    ///
    /// # Returns
    /// Whether the provider accepted the request.
    pub fn fetch_data(
        &self,
        key: CorrelationKey,
        identity: &[u8],
        range: ByteRange,
    ) -> Result<CompletionStatus, HostError> {
        let (provider, _) = self.provider(key.connection_key)?;
        Ok(provider.fetch_data(&CallbackInfo::new(key, identity), range))
    }

    /// Issue a cancel-fetch-data callback.
    pub fn cancel_fetch_data(&self, key: CorrelationKey, identity: &[u8]) -> Result<(), HostError> {
        let (provider, _) = self.provider(key.connection_key)?;
        provider.cancel_fetch_data(&CallbackInfo::new(key, identity));
        Ok(())
    }

    /// Wait for the final report of a data fetch.
    ///
    /// # Returns
    /// `(status, bytes_transferred)`, or `None` on timeout.
    pub fn wait_for_fetch(&self, key: CorrelationKey, timeout: Duration) -> Option<(FetchStatus, u64)> {
        let deadline: Instant = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            let found = state.events.iter().find_map(|event| match event {
                HostEvent::FetchComplete {
                    key: k,
                    status,
                    bytes_transferred,
                } if *k == key => Some((*status, *bytes_transferred)),
                _ => None,
            });
            if found.is_some() {
                return found;
            }
            if self.completed.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn events(&self) -> Vec<HostEvent> {
        self.state.lock().events.clone()
    }

    /// Placeholders received so far, in submission order.
    pub fn placeholders(&self) -> Vec<ReceivedPlaceholder> {
        self.state.lock().placeholders.clone()
    }

    /// Placeholders received for one request.
    pub fn placeholders_for(&self, key: CorrelationKey) -> Vec<ReceivedPlaceholder> {
        self.state
            .lock()
            .placeholders
            .iter()
            .filter(|p| p.request == key)
            .cloned()
            .collect()
    }

    /// Number of final completions submitted for a request.
    pub fn completions_for(&self, key: CorrelationKey) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.is_completion() && e.request() == Some(key))
            .count()
    }

    pub fn is_registered(&self, key: ConnectionKey) -> bool {
        self.state.lock().registrations.contains_key(&key.0)
    }

    pub fn registration_count(&self) -> usize {
        self.state.lock().registrations.len()
    }

    fn provider(&self, connection: ConnectionKey) -> Result<(Arc<dyn SyncProvider>, PathBuf), HostError> {
        let state = self.state.lock();
        let registration: &Registration = state
            .registrations
            .get(&connection.0)
            .ok_or(HostError::NotConnected(connection.0))?;
        Ok((registration.table.provider().clone(), registration.client_root.clone()))
    }

    fn record(&self, event: HostEvent) {
        let wake: bool = event.is_completion();
        self.state.lock().events.push(event);
        if wake {
            self.completed.notify_all();
        }
    }
}

impl SyncRootHost for LoopbackHost {
    fn connect(
        &self,
        client_root: &Path,
        table: CallbackTable,
        _flags: ConnectFlags,
    ) -> Result<ConnectionKey, HostError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.reject_connect {
            return Err(HostError::Rejected(reason.clone()));
        }
        if state.registrations.values().any(|r| r.client_root == client_root) {
            return Err(HostError::AlreadyRegistered(client_root.display().to_string()));
        }

        let key = ConnectionKey(self.next_connection.fetch_add(1, Ordering::Relaxed));
        state.registrations.insert(
            key.0,
            Registration {
                client_root: client_root.to_path_buf(),
                table,
            },
        );
        state.events.push(HostEvent::Connected {
            key,
            client_root: client_root.to_path_buf(),
        });
        Ok(key)
    }

    fn disconnect(&self, key: ConnectionKey) -> Result<(), HostError> {
        // Registration is dropped outside the lock; it may own the provider.
        let removed: Option<Registration> = {
            let mut state = self.state.lock();
            let removed = state.registrations.remove(&key.0);
            if removed.is_some() {
                state.events.push(HostEvent::Disconnected { key });
            }
            removed
        };

        match removed {
            Some(_) => Ok(()),
            None => Err(HostError::NotConnected(key.0)),
        }
    }

    fn execute(&self, op: CompletionOp<'_>) -> Result<ExecuteReceipt, HostError> {
        let key: CorrelationKey = op.key();
        if !self.is_registered(key.connection_key) {
            return Err(HostError::NotConnected(key.connection_key.0));
        }

        match op {
            CompletionOp::TransferPlaceholders {
                key,
                status,
                sync_status,
                batch,
            } => {
                let received: Vec<ReceivedPlaceholder> = batch
                    .iter()
                    .map(|p| ReceivedPlaceholder {
                        request: key,
                        relative_name: p.relative_name.to_string(),
                        identity: p.identity.to_vec(),
                        is_directory: p.is_directory,
                        size_bytes: p.size_bytes,
                        attributes: p.attributes,
                        in_sync: p.in_sync,
                    })
                    .collect();
                let count: usize = received.len();

                self.state.lock().placeholders.extend(received);
                self.record(HostEvent::Placeholders {
                    key,
                    status,
                    sync_status,
                    count,
                });
                Ok(ExecuteReceipt {
                    entries_processed: count as u32,
                })
            }
            CompletionOp::TransferData { key, offset, data } => {
                self.record(HostEvent::Data {
                    key,
                    offset,
                    length: data.len(),
                });

                let hook: Option<DataHook> = self.state.lock().data_hook.clone();
                if let Some(hook) = hook {
                    hook(self, &key, offset, data.len());
                }
                Ok(ExecuteReceipt::default())
            }
            CompletionOp::FetchComplete {
                key,
                bytes_transferred,
                status,
                ..
            } => {
                self.record(HostEvent::FetchComplete {
                    key,
                    status,
                    bytes_transferred,
                });
                Ok(ExecuteReceipt::default())
            }
        }
    }

    fn report_progress(&self, key: &CorrelationKey, total: u64, completed: u64) -> Result<(), HostError> {
        if !self.is_registered(key.connection_key) {
            return Err(HostError::NotConnected(key.connection_key.0));
        }
        self.record(HostEvent::Progress {
            key: *key,
            total,
            completed,
        });
        Ok(())
    }
}
