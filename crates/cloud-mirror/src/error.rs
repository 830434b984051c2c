//! Error types for the placeholder engine.
//!
//! Only setup failures ([`ConnectError`]) ever reach a caller as an `Err`.
//! Everything raised inside a host callback is converted into a
//! [`CompletionStatus`](crate::CompletionStatus) before the callback returns.

use thiserror::Error;

/// Failure reported by the host filesystem driver or its API.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// A platform call returned a failing status code.
    #[error("{operation} failed with status 0x{code:08X}")]
    Api {
        /// Name of the platform call.
        operation: &'static str,
        /// Raw HRESULT / NTSTATUS value.
        code: u32,
    },

    /// The connection key is not (or no longer) registered.
    #[error("connection {0} is not registered")]
    NotConnected(i64),

    /// A sync root already has a callback table registered.
    #[error("sync root {0} already has a connected provider")]
    AlreadyRegistered(String),

    /// The host refused the request outright.
    #[error("host rejected request: {0}")]
    Rejected(String),
}

impl HostError {
    /// Create an API error from an operation name and status code.
    ///
    /// # Arguments
    /// * `operation` - Name of the platform call
    /// * `code` - Status code it returned
    pub fn api(operation: &'static str, code: u32) -> Self {
        Self::Api { operation, code }
    }
}

/// Registration failure. Fatal to startup and propagated to the caller.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The client folder is missing or not a directory.
    #[error("invalid sync root: {path}")]
    InvalidSyncRoot {
        /// Client folder path.
        path: String,
    },

    /// The backing (server) folder does not exist.
    #[error("backing root does not exist: {path}")]
    BackingRootMissing {
        /// Server folder path.
        path: String,
    },

    /// A connection is already live on this handle.
    #[error("sync root is already connected")]
    AlreadyConnected,

    /// Options failed validation.
    #[error("invalid option {option}: {reason}")]
    InvalidOption {
        /// Option name.
        option: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The transfer runtime could not be started.
    #[error("failed to start transfer runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The host rejected the callback registration.
    #[error("could not connect to sync root: {0}")]
    Rejected(#[from] HostError),
}

/// Teardown failure. Logged, never re-raised.
#[derive(Debug, Error)]
pub enum DisconnectError {
    /// The host refused to unregister the callback table.
    #[error("could not disconnect the sync root: {0}")]
    Host(#[from] HostError),
}

/// Backing-store listing failure, converted into a negative outcome.
#[derive(Debug, Error)]
pub enum EnumerationError {
    /// The directory could not be read.
    #[error("failed to list {path}: {source}")]
    Io {
        /// Backing directory path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The identity resolves outside the backing root.
    #[error("path is outside root: {path}")]
    PathOutsideRoot {
        /// Offending relative path.
        path: String,
    },

    /// The identity blob could not be decoded.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl EnumerationError {
    /// Create an IO error for a backing path.
    ///
    /// # Arguments
    /// * `path` - Path where the error occurred
    /// * `source` - The underlying IO error
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Identity blob decoding failure.
#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    /// Byte length is not a whole number of UTF-16 code units.
    #[error("identity length {0} is not a multiple of two")]
    OddLength(usize),

    /// Bytes are not valid UTF-16.
    #[error("identity is not valid UTF-16")]
    InvalidUtf16,
}

/// Data-transfer failure, reported through the normal completion path.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The transfer observed a cancellation at a checkpoint.
    #[error("transfer cancelled after {bytes_transferred} bytes")]
    Cancelled {
        /// Bytes flushed before the checkpoint.
        bytes_transferred: u64,
    },

    /// The backing file could not be read.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Backing file path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The host rejected a chunk write.
    #[error(transparent)]
    Host(#[from] HostError),

    /// The transfer runtime has shut down.
    #[error("transfer runtime is shut down")]
    Shutdown,
}

impl FetchError {
    /// Create an IO error for a backing path.
    ///
    /// # Arguments
    /// * `path` - Path where the error occurred
    /// * `source` - The underlying IO error
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
