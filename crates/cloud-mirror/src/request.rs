//! Correlation identifiers and per-callback request data.

use std::fmt;

/// Handle of one active sync-root connection, assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(pub i64);

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The `(connection, transfer, request)` triple identifying one in-flight
/// request/response pair. Echoed back unmodified in every completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Active sync-root connection.
    pub connection_key: ConnectionKey,
    /// Logical transfer session.
    pub transfer_key: i64,
    /// Individual request within the session.
    pub request_key: i64,
}

impl CorrelationKey {
    /// Create a correlation key.
    pub fn new(connection_key: ConnectionKey, transfer_key: i64, request_key: i64) -> Self {
        Self {
            connection_key,
            transfer_key,
            request_key,
        }
    }

    /// The `(transfer, request)` slot this key occupies while in flight.
    pub fn slot(&self) -> RequestSlot {
        RequestSlot {
            transfer_key: self.transfer_key,
            request_key: self.request_key,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:#x}/{:#x}",
            self.connection_key, self.transfer_key, self.request_key
        )
    }
}

/// At most one logical fetch occupies a slot at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestSlot {
    pub transfer_key: i64,
    pub request_key: i64,
}

/// Byte range of a data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    /// Starting offset in the file.
    pub offset: u64,
    /// Number of bytes requested.
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset, saturating at `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Identity of the process that triggered a callback.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessInfo {
    pub process_id: u32,
    pub image_path: Option<String>,
}

/// Everything a host adapter extracts from one raw callback.
#[derive(Debug, Clone, Copy)]
pub struct CallbackInfo<'a> {
    /// Correlation triple of the request.
    pub key: CorrelationKey,
    /// Opaque identity blob originally handed out with the placeholder.
    /// Empty for the sync root itself.
    pub identity: &'a [u8],
    /// Fully-qualified path of the entry, when the host supplies it.
    pub normalized_path: Option<&'a str>,
    /// Originating process, when the host supplies it.
    pub process: Option<&'a ProcessInfo>,
}

impl<'a> CallbackInfo<'a> {
    /// Create callback info with only a key and identity.
    pub fn new(key: CorrelationKey, identity: &'a [u8]) -> Self {
        Self {
            key,
            identity,
            normalized_path: None,
            process: None,
        }
    }
}
