//! Status codes and outcomes reported back across the callback boundary.

use std::fmt;

/// Completion status carried by every report to the host.
///
/// Host adapters map these onto platform status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// Request succeeded.
    Success,
    /// Generic provider failure.
    Unsuccessful,
    /// Request was cancelled before it completed.
    Cancelled,
    /// Request was malformed (bad identity, colliding slot).
    InvalidRequest,
}

impl CompletionStatus {
    pub fn is_success(self) -> bool {
        self == CompletionStatus::Success
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &str = match self {
            CompletionStatus::Success => "success",
            CompletionStatus::Unsuccessful => "unsuccessful",
            CompletionStatus::Cancelled => "cancelled",
            CompletionStatus::InvalidRequest => "invalid-request",
        };
        f.write_str(name)
    }
}

/// Final status of a data fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStatus {
    Completed,
    Cancelled,
    Failed,
}

impl FetchStatus {
    /// Completion status reported for this fetch status.
    pub fn completion_status(self) -> CompletionStatus {
        match self {
            FetchStatus::Completed => CompletionStatus::Success,
            FetchStatus::Cancelled => CompletionStatus::Cancelled,
            FetchStatus::Failed => CompletionStatus::Unsuccessful,
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &str = match self {
            FetchStatus::Completed => "completed",
            FetchStatus::Cancelled => "cancelled",
            FetchStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of one request, reported exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Directory enumeration.
    Placeholders {
        status: CompletionStatus,
        /// Entries the host reports as processed.
        entries_processed: u32,
        /// Entries submitted.
        total: u32,
    },
    /// Data fetch.
    Fetch {
        status: FetchStatus,
        bytes_transferred: u64,
    },
}

impl OperationOutcome {
    /// Completion status of this outcome.
    pub fn status(&self) -> CompletionStatus {
        match self {
            OperationOutcome::Placeholders { status, .. } => *status,
            OperationOutcome::Fetch { status, .. } => status.completion_status(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }
}
