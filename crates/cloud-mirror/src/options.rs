//! Configuration options for the mirror provider.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConnectError;
use crate::host::ConnectFlags;
use crate::transfer::{CHUNK_ALIGNMENT, DEFAULT_CHUNK_SIZE};

/// Configuration for a mirror between a backing folder and a sync root.
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Backing ("server") folder projected into the sync root.
    pub server_root: PathBuf,

    /// Sync-root ("client") folder holding placeholders.
    pub client_root: PathBuf,

    /// Bytes per data-transfer chunk. Multiple of 4 KiB.
    pub chunk_size: usize,

    /// Worker threads of the transfer runtime.
    pub transfer_worker_threads: usize,

    /// Return subdirectories as directory placeholders.
    pub project_directories: bool,

    /// Flags requested when registering callbacks.
    pub connect_flags: ConnectFlags,

    /// How long `stop` waits for cancelled transfers to report.
    pub shutdown_timeout: Duration,
}

impl MirrorOptions {
    /// Create options for a server/client folder pair.
    ///
    /// # Arguments
    /// * `server_root` - Backing folder
    /// * `client_root` - Sync-root folder
    pub fn new(server_root: impl Into<PathBuf>, client_root: impl Into<PathBuf>) -> Self {
        Self {
            server_root: server_root.into(),
            client_root: client_root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            transfer_worker_threads: 2,
            project_directories: false,
            connect_flags: ConnectFlags::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Set transfer chunk size.
    ///
    /// # Arguments
    /// * `chunk_size` - Bytes per chunk
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set transfer worker thread count.
    ///
    /// # Arguments
    /// * `count` - Number of worker threads
    pub fn with_transfer_worker_threads(mut self, count: usize) -> Self {
        self.transfer_worker_threads = count;
        self
    }

    /// Enable or disable directory placeholders.
    pub fn with_project_directories(mut self, enabled: bool) -> Self {
        self.project_directories = enabled;
        self
    }

    pub fn with_connect_flags(mut self, flags: ConnectFlags) -> Self {
        self.connect_flags = flags;
        self
    }

    /// Set the shutdown drain timeout.
    ///
    /// # Arguments
    /// * `timeout` - Maximum wait for in-flight transfers at stop
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Check option values.
    ///
    /// Paths are checked at start, not here.
    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.chunk_size == 0 || self.chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(ConnectError::InvalidOption {
                option: "chunk_size",
                reason: format!("{} is not a positive multiple of {}", self.chunk_size, CHUNK_ALIGNMENT),
            });
        }
        if self.transfer_worker_threads == 0 {
            return Err(ConnectError::InvalidOption {
                option: "transfer_worker_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.server_root == self.client_root {
            return Err(ConnectError::InvalidOption {
                option: "client_root",
                reason: "must differ from server_root".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = MirrorOptions::new("server", "client");

        assert!(options.validate().is_ok());
        assert_eq!(options.chunk_size, 4 * 1024 * 1024);
        assert!(!options.project_directories);
        assert!(options.connect_flags.require_process_info);
    }

    #[test]
    fn test_unaligned_chunk_rejected() {
        let options = MirrorOptions::new("server", "client").with_chunk_size(1000);

        assert!(matches!(
            options.validate(),
            Err(ConnectError::InvalidOption {
                option: "chunk_size",
                ..
            })
        ));
    }

    #[test]
    fn test_same_roots_rejected() {
        assert!(MirrorOptions::new("same", "same").validate().is_err());
    }
}
