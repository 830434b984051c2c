//! Directory enumerator ("fetch placeholders").

use std::sync::Arc;

use crate::backing::{BackingEntry, BackingStore};
use crate::error::EnumerationError;
use crate::placeholder::{join_relative, PlaceholderDescriptor};

/// Lists one backing directory and builds its placeholders.
///
/// Only the immediate directory is listed. Subdirectory contents are
/// enumerated when the host asks for that subdirectory.
pub struct DirectoryEnumerator {
    store: Arc<dyn BackingStore>,
    project_directories: bool,
}

impl DirectoryEnumerator {
    /// Create an enumerator over a backing store.
    ///
    /// # Arguments
    /// * `store` - Backing store to list
    /// * `project_directories` - Also return subdirectories as placeholders
    pub fn new(store: Arc<dyn BackingStore>, project_directories: bool) -> Self {
        Self {
            store,
            project_directories,
        }
    }

    /// Build placeholders for a virtual directory.
    ///
    /// Hidden entries are skipped. Order follows the backing store, which
    /// sorts by name.
    ///
    /// # Arguments
    /// * `directory` - Directory relative to the root; empty for the root
    ///
    /// # Returns
    /// One descriptor per visible entry.
    pub fn enumerate(&self, directory: &str) -> Result<Vec<PlaceholderDescriptor>, EnumerationError> {
        let entries: Vec<BackingEntry> = self.store.list(directory)?;

        let placeholders: Vec<PlaceholderDescriptor> = entries
            .iter()
            .filter(|entry| self.is_projected(entry))
            .map(|entry| PlaceholderDescriptor::from_entry(entry, join_relative(directory, &entry.name)))
            .collect();

        tracing::debug!(
            "Enumerated '{}': {} of {} entries projected",
            directory,
            placeholders.len(),
            entries.len()
        );

        Ok(placeholders)
    }

    fn is_projected(&self, entry: &BackingEntry) -> bool {
        if entry.attributes.is_hidden() {
            return false;
        }
        !entry.is_directory || self.project_directories
    }
}
