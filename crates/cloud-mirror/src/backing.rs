//! Backing store access.
//!
//! The backing store is the authoritative tree projected into the sync root.
//! [`LocalBackingStore`] serves a local "server" folder.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::error::EnumerationError;
use crate::placeholder::FileAttributes;

/// Metadata of one entry in a backing directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingEntry {
    /// File name within its directory.
    pub name: String,
    pub is_directory: bool,
    /// Size in bytes (ignored for directories).
    pub size: u64,
    pub attributes: FileAttributes,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

/// Read access to the backing tree.
pub trait BackingStore: Send + Sync {
    /// Root directory of the backing tree.
    fn root(&self) -> &Path;

    /// List the immediate entries of a directory.
    ///
    /// # Arguments
    /// * `relative_dir` - Directory relative to the root; empty for the root
    ///
    /// # Returns
    /// Entries sorted by name.
    fn list(&self, relative_dir: &str) -> Result<Vec<BackingEntry>, EnumerationError>;

    /// Resolve a relative path to a location inside the root.
    ///
    /// Rejects absolute paths and any `..` component.
    fn resolve(&self, relative_path: &str) -> Result<PathBuf, EnumerationError> {
        resolve_under(self.root(), relative_path)
    }
}

/// Join `relative_path` onto `root`, refusing anything that could escape it.
pub fn resolve_under(root: &Path, relative_path: &str) -> Result<PathBuf, EnumerationError> {
    let mut resolved: PathBuf = root.to_path_buf();

    for component in Path::new(relative_path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(EnumerationError::PathOutsideRoot {
                    path: relative_path.to_string(),
                });
            }
        }
    }

    Ok(resolved)
}

/// Backing store over a local directory.
#[derive(Debug, Clone)]
pub struct LocalBackingStore {
    root: PathBuf,
}

impl LocalBackingStore {
    /// Create a store rooted at `root`. The directory is not checked here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BackingStore for LocalBackingStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list(&self, relative_dir: &str) -> Result<Vec<BackingEntry>, EnumerationError> {
        let dir: PathBuf = self.resolve(relative_dir)?;
        let read_dir = fs::read_dir(&dir)
            .map_err(|e| EnumerationError::io(dir.display().to_string(), e))?;

        let mut entries: Vec<BackingEntry> = Vec::new();

        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| EnumerationError::io(dir.display().to_string(), e))?;
            let name: String = match dir_entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    tracing::warn!("Skipping non-Unicode name {:?} in {}", raw, dir.display());
                    continue;
                }
            };

            let metadata: fs::Metadata = match fs::metadata(dir_entry.path()) {
                Ok(m) => m,
                Err(e) => {
                    // Vanished or dangling entries do not fail the whole listing.
                    tracing::warn!("Skipping {}: {}", dir_entry.path().display(), e);
                    continue;
                }
            };

            entries.push(entry_from_metadata(name, &metadata));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Build a backing entry from filesystem metadata.
fn entry_from_metadata(name: String, metadata: &fs::Metadata) -> BackingEntry {
    let modified: SystemTime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let attributes: FileAttributes = platform_attributes(&name, metadata);

    BackingEntry {
        is_directory: metadata.is_dir(),
        size: metadata.len(),
        attributes,
        created: metadata.created().unwrap_or(modified),
        modified,
        accessed: metadata.accessed().unwrap_or(modified),
        name,
    }
}

#[cfg(windows)]
fn platform_attributes(_name: &str, metadata: &fs::Metadata) -> FileAttributes {
    use std::os::windows::fs::MetadataExt;

    FileAttributes::from_bits(metadata.file_attributes())
}

/// Dot-files count as hidden outside Windows.
#[cfg(not(windows))]
fn platform_attributes(name: &str, metadata: &fs::Metadata) -> FileAttributes {
    let mut attributes: FileAttributes = if metadata.is_dir() {
        FileAttributes::DIRECTORY
    } else {
        FileAttributes::ARCHIVE
    };

    if name.starts_with('.') {
        attributes = attributes | FileAttributes::HIDDEN;
    }
    if metadata.permissions().readonly() {
        attributes = attributes | FileAttributes::READONLY;
    }

    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_sorted_with_sizes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let store = LocalBackingStore::new(dir.path());
        let entries: Vec<BackingEntry> = store.list("").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(entries[1].size, 2);
        assert!(entries[2].is_directory);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_dot_files_are_hidden() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".secret"), b"x").unwrap();

        let store = LocalBackingStore::new(dir.path());
        let entries: Vec<BackingEntry> = store.list("").unwrap();

        assert_eq!(entries.len(), 1);
        assert!(entries[0].attributes.is_hidden());
    }

    #[test]
    fn test_missing_directory_is_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalBackingStore::new(dir.path());

        assert!(matches!(store.list("nope"), Err(EnumerationError::Io { .. })));
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let root = Path::new("/srv/mirror");

        assert!(resolve_under(root, "../etc/passwd").is_err());
        assert!(resolve_under(root, "a/../../b").is_err());
        assert_eq!(resolve_under(root, "").unwrap(), root.to_path_buf());
        assert_eq!(resolve_under(root, "a/b.txt").unwrap(), root.join("a").join("b.txt"));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_resolve_rejects_absolute() {
        assert!(resolve_under(Path::new("/srv/mirror"), "/etc/passwd").is_err());
    }
}
