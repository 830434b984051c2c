//! Placeholder descriptor builder.

use std::fmt;
use std::ops::BitOr;

use crate::backing::BackingEntry;
use crate::placeholder::identity::encode_identity;
use crate::util::filetime::systemtime_to_filetime;

/// File attribute bitmask, using the Win32 `FILE_ATTRIBUTE_*` bit values.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileAttributes(u32);

impl FileAttributes {
    pub const READONLY: Self = Self(0x0000_0001);
    pub const HIDDEN: Self = Self(0x0000_0002);
    pub const SYSTEM: Self = Self(0x0000_0004);
    pub const DIRECTORY: Self = Self(0x0000_0010);
    pub const ARCHIVE: Self = Self(0x0000_0020);
    pub const NORMAL: Self = Self(0x0000_0080);

    /// Wrap raw attribute bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw attribute bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_hidden(self) -> bool {
        self.contains(Self::HIDDEN)
    }

    pub fn is_directory(self) -> bool {
        self.contains(Self::DIRECTORY)
    }
}

impl BitOr for FileAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileAttributes({:#06x})", self.0)
    }
}

/// The four placeholder timestamps, as FILETIME ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileTimes {
    pub created: i64,
    pub last_write: i64,
    pub last_access: i64,
    pub change: i64,
}

/// Immutable placeholder record ready to hand to the host driver.
///
/// The relative path doubles as the file identity: the host echoes the
/// encoded form back on every fetch and cancel for this entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderDescriptor {
    relative_path: String,
    is_directory: bool,
    size_bytes: u64,
    attributes: FileAttributes,
    times: FileTimes,
    in_sync: bool,
}

impl PlaceholderDescriptor {
    /// Build a descriptor from one backing-store entry.
    ///
    /// Change time mirrors the last-write time. Directories always carry a
    /// size of zero. Every placeholder is marked in sync, so the host will
    /// not fetch data for it until it is actually read.
    ///
    /// # Arguments
    /// * `entry` - Backing entry metadata
    /// * `relative_path` - Path of the entry relative to the backing root
    pub fn from_entry(entry: &BackingEntry, relative_path: String) -> Self {
        let last_write: i64 = systemtime_to_filetime(entry.modified);

        let times = FileTimes {
            created: systemtime_to_filetime(entry.created),
            last_write,
            last_access: systemtime_to_filetime(entry.accessed),
            change: last_write,
        };

        let (size_bytes, attributes) = if entry.is_directory {
            (0, entry.attributes | FileAttributes::DIRECTORY)
        } else {
            (entry.size, entry.attributes)
        };

        Self {
            relative_path,
            is_directory: entry.is_directory,
            size_bytes,
            attributes,
            times,
            in_sync: true,
        }
    }

    /// Path relative to the backing root; also the display name.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit(std::path::MAIN_SEPARATOR)
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// Encoded identity blob for this placeholder.
    pub fn identity(&self) -> Vec<u8> {
        encode_identity(&self.relative_path)
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn attributes(&self) -> FileAttributes {
        self.attributes
    }

    pub fn times(&self) -> FileTimes {
        self.times
    }

    /// Whether the placeholder is created already in sync.
    pub fn in_sync(&self) -> bool {
        self.in_sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn entry(name: &str, is_directory: bool) -> BackingEntry {
        let modified: SystemTime = UNIX_EPOCH + Duration::from_secs(2_000);
        BackingEntry {
            name: name.to_string(),
            is_directory,
            size: 1234,
            attributes: FileAttributes::ARCHIVE,
            created: UNIX_EPOCH + Duration::from_secs(1_000),
            modified,
            accessed: UNIX_EPOCH + Duration::from_secs(3_000),
        }
    }

    #[test]
    fn test_file_descriptor() {
        let desc = PlaceholderDescriptor::from_entry(&entry("a.txt", false), "a.txt".to_string());

        assert_eq!(desc.relative_path(), "a.txt");
        assert_eq!(desc.size_bytes(), 1234);
        assert!(!desc.is_directory());
        assert!(desc.in_sync());
        assert_eq!(desc.attributes(), FileAttributes::ARCHIVE);
    }

    #[test]
    fn test_change_time_mirrors_last_write() {
        let desc = PlaceholderDescriptor::from_entry(&entry("a.txt", false), "a.txt".to_string());
        let times: FileTimes = desc.times();

        assert_eq!(times.change, times.last_write);
        assert!(times.created < times.last_write);
        assert!(times.last_access > times.last_write);
    }

    #[test]
    fn test_directory_descriptor_has_no_size() {
        let desc = PlaceholderDescriptor::from_entry(&entry("docs", true), "docs".to_string());

        assert!(desc.is_directory());
        assert_eq!(desc.size_bytes(), 0);
        assert!(desc.attributes().is_directory());
    }

    #[test]
    fn test_file_name_of_nested_path() {
        let path: String = crate::placeholder::join_relative("sub", "b.txt");
        let desc = PlaceholderDescriptor::from_entry(&entry("b.txt", false), path);

        assert_eq!(desc.file_name(), "b.txt");
    }
}
