//! File identity blobs.
//!
//! The identity handed to the host with each placeholder is its relative
//! path as little-endian UTF-16 with a trailing null code unit. The host
//! echoes it back on every later callback for that entry.

use crate::error::IdentityError;
use crate::util::wstr::{le_bytes_to_wide, string_to_wide, wide_to_string};

/// Encode a relative path as an identity blob.
///
/// # Arguments
/// * `relative_path` - Path relative to the backing root
///
/// # Returns
/// UTF-16LE bytes including the null terminator.
pub fn encode_identity(relative_path: &str) -> Vec<u8> {
    string_to_wide(relative_path)
        .into_iter()
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// Decode an identity blob back into a relative path.
///
/// An empty blob is the sync root. The terminator is optional.
///
/// # Arguments
/// * `blob` - Identity bytes received from the host
///
/// # Returns
/// The relative path that produced the blob.
pub fn decode_identity(blob: &[u8]) -> Result<String, IdentityError> {
    if blob.is_empty() {
        return Ok(String::new());
    }

    let wide = le_bytes_to_wide(blob).ok_or(IdentityError::OddLength(blob.len()))?;
    wide_to_string(&wide).ok_or(IdentityError::InvalidUtf16)
}

/// Join a directory identity and an entry name.
///
/// The sync root is the empty string, so its children are bare names.
/// Uses the platform separator so identities resolve with `Path::join`.
pub fn join_relative(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        return name.to_string();
    }

    let mut joined: String = String::with_capacity(directory.len() + 1 + name.len());
    joined.push_str(directory.trim_end_matches(std::path::MAIN_SEPARATOR));
    joined.push(std::path::MAIN_SEPARATOR);
    joined.push_str(name);
    joined
}
