//! Wide string conversion utilities.

use smallvec::SmallVec;

/// Convert a Rust string to a null-terminated UTF-16 string.
///
/// # Arguments
/// * `s` - UTF-8 string
///
/// # Returns
/// Null-terminated wide string.
pub fn string_to_wide(s: &str) -> Vec<u16> {
    let mut wide: Vec<u16> = s.encode_utf16().collect();
    wide.push(0);
    wide
}

/// Convert UTF-16 code units to a Rust string.
///
/// Stops at the first null code unit, so both terminated and unterminated
/// input decode the same way. Unpaired surrogates are rejected rather than
/// replaced; identities must survive a round trip unchanged.
///
/// # Arguments
/// * `wide` - UTF-16 code units
///
/// # Returns
/// Decoded string, or `None` if the input is not valid UTF-16.
pub fn wide_to_string(wide: &[u16]) -> Option<String> {
    let end: usize = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16(&wide[..end]).ok()
}

/// Decode little-endian UTF-16 bytes into code units.
///
/// Paths under 256 characters stay on the stack.
///
/// # Returns
/// Code units, or `None` if the byte length is odd.
pub(crate) fn le_bytes_to_wide(bytes: &[u8]) -> Option<SmallVec<[u16; 256]>> {
    if bytes.len() % 2 != 0 {
        return None;
    }

    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    )
}
