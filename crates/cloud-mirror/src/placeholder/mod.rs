//! Placeholder descriptors and their wire identity.
//!
//! A placeholder is the lightweight local entry standing in for a backing
//! file whose content has not been fetched yet.

mod descriptor;
mod identity;

pub use descriptor::{FileAttributes, FileTimes, PlaceholderDescriptor};
pub use identity::{decode_identity, encode_identity, join_relative};
