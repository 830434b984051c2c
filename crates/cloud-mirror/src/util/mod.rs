//! Conversion helpers shared by the engine and the host adapters.

pub mod filetime;
pub mod wstr;

pub use filetime::systemtime_to_filetime;
pub use wstr::{string_to_wide, wide_to_string};
