//! FILETIME conversion utilities.
//!
//! Placeholder metadata carries timestamps as FILETIME ticks: the number of
//! 100-nanosecond intervals since January 1, 1601 UTC, stored as `i64`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the FILETIME epoch (1601) and the Unix epoch (1970).
const FILETIME_UNIX_DIFF_SECS: u64 = 11_644_473_600;
const INTERVALS_PER_SEC: u64 = 10_000_000;

/// Convert SystemTime to FILETIME ticks.
///
/// Times before the Unix epoch clamp to the Unix epoch.
///
/// # Arguments
/// * `time` - System time to convert
///
/// # Returns
/// FILETIME ticks as `i64`.
pub fn systemtime_to_filetime(time: SystemTime) -> i64 {
    let duration: Duration = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);

    let intervals: u64 = duration.as_secs() * INTERVALS_PER_SEC
        + duration.subsec_nanos() as u64 / 100
        + FILETIME_UNIX_DIFF_SECS * INTERVALS_PER_SEC;

    intervals as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch_ticks() {
        assert_eq!(systemtime_to_filetime(UNIX_EPOCH), 116_444_736_000_000_000);
    }

    #[test]
    fn test_pre_epoch_clamps() {
        let before: SystemTime = UNIX_EPOCH - Duration::from_secs(60);
        assert_eq!(systemtime_to_filetime(before), 116_444_736_000_000_000);
    }

    #[test]
    fn test_sub_tick_precision_is_dropped() {
        let time: SystemTime = UNIX_EPOCH + Duration::new(42, 1_234_567);

        assert_eq!(systemtime_to_filetime(time), 116_444_736_000_000_000 + 420_012_345);
    }
}
