//! Statistics collection for the provider.
//!
//! Counters are bumped from callback threads and the transfer runtime;
//! [`ProviderStatsCollector`] snapshots them for display or assertions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Live counters shared by every engine component.
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub(crate) enumerations: AtomicU64,
    pub(crate) enumeration_failures: AtomicU64,
    pub(crate) placeholders_reported: AtomicU64,
    pub(crate) fetches_started: AtomicU64,
    pub(crate) fetches_completed: AtomicU64,
    pub(crate) fetches_cancelled: AtomicU64,
    pub(crate) fetches_failed: AtomicU64,
    pub(crate) bytes_transferred: AtomicU64,
    pub(crate) cancels_received: AtomicU64,
    pub(crate) cancels_ignored: AtomicU64,
    pub(crate) completions_sent: AtomicU64,
    pub(crate) completion_errors: AtomicU64,
    pub(crate) buffers_allocated: AtomicU64,
    pub(crate) buffers_released: AtomicU64,
    pub(crate) callback_faults: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}

/// Snapshot of provider statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub enumerations: u64,
    pub enumeration_failures: u64,
    pub placeholders_reported: u64,
    pub fetches_started: u64,
    pub fetches_completed: u64,
    pub fetches_cancelled: u64,
    pub fetches_failed: u64,
    pub bytes_transferred: u64,
    pub cancels_received: u64,
    /// Cancels that matched no in-flight fetch.
    pub cancels_ignored: u64,
    /// Completion reports submitted to the host.
    pub completions_sent: u64,
    /// Completion reports the host rejected.
    pub completion_errors: u64,
    pub buffers_allocated: u64,
    pub buffers_released: u64,
    /// Panics caught at a callback boundary.
    pub callback_faults: u64,
    pub uptime_secs: u64,
}

impl ProviderStats {
    /// Staging buffers currently held (should be zero between callbacks).
    pub fn buffers_outstanding(&self) -> u64 {
        self.buffers_allocated.saturating_sub(self.buffers_released)
    }

    /// Fetches launched but not yet reported.
    pub fn fetches_in_flight(&self) -> u64 {
        self.fetches_started
            .saturating_sub(self.fetches_completed + self.fetches_cancelled + self.fetches_failed)
    }

    /// Format stats as a display grid.
    ///
    /// # Returns
    /// Multi-line string with formatted statistics.
    pub fn display_grid(&self) -> String {
        let rule: &str = "╠══════════════════════════════════════════════════════════╣";
        let row = |label: &str, value: String| format!("║   {:<16}{:>38} ║", label, value);

        let mut lines: Vec<String> = Vec::new();

        lines.push("╔══════════════════════════════════════════════════════════╗".to_string());
        lines.push("║                 Cloud Mirror Statistics                  ║".to_string());
        lines.push(rule.to_string());
        lines.push(format!("║ Uptime: {:>44} sec ║", self.uptime_secs));
        lines.push(rule.to_string());

        lines.push("║ Enumeration                                              ║".to_string());
        lines.push(row("Requests:", self.enumerations.to_string()));
        lines.push(row("Failures:", self.enumeration_failures.to_string()));
        lines.push(row("Placeholders:", self.placeholders_reported.to_string()));
        lines.push(rule.to_string());

        lines.push("║ Data Fetch                                               ║".to_string());
        lines.push(row("Started:", self.fetches_started.to_string()));
        lines.push(row("Completed:", self.fetches_completed.to_string()));
        lines.push(row("Cancelled:", self.fetches_cancelled.to_string()));
        lines.push(row("Failed:", self.fetches_failed.to_string()));
        lines.push(row("Transferred:", format!("{} MB", self.bytes_transferred / (1024 * 1024))));
        lines.push(row("Cancels:", format!("{} ({} ignored)", self.cancels_received, self.cancels_ignored)));
        lines.push(rule.to_string());

        lines.push("║ Completion                                               ║".to_string());
        lines.push(row("Reports sent:", self.completions_sent.to_string()));
        lines.push(row("Host errors:", self.completion_errors.to_string()));
        lines.push(row("Buffers:", format!("{}/{} released", self.buffers_released, self.buffers_allocated)));
        lines.push(row("Faults:", self.callback_faults.to_string()));

        lines.push("╚══════════════════════════════════════════════════════════╝".to_string());

        lines.join("\n")
    }
}

/// Collects statistics from a running provider.
///
/// Cloneable for use from a background stats thread.
#[derive(Clone)]
pub struct ProviderStatsCollector {
    counters: Arc<StatsCounters>,
    start_time: Instant,
}

impl ProviderStatsCollector {
    /// Create a collector over shared counters.
    ///
    /// # Arguments
    /// * `counters` - Counters bumped by the engine
    /// * `start_time` - When the provider was created
    pub fn new(counters: Arc<StatsCounters>, start_time: Instant) -> Self {
        Self {
            counters,
            start_time,
        }
    }

    /// Collect current statistics.
    pub fn collect(&self) -> ProviderStats {
        let c: &StatsCounters = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        ProviderStats {
            enumerations: load(&c.enumerations),
            enumeration_failures: load(&c.enumeration_failures),
            placeholders_reported: load(&c.placeholders_reported),
            fetches_started: load(&c.fetches_started),
            fetches_completed: load(&c.fetches_completed),
            fetches_cancelled: load(&c.fetches_cancelled),
            fetches_failed: load(&c.fetches_failed),
            bytes_transferred: load(&c.bytes_transferred),
            cancels_received: load(&c.cancels_received),
            cancels_ignored: load(&c.cancels_ignored),
            completions_sent: load(&c.completions_sent),
            completion_errors: load(&c.completion_errors),
            buffers_allocated: load(&c.buffers_allocated),
            buffers_released: load(&c.buffers_released),
            callback_faults: load(&c.callback_faults),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}
