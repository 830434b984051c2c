//! End-to-end tests driving a mirror through the loopback host.

use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloud_mirror::{
    decode_identity, encode_identity, BackingEntry, BackingStore, ByteRange, CloudMirror,
    CompletionStatus, ConnectError, ConnectionKey, EnumerationError, FetchError, FetchStatus,
    FileAttributes, HostEvent, LocalBackingStore, LoopbackHost, MirrorOptions, OperationOutcome,
    ProviderStats, ProviderSyncStatus, TransferEngine, TransferJob, TransferSink,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;
const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Fixtures
// ============================================================================

/// Local store that reports one entry name as hidden on every platform.
struct HidingStore {
    inner: LocalBackingStore,
    hidden: &'static str,
}

impl BackingStore for HidingStore {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn list(&self, relative_dir: &str) -> Result<Vec<BackingEntry>, EnumerationError> {
        let mut entries: Vec<BackingEntry> = self.inner.list(relative_dir)?;
        for entry in entries.iter_mut().filter(|e| e.name == self.hidden) {
            entry.attributes = entry.attributes | FileAttributes::HIDDEN;
        }
        Ok(entries)
    }
}

/// Engine that holds every transfer open until it is cancelled.
struct GatedEngine;

#[async_trait]
impl TransferEngine for GatedEngine {
    async fn copy(
        &self,
        _job: TransferJob,
        _sink: Arc<dyn TransferSink>,
        cancel: CancellationToken,
    ) -> Result<u64, FetchError> {
        cancel.cancelled().await;
        Err(FetchError::Cancelled {
            bytes_transferred: 0,
        })
    }
}

struct Fixture {
    server: TempDir,
    _client: TempDir,
    host: Arc<LoopbackHost>,
    mirror: CloudMirror,
}

impl Fixture {
    fn new(configure: impl FnOnce(MirrorOptions) -> MirrorOptions) -> Self {
        let server = TempDir::new().unwrap();
        let client = TempDir::new().unwrap();
        let host = Arc::new(LoopbackHost::new());
        let options = configure(MirrorOptions::new(server.path(), client.path()).with_chunk_size(MIB as usize));
        let mirror = CloudMirror::new(options, host.clone()).unwrap();

        Self {
            server,
            _client: client,
            host,
            mirror,
        }
    }

    fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path: PathBuf = self.server.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn stats(&self) -> ProviderStats {
        self.mirror.stats_collector().collect()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

// ============================================================================
// Enumeration
// ============================================================================

#[test]
fn test_hidden_file_excluded_from_root() {
    let fixture = Fixture::new(|o| o);
    for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
        fixture.write(name, name.as_bytes());
    }
    let fixture = Fixture {
        mirror: fixture.mirror.with_backing_store(Arc::new(HidingStore {
            inner: LocalBackingStore::new(fixture.server.path()),
            hidden: "d.txt",
        })),
        ..fixture
    };
    let key: ConnectionKey = fixture.mirror.start().unwrap();

    let (request, outcome) = fixture.host.fetch_placeholders(key, "").unwrap();

    assert_eq!(
        outcome,
        OperationOutcome::Placeholders {
            status: CompletionStatus::Success,
            entries_processed: 3,
            total: 3
        }
    );
    let received = fixture.host.placeholders_for(request);
    let names: Vec<&str> = received.iter().map(|p| p.relative_name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
    assert!(received.iter().all(|p| p.in_sync && !p.is_directory));
    assert_eq!(fixture.host.completions_for(request), 1);
}

#[test]
fn test_root_enumeration_resolves_backing_root() {
    let fixture = Fixture::new(|o| o);
    fixture.write("one.bin", &pattern(10));
    fixture.write("two.bin", &pattern(2000));
    fixture.write("nested/deep.bin", &pattern(5));
    let key = fixture.mirror.start().unwrap();

    let (request, _) = fixture.host.fetch_placeholders(key, "").unwrap();
    let received = fixture.host.placeholders_for(request);

    // Directories are not projected by default.
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].size_bytes, 10);
    assert_eq!(received[1].size_bytes, 2000);
    for placeholder in &received {
        let identity: String = decode_identity(&placeholder.identity).unwrap();
        assert_eq!(identity, placeholder.relative_name);
        assert!(fixture.server.path().join(&identity).is_file());
    }
}

#[test]
fn test_directory_placeholders_opt_in() {
    let fixture = Fixture::new(|o| o.with_project_directories(true));
    fixture.write("file.txt", b"x");
    fixture.write("sub/inner.txt", b"y");
    let key = fixture.mirror.start().unwrap();

    let (root, _) = fixture.host.fetch_placeholders(key, "").unwrap();
    let received = fixture.host.placeholders_for(root);
    assert_eq!(received.len(), 2);
    assert!(received[1].is_directory);
    assert_eq!(received[1].size_bytes, 0);

    let (sub, _) = fixture.host.fetch_placeholders(key, "sub").unwrap();
    let inner = fixture.host.placeholders_for(sub);
    assert_eq!(inner.len(), 1);
    assert_eq!(inner[0].relative_name, format!("sub{MAIN_SEPARATOR}inner.txt"));
}

#[test]
fn test_unlistable_directory_reports_failure() {
    let fixture = Fixture::new(|o| o);
    let key = fixture.mirror.start().unwrap();

    let (missing, outcome) = fixture.host.fetch_placeholders(key, "missing").unwrap();
    let (escape, escaped) = fixture.host.fetch_placeholders(key, "..").unwrap();

    assert_eq!(outcome.status(), CompletionStatus::Unsuccessful);
    assert_eq!(escaped.status(), CompletionStatus::Unsuccessful);
    assert_eq!(fixture.host.completions_for(missing), 1);
    assert_eq!(fixture.host.completions_for(escape), 1);
    assert!(fixture.host.placeholders().is_empty());

    // Failures still carry the provider sync status.
    let sync: Vec<ProviderSyncStatus> = fixture
        .host
        .events()
        .into_iter()
        .filter_map(|e| match e {
            HostEvent::Placeholders { sync_status, .. } => Some(sync_status),
            _ => None,
        })
        .collect();
    assert_eq!(sync, vec![ProviderSyncStatus::Full, ProviderSyncStatus::Full]);

    let stats = fixture.stats();
    assert_eq!(stats.enumeration_failures, 2);
    assert_eq!(stats.buffers_allocated, 0);
}

#[test]
fn test_empty_directory_reports_zero_entries() {
    let fixture = Fixture::new(|o| o);
    fs::create_dir(fixture.server.path().join("empty")).unwrap();
    let key = fixture.mirror.start().unwrap();

    let (request, outcome) = fixture.host.fetch_placeholders(key, "empty").unwrap();

    assert!(outcome.is_success());
    assert!(fixture.host.events().contains(&HostEvent::Placeholders {
        key: request,
        status: CompletionStatus::Success,
        sync_status: ProviderSyncStatus::Full,
        count: 0
    }));
    assert_eq!(fixture.stats().buffers_outstanding(), 0);
}

#[test]
fn test_concurrent_enumerations_stay_separate() {
    let fixture = Fixture::new(|o| o);
    for dir in 0..8 {
        for file in 0..(dir + 3) {
            fixture.write(&format!("d{dir}/f{file}.txt"), &pattern(file + 1));
        }
    }
    let key = fixture.mirror.start().unwrap();

    let results: Vec<(usize, cloud_mirror::CorrelationKey)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|dir| {
                let host = fixture.host.clone();
                scope.spawn(move || {
                    let (request, outcome) = host.fetch_placeholders(key, &format!("d{dir}")).unwrap();
                    assert!(outcome.is_success());
                    (dir, request)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (dir, request) in results {
        let received = fixture.host.placeholders_for(request);
        assert_eq!(received.len(), dir + 3);
        let prefix: String = format!("d{dir}{MAIN_SEPARATOR}");
        assert!(received.iter().all(|p| p.relative_name.starts_with(&prefix)));
        assert_eq!(fixture.host.completions_for(request), 1);
    }

    let stats = fixture.stats();
    assert_eq!(stats.buffers_allocated, 8);
    assert_eq!(stats.buffers_outstanding(), 0);
}

// ============================================================================
// Data fetch
// ============================================================================

#[test]
fn test_fetch_streams_whole_file() {
    let fixture = Fixture::new(|o| o);
    let contents: Vec<u8> = pattern((2 * MIB + 1234) as usize);
    fixture.write("big.bin", &contents);
    let key = fixture.mirror.start().unwrap();

    let request = fixture.host.next_key(key);
    let status = fixture
        .host
        .fetch_data(request, &encode_identity("big.bin"), ByteRange::new(0, contents.len() as u64))
        .unwrap();
    assert_eq!(status, CompletionStatus::Success);

    let (fetch_status, bytes) = fixture.host.wait_for_fetch(request, WAIT).unwrap();
    assert_eq!(fetch_status, FetchStatus::Completed);
    assert_eq!(bytes, contents.len() as u64);

    let chunks: Vec<(u64, usize)> = fixture
        .host
        .events()
        .into_iter()
        .filter_map(|e| match e {
            HostEvent::Data { key, offset, length } if key == request => Some((offset, length)),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![(0, MIB as usize), (MIB, MIB as usize), (2 * MIB, 1234)]);

    let progress: Vec<u64> = fixture
        .host
        .events()
        .into_iter()
        .filter_map(|e| match e {
            HostEvent::Progress { key, completed, .. } if key == request => Some(completed),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![MIB, 2 * MIB, contents.len() as u64]);
    assert_eq!(fixture.host.completions_for(request), 1);
}

#[test]
fn test_cancel_mid_transfer_reports_cancelled() {
    let fixture = Fixture::new(|o| o);
    fixture.write("ten.bin", &pattern((10 * MIB) as usize));
    let key = fixture.mirror.start().unwrap();
    let identity: Vec<u8> = encode_identity("ten.bin");

    let fired = Arc::new(AtomicBool::new(false));
    let hook_identity: Vec<u8> = identity.clone();
    let hook_fired = fired.clone();
    fixture.host.set_data_hook(Arc::new(move |host, request, offset, length| {
        if offset + length as u64 >= 4 * MIB && !hook_fired.swap(true, Ordering::SeqCst) {
            host.cancel_fetch_data(*request, &hook_identity).unwrap();
        }
    }));

    let request = fixture.host.next_key(key);
    fixture
        .host
        .fetch_data(request, &identity, ByteRange::new(0, 10 * MIB))
        .unwrap();

    let (status, bytes) = fixture.host.wait_for_fetch(request, WAIT).unwrap();
    assert_eq!(status, FetchStatus::Cancelled);
    assert!(bytes <= 4 * MIB, "reported {bytes} bytes");
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(fixture.host.completions_for(request), 1);

    let stats = fixture.stats();
    assert_eq!(stats.fetches_cancelled, 1);
    assert_eq!(stats.fetches_in_flight(), 0);
    assert!(stats.bytes_transferred < 10 * MIB);
}

#[test]
fn test_cancel_after_completion_is_noop() {
    let fixture = Fixture::new(|o| o);
    fixture.write("small.txt", b"hello");
    let key = fixture.mirror.start().unwrap();
    let identity: Vec<u8> = encode_identity("small.txt");

    let request = fixture.host.next_key(key);
    fixture.host.fetch_data(request, &identity, ByteRange::new(0, 5)).unwrap();
    assert_eq!(
        fixture.host.wait_for_fetch(request, WAIT),
        Some((FetchStatus::Completed, 5))
    );

    fixture.host.cancel_fetch_data(request, &identity).unwrap();

    assert_eq!(fixture.host.completions_for(request), 1);
    let stats = fixture.stats();
    assert_eq!(stats.cancels_received, 1);
    assert_eq!(stats.cancels_ignored, 1);
}

#[test]
fn test_cancel_requires_matching_identity() {
    let fixture = Fixture::new(|o| o);
    fixture.write("held.bin", b"data");
    let mirror = fixture.mirror.with_transfer_engine(Arc::new(GatedEngine));
    let key = mirror.start().unwrap();
    let identity: Vec<u8> = encode_identity("held.bin");

    let request = fixture.host.next_key(key);
    fixture.host.fetch_data(request, &identity, ByteRange::new(0, 4)).unwrap();

    fixture.host.cancel_fetch_data(request, &encode_identity("other.bin")).unwrap();
    assert_eq!(fixture.host.wait_for_fetch(request, Duration::from_millis(100)), None);

    fixture.host.cancel_fetch_data(request, &identity).unwrap();
    assert_eq!(
        fixture.host.wait_for_fetch(request, WAIT),
        Some((FetchStatus::Cancelled, 0))
    );

    let stats = mirror.stats_collector().collect();
    assert_eq!(stats.cancels_received, 2);
    assert_eq!(stats.cancels_ignored, 1);
}

#[test]
fn test_slot_collision_rejected() {
    let fixture = Fixture::new(|o| o);
    fixture.write("held.bin", b"data");
    let mirror = fixture.mirror.with_transfer_engine(Arc::new(GatedEngine));
    let key = mirror.start().unwrap();
    let identity: Vec<u8> = encode_identity("held.bin");

    let request = fixture.host.next_key(key);
    let first = fixture.host.fetch_data(request, &identity, ByteRange::new(0, 4)).unwrap();
    let second = fixture.host.fetch_data(request, &identity, ByteRange::new(0, 4)).unwrap();

    assert_eq!(first, CompletionStatus::Success);
    assert_eq!(second, CompletionStatus::Unsuccessful);

    // Stopping cancels the held transfer, which then reports once more.
    mirror.stop();
    assert_eq!(fixture.host.completions_for(request), 2);
}

#[test]
fn test_stop_reports_held_transfer_as_cancelled() {
    let fixture = Fixture::new(|o| o);
    fixture.write("held.bin", b"data");
    let mirror = fixture.mirror.with_transfer_engine(Arc::new(GatedEngine));
    let key = mirror.start().unwrap();

    let request = fixture.host.next_key(key);
    let status = fixture
        .host
        .fetch_data(request, &encode_identity("held.bin"), ByteRange::new(0, 4))
        .unwrap();
    assert_eq!(status, CompletionStatus::Success);

    mirror.stop();

    // The outcome is already recorded when stop returns.
    assert_eq!(
        fixture.host.wait_for_fetch(request, Duration::ZERO),
        Some((FetchStatus::Cancelled, 0))
    );
    assert_eq!(fixture.host.completions_for(request), 1);

    let events = fixture.host.events();
    let completed_at = events
        .iter()
        .position(|e| e.is_completion() && e.request() == Some(request))
        .unwrap();
    let disconnected_at = events
        .iter()
        .position(|e| *e == HostEvent::Disconnected { key })
        .unwrap();
    assert!(completed_at < disconnected_at);

    let stats = mirror.stats_collector().collect();
    assert_eq!(stats.fetches_cancelled, 1);
    assert_eq!(stats.completion_errors, 0);
}

#[test]
fn test_fetch_of_missing_or_escaping_file_fails() {
    let fixture = Fixture::new(|o| o);
    let key = fixture.mirror.start().unwrap();

    let request = fixture.host.next_key(key);
    let status = fixture
        .host
        .fetch_data(request, &encode_identity("nope.bin"), ByteRange::new(0, 10))
        .unwrap();

    // A well-formed path is admitted; the transfer finds the file missing.
    assert_eq!(status, CompletionStatus::Success);
    assert_eq!(
        fixture.host.wait_for_fetch(request, WAIT),
        Some((FetchStatus::Failed, 0))
    );

    let escape = fixture.host.next_key(key);
    let rejected = fixture
        .host
        .fetch_data(escape, &encode_identity("../outside.bin"), ByteRange::new(0, 10))
        .unwrap();
    assert_eq!(rejected, CompletionStatus::Unsuccessful);
    assert_eq!(
        fixture.host.wait_for_fetch(escape, WAIT),
        Some((FetchStatus::Failed, 0))
    );
    assert_eq!(fixture.host.completions_for(escape), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_missing_backing_root_fails_connect() {
    let client = TempDir::new().unwrap();
    let host = Arc::new(LoopbackHost::new());
    let options = MirrorOptions::new(client.path().join("no-such-server"), client.path());
    let mirror = CloudMirror::new(options, host.clone()).unwrap();

    let result = mirror.start();

    assert!(matches!(result, Err(ConnectError::BackingRootMissing { .. })));
    assert_eq!(host.registration_count(), 0);
    assert!(host.events().is_empty());
    assert!(!mirror.is_started());
}

#[test]
fn test_host_rejection_leaves_nothing_registered() {
    let fixture = Fixture::new(|o| o);
    fixture.host.reject_connections("sync root not registered");

    assert!(matches!(fixture.mirror.start(), Err(ConnectError::Rejected(_))));
    assert_eq!(fixture.host.registration_count(), 0);
    assert!(!fixture.mirror.is_started());
}

#[test]
fn test_second_start_rejected() {
    let fixture = Fixture::new(|o| o);
    fixture.mirror.start().unwrap();

    assert!(matches!(fixture.mirror.start(), Err(ConnectError::AlreadyConnected)));
    assert_eq!(fixture.host.registration_count(), 1);
}

#[test]
fn test_disconnect_after_invalidation_does_not_raise() {
    let fixture = Fixture::new(|o| o);
    let key = fixture.mirror.start().unwrap();

    assert!(fixture.host.invalidate_registration(key));
    fixture.mirror.stop();

    assert!(!fixture.mirror.is_started());
    assert_eq!(fixture.mirror.connection_key(), None);
    assert!(!fixture
        .host
        .events()
        .iter()
        .any(|e| matches!(e, HostEvent::Disconnected { .. })));
}

#[test]
fn test_stop_then_restart() {
    let fixture = Fixture::new(|o| o);
    fixture.write("a.txt", b"a");
    let first = fixture.mirror.start().unwrap();
    fixture.mirror.stop();

    assert!(fixture.host.events().contains(&HostEvent::Disconnected { key: first }));
    assert!(matches!(
        fixture.host.fetch_placeholders(first, ""),
        Err(cloud_mirror::HostError::NotConnected(_))
    ));

    let second = fixture.mirror.start().unwrap();
    assert_ne!(first, second);
    let (_, outcome) = fixture.host.fetch_placeholders(second, "").unwrap();
    assert!(outcome.is_success());
}
