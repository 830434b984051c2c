//! Transfer engine and its dedicated runtime.
//!
//! Host callbacks arrive on driver-owned threads and must return quickly, so
//! file data is streamed by tasks running on a [`TransferRuntime`], a tokio
//! runtime living on its own background thread. It is never the ambient
//! runtime of the caller.
//!
//! ```text
//! Callback Thread                Transfer Thread
//! ───────────────                ───────────────
//!     │                               │
//!     │ spawn(fetch) ────────────────►│ tokio::spawn
//!     │ return                        │ copy chunk ─► sink.write
//!     │                               │ copy chunk ─► sink.write
//!     │                               │ report outcome
//! ```

use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::request::{ByteRange, CorrelationKey};

/// Default chunk size for data transfers (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Transfer offsets and chunk sizes are multiples of this.
pub const CHUNK_ALIGNMENT: usize = 4096;

// ============================================================================
// Engine
// ============================================================================

/// One data-fetch job.
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Request the data answers.
    pub key: CorrelationKey,
    /// Backing file to read.
    pub source: PathBuf,
    /// Range the host asked for.
    pub range: ByteRange,
}

/// Destination of streamed data.
pub trait TransferSink: Send + Sync {
    /// Write one chunk at an absolute file offset.
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), FetchError>;

    /// Report progress within the requested range.
    fn progress(&self, total: u64, completed: u64);
}

/// Streams file contents for a fetch.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Copy `job.range` from the backing file into `sink`.
    ///
    /// # Arguments
    /// * `job` - What to copy
    /// * `sink` - Where chunks go
    /// * `cancel` - Checked before every chunk
    ///
    /// # Returns
    /// Bytes written, or `FetchError::Cancelled` with the bytes written so far.
    async fn copy(
        &self,
        job: TransferJob,
        sink: Arc<dyn TransferSink>,
        cancel: CancellationToken,
    ) -> Result<u64, FetchError>;
}

/// Reads the backing file in fixed-size chunks.
#[derive(Debug, Clone)]
pub struct ChunkedFileCopier {
    chunk_size: usize,
}

impl ChunkedFileCopier {
    /// Create a copier.
    ///
    /// # Arguments
    /// * `chunk_size` - Bytes per chunk, rounded up to the 4 KiB alignment
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size: usize = chunk_size.max(1).div_ceil(CHUNK_ALIGNMENT) * CHUNK_ALIGNMENT;
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for ChunkedFileCopier {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

#[async_trait]
impl TransferEngine for ChunkedFileCopier {
    async fn copy(
        &self,
        job: TransferJob,
        sink: Arc<dyn TransferSink>,
        cancel: CancellationToken,
    ) -> Result<u64, FetchError> {
        let path: String = job.source.display().to_string();
        let mut file: tokio::fs::File = tokio::fs::File::open(&job.source)
            .await
            .map_err(|e| FetchError::io(&path, e))?;
        file.seek(SeekFrom::Start(job.range.offset))
            .await
            .map_err(|e| FetchError::io(&path, e))?;

        let total: u64 = job.range.length;
        let mut buffer: Vec<u8> = vec![0u8; self.chunk_size];
        let mut transferred: u64 = 0;

        while transferred < total {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled {
                    bytes_transferred: transferred,
                });
            }

            let want: usize = (total - transferred).min(self.chunk_size as u64) as usize;
            let read: usize = read_full(&mut file, &mut buffer[..want])
                .await
                .map_err(|e| FetchError::io(&path, e))?;
            if read == 0 {
                // File shorter than the requested range.
                break;
            }

            sink.write(job.range.offset + transferred, &buffer[..read])?;
            transferred += read as u64;
            sink.progress(total, transferred);

            if read < want {
                break;
            }
        }

        Ok(transferred)
    }
}

/// Fill `buffer` unless EOF comes first.
async fn read_full(file: &mut tokio::fs::File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled: usize = 0;
    while filled < buffer.len() {
        let n: usize = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ============================================================================
// Runtime
// ============================================================================

/// Dedicated runtime owning every transfer task.
///
/// Dropping it stops the runtime; unfinished tasks are dropped with it.
pub struct TransferRuntime {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TransferRuntime {
    /// Start the runtime thread.
    ///
    /// # Arguments
    /// * `worker_threads` - Tokio worker threads
    pub fn new(worker_threads: usize) -> std::io::Result<Self> {
        let runtime: tokio::runtime::Runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("cloud-mirror-transfer")
            .enable_all()
            .build()?;

        let (tx, rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let shutdown = CancellationToken::new();
        let token: CancellationToken = shutdown.clone();
        let running = Arc::new(AtomicBool::new(true));
        let running_flag: Arc<AtomicBool> = running.clone();

        let thread: JoinHandle<()> = std::thread::Builder::new()
            .name("cloud-mirror-runtime".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut rx: mpsc::UnboundedReceiver<BoxFuture<'static, ()>> = rx;

                    loop {
                        tokio::select! {
                            biased;

                            _ = token.cancelled() => break,
                            work = rx.recv() => match work {
                                Some(work) => {
                                    tokio::spawn(work);
                                }
                                None => break,
                            },
                        }
                    }
                });

                running_flag.store(false, Ordering::Release);
                drop(runtime);
            })?;

        Ok(Self {
            tx,
            shutdown,
            running,
            thread: Some(thread),
        })
    }

    /// Run `future` as a transfer task.
    ///
    /// # Returns
    /// `FetchError::Shutdown` if the runtime is gone. The future is dropped.
    pub fn spawn<F>(&self, future: F) -> Result<(), FetchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_running() {
            return Err(FetchError::Shutdown);
        }
        self.tx.send(future.boxed()).map_err(|_| FetchError::Shutdown)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    /// Stop accepting work and join the runtime thread.
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Transfer runtime thread panicked");
            }
        }
    }
}

impl Drop for TransferRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
