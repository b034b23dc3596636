//! Chunked background uploads for one file opened for writing.
//!
//! Writes fill a buffer of `chunk_size` bytes. Each full buffer becomes a
//! numbered chunk uploaded on its own worker thread: chunk 0 creates or
//! truncates the target, every later chunk appends. At most
//! `max_concurrent_uploads` chunks are in flight; dispatching another blocks
//! the writer until one finishes.
//!
//! Appends must land in dispatch order, so each worker waits at a sequence
//! gate until every earlier chunk has finished before it touches the remote
//! file.
//!
//! The first failed chunk is remembered for the life of the pipeline. Once it
//! is set no further chunk starts, and every later `write`, `flush`, `sync`
//! and `close` returns it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::client::connection::throughput_mib;
use crate::error::SshfsError;

/// Destination of uploaded chunks.
pub trait ChunkSink: Send + Sync {
    /// Write `data` to `path`, truncating first unless `append` is set.
    fn upload_chunk(&self, path: &str, data: &[u8], append: bool) -> Result<(), SshfsError>;
}

/// Lifecycle of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Dispatched, waiting for earlier chunks.
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

/// An immutable snapshot of one chunk's bytes.
struct WriteBuffer {
    seq: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct PipelineState {
    in_flight: usize,
    /// Sequence number allowed to write next.
    next_commit: u64,
    chunks: BTreeMap<u64, ChunkStatus>,
    first_error: Option<(u64, Arc<SshfsError>)>,
}

struct Shared {
    state: Mutex<PipelineState>,
    changed: Condvar,
    uploaded: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, PipelineState>) -> MutexGuard<'a, PipelineState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles a chunk when its worker exits, including by panic, so the gate
/// and the in-flight count never get stuck.
struct Settle {
    shared: Arc<Shared>,
    seq: u64,
    len: usize,
    outcome: Option<Result<(), SshfsError>>,
}

impl Drop for Settle {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(SshfsError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "upload worker exited without a result",
                ),
            })
        });
        match outcome {
            Ok(()) => {
                self.shared
                    .uploaded
                    .fetch_add(self.len as u64, Ordering::SeqCst);
                state.chunks.insert(self.seq, ChunkStatus::Uploaded);
            }
            Err(e) => {
                state.chunks.insert(self.seq, ChunkStatus::Failed);
                if state.first_error.is_none() {
                    state.first_error = Some((self.seq, Arc::new(e)));
                }
            }
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        state.next_commit = state.next_commit.max(self.seq + 1);
        drop(state);
        self.shared.changed.notify_all();
    }
}

pub struct UploadPipeline {
    path: String,
    sink: Arc<dyn ChunkSink>,
    chunk_size: usize,
    max_in_flight: usize,
    fill: Vec<u8>,
    next_seq: u64,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    /// Highest progress value handed out so far.
    reported: AtomicU64,
}

impl UploadPipeline {
    pub fn new(
        path: impl Into<String>,
        sink: Arc<dyn ChunkSink>,
        chunk_size: usize,
        max_concurrent_uploads: usize,
    ) -> Self {
        Self {
            path: path.into(),
            sink,
            chunk_size: chunk_size.max(1),
            max_in_flight: max_concurrent_uploads.max(1),
            fill: Vec::new(),
            next_seq: 0,
            shared: Arc::new(Shared {
                state: Mutex::new(PipelineState::default()),
                changed: Condvar::new(),
                uploaded: AtomicU64::new(0),
            }),
            workers: Vec::new(),
            reported: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn sticky_error(&self, state: &PipelineState) -> Option<SshfsError> {
        state
            .first_error
            .as_ref()
            .map(|(chunk, source)| SshfsError::Upload {
                path: self.path.clone(),
                chunk: *chunk,
                source: Arc::clone(source),
            })
    }

    fn check_error(&self) -> Result<(), SshfsError> {
        match self.sticky_error(&self.shared.lock()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Buffer `data`, dispatching a chunk each time the buffer fills.
    pub fn write(&mut self, mut data: &[u8]) -> Result<usize, SshfsError> {
        self.check_error()?;
        let len = data.len();
        while !data.is_empty() {
            let room = self.chunk_size - self.fill.len();
            let take = room.min(data.len());
            self.fill.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.fill.len() == self.chunk_size {
                self.dispatch(false)?;
            }
        }
        Ok(len)
    }

    /// Dispatch whatever is buffered as an undersized chunk. Does not wait.
    pub fn flush(&mut self) -> Result<(), SshfsError> {
        self.dispatch(false)
    }

    /// Flush, wait for every chunk, and report the sticky error if any.
    pub fn sync(&mut self) -> Result<(), SshfsError> {
        self.finish(false)
    }

    /// Like `sync`, but also creates an empty target if nothing was written.
    pub fn close(&mut self) -> Result<(), SshfsError> {
        self.finish(true)
    }

    fn finish(&mut self, create_if_empty: bool) -> Result<(), SshfsError> {
        let dispatched = self.dispatch(create_if_empty && self.next_seq == 0);
        self.wait_all();
        dispatched?;
        self.check_error()
    }

    fn dispatch(&mut self, allow_empty: bool) -> Result<(), SshfsError> {
        self.check_error()?;
        if self.fill.is_empty() && !allow_empty {
            return Ok(());
        }

        let seq = self.next_seq;
        {
            let mut state = self.shared.lock();
            while state.in_flight >= self.max_in_flight && state.first_error.is_none() {
                tracing::trace!(path = %self.path, chunk = seq, "Upload limit reached, waiting");
                state = self.shared.wait(state);
            }
            if let Some(err) = self.sticky_error(&state) {
                return Err(err);
            }
            state.in_flight += 1;
            state.chunks.insert(seq, ChunkStatus::Pending);
        }

        let buffer = WriteBuffer {
            seq,
            data: std::mem::take(&mut self.fill),
        };
        tracing::debug!(path = %self.path, chunk = seq, bytes = buffer.data.len(), "Dispatching chunk");

        let settle = Settle {
            shared: Arc::clone(&self.shared),
            seq,
            len: buffer.data.len(),
            outcome: None,
        };
        let sink = Arc::clone(&self.sink);
        let path = self.path.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("sshfs-upload-{}", seq))
            .spawn(move || upload_worker(sink, path, buffer, settle));

        match spawned {
            Ok(handle) => {
                self.next_seq += 1;
                self.workers.push(handle);
                Ok(())
            }
            Err(e) => {
                // The closure and its Settle guard were dropped, recording
                // this chunk as failed.
                tracing::error!(path = %self.path, chunk = seq, error = %e, "Could not start upload worker");
                self.next_seq += 1;
                Err(SshfsError::Io { source: e })
            }
        }
    }

    /// Join every worker. Their outcomes are already recorded by `Settle`.
    fn wait_all(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!(path = %self.path, "Upload worker panicked");
            }
        }
        let mut state = self.shared.lock();
        state.chunks.retain(|_, status| *status != ChunkStatus::Uploaded);
    }

    /// Take `size` as the target's length after it was resized remotely.
    /// Only valid right after a successful `sync`.
    ///
    /// The target counts as created from here on: later chunks append to
    /// the resized file and `close` does not truncate it again.
    pub fn rebase(&mut self, size: u64) {
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        self.shared.lock().next_commit = self.next_seq;
        self.shared.uploaded.store(size, Ordering::SeqCst);
        self.reported.store(size, Ordering::SeqCst);
    }

    /// Bytes uploaded plus bytes buffered. Never decreases except through
    /// `rebase`.
    ///
    /// Buffered bytes have not left the client yet, so this runs ahead of
    /// what the server holds.
    pub fn progress(&self) -> u64 {
        let current = self.shared.uploaded.load(Ordering::SeqCst) + self.fill.len() as u64;
        self.reported.fetch_max(current, Ordering::SeqCst).max(current)
    }

    /// Bytes confirmed written to the server.
    pub fn uploaded_bytes(&self) -> u64 {
        self.shared.uploaded.load(Ordering::SeqCst)
    }

    /// Chunks dispatched so far.
    pub fn chunks_dispatched(&self) -> u64 {
        self.next_seq
    }

    /// Status of chunk `seq`, while it is still tracked.
    pub fn chunk_status(&self, seq: u64) -> Option<ChunkStatus> {
        self.shared.lock().chunks.get(&seq).copied()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.fill.len()
    }
}

impl Drop for UploadPipeline {
    fn drop(&mut self) {
        self.wait_all();
    }
}

fn upload_worker(sink: Arc<dyn ChunkSink>, path: String, buffer: WriteBuffer, mut settle: Settle) {
    let seq = buffer.seq;
    {
        let shared = Arc::clone(&settle.shared);
        let mut state = shared.lock();
        while state.next_commit != seq && state.first_error.is_none() {
            state = shared.wait(state);
        }
        if let Some((failed, _)) = &state.first_error {
            tracing::debug!(path = %path, chunk = seq, failed_chunk = *failed, "Skipping chunk after earlier failure");
            let failed = *failed;
            drop(state);
            settle.outcome = Some(Err(SshfsError::remote(
                "upload",
                path.as_str(),
                format!("not started because chunk #{} failed", failed),
            )));
            return;
        }
        state.chunks.insert(seq, ChunkStatus::Uploading);
    }

    let started = Instant::now();
    let result = sink.upload_chunk(&path, &buffer.data, seq != 0);
    let elapsed = started.elapsed();
    match &result {
        Ok(()) => tracing::debug!(
            path = %path,
            chunk = seq,
            bytes = buffer.data.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            mib_per_sec = throughput_mib(buffer.data.len(), elapsed),
            "Chunk uploaded"
        ),
        Err(e) => tracing::warn!(path = %path, chunk = seq, error = %e, "Chunk upload failed"),
    }
    settle.outcome = Some(result);
}
