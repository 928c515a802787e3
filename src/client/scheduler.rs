//! src/client/scheduler.rs
//!
//! Client-side chunk scheduler: splits a file into a deterministic
//! ordered partition, hashes everything up front, and drives a
//! bounded-concurrency upload pool with retry over a pluggable
//! transport.
//!
//! Workers drain a shared queue of missing indices; each claims one
//! index at a time, so no two workers ever upload the same chunk.
//! Aborting the scheduler just stops new claims; chunks already
//! accepted by the server stay valid for a resumed run.

use crate::models::wire::{
    ChunkAck, CreateSessionRequest, CreateSessionResponse, FinalizeResponse,
    SessionStatusResponse,
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::{
    collections::VecDeque,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::mpsc,
};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_CONCURRENCY: usize = 16;
const MAX_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const FINALIZE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const FINALIZE_POLL_LIMIT: u32 = 600;

/// Deterministic partition of a file plus all content hashes, computed
/// in one streaming pass before any network traffic.
#[derive(Clone, Debug)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub file_sha256: String,
    pub chunk_sha256: Vec<String>,
}

impl ChunkPlan {
    /// Byte length of chunk `idx` (the last chunk may be short).
    pub fn chunk_len(&self, idx: u32) -> u64 {
        let start = u64::from(idx) * self.chunk_size;
        self.chunk_size.min(self.file_size - start)
    }
}

/// Hash and partition `path` into `chunk_size` chunks.
pub async fn plan_file(path: &Path, chunk_size: u64) -> io::Result<ChunkPlan> {
    if chunk_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "chunk size must be positive",
        ));
    }
    let mut file = File::open(path).await?;
    let mut file_hasher = Sha256::new();
    let mut chunk_sha256 = Vec::new();
    let mut file_size: u64 = 0;
    let mut buf = vec![0u8; 1024 * 1024];

    'chunks: loop {
        let mut chunk_hasher = Sha256::new();
        let mut chunk_read: u64 = 0;
        while chunk_read < chunk_size {
            let want = buf.len().min((chunk_size - chunk_read) as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                if chunk_read > 0 {
                    chunk_sha256.push(format!("{:x}", chunk_hasher.finalize()));
                }
                break 'chunks;
            }
            chunk_hasher.update(&buf[..n]);
            file_hasher.update(&buf[..n]);
            chunk_read += n as u64;
            file_size += n as u64;
        }
        chunk_sha256.push(format!("{:x}", chunk_hasher.finalize()));
    }

    if file_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to upload an empty file",
        ));
    }

    Ok(ChunkPlan {
        file_size,
        chunk_size,
        total_chunks: chunk_sha256.len() as u32,
        file_sha256: format!("{:x}", file_hasher.finalize()),
        chunk_sha256,
    })
}

/// Transport failures split into "safe to retry" and terminal
/// rejections carrying the server's stable error kind.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("rejected ({kind}): {message}")]
    Rejected { kind: String, message: String },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The four protocol calls the scheduler needs from a server.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, TransportError>;

    async fn probe(&self, session: Uuid) -> Result<SessionStatusResponse, TransportError>;

    async fn put_chunk(
        &self,
        session: Uuid,
        index: u32,
        sha256: &str,
        idempotency_key: &str,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, TransportError>;

    async fn finalize(
        &self,
        session: Uuid,
        file_sha256: &str,
    ) -> Result<FinalizeResponse, TransportError>;
}

/// Informational progress snapshot emitted after each accepted chunk.
/// Never used for protocol correctness.
#[derive(Clone, Debug)]
pub struct Progress {
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    pub bytes_per_sec: f64,
    pub eta_secs: Option<f64>,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkExhausted {
        index: u32,
        attempts: u32,
        source: TransportError,
    },

    #[error("upload session ended in status {0}")]
    SessionFailed(String),
}

/// An in-flight upload: the session handle plus the local plan.
#[derive(Clone, Debug)]
pub struct UploadHandle {
    pub session_id: Uuid,
    pub plan: ChunkPlan,
    path: PathBuf,
    run_id: Uuid,
}

pub struct Scheduler<T: UploadTransport> {
    transport: Arc<T>,
    concurrency: usize,
    max_attempts: u32,
    progress: Option<mpsc::UnboundedSender<Progress>>,
}

impl<T: UploadTransport + 'static> Scheduler<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: MAX_ATTEMPTS,
            progress: None,
        }
    }

    /// Bounded worker count; clamped to `1..=MAX_CONCURRENCY`.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<Progress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Plan the file and create the server-side session.
    pub async fn begin(&self, path: &Path, chunk_size: u64) -> Result<UploadHandle, SchedulerError> {
        let plan = plan_file(path, chunk_size).await?;
        let req = CreateSessionRequest {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".into()),
            size: plan.file_size,
            mime_type: None,
            chunk_size: plan.chunk_size,
            total_chunks: plan.total_chunks,
            file_sha256: plan.file_sha256.clone(),
        };
        let resp = self.transport.create_session(&req).await?;
        debug!(session = %resp.upload_session_id, chunks = plan.total_chunks, "session created");
        Ok(UploadHandle {
            session_id: resp.upload_session_id,
            plan,
            path: path.to_path_buf(),
            run_id: Uuid::new_v4(),
        })
    }

    /// Ask the server which indices it is still missing.
    pub async fn probe(&self, handle: &UploadHandle) -> Result<Vec<u32>, SchedulerError> {
        Ok(self.transport.probe(handle.session_id).await?.missing)
    }

    /// Upload the given missing indices with a bounded worker pool.
    pub async fn run(
        &self,
        handle: &UploadHandle,
        missing: Vec<u32>,
    ) -> Result<(), SchedulerError> {
        if missing.is_empty() {
            return Ok(());
        }
        let total = handle.plan.total_chunks;
        let queue = Arc::new(Mutex::new(missing.iter().copied().collect::<VecDeque<_>>()));
        let aborted = Arc::new(AtomicBool::new(false));
        let uploaded = Arc::new(AtomicU32::new(total - missing.len() as u32));
        let bytes_done = Arc::new(AtomicU64::new(0));
        let started = Instant::now();

        let workers = self.concurrency.min(missing.len());
        let mut tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            let transport = self.transport.clone();
            let queue = queue.clone();
            let aborted = aborted.clone();
            let uploaded = uploaded.clone();
            let bytes_done = bytes_done.clone();
            let progress = self.progress.clone();
            let handle = handle.clone();
            let max_attempts = self.max_attempts;

            tasks.push(tokio::spawn(async move {
                loop {
                    if aborted.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    // Atomic claim: an index leaves the queue exactly once.
                    let Some(index) = queue.lock().unwrap().pop_front() else {
                        return Ok(());
                    };
                    match upload_one(&*transport, &handle, index, max_attempts).await {
                        Ok(len) => {
                            let done = uploaded.fetch_add(1, Ordering::SeqCst) + 1;
                            let bytes = bytes_done.fetch_add(len, Ordering::SeqCst) + len;
                            if let Some(tx) = &progress {
                                let elapsed = started.elapsed().as_secs_f64().max(1e-6);
                                let rate = bytes as f64 / elapsed;
                                let remaining: u64 = (done..total)
                                    .map(|i| handle.plan.chunk_len(i))
                                    .sum();
                                let _ = tx.send(Progress {
                                    uploaded_chunks: done,
                                    total_chunks: total,
                                    bytes_per_sec: rate,
                                    eta_secs: (rate > 0.0)
                                        .then(|| remaining as f64 / rate),
                                });
                            }
                        }
                        Err(err) => {
                            aborted.store(true, Ordering::SeqCst);
                            return Err(err);
                        }
                    }
                }
            }));
        }

        let mut first_error = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error
                        .get_or_insert(SchedulerError::Io(io::Error::other(join_err.to_string())));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn finalize(&self, handle: &UploadHandle) -> Result<FinalizeResponse, SchedulerError> {
        Ok(self
            .transport
            .finalize(handle.session_id, &handle.plan.file_sha256)
            .await?)
    }

    /// Drive a whole upload: plan, create, upload missing chunks,
    /// finalize, then poll until the session is terminal.
    pub async fn upload_file(
        &self,
        path: &Path,
        chunk_size: u64,
    ) -> Result<Uuid, SchedulerError> {
        let handle = self.begin(path, chunk_size).await?;
        let missing = self.probe(&handle).await?;
        self.run(&handle, missing).await?;

        for _ in 0..FINALIZE_POLL_LIMIT {
            let resp = self.finalize(&handle).await?;
            match resp.status {
                crate::models::session::UploadStatus::Completed => {
                    return resp.file_id.ok_or_else(|| {
                        SchedulerError::SessionFailed("completed without a file id".into())
                    });
                }
                crate::models::session::UploadStatus::Finalizing => {
                    tokio::time::sleep(FINALIZE_POLL_INTERVAL).await;
                }
                status => return Err(SchedulerError::SessionFailed(format!("{status:?}"))),
            }
        }
        Err(SchedulerError::SessionFailed(
            "timed out waiting for reassembly".into(),
        ))
    }
}

async fn upload_one<T: UploadTransport + ?Sized>(
    transport: &T,
    handle: &UploadHandle,
    index: u32,
    max_attempts: u32,
) -> Result<u64, SchedulerError> {
    let bytes = read_chunk(&handle.path, index, &handle.plan).await?;
    let len = bytes.len() as u64;
    let sha256 = &handle.plan.chunk_sha256[index as usize];

    let mut attempt = 1;
    loop {
        // Attempt-scoped idempotency key: retries of a failed call are
        // distinguishable on the wire yet land on the same server effect.
        let key = format!("{}:{}:{}", handle.run_id, index, attempt);
        match transport
            .put_chunk(handle.session_id, index, sha256, &key, bytes.clone())
            .await
        {
            Ok(_) => return Ok(len),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(index, attempt, "chunk upload failed, retrying in {delay:?}: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) if err.is_retryable() => {
                return Err(SchedulerError::ChunkExhausted {
                    index,
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn read_chunk(path: &Path, index: u32, plan: &ChunkPlan) -> io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    let offset = u64::from(index) * plan.chunk_size;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; plan.chunk_len(index) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::UploadStatus;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_fixture(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn plan_partitions_and_hashes_deterministically() {
        let data = test_data(100);
        let file = write_fixture(&data);

        let plan = plan_file(file.path(), 32).await.unwrap();
        assert_eq!(plan.total_chunks, 4);
        assert_eq!(plan.file_size, 100);
        assert_eq!(plan.chunk_len(0), 32);
        assert_eq!(plan.chunk_len(3), 4);
        assert_eq!(
            plan.file_sha256,
            format!("{:x}", Sha256::digest(&data))
        );
        assert_eq!(
            plan.chunk_sha256[1],
            format!("{:x}", Sha256::digest(&data[32..64]))
        );

        let again = plan_file(file.path(), 32).await.unwrap();
        assert_eq!(again.chunk_sha256, plan.chunk_sha256);
    }

    #[tokio::test]
    async fn plan_rejects_empty_input() {
        let file = write_fixture(b"");
        assert!(plan_file(file.path(), 32).await.is_err());
    }

    /// In-memory transport that stores accepted chunks, counts attempts
    /// per index, and fails the first N attempts of selected indices.
    struct MockTransport {
        session_id: Uuid,
        total_chunks: u32,
        state: Mutex<MockState>,
        fail_first_attempts: HashMap<u32, u32>,
        reject_index: Option<u32>,
    }

    #[derive(Default)]
    struct MockState {
        attempts: HashMap<u32, u32>,
        accepted: HashMap<u32, Vec<u8>>,
        keys_seen: Vec<String>,
    }

    impl MockTransport {
        fn new(total_chunks: u32) -> Self {
            Self {
                session_id: Uuid::new_v4(),
                total_chunks,
                state: Mutex::new(MockState::default()),
                fail_first_attempts: HashMap::new(),
                reject_index: None,
            }
        }
    }

    #[async_trait]
    impl UploadTransport for MockTransport {
        async fn create_session(
            &self,
            req: &CreateSessionRequest,
        ) -> Result<CreateSessionResponse, TransportError> {
            Ok(CreateSessionResponse {
                upload_session_id: self.session_id,
                accepted_chunk_size: req.chunk_size,
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        }

        async fn probe(&self, _session: Uuid) -> Result<SessionStatusResponse, TransportError> {
            let state = self.state.lock().unwrap();
            let received: Vec<u32> = state.accepted.keys().copied().collect();
            let missing = (0..self.total_chunks)
                .filter(|i| !state.accepted.contains_key(i))
                .collect();
            Ok(SessionStatusResponse {
                received,
                missing,
                status: UploadStatus::Uploading,
            })
        }

        async fn put_chunk(
            &self,
            _session: Uuid,
            index: u32,
            _sha256: &str,
            idempotency_key: &str,
            bytes: Vec<u8>,
        ) -> Result<ChunkAck, TransportError> {
            if self.reject_index == Some(index) {
                return Err(TransportError::Rejected {
                    kind: "checksum-mismatch".into(),
                    message: "bad chunk".into(),
                });
            }
            let mut state = self.state.lock().unwrap();
            state.keys_seen.push(idempotency_key.to_string());
            let attempt = state.attempts.entry(index).or_insert(0);
            *attempt += 1;
            if let Some(&failures) = self.fail_first_attempts.get(&index) {
                if *attempt <= failures {
                    return Err(TransportError::Transient("connection reset".into()));
                }
            }
            let duplicate = state.accepted.insert(index, bytes.clone()).is_some();
            Ok(ChunkAck {
                received: index,
                size: bytes.len() as u64,
                duplicate,
            })
        }

        async fn finalize(
            &self,
            session: Uuid,
            _file_sha256: &str,
        ) -> Result<FinalizeResponse, TransportError> {
            Ok(FinalizeResponse {
                upload_session_id: session,
                file_id: Some(Uuid::new_v4()),
                status: UploadStatus::Completed,
            })
        }
    }

    #[tokio::test]
    async fn run_uploads_each_missing_index_exactly_once() {
        let data = test_data(200);
        let file = write_fixture(&data);
        let transport = MockTransport::new(7);
        let scheduler = Scheduler::new(transport).with_concurrency(4);

        let handle = scheduler.begin(file.path(), 30).await.unwrap();
        assert_eq!(handle.plan.total_chunks, 7);
        let missing = scheduler.probe(&handle).await.unwrap();
        scheduler.run(&handle, missing).await.unwrap();

        let state = scheduler.transport.state.lock().unwrap();
        assert_eq!(state.accepted.len(), 7);
        // every accepted chunk carries the right bytes
        for (idx, bytes) in &state.accepted {
            let start = *idx as usize * 30;
            let end = (start + 30).min(data.len());
            assert_eq!(bytes, &data[start..end]);
        }
        // no index claimed twice (attempt counts all 1 without failures)
        assert!(state.attempts.values().all(|&a| a == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let data = test_data(96);
        let file = write_fixture(&data);
        let mut transport = MockTransport::new(3);
        transport.fail_first_attempts.insert(1, 2);
        let scheduler = Scheduler::new(transport).with_concurrency(2);

        let handle = scheduler.begin(file.path(), 32).await.unwrap();
        scheduler.run(&handle, vec![0, 1, 2]).await.unwrap();

        let state = scheduler.transport.state.lock().unwrap();
        assert_eq!(state.attempts[&1], 3);
        assert_eq!(state.accepted.len(), 3);
        // each retry used a fresh attempt-scoped idempotency key
        let keys_for_1: Vec<_> = state
            .keys_seen
            .iter()
            .filter(|k| k.contains(&format!("{}:1:", handle.run_id)))
            .collect();
        assert_eq!(keys_for_1.len(), 3);
    }

    #[tokio::test]
    async fn terminal_rejection_aborts_the_pool() {
        let data = test_data(96);
        let file = write_fixture(&data);
        let mut transport = MockTransport::new(3);
        transport.reject_index = Some(2);
        let scheduler = Scheduler::new(transport).with_concurrency(1);

        let handle = scheduler.begin(file.path(), 32).await.unwrap();
        let err = scheduler.run(&handle, vec![0, 1, 2]).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Transport(TransportError::Rejected { .. })
        ));
        // accepted chunks from before the abort remain valid for resume
        let state = scheduler.transport.state.lock().unwrap();
        assert_eq!(state.accepted.len(), 2);
    }

    #[tokio::test]
    async fn progress_events_are_emitted() {
        let data = test_data(64);
        let file = write_fixture(&data);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(MockTransport::new(2))
            .with_concurrency(2)
            .with_progress(tx);

        let handle = scheduler.begin(file.path(), 32).await.unwrap();
        scheduler.run(&handle, vec![0, 1]).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events.last().unwrap().uploaded_chunks, 2);
    }
}
