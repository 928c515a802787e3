//! src/services/session_service.rs
//!
//! SessionService — the upload session state machine backed by SQLite
//! for metadata and `ChunkStore` for staged bytes.
//!
//! State machine: `init → uploading → finalizing → completed`, with
//! `failed` reachable from `uploading`/`finalizing` and `expired` from
//! `init`/`uploading` by timeout. Expiry is enforced by comparing the
//! stored deadline against wall-clock time at the start of every call;
//! the background GC only reclaims storage.
//!
//! Concurrency notes:
//! - duplicate chunk writes resolve through the `(session_id, idx)`
//!   unique key, claimed before any bytes reach the store: the losing
//!   insert of a race is reported as an idempotent duplicate (or a
//!   checksum conflict) without ever writing;
//! - finalize is exclusive per session via a conditional UPDATE on the
//!   `uploading` status; exactly one caller observes `rows_affected = 1`.

use crate::{
    config::MAX_CHUNK_SIZE,
    errors::{ShareError, ShareResult, is_unique_violation},
    models::{
        file::{FileStatus, StoredFile},
        owner::Owner,
        session::{ChunkBitmap, ChunkRecord, UploadSession, UploadStatus, expected_total_chunks},
        wire::{ChunkAck, CreateSessionRequest, FinalizeResponse, SessionStatusResponse},
    },
    services::{assembler, chunk_store::ChunkStore},
};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct SessionService {
    pub db: Arc<SqlitePool>,
    pub store: ChunkStore,

    session_ttl: Duration,
    session_retention: Duration,
    sync_finalize_max_bytes: u64,
}

impl SessionService {
    pub fn new(
        db: Arc<SqlitePool>,
        store: ChunkStore,
        session_ttl_minutes: i64,
        session_retention_minutes: i64,
        sync_finalize_max_bytes: u64,
    ) -> Self {
        Self {
            db,
            store,
            session_ttl: Duration::minutes(session_ttl_minutes),
            session_retention: Duration::minutes(session_retention_minutes),
            sync_finalize_max_bytes,
        }
    }

    /// Resolve a bearer API key to an owner. `None` means anonymous.
    pub async fn resolve_owner(&self, api_key: Option<&str>) -> ShareResult<Option<Owner>> {
        let Some(key) = api_key else {
            return Ok(None);
        };
        sqlx::query_as::<_, Owner>(
            "SELECT id, name, api_key, quota_bytes, used_bytes, created_at
             FROM owners WHERE api_key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?
        .map(Some)
        .ok_or(ShareError::Unauthorized)
    }

    /// Create a new upload session.
    ///
    /// The requested chunk size is clamped to policy; `total_chunks`
    /// must match `ceil(size / accepted_chunk_size)` exactly.
    pub async fn create(
        &self,
        req: &CreateSessionRequest,
        owner: Option<&Owner>,
    ) -> ShareResult<UploadSession> {
        if req.filename.trim().is_empty() {
            return Err(ShareError::Validation("filename must not be empty".into()));
        }
        if req.size == 0 {
            return Err(ShareError::Validation("size must be positive".into()));
        }
        if req.chunk_size == 0 {
            return Err(ShareError::Validation("chunk size must be positive".into()));
        }
        if i64::try_from(req.size).is_err() {
            return Err(ShareError::Validation(
                "size exceeds supported maximum".into(),
            ));
        }

        let accepted_chunk_size = req.chunk_size.min(MAX_CHUNK_SIZE);
        let expected = expected_total_chunks(req.size as i64, accepted_chunk_size as i64);
        if i64::from(req.total_chunks) != expected {
            return Err(ShareError::Validation(format!(
                "total_chunks must be {} for size {} and accepted chunk size {}",
                expected, req.size, accepted_chunk_size
            )));
        }

        if let Some(owner) = owner {
            if !owner.has_room_for(req.size as i64) {
                return Err(ShareError::QuotaExceeded);
            }
        }

        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            owner_id: owner.map(|o| o.id),
            filename: req.filename.clone(),
            size_bytes: req.size as i64,
            mime_type: req.mime_type.clone(),
            chunk_size: accepted_chunk_size as i64,
            total_chunks: expected,
            file_sha256: req.file_sha256.to_lowercase(),
            status: UploadStatus::Init,
            received_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + self.session_ttl,
            finalized_at: None,
        };

        sqlx::query(
            "INSERT INTO upload_sessions (
                 id, owner_id, filename, size_bytes, mime_type, chunk_size,
                 total_chunks, file_sha256, status, received_count,
                 created_at, updated_at, expires_at, finalized_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(session.owner_id)
        .bind(&session.filename)
        .bind(session.size_bytes)
        .bind(&session.mime_type)
        .bind(session.chunk_size)
        .bind(session.total_chunks)
        .bind(&session.file_sha256)
        .bind(session.status)
        .bind(session.received_count)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .bind(session.finalized_at)
        .execute(&*self.db)
        .await?;

        info!(
            session = %session.id,
            size = session.size_bytes,
            chunks = session.total_chunks,
            "created upload session"
        );
        Ok(session)
    }

    pub async fn fetch_session(&self, id: Uuid) -> ShareResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, owner_id, filename, size_bytes, mime_type, chunk_size,
                    total_chunks, file_sha256, status, received_count,
                    created_at, updated_at, expires_at, finalized_at
             FROM upload_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(ShareError::SessionNotFound(id))
    }

    /// Reject (and mark) a session whose deadline has passed.
    async fn ensure_live(&self, session: &UploadSession) -> ShareResult<()> {
        if !session.is_lapsed(Utc::now()) {
            return Ok(());
        }
        sqlx::query(
            "UPDATE upload_sessions SET status = 'expired', updated_at = ?
             WHERE id = ? AND status IN ('init', 'uploading')",
        )
        .bind(Utc::now())
        .bind(session.id)
        .execute(&*self.db)
        .await?;
        Err(ShareError::SessionExpired(session.id))
    }

    async fn received_bitmap(&self, session: &UploadSession) -> ShareResult<ChunkBitmap> {
        let indices: Vec<i64> =
            sqlx::query_scalar("SELECT idx FROM upload_chunks WHERE session_id = ?")
                .bind(session.id)
                .fetch_all(&*self.db)
                .await?;
        Ok(ChunkBitmap::from_indices(
            session.total_chunks as u32,
            indices.into_iter().map(|i| i as u32),
        ))
    }

    /// Report received and missing indices. Pure read apart from the
    /// last-seen timestamp used for expiry accounting.
    pub async fn probe(&self, id: Uuid) -> ShareResult<SessionStatusResponse> {
        let session = self.fetch_session(id).await?;
        self.ensure_live(&session).await?;

        let bitmap = self.received_bitmap(&session).await?;
        sqlx::query("UPDATE upload_sessions SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(SessionStatusResponse {
            received: bitmap.received(),
            missing: bitmap.missing(),
            status: session.status,
        })
    }

    /// Accept one chunk. Re-submitting an already-accepted index with
    /// identical bytes is a success no-op; different bytes under the
    /// same index are rejected without touching stored data.
    pub async fn accept_chunk(
        &self,
        id: Uuid,
        index: i64,
        declared_size: Option<u64>,
        declared_sha256: Option<&str>,
        idempotency_key: Option<&str>,
        bytes: &[u8],
    ) -> ShareResult<ChunkAck> {
        let session = self.fetch_session(id).await?;
        self.ensure_live(&session).await?;
        if !session.accepts_chunks() {
            return Err(ShareError::StateConflict(format!(
                "session is {:?}, not accepting chunks",
                session.status
            )));
        }
        if index < 0 || index >= session.total_chunks {
            return Err(ShareError::IndexOutOfRange {
                index,
                total: session.total_chunks,
            });
        }
        if bytes.is_empty() {
            return Err(ShareError::Validation("empty chunk".into()));
        }
        if bytes.len() as u64 > MAX_CHUNK_SIZE {
            return Err(ShareError::ChunkTooLarge {
                got: bytes.len() as u64,
                max: MAX_CHUNK_SIZE,
            });
        }
        if let Some(declared) = declared_size {
            if declared != bytes.len() as u64 {
                return Err(ShareError::Validation(format!(
                    "chunk size mismatch: declared {}, got {}",
                    declared,
                    bytes.len()
                )));
            }
        }

        let computed = format!("{:x}", Sha256::digest(bytes));
        if let Some(declared) = declared_sha256 {
            if !declared.eq_ignore_ascii_case(&computed) {
                return Err(ShareError::ChecksumMismatch(format!(
                    "chunk {} declared {}, computed {}",
                    index, declared, computed
                )));
            }
        }

        if let Some(existing) = self.fetch_chunk(id, index).await? {
            return self.ack_duplicate(&existing, &computed);
        }

        // Claim the (session_id, idx) row before touching the store:
        // the loser of a same-index race must never reach the write,
        // so stored bytes always match the recorded hash.
        let insert = sqlx::query(
            "INSERT INTO upload_chunks (session_id, idx, size_bytes, sha256, idempotency_key, received_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(index)
        .bind(bytes.len() as i64)
        .bind(&computed)
        .bind(idempotency_key)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        match insert {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                // Lost the claim; the winner's bytes are the ones that
                // count, ours only matter for the identical/conflicting
                // distinction.
                let existing = self
                    .fetch_chunk(id, index)
                    .await?
                    .ok_or(ShareError::Sqlx(err))?;
                return self.ack_duplicate(&existing, &computed);
            }
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.store.write_chunk(id, index as u32, bytes).await {
            // Release the claim so a retry can stage the bytes.
            let _ = sqlx::query("DELETE FROM upload_chunks WHERE session_id = ? AND idx = ?")
                .bind(id)
                .bind(index)
                .execute(&*self.db)
                .await;
            return Err(err.into());
        }

        sqlx::query(
            "UPDATE upload_sessions
             SET received_count = received_count + 1, status = 'uploading', updated_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        Ok(ChunkAck {
            received: index as u32,
            size: bytes.len() as u64,
            duplicate: false,
        })
    }

    fn ack_duplicate(&self, existing: &ChunkRecord, computed: &str) -> ShareResult<ChunkAck> {
        if existing.sha256 != computed {
            return Err(ShareError::ChecksumMismatch(format!(
                "chunk {} already stored with different content",
                existing.idx
            )));
        }
        Ok(ChunkAck {
            received: existing.idx as u32,
            size: existing.size_bytes as u64,
            duplicate: true,
        })
    }

    async fn fetch_chunk(&self, session_id: Uuid, idx: i64) -> ShareResult<Option<ChunkRecord>> {
        Ok(sqlx::query_as::<_, ChunkRecord>(
            "SELECT session_id, idx, size_bytes, sha256, idempotency_key, received_at
             FROM upload_chunks WHERE session_id = ? AND idx = ?",
        )
        .bind(session_id)
        .bind(idx)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Request reassembly. Exactly one caller per session claims the
    /// `uploading → finalizing` edge; later calls observe the current
    /// status instead of starting a duplicate job.
    pub async fn finalize(&self, id: Uuid, expected_sha256: &str) -> ShareResult<FinalizeResponse> {
        let session = self.fetch_session(id).await?;
        self.ensure_live(&session).await?;

        match session.status {
            UploadStatus::Completed => {
                let file = self.file_for_session(id).await?;
                return Ok(FinalizeResponse {
                    upload_session_id: id,
                    file_id: file.map(|f| f.id),
                    status: UploadStatus::Completed,
                });
            }
            UploadStatus::Finalizing | UploadStatus::Failed => {
                return Ok(FinalizeResponse {
                    upload_session_id: id,
                    file_id: None,
                    status: session.status,
                });
            }
            UploadStatus::Init | UploadStatus::Uploading => {}
            UploadStatus::Expired => return Err(ShareError::SessionExpired(id)),
        }

        if !expected_sha256.eq_ignore_ascii_case(&session.file_sha256) {
            return Err(ShareError::ChecksumMismatch(
                "finalize hash differs from the declared whole-file hash".into(),
            ));
        }
        if !session.is_complete() {
            let bitmap = self.received_bitmap(&session).await?;
            return Err(ShareError::StateConflict(format!(
                "incomplete upload: missing indices {:?}",
                bitmap.missing()
            )));
        }

        let claimed = sqlx::query(
            "UPDATE upload_sessions SET status = 'finalizing', updated_at = ?
             WHERE id = ? AND status = 'uploading'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        if claimed.rows_affected() == 0 {
            // Another finalize won the claim.
            return Ok(FinalizeResponse {
                upload_session_id: id,
                file_id: None,
                status: UploadStatus::Finalizing,
            });
        }

        // The file id is allocated here but the record itself is only
        // created by the assembler once the payload verifies; a failed
        // reassembly leaves no file row behind.
        let file_id = Uuid::new_v4();

        if session.size_bytes as u64 <= self.sync_finalize_max_bytes {
            assembler::assemble_with_retry(self.db.clone(), self.store.clone(), id, file_id)
                .await?;
            return Ok(FinalizeResponse {
                upload_session_id: id,
                file_id: Some(file_id),
                status: UploadStatus::Completed,
            });
        }

        let db = self.db.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = assembler::assemble_with_retry(db, store, id, file_id).await {
                warn!(session = %id, file = %file_id, "reassembly failed: {err}");
            }
        });

        Ok(FinalizeResponse {
            upload_session_id: id,
            file_id: None,
            status: UploadStatus::Finalizing,
        })
    }

    pub async fn file_for_session(&self, session_id: Uuid) -> ShareResult<Option<StoredFile>> {
        Ok(sqlx::query_as::<_, StoredFile>(
            "SELECT id, session_id, owner_id, filename, size_bytes, mime_type, sha256,
                    storage_path, status, is_deleted, created_at, completed_at
             FROM stored_files WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn fetch_file(&self, file_id: Uuid) -> ShareResult<StoredFile> {
        sqlx::query_as::<_, StoredFile>(
            "SELECT id, session_id, owner_id, filename, size_bytes, mime_type, sha256,
                    storage_path, status, is_deleted, created_at, completed_at
             FROM stored_files WHERE id = ? AND is_deleted = 0",
        )
        .bind(file_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(ShareError::FileNotFound(file_id))
    }

    /// Soft-delete a file: the id and audit history stay, the payload
    /// and its links go away, the owner's quota is credited back.
    pub async fn delete_file(&self, file_id: Uuid, owner: Option<&Owner>) -> ShareResult<()> {
        let file = self.fetch_file(file_id).await?;
        if let Some(owner_id) = file.owner_id {
            if owner.map(|o| o.id) != Some(owner_id) {
                return Err(ShareError::Unauthorized);
            }
        }

        sqlx::query("UPDATE stored_files SET is_deleted = 1 WHERE id = ?")
            .bind(file_id)
            .execute(&*self.db)
            .await?;
        sqlx::query("UPDATE download_links SET is_deleted = 1 WHERE file_id = ?")
            .bind(file_id)
            .execute(&*self.db)
            .await?;
        if file.status == FileStatus::Ready {
            if let Some(owner_id) = file.owner_id {
                sqlx::query("UPDATE owners SET used_bytes = used_bytes - ? WHERE id = ?")
                    .bind(file.size_bytes)
                    .bind(owner_id)
                    .execute(&*self.db)
                    .await?;
            }
        }

        self.store.remove_file_payload(file_id).await;
        if let Some(session_id) = file.session_id {
            let _ = self.store.cleanup_session(session_id).await;
        }
        info!(file = %file_id, "soft-deleted file");
        Ok(())
    }

    /// One garbage-collection pass: flip overdue sessions to `expired`,
    /// then drop storage and rows for terminal failures past retention.
    pub async fn gc_tick(&self) -> ShareResult<()> {
        let now = Utc::now();
        let expired = sqlx::query(
            "UPDATE upload_sessions SET status = 'expired', updated_at = ?
             WHERE status IN ('init', 'uploading') AND expires_at < ?",
        )
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        if expired.rows_affected() > 0 {
            info!(count = expired.rows_affected(), "expired overdue sessions");
        }

        let cutoff = now - self.session_retention;
        let stale: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM upload_sessions
             WHERE status IN ('expired', 'failed') AND updated_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;

        for session_id in stale {
            if let Err(err) = self.store.cleanup_session(session_id).await {
                warn!(session = %session_id, "failed to clean staging dir: {err}");
                continue;
            }
            sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
                .bind(session_id)
                .execute(&*self.db)
                .await?;
            sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
                .bind(session_id)
                .execute(&*self.db)
                .await?;
            info!(session = %session_id, "garbage-collected session");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    pub async fn memory_pool() -> Arc<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for stmt in include_str!("../../migrations/0001_init.sql")
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        Arc::new(pool)
    }

    /// Service with sync finalize so tests observe terminal states
    /// without polling, plus the tempdir keeping storage alive.
    pub async fn service() -> (SessionService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = memory_pool().await;
        let store = ChunkStore::new(dir.path());
        let service = SessionService::new(db, store, 360, 1440, u64::MAX);
        (service, dir)
    }

    pub fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    pub fn create_request(data: &[u8], chunk_size: u64) -> CreateSessionRequest {
        CreateSessionRequest {
            filename: "report.bin".into(),
            size: data.len() as u64,
            mime_type: Some("application/octet-stream".into()),
            chunk_size,
            total_chunks: (data.len() as u64).div_ceil(chunk_size) as u32,
            file_sha256: sha256_hex(data),
        }
    }

    /// Upload every chunk of `data` in the given index order.
    pub async fn put_chunks(
        service: &SessionService,
        session: Uuid,
        data: &[u8],
        chunk_size: usize,
        order: &[usize],
    ) {
        for &idx in order {
            let start = idx * chunk_size;
            let end = (start + chunk_size).min(data.len());
            service
                .accept_chunk(
                    session,
                    idx as i64,
                    Some((end - start) as u64),
                    None,
                    Some(&format!("test:{idx}:1")),
                    &data[start..end],
                )
                .await
                .unwrap();
        }
    }
}
