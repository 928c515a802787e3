//! src/services/assembler.rs
//!
//! Reassembly worker: streams staged chunks in index order into one
//! file, verifies the whole-file hash, and atomically promotes the
//! result. The rename into the permanent path is the single commit
//! point; a crash before it leaves only a discardable temp file.
//!
//! Reassembly for different sessions shares nothing mutable and runs
//! fully in parallel.

use crate::{
    errors::{ShareError, ShareResult},
    models::session::{UploadSession, UploadStatus},
    services::chunk_store::ChunkStore,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{info, warn};
use uuid::Uuid;

const COPY_BUF_SIZE: usize = 1024 * 1024;
const MAX_IO_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Assemble a finalizing session, retrying transient I/O failures with
/// exponential backoff. Hash mismatches are terminal and never retried;
/// exhausting I/O retries also fails the session.
pub async fn assemble_with_retry(
    db: Arc<SqlitePool>,
    store: ChunkStore,
    session_id: Uuid,
    file_id: Uuid,
) -> ShareResult<i64> {
    let mut attempt = 0;
    loop {
        match assemble(&db, &store, session_id, file_id).await {
            Ok(size) => return Ok(size),
            Err(err @ (ShareError::Io(_) | ShareError::Sqlx(_))) if attempt + 1 < MAX_IO_ATTEMPTS => {
                attempt += 1;
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    session = %session_id,
                    attempt,
                    "transient reassembly failure, retrying in {delay:?}: {err}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                mark_failed(&db, session_id).await;
                return Err(err);
            }
        }
    }
}

async fn assemble(
    db: &SqlitePool,
    store: &ChunkStore,
    session_id: Uuid,
    file_id: Uuid,
) -> ShareResult<i64> {
    let session = sqlx::query_as::<_, UploadSession>(
        "SELECT id, owner_id, filename, size_bytes, mime_type, chunk_size,
                total_chunks, file_sha256, status, received_count,
                created_at, updated_at, expires_at, finalized_at
         FROM upload_sessions WHERE id = ?",
    )
    .bind(session_id)
    .fetch_optional(db)
    .await?
    .ok_or(ShareError::SessionNotFound(session_id))?;

    if session.status != UploadStatus::Finalizing {
        return Err(ShareError::StateConflict(format!(
            "session is {:?}, expected finalizing",
            session.status
        )));
    }

    let final_path = store.final_file_path(file_id);
    let parent = final_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ShareError::Io(std::io::Error::other("final path missing parent")))?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".assemble-{}", Uuid::new_v4()));

    let result = copy_chunks(store, &session, &tmp_path).await;
    let (size, sha256) = match result {
        Ok(pair) => pair,
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
    };

    if !sha256.eq_ignore_ascii_case(&session.file_sha256) {
        // Staged chunks stay for diagnostics until the GC retention
        // window; the partial assembly itself is discarded.
        let _ = fs::remove_file(&tmp_path).await;
        mark_failed(db, session_id).await;
        return Err(ShareError::ChecksumMismatch(format!(
            "assembled file hashed {}, session declared {}",
            sha256, session.file_sha256
        )));
    }

    // Commit point: after this rename the file is fully valid.
    if let Err(err) = fs::rename(&tmp_path, &final_path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(ShareError::Io(err));
    }

    let now = Utc::now();
    // File records exist only for verified payloads. OR REPLACE keeps a
    // retried attempt after a post-rename fault landing on the same id.
    sqlx::query(
        "INSERT OR REPLACE INTO stored_files (
             id, session_id, owner_id, filename, size_bytes, mime_type,
             sha256, storage_path, status, is_deleted, created_at, completed_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'ready', 0, ?, ?)",
    )
    .bind(file_id)
    .bind(session.id)
    .bind(session.owner_id)
    .bind(&session.filename)
    .bind(size)
    .bind(&session.mime_type)
    .bind(&session.file_sha256)
    .bind(final_path.to_string_lossy().into_owned())
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    sqlx::query(
        "UPDATE upload_sessions SET status = 'completed', finalized_at = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(session_id)
    .execute(db)
    .await?;
    if let Some(owner_id) = session.owner_id {
        sqlx::query("UPDATE owners SET used_bytes = used_bytes + ? WHERE id = ?")
            .bind(size)
            .bind(owner_id)
            .execute(db)
            .await?;
    }

    if let Err(err) = store.cleanup_session(session_id).await {
        warn!(session = %session_id, "staging cleanup failed: {err}");
    }
    info!(session = %session_id, file = %file_id, size, "reassembly complete");
    Ok(size)
}

/// Stream every chunk in ascending index order into `tmp_path` with a
/// bounded buffer, hashing as we copy. Returns (byte count, hex hash)
/// after flush + fsync.
async fn copy_chunks(
    store: &ChunkStore,
    session: &UploadSession,
    tmp_path: &Path,
) -> ShareResult<(i64, String)> {
    let mut out = File::create(tmp_path).await?;
    let mut hasher = Sha256::new();
    let mut total: i64 = 0;
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    for idx in 0..session.total_chunks as u32 {
        let mut chunk = store.open_chunk(session.id, idx).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ShareError::StateConflict(format!("staged chunk {idx} is missing"))
            } else {
                ShareError::Io(err)
            }
        })?;
        loop {
            let n = chunk.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            total += n as i64;
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok((total, format!("{:x}", hasher.finalize())))
}

async fn mark_failed(db: &SqlitePool, session_id: Uuid) {
    if let Err(err) = sqlx::query(
        "UPDATE upload_sessions SET status = 'failed', updated_at = ?
         WHERE id = ? AND status = 'finalizing'",
    )
    .bind(Utc::now())
    .bind(session_id)
    .execute(db)
    .await
    {
        warn!(session = %session_id, "could not mark session failed: {err}");
    }
}
