//! Stored file record created at finalize time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Row exists, reassembly not yet finished.
    Pending,
    /// Payload durably written and hash-verified.
    Ready,
    /// Reassembly failed; the row remains for diagnostics.
    Error,
}

/// A fully assembled file. Created exactly once per upload session; the
/// id is permanent even after a soft delete.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredFile {
    pub id: Uuid,

    /// Session the file was assembled from, until that session is GC'd.
    pub session_id: Option<Uuid>,

    pub owner_id: Option<Uuid>,
    pub filename: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,

    /// Verified SHA-256 of the assembled payload.
    pub sha256: String,

    /// Absolute payload path. Populated only after the atomic promote.
    pub storage_path: String,

    pub status: FileStatus,

    /// Soft-delete marker; audit history outlives the payload.
    pub is_deleted: bool,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StoredFile {
    /// A file can only be shared once it is ready and not deleted.
    pub fn is_downloadable(&self) -> bool {
        self.status == FileStatus::Ready && !self.is_deleted
    }
}
