//! Request/response DTOs shared by the HTTP handlers and the client
//! scheduler's transport.

use crate::models::{file::FileStatus, session::UploadStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateSessionRequest {
    pub filename: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub file_sha256: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateSessionResponse {
    pub upload_session_id: Uuid,
    /// Server may clamp the requested chunk size down to policy.
    pub accepted_chunk_size: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionStatusResponse {
    pub received: Vec<u32>,
    pub missing: Vec<u32>,
    pub status: UploadStatus,
}

/// Acknowledgement for a chunk put. `duplicate` marks an idempotent
/// replay of an already-accepted index.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChunkAck {
    pub received: u32,
    pub size: u64,
    pub duplicate: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FinalizeRequest {
    pub file_sha256: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FinalizeResponse {
    pub upload_session_id: Uuid,
    /// Populated once the session reaches `completed`.
    pub file_id: Option<Uuid>,
    pub status: UploadStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CreateLinkRequest {
    pub expires_at: Option<DateTime<Utc>>,
    pub expires_in_minutes: Option<i64>,
    #[serde(default)]
    pub no_expiry: bool,
    pub max_uses: Option<u32>,
    pub password: Option<String>,
    #[serde(default)]
    pub require_download_page: bool,
    #[serde(default)]
    pub create_short_link: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadLinkResponse {
    pub id: Uuid,
    /// Contains the plaintext token; returned exactly once at issue time
    /// and reconstructed (without token) for listings.
    pub url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub never_expires: bool,
    pub remaining_uses: Option<i64>,
    pub require_download_page: bool,
    pub has_password: bool,
    pub short_url: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileDetailResponse {
    pub id: Uuid,
    pub filename: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub sha256: String,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
    pub links: Vec<DownloadLinkResponse>,
}

/// Metadata headers accompanying a raw chunk PUT.
pub const CHUNK_SIZE_HEADER: &str = "x-chunk-size";
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
