//! Download links, issuance policy, and the append-only audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A policy-bearing download link for one stored file.
///
/// The plaintext token is never persisted; `token_sha256` is the only
/// handle the database keeps, so a leaked table cannot be replayed.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DownloadLink {
    pub id: Uuid,
    pub file_id: Uuid,

    /// One-way hash of the issued token.
    pub token_sha256: String,

    /// Absent when the link never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub never_expires: bool,

    /// Remaining successful resolutions. NULL means unlimited; never
    /// goes negative, and a zero link is permanently unusable.
    pub remaining_uses: Option<i64>,

    /// argon2 PHC string, present when the link is password protected.
    pub password_hash: Option<String>,

    /// Whether the client must show an interstitial page before transfer.
    pub require_download_page: bool,

    /// Optional short alias (`/s/{code}`). Unique for the table's whole
    /// lifetime: soft-deleted rows keep their code so it is never reused.
    pub short_code: Option<String>,

    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Issuance policy, consumed uniformly by the resolver.
#[derive(Clone, Debug, Default)]
pub struct LinkPolicy {
    /// Explicit deadline; ignored when `never_expires` is set.
    pub expires_at: Option<DateTime<Utc>>,
    pub never_expires: bool,

    /// `Some(1)` makes a one-time link; `None` is unlimited.
    pub max_uses: Option<u32>,

    pub password: Option<String>,
    pub require_download_page: bool,
    pub short_alias: bool,
}

/// One access attempt against a link. Append-only, never mutated.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DownloadAuditEntry {
    pub id: i64,
    pub link_id: Uuid,
    pub remote_addr: Option<String>,
    pub outcome: String,
    pub succeeded: bool,
    pub created_at: DateTime<Utc>,
}
