//! Upload session and chunk records, plus the received-chunk bitmap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of an upload session.
///
/// `Init`, `Uploading` and `Finalizing` are the only states that accept
/// protocol calls; `Completed`, `Expired` and `Failed` are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Init,
    Uploading,
    Finalizing,
    Completed,
    Expired,
    Failed,
}

/// A server-side record tracking one file's in-progress chunked upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Session UUID handed to the client at create time.
    pub id: Uuid,

    /// Owning account, if the session was created with a credential.
    pub owner_id: Option<Uuid>,

    /// Original filename as declared by the client.
    pub filename: String,

    /// Declared total size of the file in bytes.
    pub size_bytes: i64,

    /// Content type (MIME type) declared by the client.
    pub mime_type: Option<String>,

    /// Accepted chunk size; every chunk except the last must be this long.
    pub chunk_size: i64,

    /// `ceil(size_bytes / chunk_size)`, fixed at create time.
    pub total_chunks: i64,

    /// Client-declared SHA-256 of the whole file, verified at reassembly.
    pub file_sha256: String,

    pub status: UploadStatus,

    /// How many distinct chunk indices have been accepted so far.
    pub received_count: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Deadline after which the session rejects all further calls.
    pub expires_at: DateTime<Utc>,

    pub finalized_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// True while the session still accepts chunk puts.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self.status, UploadStatus::Init | UploadStatus::Uploading)
    }

    /// True when the expiry deadline has passed for a non-terminal session.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.accepts_chunks() && now > self.expires_at
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks
    }
}

/// One accepted chunk, keyed by `(session_id, idx)`.
///
/// A record is created at most once per index; retransmissions of the
/// same bytes are acknowledged without touching it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkRecord {
    pub session_id: Uuid,
    pub idx: i64,
    pub size_bytes: i64,
    pub sha256: String,
    pub idempotency_key: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Fixed-size bit array tracking which chunk indices have been received.
///
/// Holds exactly `total` bits. Membership tests and updates are O(1);
/// completeness is a byte scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkBitmap {
    bits: Vec<u8>,
    total: u32,
}

impl ChunkBitmap {
    pub fn new(total: u32) -> Self {
        Self {
            bits: vec![0u8; total.div_ceil(8) as usize],
            total,
        }
    }

    /// Build a bitmap from a list of received indices. Out-of-range
    /// indices are ignored; the session layer rejects them upstream.
    pub fn from_indices<I: IntoIterator<Item = u32>>(total: u32, indices: I) -> Self {
        let mut bitmap = Self::new(total);
        for idx in indices {
            bitmap.set(idx);
        }
        bitmap
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Mark `idx` received. Returns false when the bit was already set
    /// or the index is out of range.
    pub fn set(&mut self, idx: u32) -> bool {
        if idx >= self.total || self.contains(idx) {
            return false;
        }
        self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        true
    }

    pub fn contains(&self, idx: u32) -> bool {
        if idx >= self.total {
            return false;
        }
        self.bits[(idx / 8) as usize] & (1 << (idx % 8)) != 0
    }

    pub fn received_count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total
    }

    pub fn received(&self) -> Vec<u32> {
        (0..self.total).filter(|&i| self.contains(i)).collect()
    }

    pub fn missing(&self) -> Vec<u32> {
        (0..self.total).filter(|&i| !self.contains(i)).collect()
    }
}

/// `ceil(size / chunk_size)` for positive inputs.
pub fn expected_total_chunks(size: i64, chunk_size: i64) -> i64 {
    (size as u64).div_ceil(chunk_size as u64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_has_exactly_total_bits() {
        let bitmap = ChunkBitmap::new(9);
        assert_eq!(bitmap.total(), 9);
        assert_eq!(bitmap.missing().len(), 9);
        assert!(!bitmap.contains(9));
    }

    #[test]
    fn bitmap_set_is_idempotent_and_bounded() {
        let mut bitmap = ChunkBitmap::new(4);
        assert!(bitmap.set(2));
        assert!(!bitmap.set(2));
        assert!(!bitmap.set(4));
        assert_eq!(bitmap.received(), vec![2]);
        assert_eq!(bitmap.missing(), vec![0, 1, 3]);
        assert_eq!(bitmap.received_count(), 1);
    }

    #[test]
    fn bitmap_completeness() {
        let mut bitmap = ChunkBitmap::new(3);
        for idx in [1, 0, 2] {
            bitmap.set(idx);
        }
        assert!(bitmap.is_complete());
        assert!(bitmap.missing().is_empty());
    }

    #[test]
    fn from_indices_matches_manual_sets() {
        let bitmap = ChunkBitmap::from_indices(10, [0, 3, 9]);
        assert_eq!(bitmap.received(), vec![0, 3, 9]);
        assert_eq!(bitmap.received_count(), 3);
    }

    #[test]
    fn total_chunks_is_ceiling_division() {
        assert_eq!(expected_total_chunks(25 << 20, 8 << 20), 4);
        assert_eq!(expected_total_chunks(16, 8), 2);
        assert_eq!(expected_total_chunks(17, 8), 3);
        assert_eq!(expected_total_chunks(1, 8), 1);
        // stays exact at the top of the range
        assert_eq!(expected_total_chunks(i64::MAX, 1), i64::MAX);
        assert_eq!(expected_total_chunks(i64::MAX, i64::MAX), 1);
    }
}
