//! src/services/chunk_store.rs
//!
//! Durable staging area for uploaded chunks and the final file layout.
//!
//! Layout on disk:
//! - staging: `base_path/uploads/tmp/{session_id}/chunk_{idx:08}.part`
//! - final:   `base_path/files/{file_id}/data`
//!
//! Chunk writes land in a temp name first and are renamed into place, so
//! a crashed or raced write never leaves a partially visible part. The
//! database unique key on `(session_id, idx)` is the arbiter for
//! "written exactly once"; the store itself only guarantees atomic
//! visibility.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct ChunkStore {
    base_path: PathBuf,
}

impl ChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.base_path
            .join("uploads")
            .join("tmp")
            .join(session_id.to_string())
    }

    pub fn chunk_path(&self, session_id: Uuid, idx: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("chunk_{:08}.part", idx))
    }

    pub fn file_dir(&self, file_id: Uuid) -> PathBuf {
        self.base_path.join("files").join(file_id.to_string())
    }

    /// Permanent location of an assembled file's payload.
    pub fn final_file_path(&self, file_id: Uuid) -> PathBuf {
        self.file_dir(file_id).join("data")
    }

    /// Persist one chunk. Writes to a temp name, fsyncs, then renames
    /// into the canonical part path. The session layer claims the
    /// `(session_id, idx)` row before calling this, so at most one
    /// accepted submission ever writes a given part; renaming over a
    /// leftover from a failed earlier attempt is harmless.
    pub async fn write_chunk(&self, session_id: Uuid, idx: u32, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.chunk_path(session_id, idx);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("chunk path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = write_and_sync(&mut file, data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        Ok(path)
    }

    /// Open one staged chunk for reading during reassembly.
    pub async fn open_chunk(&self, session_id: Uuid, idx: u32) -> io::Result<File> {
        File::open(self.chunk_path(session_id, idx)).await
    }

    /// Remove the whole staging directory for a session. Missing
    /// directories are fine; sessions may be cleaned twice.
    pub async fn cleanup_session(&self, session_id: Uuid) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Remove a soft-deleted file's payload directory, best effort.
    pub async fn remove_file_payload(&self, file_id: Uuid) {
        let dir = self.file_dir(file_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("removed payload directory {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!("failed to remove {}: {}", dir.display(), err),
        }
    }
}

async fn write_and_sync(file: &mut File, data: &[u8]) -> io::Result<()> {
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn chunk_roundtrip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let session = Uuid::new_v4();

        let path = store.write_chunk(session, 3, b"abc").await.unwrap();
        assert!(path.ends_with("chunk_00000003.part"));

        let mut buf = Vec::new();
        store
            .open_chunk(session, 3)
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"abc");

        store.cleanup_session(session).await.unwrap();
        assert!(!store.session_dir(session).exists());
        // second cleanup is a no-op
        store.cleanup_session(session).await.unwrap();
    }

    #[tokio::test]
    async fn rewrite_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let session = Uuid::new_v4();

        store.write_chunk(session, 0, b"same").await.unwrap();
        store.write_chunk(session, 0, b"same").await.unwrap();

        let mut buf = Vec::new();
        store
            .open_chunk(session, 0)
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"same");
    }
}
