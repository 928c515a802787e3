//! src/services/link_service.rs
//!
//! LinkService — issues signed download tokens and validates incoming
//! ones against the stored policy.
//!
//! The plaintext token is returned exactly once at issue time; only its
//! SHA-256 is persisted, so a leaked database cannot forge or replay a
//! link. For limited-use links the check-and-decrement is a single
//! conditional UPDATE, which keeps two near-simultaneous requests from
//! both passing a count of 1.

use crate::{
    errors::{ShareError, ShareResult, is_unique_violation},
    models::{
        file::StoredFile,
        link::{DownloadLink, LinkPolicy},
    },
};
use argon2::{
    Argon2, PasswordHasher, PasswordVerifier,
    password_hash::{PasswordHash, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// JWT exp claim used for links that never expire. Far enough out to be
/// effectively permanent while staying a valid unix timestamp.
const NEVER_EXPIRES_DAYS: i64 = 365 * 100;

const SHORT_CODE_LEN: usize = 8;
const SHORT_CODE_ATTEMPTS: u32 = 8;

/// Claims bound into every download token. The signature makes the
/// file id, validity window, and use marker tamper-proof.
#[derive(Serialize, Deserialize, Debug)]
struct DownloadClaims {
    /// Link id; resolves the policy row.
    tid: Uuid,
    /// File id the token authorizes.
    fid: Uuid,
    one_time: bool,
    iat: i64,
    nbf: i64,
    exp: i64,
}

/// Issue-time result: the link row plus the plaintext token, which is
/// never stored and never reproducible.
#[derive(Debug)]
pub struct IssuedLink {
    pub link: DownloadLink,
    pub token: String,
}

/// A successful resolution: authorization to transfer, not the bytes.
#[derive(Debug)]
pub struct ResolvedDownload {
    pub file: StoredFile,
    pub link: DownloadLink,
    /// The client must show a confirmation page before transferring.
    pub interstitial_required: bool,
}

#[derive(Clone)]
pub struct LinkService {
    pub db: Arc<SqlitePool>,
    secret: String,
}

impl LinkService {
    pub fn new(db: Arc<SqlitePool>, secret: impl Into<String>) -> Self {
        Self {
            db,
            secret: secret.into(),
        }
    }

    /// Issue a new download link for a ready file.
    pub async fn create_link(
        &self,
        file: &StoredFile,
        policy: &LinkPolicy,
    ) -> ShareResult<IssuedLink> {
        if !file.is_downloadable() {
            return Err(ShareError::StateConflict("file is not ready".into()));
        }

        let now = Utc::now();
        let (expires_at, token_exp) = if policy.never_expires {
            (None, now + Duration::days(NEVER_EXPIRES_DAYS))
        } else {
            let deadline = policy.expires_at.unwrap_or(now + Duration::minutes(60));
            if deadline <= now {
                return Err(ShareError::Validation(
                    "expiration must be in the future".into(),
                ));
            }
            (Some(deadline), deadline)
        };

        let remaining_uses = match policy.max_uses {
            Some(0) => {
                return Err(ShareError::Validation("max_uses must be at least 1".into()));
            }
            Some(n) => Some(i64::from(n)),
            None => None,
        };

        let password_hash = match &policy.password {
            Some(password) => Some(hash_password(password)?),
            None => None,
        };

        let link_id = Uuid::new_v4();
        let token = self.sign_token(link_id, file.id, now, token_exp, policy.max_uses == Some(1))?;
        let token_sha256 = format!("{:x}", Sha256::digest(token.as_bytes()));

        let mut attempt = 0;
        let link = loop {
            let short_code = policy.short_alias.then(generate_short_code);
            let link = DownloadLink {
                id: link_id,
                file_id: file.id,
                token_sha256: token_sha256.clone(),
                expires_at,
                never_expires: policy.never_expires,
                remaining_uses,
                password_hash: password_hash.clone(),
                require_download_page: policy.require_download_page,
                short_code,
                is_deleted: false,
                created_at: now,
            };
            match self.insert_link(&link).await {
                Ok(()) => break link,
                // Alias collision: roll a new code and try again.
                Err(ShareError::Sqlx(err))
                    if is_unique_violation(&err)
                        && policy.short_alias
                        && attempt + 1 < SHORT_CODE_ATTEMPTS =>
                {
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        info!(link = %link.id, file = %file.id, "issued download link");
        Ok(IssuedLink { link, token })
    }

    async fn insert_link(&self, link: &DownloadLink) -> ShareResult<()> {
        sqlx::query(
            "INSERT INTO download_links (
                 id, file_id, token_sha256, expires_at, never_expires, remaining_uses,
                 password_hash, require_download_page, short_code, is_deleted, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(link.id)
        .bind(link.file_id)
        .bind(&link.token_sha256)
        .bind(link.expires_at)
        .bind(link.never_expires)
        .bind(link.remaining_uses)
        .bind(&link.password_hash)
        .bind(link.require_download_page)
        .bind(&link.short_code)
        .bind(link.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    fn sign_token(
        &self,
        link_id: Uuid,
        file_id: Uuid,
        now: DateTime<Utc>,
        exp: DateTime<Utc>,
        one_time: bool,
    ) -> ShareResult<String> {
        let claims = DownloadClaims {
            tid: link_id,
            fid: file_id,
            one_time,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: exp.timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|_| ShareError::TokenInvalid)
    }

    /// Validate a token and, for limited-use links, consume one use.
    /// Every attempt leaves an audit entry.
    pub async fn resolve(
        &self,
        token: &str,
        password: Option<&str>,
        remote_addr: Option<&str>,
    ) -> ShareResult<ResolvedDownload> {
        let token_sha256 = format!("{:x}", Sha256::digest(token.as_bytes()));
        let link = self.fetch_link_by_hash(&token_sha256).await?;
        let link_id = link.as_ref().map(|l| l.id);

        match self.check_and_consume(token, link, password).await {
            Ok(resolved) => {
                self.audit(resolved.link.id, remote_addr, "ok", true).await;
                Ok(resolved)
            }
            Err(err) => {
                if let Some(link_id) = link_id {
                    self.audit(link_id, remote_addr, err.kind(), false).await;
                }
                Err(err)
            }
        }
    }

    /// Resolve a short alias instead of a signed token. The alias is an
    /// alternate identifier for the same link row and runs through the
    /// same policy checks and audit trail.
    pub async fn resolve_short_code(
        &self,
        code: &str,
        password: Option<&str>,
        remote_addr: Option<&str>,
    ) -> ShareResult<ResolvedDownload> {
        let link = self.fetch_link_by_short_code(code).await?;
        let link_id = link.id;
        let file_id = link.file_id;

        match self.authorize_link(link, file_id, password).await {
            Ok(resolved) => {
                self.audit(link_id, remote_addr, "ok", true).await;
                Ok(resolved)
            }
            Err(err) => {
                self.audit(link_id, remote_addr, err.kind(), false).await;
                Err(err)
            }
        }
    }

    /// Look up the link a token refers to without validating or
    /// consuming anything. Lets handlers surface the confirmation page
    /// before a use is spent.
    pub async fn peek(&self, token: &str) -> ShareResult<Option<DownloadLink>> {
        let token_sha256 = format!("{:x}", Sha256::digest(token.as_bytes()));
        self.fetch_link_by_hash(&token_sha256).await
    }

    async fn check_and_consume(
        &self,
        token: &str,
        link: Option<DownloadLink>,
        password: Option<&str>,
    ) -> ShareResult<ResolvedDownload> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        validation.validate_nbf = true;
        let decoded = decode::<DownloadClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|err| match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => ShareError::TokenExpired,
            _ => ShareError::TokenInvalid,
        })?;

        let link = link.ok_or(ShareError::LinkNotFound)?;
        if link.is_deleted || decoded.claims.tid != link.id {
            return Err(ShareError::LinkNotFound);
        }

        self.authorize_link(link, decoded.claims.fid, password).await
    }

    /// Shared policy tail for both token and alias resolution: row
    /// expiry, password, and the use-count decrement.
    async fn authorize_link(
        &self,
        link: DownloadLink,
        file_id: Uuid,
        password: Option<&str>,
    ) -> ShareResult<ResolvedDownload> {
        let now = Utc::now();
        if !link.never_expires {
            match link.expires_at {
                Some(deadline) if now <= deadline => {}
                _ => return Err(ShareError::TokenExpired),
            }
        }

        if let Some(stored_hash) = &link.password_hash {
            let Some(password) = password else {
                return Err(ShareError::PasswordRequired);
            };
            if !verify_password(password, stored_hash) {
                return Err(ShareError::PasswordIncorrect);
            }
        }

        // The atomic check-and-decrement: only one of N concurrent
        // requests can take the last remaining use.
        if link.remaining_uses.is_some() {
            let consumed = sqlx::query(
                "UPDATE download_links SET remaining_uses = remaining_uses - 1
                 WHERE id = ? AND remaining_uses > 0",
            )
            .bind(link.id)
            .execute(&*self.db)
            .await?;
            if consumed.rows_affected() == 0 {
                return Err(ShareError::TokenExhausted);
            }
        }

        let file = self.fetch_link_file(file_id).await?;
        let interstitial_required = link.require_download_page;
        let link = self.fetch_link(link.id).await?;
        Ok(ResolvedDownload {
            file,
            link,
            interstitial_required,
        })
    }

    async fn fetch_link_file(&self, file_id: Uuid) -> ShareResult<StoredFile> {
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

    async fn fetch_link_by_hash(&self, token_sha256: &str) -> ShareResult<Option<DownloadLink>> {
        Ok(sqlx::query_as::<_, DownloadLink>(
            "SELECT id, file_id, token_sha256, expires_at, never_expires, remaining_uses,
                    password_hash, require_download_page, short_code, is_deleted, created_at
             FROM download_links WHERE token_sha256 = ?",
        )
        .bind(token_sha256)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn fetch_link(&self, link_id: Uuid) -> ShareResult<DownloadLink> {
        sqlx::query_as::<_, DownloadLink>(
            "SELECT id, file_id, token_sha256, expires_at, never_expires, remaining_uses,
                    password_hash, require_download_page, short_code, is_deleted, created_at
             FROM download_links WHERE id = ?",
        )
        .bind(link_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(ShareError::LinkNotFound)
    }

    /// Look up an active link by its short alias.
    pub async fn fetch_link_by_short_code(&self, code: &str) -> ShareResult<DownloadLink> {
        sqlx::query_as::<_, DownloadLink>(
            "SELECT id, file_id, token_sha256, expires_at, never_expires, remaining_uses,
                    password_hash, require_download_page, short_code, is_deleted, created_at
             FROM download_links WHERE short_code = ? AND is_deleted = 0",
        )
        .bind(code)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(ShareError::LinkNotFound)
    }

    pub async fn list_links(&self, file_id: Uuid) -> ShareResult<Vec<DownloadLink>> {
        Ok(sqlx::query_as::<_, DownloadLink>(
            "SELECT id, file_id, token_sha256, expires_at, never_expires, remaining_uses,
                    password_hash, require_download_page, short_code, is_deleted, created_at
             FROM download_links WHERE file_id = ? AND is_deleted = 0
             ORDER BY created_at DESC",
        )
        .bind(file_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Soft-delete a link. The row (and its alias) stays so audit
    /// history survives and the alias is never reissued.
    pub async fn delete_link(&self, file_id: Uuid, link_id: Uuid) -> ShareResult<()> {
        let result = sqlx::query(
            "UPDATE download_links SET is_deleted = 1 WHERE id = ? AND file_id = ? AND is_deleted = 0",
        )
        .bind(link_id)
        .bind(file_id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ShareError::LinkNotFound);
        }
        Ok(())
    }

    async fn audit(&self, link_id: Uuid, remote_addr: Option<&str>, outcome: &str, succeeded: bool) {
        if let Err(err) = sqlx::query(
            "INSERT INTO download_audit (link_id, remote_addr, outcome, succeeded, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(link_id)
        .bind(remote_addr)
        .bind(outcome)
        .bind(succeeded)
        .bind(Utc::now())
        .execute(&*self.db)
        .await
        {
            tracing::warn!(link = %link_id, "failed to write audit entry: {err}");
        }
    }
}

fn hash_password(password: &str) -> ShareResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| ShareError::Validation("could not hash password".into()))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn generate_short_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SHORT_CODE_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::file::FileStatus;
    use crate::services::session_service::test_support::memory_pool;

    async fn ready_file(db: &SqlitePool) -> StoredFile {
        let file = StoredFile {
            id: Uuid::new_v4(),
            session_id: None,
            owner_id: None,
            filename: "notes.txt".into(),
            size_bytes: 5,
            mime_type: Some("text/plain".into()),
            sha256: format!("{:x}", Sha256::digest(b"hello")),
            storage_path: "/tmp/unused".into(),
            status: FileStatus::Ready,
            is_deleted: false,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        sqlx::query(
            "INSERT INTO stored_files (
                 id, session_id, owner_id, filename, size_bytes, mime_type,
                 sha256, storage_path, status, is_deleted, created_at, completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(file.id)
        .bind(file.session_id)
        .bind(file.owner_id)
        .bind(&file.filename)
        .bind(file.size_bytes)
        .bind(&file.mime_type)
        .bind(&file.sha256)
        .bind(&file.storage_path)
        .bind(file.status)
        .bind(file.created_at)
        .bind(file.completed_at)
        .execute(db)
        .await
        .unwrap();
        file
    }

    async fn setup() -> (LinkService, StoredFile) {
        let db = memory_pool().await;
        let file = ready_file(&db).await;
        (LinkService::new(db, "test-secret"), file)
    }

    #[tokio::test]
    async fn issue_and_resolve_roundtrip() {
        let (service, file) = setup().await;
        let issued = service
            .create_link(&file, &LinkPolicy::default())
            .await
            .unwrap();
        assert!(issued.link.password_hash.is_none());

        // plaintext token never lands in the database
        let stored: String =
            sqlx::query_scalar("SELECT token_sha256 FROM download_links WHERE id = ?")
                .bind(issued.link.id)
                .fetch_one(&*service.db)
                .await
                .unwrap();
        assert_ne!(stored, issued.token);

        let resolved = service.resolve(&issued.token, None, Some("10.0.0.1")).await.unwrap();
        assert_eq!(resolved.file.id, file.id);
        assert!(!resolved.interstitial_required);
    }

    #[tokio::test]
    async fn tampered_and_unknown_tokens_rejected() {
        let (service, file) = setup().await;
        let issued = service
            .create_link(&file, &LinkPolicy::default())
            .await
            .unwrap();

        let mut tampered = issued.token.clone();
        tampered.pop();
        let err = service.resolve(&tampered, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "token-invalid");

        // validly signed by another instance: unknown here
        let other = LinkService::new(service.db.clone(), "other-secret");
        let err = other.resolve(&issued.token, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "token-invalid");
    }

    #[tokio::test]
    async fn expired_link_is_rejected_and_audited() {
        let (service, file) = setup().await;
        let policy = LinkPolicy {
            expires_at: Some(Utc::now() + Duration::milliseconds(50)),
            ..Default::default()
        };
        let issued = service.create_link(&file, &policy).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let err = service.resolve(&issued.token, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "token-expired");

        let outcomes: Vec<(String, bool)> = sqlx::query_as(
            "SELECT outcome, succeeded FROM download_audit WHERE link_id = ?",
        )
        .bind(issued.link.id)
        .fetch_all(&*service.db)
        .await
        .unwrap();
        assert_eq!(outcomes, vec![("token-expired".to_string(), false)]);
    }

    #[tokio::test]
    async fn password_checks() {
        let (service, file) = setup().await;
        let policy = LinkPolicy {
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let issued = service.create_link(&file, &policy).await.unwrap();

        let err = service.resolve(&issued.token, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "password-required");
        let err = service
            .resolve(&issued.token, Some("wrong"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "password-incorrect");
        service
            .resolve(&issued.token, Some("hunter2"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn one_time_link_single_sequential_use() {
        let (service, file) = setup().await;
        let policy = LinkPolicy {
            max_uses: Some(1),
            ..Default::default()
        };
        let issued = service.create_link(&file, &policy).await.unwrap();

        let resolved = service.resolve(&issued.token, None, None).await.unwrap();
        assert_eq!(resolved.link.remaining_uses, Some(0));
        let err = service.resolve(&issued.token, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "token-exhausted");

        let audits: Vec<(String, bool)> = sqlx::query_as(
            "SELECT outcome, succeeded FROM download_audit WHERE link_id = ? ORDER BY id",
        )
        .bind(issued.link.id)
        .fetch_all(&*service.db)
        .await
        .unwrap();
        assert_eq!(
            audits,
            vec![
                ("ok".to_string(), true),
                ("token-exhausted".to_string(), false)
            ]
        );
    }

    #[tokio::test]
    async fn one_time_link_concurrent_race_has_one_winner() {
        let (service, file) = setup().await;
        let policy = LinkPolicy {
            max_uses: Some(1),
            ..Default::default()
        };
        let issued = service.create_link(&file, &policy).await.unwrap();

        let a = {
            let service = service.clone();
            let token = issued.token.clone();
            tokio::spawn(async move { service.resolve(&token, None, None).await })
        };
        let b = {
            let service = service.clone();
            let token = issued.token.clone();
            tokio::spawn(async move { service.resolve(&token, None, None).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(ShareError::TokenExhausted)))
            .count();
        assert_eq!(exhausted, 1);

        let remaining: i64 =
            sqlx::query_scalar("SELECT remaining_uses FROM download_links WHERE id = ?")
                .bind(issued.link.id)
                .fetch_one(&*service.db)
                .await
                .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn deleted_link_is_permanently_unusable() {
        let (service, file) = setup().await;
        let issued = service
            .create_link(&file, &LinkPolicy::default())
            .await
            .unwrap();
        service.delete_link(file.id, issued.link.id).await.unwrap();

        let err = service.resolve(&issued.token, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "link-not-found");
        // deleting twice reports not-found, audit rows survive
        let err = service.delete_link(file.id, issued.link.id).await.unwrap_err();
        assert_eq!(err.kind(), "link-not-found");
    }

    #[tokio::test]
    async fn short_alias_resolves_and_never_expires_flag() {
        let (service, file) = setup().await;
        let policy = LinkPolicy {
            never_expires: true,
            short_alias: true,
            ..Default::default()
        };
        let issued = service.create_link(&file, &policy).await.unwrap();
        let code = issued.link.short_code.clone().unwrap();
        assert_eq!(code.len(), SHORT_CODE_LEN);
        assert!(issued.link.expires_at.is_none());

        let by_code = service.fetch_link_by_short_code(&code).await.unwrap();
        assert_eq!(by_code.id, issued.link.id);

        service.resolve(&issued.token, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn short_alias_consumes_uses_like_the_token() {
        let (service, file) = setup().await;
        let policy = LinkPolicy {
            max_uses: Some(1),
            short_alias: true,
            ..Default::default()
        };
        let issued = service.create_link(&file, &policy).await.unwrap();
        let code = issued.link.short_code.clone().unwrap();

        let resolved = service.resolve_short_code(&code, None, None).await.unwrap();
        assert_eq!(resolved.file.id, file.id);
        // alias and token draw down the same use count
        let err = service.resolve(&issued.token, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "token-exhausted");
    }

    #[tokio::test]
    async fn link_for_pending_file_rejected() {
        let (service, mut file) = setup().await;
        file.status = FileStatus::Pending;
        let err = service
            .create_link(&file, &LinkPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session-state-conflict");
    }
}
