//! Public download endpoints.
//!
//! Streams file payloads straight from disk and keeps every policy
//! decision (signature, expiry, password, use count) in `LinkService`.
//! Links flagged with a confirmation page answer the first request with
//! a JSON interstitial instead of bytes, without spending a use; the
//! caller repeats the request with `confirm=true` to start the
//! transfer.

use crate::{
    errors::{ShareError, ShareResult},
    models::file::StoredFile,
    services::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::io::SeekFrom;
use tokio::{fs::File, io::AsyncSeekExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug, Deserialize, Default)]
pub struct DownloadQuery {
    pub token: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

/// `GET /download/{token}` — direct token download.
pub async fn download_by_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ShareResult<Response> {
    stream_for_token(&state, &token, &query, None, &headers).await
}

/// `GET /d/{file_id}?token=...` — download page URL; the token travels
/// in the query and must authorize exactly the file in the path.
pub async fn download_page(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ShareResult<Response> {
    let token = query.token.clone().ok_or(ShareError::TokenInvalid)?;
    stream_for_token(&state, &token, &query, Some(file_id), &headers).await
}

/// `GET /s/{code}` — short alias; the alias itself is the credential.
pub async fn download_by_short_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ShareResult<Response> {
    if !query.confirm {
        let link = state.links.fetch_link_by_short_code(&code).await?;
        if link.require_download_page {
            return Ok(interstitial(link.file_id, link.password_hash.is_some()));
        }
    }
    let resolved = state
        .links
        .resolve_short_code(
            &code,
            query.password.as_deref(),
            super::remote_addr(&headers).as_deref(),
        )
        .await?;
    stream_file(&resolved.file, &headers).await
}

async fn stream_for_token(
    state: &AppState,
    token: &str,
    query: &DownloadQuery,
    expected_file: Option<Uuid>,
    headers: &HeaderMap,
) -> ShareResult<Response> {
    // Peek before resolving so neither the file-id check nor the
    // interstitial burns a use.
    if let Some(link) = state.links.peek(token).await? {
        if !link.is_deleted {
            if let Some(expected) = expected_file {
                if link.file_id != expected {
                    return Err(ShareError::TokenInvalid);
                }
            }
            if !query.confirm && link.require_download_page {
                return Ok(interstitial(link.file_id, link.password_hash.is_some()));
            }
        }
    }

    let resolved = state
        .links
        .resolve(
            token,
            query.password.as_deref(),
            super::remote_addr(headers).as_deref(),
        )
        .await?;
    stream_file(&resolved.file, headers).await
}

fn interstitial(file_id: Uuid, password_protected: bool) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "interstitial": true,
            "file_id": file_id,
            "password_protected": password_protected,
            "hint": "repeat the request with confirm=true to start the transfer",
        })),
    )
        .into_response()
}

/// Stream the payload with range support and a download disposition.
async fn stream_file(file: &StoredFile, headers: &HeaderMap) -> ShareResult<Response> {
    if !file.is_downloadable() {
        return Err(ShareError::FileNotFound(file.id));
    }
    let total = file.size_bytes.max(0) as u64;
    let mut payload = File::open(&file.storage_path).await?;

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let mut response = match parse_byte_range(range, total) {
        ByteRange::Full => {
            let mut response = Response::new(Body::from_stream(ReaderStream::new(payload)));
            insert_numeric(response.headers_mut(), header::CONTENT_LENGTH, total);
            response
        }
        ByteRange::Slice(start, end) => {
            use tokio::io::AsyncReadExt;
            payload.seek(SeekFrom::Start(start)).await?;
            let len = end - start + 1;
            let stream = ReaderStream::new(payload.take(len));
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_numeric(response.headers_mut(), header::CONTENT_LENGTH, len);
            insert_str(
                response.headers_mut(),
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", start, end, total),
            );
            response
        }
        ByteRange::Unsatisfiable => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            insert_str(
                response.headers_mut(),
                header::CONTENT_RANGE,
                &format!("bytes */{}", total),
            );
            return Ok(response);
        }
    };

    let resp_headers = response.headers_mut();
    resp_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    let content_type = file
        .mime_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    resp_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    resp_headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&file.filename),
    );
    Ok(response)
}

enum ByteRange {
    Full,
    /// Inclusive start and end offsets.
    Slice(u64, u64),
    Unsatisfiable,
}

/// Parse a single-range `Range` header against a payload of `total`
/// bytes. Malformed or multi-range headers fall back to the full body;
/// a well-formed range beyond the payload is unsatisfiable.
fn parse_byte_range(header: Option<&str>, total: u64) -> ByteRange {
    let Some(range) = header.and_then(|h| h.strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if range.contains(',') || total == 0 {
        return ByteRange::Full;
    }
    let Some((start, end)) = range.split_once('-') else {
        return ByteRange::Full;
    };

    match (start.trim(), end.trim()) {
        // bytes=-N : final N bytes
        ("", suffix) => match suffix.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(n) => ByteRange::Slice(total.saturating_sub(n), total - 1),
            Err(_) => ByteRange::Full,
        },
        // bytes=N- : from N to the end
        (start, "") => match start.parse::<u64>() {
            Ok(n) if n < total => ByteRange::Slice(n, total - 1),
            Ok(_) => ByteRange::Unsatisfiable,
            Err(_) => ByteRange::Full,
        },
        (start, end) => match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(s), Ok(e)) if s <= e && s < total => ByteRange::Slice(s, e.min(total - 1)),
            (Ok(_), Ok(_)) => ByteRange::Unsatisfiable,
            _ => ByteRange::Full,
        },
    }
}

/// RFC 6266 disposition: an ASCII fallback name plus the RFC 5987
/// UTF-8 form for everything else.
fn content_disposition(filename: &str) -> HeaderValue {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() || c == ' ' {
                match c {
                    '"' | '\\' => '_',
                    other => other,
                }
            } else {
                '_'
            }
        })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        percent_encode(filename.as_bytes())
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn insert_numeric(headers: &mut HeaderMap, name: header::HeaderName, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}

fn insert_str(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{file::FileStatus, link::LinkPolicy},
        services::{
            chunk_store::ChunkStore,
            link_service::LinkService,
            session_service::{SessionService, test_support::memory_pool},
        },
    };
    use chrono::Utc;
    use sha2::{Digest, Sha256};

    async fn state_with_file(payload: &[u8]) -> (AppState, StoredFile, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = memory_pool().await;
        let storage_path = dir.path().join("data");
        std::fs::write(&storage_path, payload).unwrap();

        let file = StoredFile {
            id: Uuid::new_v4(),
            session_id: None,
            owner_id: None,
            filename: "notes.txt".into(),
            size_bytes: payload.len() as i64,
            mime_type: Some("text/plain".into()),
            sha256: format!("{:x}", Sha256::digest(payload)),
            storage_path: storage_path.to_string_lossy().into_owned(),
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
        .execute(&*db)
        .await
        .unwrap();

        let state = AppState {
            sessions: SessionService::new(
                db.clone(),
                ChunkStore::new(dir.path()),
                360,
                1440,
                u64::MAX,
            ),
            links: LinkService::new(db, "test-secret"),
        };
        (state, file, dir)
    }

    async fn remaining_uses(state: &AppState, link_id: Uuid) -> i64 {
        sqlx::query_scalar("SELECT remaining_uses FROM download_links WHERE id = ?")
            .bind(link_id)
            .fetch_one(&*state.links.db)
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn wrong_file_token_is_rejected_without_spending_a_use() {
        let (state, file, _dir) = state_with_file(b"payload bytes").await;
        let policy = LinkPolicy {
            max_uses: Some(1),
            ..Default::default()
        };
        let issued = state.links.create_link(&file, &policy).await.unwrap();
        let headers = HeaderMap::new();

        // token presented under a different file id path
        let err = stream_for_token(
            &state,
            &issued.token,
            &DownloadQuery::default(),
            Some(Uuid::new_v4()),
            &headers,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "token-invalid");
        assert_eq!(remaining_uses(&state, issued.link.id).await, 1);

        // the matching path still gets the single use
        let response = stream_for_token(
            &state,
            &issued.token,
            &DownloadQuery::default(),
            Some(file.id),
            &headers,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"payload bytes");
        assert_eq!(remaining_uses(&state, issued.link.id).await, 0);
    }

    #[tokio::test]
    async fn interstitial_spends_no_use_until_confirmed() {
        let (state, file, _dir) = state_with_file(b"payload bytes").await;
        let policy = LinkPolicy {
            max_uses: Some(1),
            require_download_page: true,
            ..Default::default()
        };
        let issued = state.links.create_link(&file, &policy).await.unwrap();
        let headers = HeaderMap::new();

        let response = stream_for_token(
            &state,
            &issued.token,
            &DownloadQuery::default(),
            None,
            &headers,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(page["interstitial"], true);
        assert_eq!(remaining_uses(&state, issued.link.id).await, 1);

        let confirmed = DownloadQuery {
            confirm: true,
            ..Default::default()
        };
        let response = stream_for_token(&state, &issued.token, &confirmed, None, &headers)
            .await
            .unwrap();
        assert_eq!(body_bytes(response).await, b"payload bytes");
        assert_eq!(remaining_uses(&state, issued.link.id).await, 0);
    }

    fn slice(header: &str, total: u64) -> Option<(u64, u64)> {
        match parse_byte_range(Some(header), total) {
            ByteRange::Slice(s, e) => Some((s, e)),
            _ => None,
        }
    }

    #[test]
    fn range_parsing() {
        assert!(matches!(parse_byte_range(None, 100), ByteRange::Full));
        assert_eq!(slice("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(slice("bytes=90-", 100), Some((90, 99)));
        assert_eq!(slice("bytes=-10", 100), Some((90, 99)));
        // end clamped to the payload
        assert_eq!(slice("bytes=50-500", 100), Some((50, 99)));
        assert!(matches!(
            parse_byte_range(Some("bytes=100-"), 100),
            ByteRange::Unsatisfiable
        ));
        assert!(matches!(
            parse_byte_range(Some("bytes=0-9,20-29"), 100),
            ByteRange::Full
        ));
        assert!(matches!(
            parse_byte_range(Some("bytes=abc"), 100),
            ByteRange::Full
        ));
    }

    #[test]
    fn disposition_escapes_non_ascii_names() {
        let value = content_disposition("r\u{e9}sum\u{e9}.pdf");
        let text = value.to_str().unwrap();
        assert!(text.starts_with("attachment; filename=\"r_sum_.pdf\""));
        assert!(text.contains("filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"));

        let plain = content_disposition("notes.txt");
        assert!(plain.to_str().unwrap().contains("filename=\"notes.txt\""));
    }
}
