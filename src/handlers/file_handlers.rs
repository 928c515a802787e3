//! HTTP handlers for stored-file metadata and download-link management.
//!
//! Owned files require the owner's bearer key; anonymous files are
//! managed by whoever holds the file id.

use crate::{
    errors::{ShareError, ShareResult},
    models::{
        file::StoredFile,
        link::{DownloadLink, LinkPolicy},
        wire::{CreateLinkRequest, DownloadLinkResponse, FileDetailResponse},
    },
    services::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use chrono::{Duration, Utc};
use uuid::Uuid;

/// `GET /api/files/{id}` — metadata plus active links (without tokens).
pub async fn file_detail(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> ShareResult<Json<FileDetailResponse>> {
    let file = authorized_file(&state, &headers, file_id).await?;
    let links = state.links.list_links(file_id).await?;
    Ok(Json(FileDetailResponse {
        id: file.id,
        filename: file.filename.clone(),
        size: file.size_bytes.max(0) as u64,
        mime_type: file.mime_type.clone(),
        sha256: file.sha256.clone(),
        status: file.status,
        created_at: file.created_at,
        links: links.iter().map(|link| link_response(link, None)).collect(),
    }))
}

/// `DELETE /api/files/{id}` — soft delete, links included.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> ShareResult<StatusCode> {
    let owner = state
        .sessions
        .resolve_owner(super::bearer_token(&headers))
        .await?;
    state.sessions.delete_file(file_id, owner.as_ref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/files/{id}/links`
///
/// The response carries the plaintext token exactly once; it cannot be
/// recovered from the server afterwards.
pub async fn create_download_link(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<CreateLinkRequest>,
) -> ShareResult<(StatusCode, Json<DownloadLinkResponse>)> {
    let file = authorized_file(&state, &headers, file_id).await?;

    let expires_at = match (req.no_expiry, req.expires_at, req.expires_in_minutes) {
        (true, _, _) => None,
        (false, Some(at), _) => Some(at),
        (false, None, Some(minutes)) => {
            if minutes <= 0 {
                return Err(ShareError::Validation(
                    "expires_in_minutes must be positive".into(),
                ));
            }
            Some(Utc::now() + Duration::minutes(minutes))
        }
        (false, None, None) => None,
    };
    let policy = LinkPolicy {
        expires_at,
        never_expires: req.no_expiry,
        max_uses: req.max_uses,
        password: req.password.clone(),
        require_download_page: req.require_download_page,
        short_alias: req.create_short_link,
    };

    let issued = state.links.create_link(&file, &policy).await?;
    Ok((
        StatusCode::CREATED,
        Json(link_response(&issued.link, Some(&issued.token))),
    ))
}

/// `GET /api/files/{id}/links`
pub async fn list_download_links(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> ShareResult<Json<Vec<DownloadLinkResponse>>> {
    authorized_file(&state, &headers, file_id).await?;
    let links = state.links.list_links(file_id).await?;
    Ok(Json(
        links.iter().map(|link| link_response(link, None)).collect(),
    ))
}

/// `DELETE /api/files/{id}/links/{link_id}` — revoke a link.
pub async fn delete_download_link(
    State(state): State<AppState>,
    Path((file_id, link_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> ShareResult<StatusCode> {
    authorized_file(&state, &headers, file_id).await?;
    state.links.delete_link(file_id, link_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Fetch a file and enforce ownership: files created under an owner key
/// are only visible to that owner.
async fn authorized_file(
    state: &AppState,
    headers: &HeaderMap,
    file_id: Uuid,
) -> ShareResult<StoredFile> {
    let owner = state
        .sessions
        .resolve_owner(super::bearer_token(headers))
        .await?;
    let file = state.sessions.fetch_file(file_id).await?;
    if let Some(owner_id) = file.owner_id {
        if owner.map(|o| o.id) != Some(owner_id) {
            return Err(ShareError::Unauthorized);
        }
    }
    Ok(file)
}

fn link_response(link: &DownloadLink, token: Option<&str>) -> DownloadLinkResponse {
    DownloadLinkResponse {
        id: link.id,
        url: token.map(|t| format!("/download/{}", t)),
        expires_at: link.expires_at,
        never_expires: link.never_expires,
        remaining_uses: link.remaining_uses,
        require_download_page: link.require_download_page,
        has_password: link.password_hash.is_some(),
        short_url: link.short_code.as_deref().map(|code| format!("/s/{}", code)),
    }
}
