//! HTTP handlers for the chunked-upload session lifecycle.
//!
//! Chunk bodies arrive raw; their metadata rides in `x-chunk-size`,
//! `x-chunk-checksum` and `x-idempotency-key` headers so the payload
//! never needs re-framing. All state decisions live in `SessionService`.

use crate::{
    errors::{ShareError, ShareResult},
    models::{
        session::UploadStatus,
        wire::{
            CHUNK_CHECKSUM_HEADER, CHUNK_SIZE_HEADER, ChunkAck, CreateSessionRequest,
            CreateSessionResponse, FinalizeRequest, FinalizeResponse, IDEMPOTENCY_KEY_HEADER,
            SessionStatusResponse,
        },
    },
    services::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use uuid::Uuid;

/// `POST /api/upload/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> ShareResult<(StatusCode, Json<CreateSessionResponse>)> {
    let owner = state
        .sessions
        .resolve_owner(super::bearer_token(&headers))
        .await?;
    let session = state.sessions.create(&req, owner.as_ref()).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            upload_session_id: session.id,
            accepted_chunk_size: session.chunk_size as u64,
            expires_at: session.expires_at,
        }),
    ))
}

/// `GET /api/upload/sessions/{id}` — received/missing indices for resume.
pub async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ShareResult<Json<SessionStatusResponse>> {
    Ok(Json(state.sessions.probe(id).await?))
}

/// `PUT /api/upload/sessions/{id}/chunk/{index}` — raw chunk body.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((id, index)): Path<(Uuid, i64)>,
    headers: HeaderMap,
    body: Bytes,
) -> ShareResult<Json<ChunkAck>> {
    let declared_size = match header_str(&headers, CHUNK_SIZE_HEADER) {
        Some(value) => Some(value.parse::<u64>().map_err(|_| {
            ShareError::Validation(format!("invalid {} header", CHUNK_SIZE_HEADER))
        })?),
        None => None,
    };
    let declared_sha256 = header_str(&headers, CHUNK_CHECKSUM_HEADER);
    let idempotency_key = header_str(&headers, IDEMPOTENCY_KEY_HEADER);

    let ack = state
        .sessions
        .accept_chunk(
            id,
            index,
            declared_size,
            declared_sha256,
            idempotency_key,
            &body,
        )
        .await?;
    Ok(Json(ack))
}

/// `POST /api/upload/sessions/{id}/finalize`
///
/// 200 once the file is assembled, 202 while reassembly runs in the
/// background; clients poll by re-posting the same request.
pub async fn finalize_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FinalizeRequest>,
) -> ShareResult<(StatusCode, Json<FinalizeResponse>)> {
    let response = state.sessions.finalize(id, &req.file_sha256).await?;
    let code = match response.status {
        UploadStatus::Completed => StatusCode::OK,
        _ => StatusCode::ACCEPTED,
    };
    Ok((code, Json(response)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
