//! Route table for the upload API and the public download surface.
//!
//! ## Structure
//! - **Upload sessions** (`/api/upload/...`)
//!   - `POST /api/upload/sessions` — create a session
//!   - `GET  /api/upload/sessions/{id}` — received/missing indices
//!   - `PUT  /api/upload/sessions/{id}/chunk/{index}` — raw chunk body
//!   - `POST /api/upload/sessions/{id}/finalize` — request reassembly
//!
//! - **Files and links** (`/api/files/...`)
//!   - `GET/DELETE /api/files/{id}` — metadata / soft delete
//!   - `POST/GET   /api/files/{id}/links` — issue / list links
//!   - `DELETE     /api/files/{id}/links/{link_id}` — revoke a link
//!
//! - **Public downloads**
//!   - `GET /download/{token}` — direct signed-token download
//!   - `GET /d/{file_id}?token=...` — download page URL
//!   - `GET /s/{code}` — short alias

use crate::{
    config::MAX_CHUNK_SIZE,
    handlers::{
        download_handlers::{download_by_short_code, download_by_token, download_page},
        file_handlers::{
            create_download_link, delete_download_link, delete_file, file_detail,
            list_download_links,
        },
        health_handlers::{healthz, readyz},
        upload_handlers::{create_session, finalize_session, session_status, upload_chunk},
    },
    services::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};

/// Build the router carrying shared `AppState` to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload session lifecycle
        .route("/api/upload/sessions", post(create_session))
        .route("/api/upload/sessions/{id}", get(session_status))
        .route("/api/upload/sessions/{id}/chunk/{index}", put(upload_chunk))
        .route("/api/upload/sessions/{id}/finalize", post(finalize_session))
        // file metadata and link management
        .route("/api/files/{id}", get(file_detail).delete(delete_file))
        .route(
            "/api/files/{id}/links",
            post(create_download_link).get(list_download_links),
        )
        .route("/api/files/{id}/links/{link_id}", delete(delete_download_link))
        // public downloads
        .route("/download/{token}", get(download_by_token))
        .route("/d/{file_id}", get(download_page))
        .route("/s/{code}", get(download_by_short_code))
        // raw chunk bodies exceed axum's default 2 MiB cap
        .layer(DefaultBodyLimit::max(MAX_CHUNK_SIZE as usize + 64 * 1024))
}
