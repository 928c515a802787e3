//! Core data models for the chunked-upload and share-link service.
//!
//! These entities map to SQLite tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`. The wire DTOs shared by the HTTP
//! handlers and the client-side scheduler live in `wire`.

pub mod file;
pub mod link;
pub mod owner;
pub mod session;
pub mod wire;
