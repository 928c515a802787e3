pub mod assembler;
pub mod chunk_store;
pub mod link_service;
pub mod session_service;

/// Shared router state: the two long-lived services, both cheap clones
/// over the same pool and storage root.
#[derive(Clone)]
pub struct AppState {
    pub sessions: session_service::SessionService,
    pub links: link_service::LinkService,
}
