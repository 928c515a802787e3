//! Client-side chunk scheduler and its HTTP transport.

pub mod http_transport;
pub mod scheduler;
