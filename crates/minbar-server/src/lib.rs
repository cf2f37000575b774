//! Axum HTTP surface: the streaming ask endpoint plus liveness and
//! worker-readiness probes.

pub mod handlers;
pub mod server;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
