//! TARDIS REST API: configuration, shared state and the axum router.

pub mod config;
pub mod server;
