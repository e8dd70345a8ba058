//! Ferry Gateway Server
//!
//! Thin HTTP surface over the routing engine: the selection/outcome API used
//! by the proxying layer plus read-only health and monitoring endpoints.

pub mod app;
pub mod router;

pub use app::{create_app, start_server, AppState};
