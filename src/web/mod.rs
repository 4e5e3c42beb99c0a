//! Dashboard HTTP API.

pub mod api;

pub use api::{AppState, dashboard_routes};
