//! API server for Keel.
//!
//! Exposes build creation, worker status reports, cancellation and the
//! administrative build and queue queries over HTTP.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
