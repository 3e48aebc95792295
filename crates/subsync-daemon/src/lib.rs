//! HTTP surface of the subsync service.
//!
//! The binary in `main.rs` loads configuration, opens the store, and serves
//! [`app::router`]. Everything here is a thin adapter: handlers build a
//! [`subsync_core::RequestContext`], call into `subsync-core`, and map the
//! result to a status code.

pub mod app;
pub mod auth;
pub mod error;

pub use app::{AppState, router};
pub use error::ApiError;
