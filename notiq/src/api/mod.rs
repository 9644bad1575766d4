//! HTTP boundary.
//!
//! - `POST /notifications/` accepts a notification into the queue
//! - `GET /health` reports liveness

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{ApiServer, ApiServerConfig, AppState};
