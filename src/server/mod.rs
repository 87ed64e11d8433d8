//! HTTP surface of the runtime.

pub mod routes;

pub use routes::{app_router, AppState};
