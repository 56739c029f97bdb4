//! HTTP surface and system assembly for the Chengis CI/CD engine.

pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod system;

pub use error::ApiError;
pub use state::AppState;
pub use system::System;
