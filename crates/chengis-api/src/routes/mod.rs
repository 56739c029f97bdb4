//! Route assembly.

use axum::Router;

use crate::AppState;

pub mod agents;
pub mod approvals;
pub mod metrics;
pub mod webhooks;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/webhooks", webhooks::router())
        .nest("/agent", agents::router())
        .nest("/builds", approvals::router())
        .merge(metrics::router())
        .with_state(state)
}
