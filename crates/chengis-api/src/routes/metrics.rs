//! Metrics exposition.

use axum::Router;
use axum::extract::State;
use axum::routing::get;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics(State(state): State<AppState>) -> String {
    // Gauges sampled at scrape time.
    if let Ok(age) = state.builds.oldest_queued_age_secs().await {
        state
            .metrics
            .queue_oldest_pending_seconds
            .set(age.unwrap_or(0));
    }
    state
        .metrics
        .agents_online
        .set(state.registry.online_count().await as i64);
    state
        .metrics
        .event_bus_dropped_total
        .set(state.bus.dropped() as i64);

    state.metrics.render()
}
