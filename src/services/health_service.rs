use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Probe the stores and report the degraded flag with engine counters.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let engine = state.engine();
    if let Err(err) = engine.health().await {
        warn!(error = %err, "storage health check failed");
    }

    HealthResponse::new(
        state.is_degraded(),
        engine.queued_updates().await,
        engine.active_subscriptions(),
    )
}
