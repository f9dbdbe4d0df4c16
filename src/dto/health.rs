//! Health check payloads.

use serde::Serialize;
use utoipa::ToSchema;

/// Health payload returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Score updates waiting for the next flush.
    pub queued_updates: usize,
    /// Live room subscriptions.
    pub subscriptions: usize,
}

impl HealthResponse {
    /// Build the payload from the degraded flag and engine counters.
    pub fn new(degraded: bool, queued_updates: usize, subscriptions: usize) -> Self {
        Self {
            status: if degraded { "degraded" } else { "ok" }.to_string(),
            queued_updates,
            subscriptions,
        }
    }
}
