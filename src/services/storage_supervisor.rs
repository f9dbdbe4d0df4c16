use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::state::SharedState;

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Poll both stores and keep the shared state in degraded mode while either is unreachable.
pub async fn run(state: SharedState) {
    let engine = state.engine().clone();
    let mut idle_delay = INITIAL_DELAY;

    loop {
        match engine.health().await {
            Ok(()) => {
                if state.is_degraded() {
                    info!("stores healthy; leaving degraded mode");
                    state.set_degraded(false);
                }
                idle_delay = INITIAL_DELAY;
                sleep(HEALTH_POLL_INTERVAL).await;
            }
            Err(health_err) => {
                warn!(error = %health_err, "store health check failed");
                let mut reconnect_delay = INITIAL_DELAY;
                let mut reconnected = false;

                for attempt in 0..MAX_RECONNECT_ATTEMPTS {
                    match engine.reconnect().await {
                        Ok(()) => {
                            info!(attempt, "store reconnection succeeded after health check failure");
                            reconnected = true;
                            break;
                        }
                        Err(reconnect_err) => {
                            if attempt == 0 {
                                warn!(
                                    attempt, error = %reconnect_err,
                                    "store reconnect first attempt failed; entering degraded mode"
                                );
                                state.set_degraded(true);
                            } else {
                                warn!(attempt, error = %reconnect_err, "store reconnect attempt failed");
                            }
                            sleep(reconnect_delay).await;
                            reconnect_delay = (reconnect_delay * 2).min(MAX_DELAY);
                        }
                    }
                }

                if reconnected {
                    state.set_degraded(false);
                    sleep(HEALTH_POLL_INTERVAL).await;
                } else {
                    warn!("exhausted store reconnect attempts; staying in degraded mode");
                    sleep(idle_delay).await;
                    idle_delay = (idle_delay * 2).min(MAX_DELAY);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::timeout;

    use super::*;
    use crate::{
        config::AppConfig,
        services::engine::SyncEngine,
        state::AppState,
    };

    #[tokio::test]
    async fn healthy_stores_clear_degraded_mode() {
        let config = AppConfig::default();
        let engine = Arc::new(SyncEngine::in_memory(config.engine.clone()));
        let state = AppState::new(engine, config);
        assert!(state.is_degraded());

        let mut watcher = state.degraded_watcher();
        let task = tokio::spawn(run(state.clone()));
        timeout(Duration::from_secs(2), watcher.wait_for(|degraded| !degraded))
            .await
            .unwrap()
            .unwrap();
        task.abort();
    }
}
