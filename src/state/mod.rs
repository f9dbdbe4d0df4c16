//! Shared application state plus the session lifecycle and room models.

pub mod lifecycle;
pub mod room;

use std::sync::Arc;

use tokio::sync::watch;

use crate::{config::AppConfig, services::engine::SyncEngine};

/// Handle cloned into every handler.
pub type SharedState = Arc<AppState>;

/// Central application state shared by every HTTP handler and background task.
pub struct AppState {
    engine: Arc<SyncEngine>,
    config: AppConfig,
    degraded: watch::Sender<bool>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until the first successful health check.
    pub fn new(engine: Arc<SyncEngine>, config: AppConfig) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            engine,
            config,
            degraded: degraded_tx,
        })
    }

    /// Synchronization engine.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Loaded configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn set_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }
}
