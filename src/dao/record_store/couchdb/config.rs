use std::{env, time::Duration};

use super::error::{CouchDaoError, CouchResult};

const DEFAULT_SESSIONS_DB: &str = "quiz_sessions";
const DEFAULT_CHANGES_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the CouchDB session documents live and how the change feed is polled.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Server root, e.g. `http://localhost:5984`.
    pub base_url: String,
    /// Database holding the session documents.
    pub database: String,
    /// Basic-auth pair, sent only when both halves are set.
    pub credentials: Option<(String, String)>,
    /// How long one longpoll request on `_changes` may stay open.
    pub changes_timeout: Duration,
}

impl CouchConfig {
    /// Session database at `base_url`, anonymous, default longpoll timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            database: DEFAULT_SESSIONS_DB.to_owned(),
            credentials: None,
            changes_timeout: DEFAULT_CHANGES_TIMEOUT,
        }
    }

    /// Read `COUCH_BASE_URL` (required) plus the optional `COUCH_DB`,
    /// `COUCH_USERNAME`/`COUCH_PASSWORD` and `COUCH_CHANGES_TIMEOUT_SECS`.
    pub fn from_env() -> CouchResult<Self> {
        let base_url = env::var("COUCH_BASE_URL").map_err(|_| CouchDaoError::MissingEnvVar {
            var: "COUCH_BASE_URL",
        })?;

        let mut config = Self::new(base_url);
        if let Ok(database) = env::var("COUCH_DB") {
            config.database = database;
        }
        config.credentials = env::var("COUCH_USERNAME")
            .ok()
            .zip(env::var("COUCH_PASSWORD").ok());
        if let Some(secs) = env::var("COUCH_CHANGES_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.changes_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}
