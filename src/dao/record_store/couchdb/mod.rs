//! CouchDB authoritative store, following sessions through the `_changes` feed.

mod config;
mod error;
mod models;
mod store;

pub use config::CouchConfig;
pub use error::{CouchDaoError, CouchResult};
pub use store::CouchSessionStore;

use crate::dao::storage::StorageError;

impl From<CouchDaoError> for StorageError {
    fn from(err: CouchDaoError) -> Self {
        if matches!(err, CouchDaoError::RateLimited { .. }) {
            return StorageError::rate_limited(err.to_string());
        }
        StorageError::unavailable(err.to_string(), err)
    }
}
