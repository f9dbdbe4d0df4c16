//! MongoDB store backends.

mod config;
mod connection;
mod error;
mod models;
pub mod store;

pub use config::MongoConfig;
pub use error::{MongoDaoError, MongoResult};
pub use store::MongoStore;

use crate::dao::storage::StorageError;

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        if err.is_rate_limited() {
            return StorageError::rate_limited(err.to_string());
        }
        StorageError::unavailable(err.to_string(), err)
    }
}
