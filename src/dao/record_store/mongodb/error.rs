use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use thiserror::Error;

/// Result alias for MongoDB DAO operations.
pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

/// Server error code returned by throttling MongoDB-compatible backends.
const REQUEST_RATE_TOO_LARGE: i32 = 16500;
const DUPLICATE_KEY: i32 = 11000;

/// Failures raised by the MongoDB store implementation.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB database `{database}` did not answer the connection ping")]
    ConnectPing {
        database: String,
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("MongoDB `{operation}` on `{collection}` failed")]
    Query {
        collection: &'static str,
        operation: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("malformed document `{id}` in `{collection}`: {reason}")]
    InvalidDocument {
        collection: &'static str,
        id: String,
        reason: String,
    },
}

impl MongoDaoError {
    pub(crate) fn query(
        collection: &'static str,
        operation: &'static str,
    ) -> impl FnOnce(MongoError) -> MongoDaoError {
        move |source| MongoDaoError::Query {
            collection,
            operation,
            source,
        }
    }

    /// Whether the server throttled the request.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            MongoDaoError::Query { source, .. } => {
                matches!(*source.kind, ErrorKind::Command(ref cmd) if cmd.code == REQUEST_RATE_TOO_LARGE)
            }
            _ => false,
        }
    }
}

/// Whether an insert failed because the `_id` already exists.
pub(crate) fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref write)) if write.code == DUPLICATE_KEY
    )
}
