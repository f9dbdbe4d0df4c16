//! Error types shared by the CouchDB session store.

use reqwest::StatusCode;
use thiserror::Error;

/// Convenient result alias returning [`CouchDaoError`] failures.
pub type CouchResult<T> = Result<T, CouchDaoError>;

/// Failures that can occur while interacting with CouchDB.
#[derive(Debug, Error)]
pub enum CouchDaoError {
    /// Required environment variable is missing.
    #[error("missing CouchDB environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build CouchDB client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// CouchDB rejected a GET against the target database.
    #[error("failed to query CouchDB database `{database}`")]
    DatabaseQuery {
        database: String,
        #[source]
        source: reqwest::Error,
    },
    /// CouchDB rejected a database creation request.
    #[error("failed to create CouchDB database `{database}`")]
    DatabaseCreate {
        database: String,
        #[source]
        source: reqwest::Error,
    },
    /// CouchDB returned an unexpected status code for a database operation.
    #[error("unexpected CouchDB database response status {status} for `{database}`")]
    DatabaseStatus {
        database: String,
        status: StatusCode,
    },
    /// A request to a document endpoint could not be sent.
    #[error("failed to send CouchDB request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// CouchDB returned an unexpected status code for a document endpoint.
    #[error("unexpected CouchDB response status {status} for `{path}`")]
    RequestStatus { path: String, status: StatusCode },
    /// CouchDB answered 429.
    #[error("CouchDB throttled the request to `{path}`")]
    RateLimited { path: String },
    /// Revision conflicts kept winning over our writes.
    #[error("document `{path}` stayed in conflict after {attempts} attempt(s)")]
    Conflict { path: String, attempts: u32 },
    /// Response payload could not be parsed into JSON.
    #[error("failed to decode CouchDB response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// Decoding a JSON value into the expected model failed.
    #[error("failed to deserialize CouchDB value for `{path}`")]
    DeserializeValue {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CouchDaoError {
    /// Map a non-success status to the matching error.
    pub(crate) fn from_status(path: &str, status: StatusCode) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            CouchDaoError::RateLimited {
                path: path.to_owned(),
            }
        } else {
            CouchDaoError::RequestStatus {
                path: path.to_owned(),
                status,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::storage::StorageError;

    #[test]
    fn throttling_maps_to_rate_limited_storage_error() {
        let err = CouchDaoError::from_status("session::123456", StatusCode::TOO_MANY_REQUESTS);
        let storage: StorageError = err.into();
        assert!(storage.is_rate_limited());

        let err = CouchDaoError::from_status("session::123456", StatusCode::BAD_GATEWAY);
        let storage: StorageError = err.into();
        assert!(!storage.is_rate_limited());
    }
}
