use mongodb::{Client, Database, bson::doc, options::ClientOptions};
use tracing::debug;

use super::error::{MongoDaoError, MongoResult};

/// Build a client for `database_name` and confirm the server answers a ping.
///
/// Callers own the retry schedule: startup loops with backoff and the storage
/// supervisor reconnects on failed health checks.
pub(super) async fn open_database(
    options: &ClientOptions,
    database_name: &str,
) -> MongoResult<(Client, Database)> {
    let client = Client::with_options(options.clone())
        .map_err(|source| MongoDaoError::ClientConstruction { source })?;
    let database = client.database(database_name);

    database
        .run_command(doc! { "ping": 1 })
        .await
        .map_err(|source| MongoDaoError::ConnectPing {
            database: database_name.to_owned(),
            source,
        })?;

    debug!(database = database_name, "MongoDB answered the connection ping");
    Ok((client, database))
}
