use std::{sync::Arc, time::SystemTime};

use futures::{StreamExt, future::BoxFuture};
use reqwest::{Client, Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, from_value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dao::{
    models::{MergeOutcome, Progress, RosterEntry, SessionEntity},
    record_store::{AuthoritativeStore, ChangeStream, SessionChange},
    storage::StorageResult,
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        AllDocsResponse, ChangesRequest, ChangesResponse, CouchSessionDocument, END_SUFFIX,
        RevisionOnly, SESSION_PREFIX, session_doc_id,
    },
};

/// Revision conflicts tolerated before a read-modify-write gives up.
const MAX_CONFLICT_RETRIES: u32 = 5;

enum PutOutcome {
    Written,
    Conflict,
}

/// CouchDB-backed authoritative session store.
///
/// Each session is one `session::{code}` document; writes carry the last read `_rev`
/// and are retried from a fresh read on 409.
#[derive(Clone)]
pub struct CouchSessionStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
    changes_timeout_ms: u128,
}

impl CouchSessionStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let store = Self {
            client,
            base_url: Arc::from(config.base_url.trim_end_matches('/')),
            database: Arc::from(config.database),
            auth: config
                .credentials
                .map(|(user, pass)| (Arc::from(user), Arc::from(pass))),
            changes_timeout_ms: config.changes_timeout.as_millis(),
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.authorized(method, format!("{}/{}/{}", self.base_url, self.database, path))
    }

    fn database_request(&self, method: Method) -> reqwest::RequestBuilder {
        self.authorized(method, format!("{}/{}", self.base_url, self.database))
    }

    fn authorized(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth {
            Some((user, pass)) => builder.basic_auth(user.as_ref(), Some(pass.as_ref())),
            None => builder,
        }
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let response = self
            .database_request(Method::GET)
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .database_request(Method::PUT)
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                // 412: created concurrently by another instance.
                if create.status().is_success() || create.status() == StatusCode::PRECONDITION_FAILED
                {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn ping(&self) -> CouchResult<()> {
        let path = self.database.to_string();
        let response = self
            .database_request(Method::GET)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: path.clone(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CouchDaoError::from_status(&path, response.status()))
        }
    }

    async fn get_document<T>(&self, doc_id: &str) -> CouchResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                response.json::<T>().await.map(Some).map_err(|source| {
                    CouchDaoError::DecodeResponse {
                        path: doc_id.to_string(),
                        source,
                    }
                })
            }
            other => Err(CouchDaoError::from_status(doc_id, other)),
        }
    }

    async fn put_document<T>(&self, doc_id: &str, document: &T) -> CouchResult<PutOutcome>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::CONFLICT => Ok(PutOutcome::Conflict),
            status if status.is_success() => Ok(PutOutcome::Written),
            other => Err(CouchDaoError::from_status(doc_id, other)),
        }
    }

    /// Read the session, let `edit` change it, and write it back with the read revision.
    ///
    /// `edit` returns `false` to skip the write. Returns `None` when the session is absent.
    async fn modify_session<F>(&self, code: &str, mut edit: F) -> CouchResult<Option<bool>>
    where
        F: FnMut(&mut SessionEntity) -> bool,
    {
        let doc_id = session_doc_id(code);
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let Some(mut document) = self.get_document::<CouchSessionDocument>(&doc_id).await?
            else {
                return Ok(None);
            };
            if !edit(&mut document.session) {
                return Ok(Some(false));
            }
            document.session.updated_at = SystemTime::now();

            match self.put_document(&doc_id, &document).await? {
                PutOutcome::Written => return Ok(Some(true)),
                PutOutcome::Conflict => {
                    debug!(doc_id = %doc_id, attempt, "CouchDB revision conflict; re-reading");
                }
            }
        }

        Err(CouchDaoError::Conflict {
            path: doc_id,
            attempts: MAX_CONFLICT_RETRIES,
        })
    }

    async fn create_session(&self, session: SessionEntity) -> CouchResult<bool> {
        let document = CouchSessionDocument::from_entity(session, None);
        match self.put_document(&document.id, &document).await? {
            PutOutcome::Written => Ok(true),
            PutOutcome::Conflict => Ok(false),
        }
    }

    async fn find_session(&self, code: &str) -> CouchResult<Option<SessionEntity>> {
        Ok(self
            .get_document::<CouchSessionDocument>(&session_doc_id(code))
            .await?
            .map(CouchSessionDocument::into_entity))
    }

    async fn update_session(&self, session: SessionEntity) -> CouchResult<bool> {
        let code = session.code.clone();
        let written = self
            .modify_session(&code, |current| {
                *current = session.clone();
                true
            })
            .await?;
        Ok(written.unwrap_or(false))
    }

    async fn replace_roster_entry(&self, code: &str, entry: RosterEntry) -> CouchResult<bool> {
        let written = self
            .modify_session(code, |session| {
                session.replace_roster_entry(entry.clone());
                true
            })
            .await?;
        Ok(written.unwrap_or(false))
    }

    async fn merge_roster_progress(
        &self,
        code: &str,
        player_id: Uuid,
        progress: Progress,
    ) -> CouchResult<MergeOutcome> {
        let mut outcome = MergeOutcome::Missing;
        let found = self
            .modify_session(code, |session| {
                outcome = match session.roster.iter_mut().find(|entry| entry.id == player_id) {
                    Some(entry) => entry.merge_progress(progress),
                    None => MergeOutcome::Missing,
                };
                outcome == MergeOutcome::Applied
            })
            .await?;

        Ok(if found.is_none() {
            MergeOutcome::Missing
        } else {
            outcome
        })
    }

    async fn delete_session(&self, code: &str) -> CouchResult<bool> {
        let doc_id = session_doc_id(code);
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(current) = self.get_document::<RevisionOnly>(&doc_id).await? else {
                return Ok(false);
            };
            let response = self
                .request(Method::DELETE, &doc_id)
                .query(&[("rev", current.rev.as_str())])
                .send()
                .await
                .map_err(|source| CouchDaoError::RequestSend {
                    path: doc_id.clone(),
                    source,
                })?;

            match response.status() {
                StatusCode::NOT_FOUND => return Ok(false),
                StatusCode::CONFLICT => continue,
                status if status.is_success() => return Ok(true),
                other => return Err(CouchDaoError::from_status(&doc_id, other)),
            }
        }

        Err(CouchDaoError::Conflict {
            path: doc_id,
            attempts: MAX_CONFLICT_RETRIES,
        })
    }

    async fn sessions_created_before(&self, cutoff: SystemTime) -> CouchResult<Vec<String>> {
        const ALL_DOCS: &str = "_all_docs";
        let query = [
            ("include_docs", "true".to_string()),
            ("startkey", format!("\"{}\"", SESSION_PREFIX)),
            ("endkey", format!("\"{}{}\"", SESSION_PREFIX, END_SUFFIX)),
        ];

        let response = self
            .request(Method::GET, ALL_DOCS)
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: ALL_DOCS.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::from_status(ALL_DOCS, response.status()));
        }

        let payload = response.json::<AllDocsResponse>().await.map_err(|source| {
            CouchDaoError::DecodeResponse {
                path: ALL_DOCS.to_string(),
                source,
            }
        })?;

        let mut codes = Vec::new();
        for row in payload.rows {
            if let Some(doc) = row.doc {
                let document: CouchSessionDocument =
                    from_value(doc).map_err(|source| CouchDaoError::DeserializeValue {
                        path: ALL_DOCS.to_string(),
                        source,
                    })?;
                if document.session.created_at < cutoff {
                    codes.push(document.session.code);
                }
            }
        }

        Ok(codes)
    }

    async fn fetch_changes(&self, doc_id: &str, since: &Value) -> CouchResult<ChangesResponse> {
        const CHANGES: &str = "_changes";
        let since = match since {
            Value::String(seq) => seq.clone(),
            other => other.to_string(),
        };
        let query = [
            ("feed", "longpoll".to_string()),
            ("filter", "_doc_ids".to_string()),
            ("include_docs", "true".to_string()),
            ("since", since),
            ("timeout", self.changes_timeout_ms.to_string()),
        ];

        let response = self
            .request(Method::POST, CHANGES)
            .query(&query)
            .json(&ChangesRequest { doc_ids: [doc_id] })
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: CHANGES.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::from_status(CHANGES, response.status()));
        }

        response
            .json::<ChangesResponse>()
            .await
            .map_err(|source| CouchDaoError::DecodeResponse {
                path: CHANGES.to_string(),
                source,
            })
    }

    /// Longpoll `_changes` for one document; the stream ends on the first failed request.
    fn watch_session(&self, code: &str) -> ChangeStream<SessionChange> {
        let store = self.clone();
        let doc_id = session_doc_id(code);

        let stream = async_stream::stream! {
            let mut since = Value::String("now".to_owned());
            loop {
                let batch = match store.fetch_changes(&doc_id, &since).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(doc_id = %doc_id, error = %err, "CouchDB change feed failed");
                        break;
                    }
                };
                since = batch.last_seq;

                for row in batch.results {
                    if row.deleted {
                        yield SessionChange::Deleted;
                        continue;
                    }
                    let change = row
                        .doc
                        .and_then(|doc| from_value::<CouchSessionDocument>(doc).ok())
                        .map(|doc| SessionChange::Updated(doc.into_entity()))
                        .unwrap_or(SessionChange::Resync);
                    yield change;
                }
            }
        };

        stream.boxed()
    }
}

impl AuthoritativeStore for CouchSessionStore {
    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.create_session(session).await.map_err(Into::into) })
    }

    fn find_session(&self, code: &str) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move { store.find_session(&code).await.map_err(Into::into) })
    }

    fn update_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.update_session(session).await.map_err(Into::into) })
    }

    fn replace_roster_entry(
        &self,
        code: &str,
        entry: RosterEntry,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store
                .replace_roster_entry(&code, entry)
                .await
                .map_err(Into::into)
        })
    }

    fn merge_roster_progress(
        &self,
        code: &str,
        player_id: Uuid,
        progress: Progress,
    ) -> BoxFuture<'static, StorageResult<MergeOutcome>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store
                .merge_roster_progress(&code, player_id, progress)
                .await
                .map_err(Into::into)
        })
    }

    fn delete_session(&self, code: &str) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move { store.delete_session(&code).await.map_err(Into::into) })
    }

    fn sessions_created_before(
        &self,
        cutoff: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        let store = self.clone();
        Box::pin(async move { store.sessions_created_before(cutoff).await.map_err(Into::into) })
    }

    fn watch_session(
        &self,
        code: &str,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<SessionChange>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            // Fail early when the server is down so the caller falls back to polling.
            store.ping().await?;
            Ok(store.watch_session(&code))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}
