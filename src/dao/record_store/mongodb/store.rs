//! MongoDB implementations of the fast store, authoritative store and retry ledger.

use std::{future, sync::Arc, time::SystemTime};

use futures::{StreamExt, TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{Bson, DateTime, Document, doc},
    change_stream::event::{ChangeStreamEvent, OperationType},
    options::{FullDocumentType, IndexOptions, ReturnDocument},
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::open_database,
    error::{MongoDaoError, MongoResult, is_duplicate_key},
    models::{
        LEDGER_COLLECTION, MongoFailedUpdateDocument, MongoPlayerDocument, MongoSessionDocument,
        PLAYER_COLLECTION, SESSION_COLLECTION, answer_document, player_id_from_key, player_key,
        roster_document,
    },
};
use crate::dao::{
    models::{
        AnswerEntity, FailedUpdateEntity, FailedUpdateStatus, MergeOutcome, PlayerEntity,
        Progress, RosterEntry, SessionEntity,
    },
    record_store::{
        AuthoritativeStore, ChangeStream, FastRecordStore, PlayerChange, PlayerClock,
        RetryLedger, SessionChange,
    },
    storage::StorageResult,
};

/// MongoDB-backed implementation of every record store role.
///
/// Player rows live in `players` keyed by `{code}:{player_id}`, sessions in `sessions`
/// keyed by join code and retry records in `failed_updates`.
#[derive(Clone)]
pub struct MongoStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            open_database(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

fn now() -> DateTime {
    DateTime::from_system_time(SystemTime::now())
}

fn counter(document: &Document, field: &str) -> u32 {
    let value = match document.get(field) {
        Some(Bson::Int32(v)) => i64::from(*v),
        Some(Bson::Int64(v)) => *v,
        Some(Bson::Double(v)) => *v as i64,
        _ => 0,
    };
    value.clamp(0, i64::from(u32::MAX)) as u32
}

fn would_raise(progress: Progress) -> Document {
    doc! {
        "$or": [
            { "score": { "$lt": i64::from(progress.score) } },
            { "questions_answered": { "$lt": i64::from(progress.questions_answered) } },
        ]
    }
}

impl MongoStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            open_database(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let database = self.database().await;
        let indexes: [(&'static str, &'static str, Document); 4] = [
            (
                PLAYER_COLLECTION,
                "player_session_name_idx",
                doc! { "session_code": 1, "name": 1 },
            ),
            (
                SESSION_COLLECTION,
                "session_created_idx",
                doc! { "created_at": 1 },
            ),
            (
                LEDGER_COLLECTION,
                "ledger_status_idx",
                doc! { "status": 1, "created_at": 1 },
            ),
            (
                LEDGER_COLLECTION,
                "ledger_target_idx",
                doc! { "session_code": 1, "player_id": 1 },
            ),
        ];

        for (collection, name, keys) in indexes {
            let index = IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().name(Some(name.to_owned())).build())
                .build();
            database
                .collection::<Document>(collection)
                .create_index(index)
                .await
                .map_err(|source| MongoDaoError::EnsureIndex {
                    collection,
                    index: name,
                    source,
                })?;
        }

        Ok(())
    }

    async fn database(&self) -> Database {
        let guard = self.inner.state.read().await;
        guard.database.clone()
    }

    async fn players(&self) -> Collection<MongoPlayerDocument> {
        self.database().await.collection(PLAYER_COLLECTION)
    }

    async fn raw_players(&self) -> Collection<Document> {
        self.database().await.collection(PLAYER_COLLECTION)
    }

    async fn sessions(&self) -> Collection<MongoSessionDocument> {
        self.database().await.collection(SESSION_COLLECTION)
    }

    async fn raw_sessions(&self) -> Collection<Document> {
        self.database().await.collection(SESSION_COLLECTION)
    }

    async fn ledger(&self) -> Collection<MongoFailedUpdateDocument> {
        self.database().await.collection(LEDGER_COLLECTION)
    }

    async fn upsert_player(&self, player: PlayerEntity) -> MongoResult<()> {
        let document = MongoPlayerDocument::from(&player);
        self.players()
            .await
            .replace_one(doc! { "_id": player_key(&player.session_code, player.id) }, &document)
            .upsert(true)
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "upsert_player"))?;
        Ok(())
    }

    async fn find_player(&self, code: &str, player_id: Uuid) -> MongoResult<Option<PlayerEntity>> {
        self.players()
            .await
            .find_one(doc! { "_id": player_key(code, player_id) })
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "find_player"))?
            .map(PlayerEntity::try_from)
            .transpose()
    }

    async fn read_progress(&self, code: &str, player_id: Uuid) -> MongoResult<Option<Progress>> {
        let document = self
            .raw_players()
            .await
            .find_one(doc! { "_id": player_key(code, player_id) })
            .projection(doc! { "score": 1, "questions_answered": 1 })
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "read_progress"))?;

        Ok(document.map(|doc| Progress::new(counter(&doc, "score"), counter(&doc, "questions_answered"))))
    }

    async fn list_players(&self, code: &str) -> MongoResult<Vec<PlayerEntity>> {
        let documents: Vec<MongoPlayerDocument> = self
            .players()
            .await
            .find(doc! { "session_code": code })
            .sort(doc! { "joined_at": 1 })
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "list_players"))?
            .try_collect()
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "list_players"))?;

        documents.into_iter().map(PlayerEntity::try_from).collect()
    }

    async fn delete_player(&self, code: &str, player_id: Uuid) -> MongoResult<bool> {
        let result = self
            .players()
            .await
            .delete_one(doc! { "_id": player_key(code, player_id) })
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "delete_player"))?;
        Ok(result.deleted_count > 0)
    }

    async fn delete_players_named(&self, code: &str, name: &str) -> MongoResult<Vec<Uuid>> {
        let filter = doc! { "session_code": code, "name": name };
        let collection = self.raw_players().await;
        let keys: Vec<Document> = collection
            .find(filter.clone())
            .projection(doc! { "_id": 1 })
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "delete_players_named"))?
            .try_collect()
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "delete_players_named"))?;

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        collection
            .delete_many(filter)
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "delete_players_named"))?;

        Ok(keys
            .iter()
            .filter_map(|doc| doc.get_str("_id").ok().and_then(player_id_from_key))
            .collect())
    }

    async fn merge_progress(
        &self,
        code: &str,
        player_id: Uuid,
        progress: Progress,
    ) -> MongoResult<MergeOutcome> {
        let key = player_key(code, player_id);
        let mut filter = would_raise(progress);
        filter.insert("_id", key.clone());
        let update = doc! {
            "$max": {
                "score": i64::from(progress.score),
                "questions_answered": i64::from(progress.questions_answered),
            },
            "$set": { "updated_at": now() },
        };

        let collection = self.raw_players().await;
        let result = collection
            .update_one(filter, update)
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "merge_progress"))?;
        if result.matched_count > 0 {
            return Ok(MergeOutcome::Applied);
        }

        let exists = collection
            .count_documents(doc! { "_id": key })
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "merge_progress"))?;
        Ok(if exists == 0 {
            MergeOutcome::Missing
        } else {
            MergeOutcome::Unchanged
        })
    }

    async fn append_answer(
        &self,
        code: &str,
        player_id: Uuid,
        answer: AnswerEntity,
        question_limit: u32,
    ) -> MongoResult<MergeOutcome> {
        let key = player_key(code, player_id);
        let filter = doc! {
            "_id": key.clone(),
            "answers.question_ref": { "$ne": &answer.question_ref },
            "questions_answered": { "$lt": i64::from(question_limit) },
        };
        let update = doc! {
            "$push": { "answers": answer_document(&answer) },
            "$inc": {
                "score": i64::from(answer.points),
                "questions_answered": 1_i64,
            },
            "$set": { "updated_at": now() },
        };

        let collection = self.raw_players().await;
        let result = collection
            .update_one(filter, update)
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "append_answer"))?;
        if result.matched_count > 0 {
            return Ok(MergeOutcome::Applied);
        }

        let exists = collection
            .count_documents(doc! { "_id": key })
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "append_answer"))?;
        Ok(if exists == 0 {
            MergeOutcome::Missing
        } else {
            MergeOutcome::Unchanged
        })
    }

    async fn stamp_players(&self, code: &str, clock: PlayerClock, at: SystemTime) -> MongoResult<u64> {
        let field = match clock {
            PlayerClock::Started => "started_at",
            PlayerClock::Ended => "ended_at",
        };
        let at = DateTime::from_system_time(at);
        let result = self
            .raw_players()
            .await
            .update_many(
                doc! { "session_code": code, field: Bson::Null },
                doc! { "$set": { field: at, "updated_at": now() } },
            )
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "stamp_players"))?;
        Ok(result.modified_count)
    }

    async fn delete_session_players(&self, code: &str) -> MongoResult<u64> {
        let result = self
            .players()
            .await
            .delete_many(doc! { "session_code": code })
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "delete_session_players"))?;
        Ok(result.deleted_count)
    }

    async fn watch_players(&self, code: &str) -> MongoResult<ChangeStream<PlayerChange>> {
        let pattern = format!("^{code}:");
        let stream = self
            .players()
            .await
            .watch()
            .pipeline([doc! { "$match": { "documentKey._id": { "$regex": pattern } } }])
            .full_document(FullDocumentType::UpdateLookup)
            .await
            .map_err(MongoDaoError::query(PLAYER_COLLECTION, "watch_players"))?;

        Ok(stream
            .take_while(|event| future::ready(event.is_ok()))
            .filter_map(|event| future::ready(event.ok().and_then(player_change)))
            .boxed())
    }

    async fn create_session(&self, session: SessionEntity) -> MongoResult<bool> {
        let document = MongoSessionDocument::from(&session);
        match self.sessions().await.insert_one(&document).await {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(source) => Err(MongoDaoError::Query {
                collection: SESSION_COLLECTION,
                operation: "create_session",
                source,
            }),
        }
    }

    async fn find_session(&self, code: &str) -> MongoResult<Option<SessionEntity>> {
        self.sessions()
            .await
            .find_one(doc! { "_id": code })
            .await
            .map_err(MongoDaoError::query(SESSION_COLLECTION, "find_session"))?
            .map(SessionEntity::try_from)
            .transpose()
    }

    async fn update_session(&self, session: SessionEntity) -> MongoResult<bool> {
        let document = MongoSessionDocument::from(&session);
        let result = self
            .sessions()
            .await
            .replace_one(doc! { "_id": &session.code }, &document)
            .await
            .map_err(MongoDaoError::query(SESSION_COLLECTION, "update_session"))?;
        Ok(result.matched_count > 0)
    }

    async fn replace_roster_entry(&self, code: &str, entry: RosterEntry) -> MongoResult<bool> {
        let id = entry.id.to_string();
        let pipeline = vec![doc! {
            "$set": {
                "roster": {
                    "$concatArrays": [
                        {
                            "$filter": {
                                "input": { "$ifNull": ["$roster", []] },
                                "as": "entry",
                                "cond": {
                                    "$and": [
                                        { "$ne": ["$$entry.id", &id] },
                                        { "$ne": ["$$entry.name", &entry.name] },
                                    ]
                                },
                            }
                        },
                        [roster_document(&entry)],
                    ]
                },
                "updated_at": now(),
            }
        }];

        let result = self
            .raw_sessions()
            .await
            .update_one(doc! { "_id": code }, pipeline)
            .await
            .map_err(MongoDaoError::query(SESSION_COLLECTION, "replace_roster_entry"))?;
        Ok(result.matched_count > 0)
    }

    async fn merge_roster_progress(
        &self,
        code: &str,
        player_id: Uuid,
        progress: Progress,
    ) -> MongoResult<MergeOutcome> {
        let id = player_id.to_string();
        let mut element = would_raise(progress);
        element.insert("id", id.clone());
        let filter = doc! { "_id": code, "roster": { "$elemMatch": element } };
        let update = doc! {
            "$max": {
                "roster.$[entry].score": i64::from(progress.score),
                "roster.$[entry].questions_answered": i64::from(progress.questions_answered),
            },
            "$set": { "updated_at": now() },
        };

        let collection = self.raw_sessions().await;
        let result = collection
            .update_one(filter, update)
            .array_filters([doc! { "entry.id": &id }])
            .await
            .map_err(MongoDaoError::query(SESSION_COLLECTION, "merge_roster_progress"))?;
        if result.matched_count > 0 {
            return Ok(MergeOutcome::Applied);
        }

        let exists = collection
            .count_documents(doc! { "_id": code, "roster.id": &id })
            .await
            .map_err(MongoDaoError::query(SESSION_COLLECTION, "merge_roster_progress"))?;
        Ok(if exists == 0 {
            MergeOutcome::Missing
        } else {
            MergeOutcome::Unchanged
        })
    }

    async fn delete_session(&self, code: &str) -> MongoResult<bool> {
        let result = self
            .sessions()
            .await
            .delete_one(doc! { "_id": code })
            .await
            .map_err(MongoDaoError::query(SESSION_COLLECTION, "delete_session"))?;
        Ok(result.deleted_count > 0)
    }

    async fn sessions_created_before(&self, cutoff: SystemTime) -> MongoResult<Vec<String>> {
        let documents: Vec<Document> = self
            .raw_sessions()
            .await
            .find(doc! { "created_at": { "$lt": DateTime::from_system_time(cutoff) } })
            .projection(doc! { "_id": 1 })
            .await
            .map_err(MongoDaoError::query(SESSION_COLLECTION, "sessions_created_before"))?
            .try_collect()
            .await
            .map_err(MongoDaoError::query(SESSION_COLLECTION, "sessions_created_before"))?;

        Ok(documents
            .iter()
            .filter_map(|doc| doc.get_str("_id").ok().map(str::to_owned))
            .collect())
    }

    async fn watch_session(&self, code: &str) -> MongoResult<ChangeStream<SessionChange>> {
        let stream = self
            .sessions()
            .await
            .watch()
            .pipeline([doc! { "$match": { "documentKey._id": code } }])
            .full_document(FullDocumentType::UpdateLookup)
            .await
            .map_err(MongoDaoError::query(SESSION_COLLECTION, "watch_session"))?;

        Ok(stream
            .take_while(|event| future::ready(event.is_ok()))
            .filter_map(|event| future::ready(event.ok().and_then(session_change)))
            .boxed())
    }

    async fn insert_failed(&self, record: FailedUpdateEntity) -> MongoResult<()> {
        self.ledger()
            .await
            .insert_one(MongoFailedUpdateDocument::from(&record))
            .await
            .map_err(MongoDaoError::query(LEDGER_COLLECTION, "insert"))?;
        Ok(())
    }

    async fn find_failed(&self, id: Uuid) -> MongoResult<Option<FailedUpdateEntity>> {
        self.ledger()
            .await
            .find_one(doc! { "_id": id.to_string() })
            .await
            .map_err(MongoDaoError::query(LEDGER_COLLECTION, "find"))?
            .map(FailedUpdateEntity::try_from)
            .transpose()
    }

    async fn claim_failed(&self, id: Uuid) -> MongoResult<Option<FailedUpdateEntity>> {
        self.ledger()
            .await
            .find_one_and_update(
                doc! {
                    "_id": id.to_string(),
                    "status": FailedUpdateStatus::Pending.as_str(),
                },
                doc! {
                    "$set": {
                        "status": FailedUpdateStatus::Processing.as_str(),
                        "updated_at": now(),
                    }
                },
            )
            .return_document(ReturnDocument::After)
            .await
            .map_err(MongoDaoError::query(LEDGER_COLLECTION, "claim"))?
            .map(FailedUpdateEntity::try_from)
            .transpose()
    }

    async fn update_failed(&self, record: FailedUpdateEntity) -> MongoResult<()> {
        self.ledger()
            .await
            .replace_one(
                doc! { "_id": record.id.to_string() },
                MongoFailedUpdateDocument::from(&record),
            )
            .upsert(true)
            .await
            .map_err(MongoDaoError::query(LEDGER_COLLECTION, "update"))?;
        Ok(())
    }

    async fn list_pending(
        &self,
        scope: Option<(String, Uuid)>,
    ) -> MongoResult<Vec<FailedUpdateEntity>> {
        let mut filter = doc! { "status": FailedUpdateStatus::Pending.as_str() };
        if let Some((code, player_id)) = scope {
            filter.insert("session_code", code);
            filter.insert("player_id", player_id.to_string());
        }

        let documents: Vec<MongoFailedUpdateDocument> = self
            .ledger()
            .await
            .find(filter)
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(MongoDaoError::query(LEDGER_COLLECTION, "list_pending"))?
            .try_collect()
            .await
            .map_err(MongoDaoError::query(LEDGER_COLLECTION, "list_pending"))?;

        documents
            .into_iter()
            .map(FailedUpdateEntity::try_from)
            .collect()
    }

    async fn release_stale_claims(&self, cutoff: SystemTime) -> MongoResult<u64> {
        let result = self
            .ledger()
            .await
            .update_many(
                doc! {
                    "status": FailedUpdateStatus::Processing.as_str(),
                    "updated_at": { "$lt": DateTime::from_system_time(cutoff) },
                },
                doc! {
                    "$set": {
                        "status": FailedUpdateStatus::Pending.as_str(),
                        "updated_at": now(),
                    }
                },
            )
            .await
            .map_err(MongoDaoError::query(LEDGER_COLLECTION, "release_stale_claims"))?;
        Ok(result.modified_count)
    }

    async fn purge_finished(&self, cutoff: SystemTime) -> MongoResult<u64> {
        let result = self
            .ledger()
            .await
            .delete_many(doc! {
                "status": {
                    "$in": [
                        FailedUpdateStatus::Completed.as_str(),
                        FailedUpdateStatus::Failed.as_str(),
                    ]
                },
                "updated_at": { "$lt": DateTime::from_system_time(cutoff) },
            })
            .await
            .map_err(MongoDaoError::query(LEDGER_COLLECTION, "purge_finished"))?;
        Ok(result.deleted_count)
    }
}

fn player_change(event: ChangeStreamEvent<MongoPlayerDocument>) -> Option<PlayerChange> {
    match event.operation_type {
        OperationType::Insert | OperationType::Update | OperationType::Replace => {
            match event.full_document.map(PlayerEntity::try_from) {
                Some(Ok(player)) => Some(PlayerChange::Upserted(player)),
                _ => Some(PlayerChange::Resync),
            }
        }
        OperationType::Delete => event
            .document_key
            .as_ref()
            .and_then(|key| key.get_str("_id").ok())
            .and_then(player_id_from_key)
            .map(PlayerChange::Deleted)
            .or(Some(PlayerChange::Resync)),
        _ => Some(PlayerChange::Resync),
    }
}

fn session_change(event: ChangeStreamEvent<MongoSessionDocument>) -> Option<SessionChange> {
    match event.operation_type {
        OperationType::Insert | OperationType::Update | OperationType::Replace => {
            match event.full_document.map(SessionEntity::try_from) {
                Some(Ok(session)) => Some(SessionChange::Updated(session)),
                _ => Some(SessionChange::Resync),
            }
        }
        OperationType::Delete | OperationType::Drop => Some(SessionChange::Deleted),
        _ => Some(SessionChange::Resync),
    }
}

impl FastRecordStore for MongoStore {
    fn upsert_player(&self, player: PlayerEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.upsert_player(player).await.map_err(Into::into) })
    }

    fn find_player(
        &self,
        code: &str,
        player_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move { store.find_player(&code, player_id).await.map_err(Into::into) })
    }

    fn read_progress(
        &self,
        code: &str,
        player_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<Progress>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move { store.read_progress(&code, player_id).await.map_err(Into::into) })
    }

    fn list_players(&self, code: &str) -> BoxFuture<'static, StorageResult<Vec<PlayerEntity>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move { store.list_players(&code).await.map_err(Into::into) })
    }

    fn delete_player(&self, code: &str, player_id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move { store.delete_player(&code, player_id).await.map_err(Into::into) })
    }

    fn delete_players_named(
        &self,
        code: &str,
        name: &str,
    ) -> BoxFuture<'static, StorageResult<Vec<Uuid>>> {
        let store = self.clone();
        let code = code.to_owned();
        let name = name.to_owned();
        Box::pin(async move {
            store
                .delete_players_named(&code, &name)
                .await
                .map_err(Into::into)
        })
    }

    fn merge_progress(
        &self,
        code: &str,
        player_id: Uuid,
        progress: Progress,
    ) -> BoxFuture<'static, StorageResult<MergeOutcome>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store
                .merge_progress(&code, player_id, progress)
                .await
                .map_err(Into::into)
        })
    }

    fn append_answer(
        &self,
        code: &str,
        player_id: Uuid,
        answer: AnswerEntity,
        question_limit: u32,
    ) -> BoxFuture<'static, StorageResult<MergeOutcome>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store
                .append_answer(&code, player_id, answer, question_limit)
                .await
                .map_err(Into::into)
        })
    }

    fn stamp_players(
        &self,
        code: &str,
        clock: PlayerClock,
        at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move { store.stamp_players(&code, clock, at).await.map_err(Into::into) })
    }

    fn delete_session_players(&self, code: &str) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move { store.delete_session_players(&code).await.map_err(Into::into) })
    }

    fn watch_players(
        &self,
        code: &str,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<PlayerChange>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move { store.watch_players(&code).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}

impl AuthoritativeStore for MongoStore {
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
        Box::pin(async move { store.watch_session(&code).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}

impl RetryLedger for MongoStore {
    fn insert(&self, record: FailedUpdateEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert_failed(record).await.map_err(Into::into) })
    }

    fn find(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<FailedUpdateEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_failed(id).await.map_err(Into::into) })
    }

    fn claim(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<FailedUpdateEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.claim_failed(id).await.map_err(Into::into) })
    }

    fn update(&self, record: FailedUpdateEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.update_failed(record).await.map_err(Into::into) })
    }

    fn list_pending(
        &self,
        scope: Option<(String, Uuid)>,
    ) -> BoxFuture<'static, StorageResult<Vec<FailedUpdateEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_pending(scope).await.map_err(Into::into) })
    }

    fn release_stale_claims(&self, cutoff: SystemTime) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move { store.release_stale_claims(cutoff).await.map_err(Into::into) })
    }

    fn purge_finished(&self, cutoff: SystemTime) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move { store.purge_finished(cutoff).await.map_err(Into::into) })
    }
}
