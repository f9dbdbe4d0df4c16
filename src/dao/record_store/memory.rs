//! In-process store backends used for local development and tests.
//!
//! Each store keeps its rows in a [`DashMap`] and publishes changes through a Tokio broadcast
//! channel. [`StoreFaults`] lets tests take a store offline or make it reject writes as rate
//! limited.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    time::SystemTime,
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{StreamExt, future::BoxFuture};
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use uuid::Uuid;

use super::{
    AuthoritativeStore, ChangeStream, FastRecordStore, PlayerChange, PlayerClock, RetryLedger,
    SessionChange,
};
use crate::dao::{
    models::{
        AnswerEntity, FailedUpdateEntity, FailedUpdateStatus, MergeOutcome, PlayerEntity,
        Progress, RosterEntry, SessionEntity,
    },
    storage::{StorageError, StorageResult},
};

const EVENT_CAPACITY: usize = 1024;

const MODE_ONLINE: u8 = 0;
const MODE_OFFLINE: u8 = 1;
const MODE_RATE_LIMITED: u8 = 2;

/// Failure raised while a memory store is switched offline.
#[derive(Debug, Error)]
#[error("in-memory {store} store is offline ({operation})")]
pub struct OfflineError {
    store: &'static str,
    operation: &'static str,
}

/// Fault injection switches shared by every memory store.
#[derive(Debug, Default)]
pub struct StoreFaults {
    mode: AtomicU8,
    fail_next: AtomicU32,
}

impl StoreFaults {
    /// Make every operation fail as unavailable (or restore normal operation).
    pub fn set_offline(&self, offline: bool) {
        let mode = if offline { MODE_OFFLINE } else { MODE_ONLINE };
        self.mode.store(mode, Ordering::SeqCst);
    }

    /// Make every operation fail as rate limited (or restore normal operation).
    pub fn set_rate_limited(&self, limited: bool) {
        let mode = if limited { MODE_RATE_LIMITED } else { MODE_ONLINE };
        self.mode.store(mode, Ordering::SeqCst);
    }

    /// Fail the next `count` operations as unavailable, then recover.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn check(&self, store: &'static str, operation: &'static str) -> StorageResult<()> {
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(offline(store, operation));
        }

        match self.mode.load(Ordering::SeqCst) {
            MODE_OFFLINE => Err(offline(store, operation)),
            MODE_RATE_LIMITED => Err(StorageError::rate_limited(format!(
                "in-memory {store} store throttled {operation}"
            ))),
            _ => Ok(()),
        }
    }
}

fn offline(store: &'static str, operation: &'static str) -> StorageError {
    let err = OfflineError { store, operation };
    StorageError::unavailable(err.to_string(), err)
}

// ---------------------------------------------------------------------------
// Fast record store
// ---------------------------------------------------------------------------

/// Per-player rows grouped by session code.
#[derive(Clone)]
pub struct MemoryFastStore {
    inner: Arc<MemoryFastInner>,
}

struct MemoryFastInner {
    sessions: DashMap<String, IndexMap<Uuid, PlayerEntity>>,
    events: broadcast::Sender<(String, PlayerChange)>,
    faults: StoreFaults,
    progress_writes: AtomicU64,
}

impl Default for MemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFastStore {
    /// Empty store.
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MemoryFastInner {
                sessions: DashMap::new(),
                events,
                faults: StoreFaults::default(),
                progress_writes: AtomicU64::new(0),
            }),
        }
    }

    /// Fault injection switches for this store.
    pub fn faults(&self) -> &StoreFaults {
        &self.inner.faults
    }

    /// Number of progress merges that reached the store.
    pub fn progress_writes(&self) -> u64 {
        self.inner.progress_writes.load(Ordering::SeqCst)
    }

    /// Live change-stream listeners.
    pub fn watcher_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    fn check(&self, operation: &'static str) -> StorageResult<()> {
        self.inner.faults.check("fast", operation)
    }

    fn publish(&self, code: &str, change: PlayerChange) {
        let _ = self.inner.events.send((code.to_owned(), change));
    }

    /// Mutate one row under the session lock and publish the row if it changed.
    fn mutate_player<F>(&self, code: &str, player_id: Uuid, mutate: F) -> MergeOutcome
    where
        F: FnOnce(&mut PlayerEntity) -> MergeOutcome,
    {
        let changed = {
            let Some(mut players) = self.inner.sessions.get_mut(code) else {
                return MergeOutcome::Missing;
            };
            let Some(player) = players.get_mut(&player_id) else {
                return MergeOutcome::Missing;
            };
            match mutate(player) {
                MergeOutcome::Applied => player.clone(),
                other => return other,
            }
        };

        self.publish(code, PlayerChange::Upserted(changed));
        MergeOutcome::Applied
    }
}

impl FastRecordStore for MemoryFastStore {
    fn upsert_player(&self, player: PlayerEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.check("upsert_player")?;
            let code = player.session_code.clone();
            store
                .inner
                .sessions
                .entry(code.clone())
                .or_default()
                .insert(player.id, player.clone());
            store.publish(&code, PlayerChange::Upserted(player));
            Ok(())
        })
    }

    fn find_player(
        &self,
        code: &str,
        player_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("find_player")?;
            Ok(store
                .inner
                .sessions
                .get(&code)
                .and_then(|players| players.get(&player_id).cloned()))
        })
    }

    fn read_progress(
        &self,
        code: &str,
        player_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<Progress>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("read_progress")?;
            Ok(store
                .inner
                .sessions
                .get(&code)
                .and_then(|players| players.get(&player_id).map(PlayerEntity::progress)))
        })
    }

    fn list_players(&self, code: &str) -> BoxFuture<'static, StorageResult<Vec<PlayerEntity>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("list_players")?;
            Ok(store
                .inner
                .sessions
                .get(&code)
                .map(|players| players.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn delete_player(&self, code: &str, player_id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("delete_player")?;
            let removed = store
                .inner
                .sessions
                .get_mut(&code)
                .and_then(|mut players| players.shift_remove(&player_id))
                .is_some();
            if removed {
                store.publish(&code, PlayerChange::Deleted(player_id));
            }
            Ok(removed)
        })
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
            store.check("delete_players_named")?;
            let removed: Vec<Uuid> = match store.inner.sessions.get_mut(&code) {
                Some(mut players) => {
                    let ids: Vec<Uuid> = players
                        .values()
                        .filter(|player| player.name == name)
                        .map(|player| player.id)
                        .collect();
                    for id in &ids {
                        players.shift_remove(id);
                    }
                    ids
                }
                None => Vec::new(),
            };
            for id in &removed {
                store.publish(&code, PlayerChange::Deleted(*id));
            }
            Ok(removed)
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
            store.check("merge_progress")?;
            store.inner.progress_writes.fetch_add(1, Ordering::SeqCst);
            Ok(store.mutate_player(&code, player_id, |player| {
                player.merge_progress(progress)
            }))
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
            store.check("append_answer")?;
            Ok(store.mutate_player(&code, player_id, |player| {
                player.append_answer(answer, question_limit)
            }))
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
        Box::pin(async move {
            store.check("stamp_players")?;
            let stamped: Vec<PlayerEntity> = match store.inner.sessions.get_mut(&code) {
                Some(mut players) => players
                    .values_mut()
                    .filter_map(|player| {
                        let slot = match clock {
                            PlayerClock::Started => &mut player.started_at,
                            PlayerClock::Ended => &mut player.ended_at,
                        };
                        if slot.is_some() {
                            return None;
                        }
                        *slot = Some(at);
                        player.updated_at = at;
                        Some(player.clone())
                    })
                    .collect(),
                None => Vec::new(),
            };
            let count = stamped.len() as u64;
            for player in stamped {
                store.publish(&code, PlayerChange::Upserted(player));
            }
            Ok(count)
        })
    }

    fn delete_session_players(&self, code: &str) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("delete_session_players")?;
            let removed = store
                .inner
                .sessions
                .remove(&code)
                .map(|(_, players)| players)
                .unwrap_or_default();
            for id in removed.keys() {
                store.publish(&code, PlayerChange::Deleted(*id));
            }
            Ok(removed.len() as u64)
        })
    }

    fn watch_players(
        &self,
        code: &str,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<PlayerChange>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("watch_players")?;
            let receiver = store.inner.events.subscribe();
            let stream = BroadcastStream::new(receiver)
                .filter_map(move |item| {
                    let change = match item {
                        Ok((event_code, change)) if event_code == code => Some(change),
                        Ok(_) => None,
                        Err(BroadcastStreamRecvError::Lagged(_)) => Some(PlayerChange::Resync),
                    };
                    futures::future::ready(change)
                })
                .boxed();
            Ok(stream)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.check("health_check") })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.check("try_reconnect") })
    }
}

// ---------------------------------------------------------------------------
// Authoritative store
// ---------------------------------------------------------------------------

/// Session documents keyed by join code.
#[derive(Clone)]
pub struct MemoryAuthoritativeStore {
    inner: Arc<MemoryAuthoritativeInner>,
}

struct MemoryAuthoritativeInner {
    sessions: DashMap<String, SessionEntity>,
    events: broadcast::Sender<(String, SessionChange)>,
    faults: StoreFaults,
}

impl Default for MemoryAuthoritativeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuthoritativeStore {
    /// Empty store.
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MemoryAuthoritativeInner {
                sessions: DashMap::new(),
                events,
                faults: StoreFaults::default(),
            }),
        }
    }

    /// Fault injection switches for this store.
    pub fn faults(&self) -> &StoreFaults {
        &self.inner.faults
    }

    /// Live change-stream listeners.
    pub fn watcher_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    fn check(&self, operation: &'static str) -> StorageResult<()> {
        self.inner.faults.check("authoritative", operation)
    }

    fn publish(&self, code: &str, change: SessionChange) {
        let _ = self.inner.events.send((code.to_owned(), change));
    }
}

impl AuthoritativeStore for MemoryAuthoritativeStore {
    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store.check("create_session")?;
            let code = session.code.clone();
            let inserted = match store.inner.sessions.entry(code.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(session.clone());
                    true
                }
            };
            if inserted {
                store.publish(&code, SessionChange::Updated(session));
            }
            Ok(inserted)
        })
    }

    fn find_session(&self, code: &str) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("find_session")?;
            Ok(store.inner.sessions.get(&code).map(|entry| entry.clone()))
        })
    }

    fn update_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store.check("update_session")?;
            let code = session.code.clone();
            let updated = match store.inner.sessions.get_mut(&code) {
                Some(mut existing) => {
                    *existing = session.clone();
                    true
                }
                None => false,
            };
            if updated {
                store.publish(&code, SessionChange::Updated(session));
            }
            Ok(updated)
        })
    }

    fn replace_roster_entry(
        &self,
        code: &str,
        entry: RosterEntry,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("replace_roster_entry")?;
            let updated = store.inner.sessions.get_mut(&code).map(|mut session| {
                session.replace_roster_entry(entry);
                session.updated_at = SystemTime::now();
                session.clone()
            });
            match updated {
                Some(session) => {
                    store.publish(&code, SessionChange::Updated(session));
                    Ok(true)
                }
                None => Ok(false),
            }
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
            store.check("merge_roster_progress")?;
            let changed = {
                let Some(mut session) = store.inner.sessions.get_mut(&code) else {
                    return Ok(MergeOutcome::Missing);
                };
                let Some(entry) = session.roster.iter_mut().find(|entry| entry.id == player_id)
                else {
                    return Ok(MergeOutcome::Missing);
                };
                match entry.merge_progress(progress) {
                    MergeOutcome::Applied => {
                        session.updated_at = SystemTime::now();
                        session.clone()
                    }
                    other => return Ok(other),
                }
            };
            store.publish(&code, SessionChange::Updated(changed));
            Ok(MergeOutcome::Applied)
        })
    }

    fn delete_session(&self, code: &str) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("delete_session")?;
            let removed = store.inner.sessions.remove(&code).is_some();
            if removed {
                store.publish(&code, SessionChange::Deleted);
            }
            Ok(removed)
        })
    }

    fn sessions_created_before(
        &self,
        cutoff: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check("sessions_created_before")?;
            Ok(store
                .inner
                .sessions
                .iter()
                .filter(|entry| entry.created_at < cutoff)
                .map(|entry| entry.key().clone())
                .collect())
        })
    }

    fn watch_session(
        &self,
        code: &str,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<SessionChange>>> {
        let store = self.clone();
        let code = code.to_owned();
        Box::pin(async move {
            store.check("watch_session")?;
            let receiver = store.inner.events.subscribe();
            let stream = BroadcastStream::new(receiver)
                .filter_map(move |item| {
                    let change = match item {
                        Ok((event_code, change)) if event_code == code => Some(change),
                        Ok(_) => None,
                        Err(BroadcastStreamRecvError::Lagged(_)) => Some(SessionChange::Resync),
                    };
                    futures::future::ready(change)
                })
                .boxed();
            Ok(stream)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.check("health_check") })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.check("try_reconnect") })
    }
}

// ---------------------------------------------------------------------------
// Retry ledger
// ---------------------------------------------------------------------------

/// Retry records keyed by id.
#[derive(Clone)]
pub struct MemoryRetryLedger {
    inner: Arc<MemoryLedgerInner>,
}

struct MemoryLedgerInner {
    records: DashMap<Uuid, FailedUpdateEntity>,
    faults: StoreFaults,
}

impl Default for MemoryRetryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRetryLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryLedgerInner {
                records: DashMap::new(),
                faults: StoreFaults::default(),
            }),
        }
    }

    /// Fault injection switches for this ledger.
    pub fn faults(&self) -> &StoreFaults {
        &self.inner.faults
    }

    /// Number of records currently held, whatever their status.
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    /// Whether the ledger holds no record.
    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    fn check(&self, operation: &'static str) -> StorageResult<()> {
        self.inner.faults.check("ledger", operation)
    }
}

impl RetryLedger for MemoryRetryLedger {
    fn insert(&self, record: FailedUpdateEntity) -> BoxFuture<'static, StorageResult<()>> {
        let ledger = self.clone();
        Box::pin(async move {
            ledger.check("insert")?;
            ledger.inner.records.insert(record.id, record);
            Ok(())
        })
    }

    fn find(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<FailedUpdateEntity>>> {
        let ledger = self.clone();
        Box::pin(async move {
            ledger.check("find")?;
            Ok(ledger.inner.records.get(&id).map(|entry| entry.clone()))
        })
    }

    fn claim(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<FailedUpdateEntity>>> {
        let ledger = self.clone();
        Box::pin(async move {
            ledger.check("claim")?;
            let Some(mut record) = ledger.inner.records.get_mut(&id) else {
                return Ok(None);
            };
            if record.status != FailedUpdateStatus::Pending {
                return Ok(None);
            }
            record.status = FailedUpdateStatus::Processing;
            record.updated_at = SystemTime::now();
            Ok(Some(record.clone()))
        })
    }

    fn update(&self, record: FailedUpdateEntity) -> BoxFuture<'static, StorageResult<()>> {
        let ledger = self.clone();
        Box::pin(async move {
            ledger.check("update")?;
            ledger.inner.records.insert(record.id, record);
            Ok(())
        })
    }

    fn list_pending(
        &self,
        scope: Option<(String, Uuid)>,
    ) -> BoxFuture<'static, StorageResult<Vec<FailedUpdateEntity>>> {
        let ledger = self.clone();
        Box::pin(async move {
            ledger.check("list_pending")?;
            let mut pending: Vec<FailedUpdateEntity> = ledger
                .inner
                .records
                .iter()
                .filter(|entry| entry.status == FailedUpdateStatus::Pending)
                .filter(|entry| match &scope {
                    Some((code, player_id)) => {
                        &entry.session_code == code && entry.player_id == *player_id
                    }
                    None => true,
                })
                .map(|entry| entry.clone())
                .collect();
            pending.sort_by_key(|record| record.created_at);
            Ok(pending)
        })
    }

    fn release_stale_claims(&self, cutoff: SystemTime) -> BoxFuture<'static, StorageResult<u64>> {
        let ledger = self.clone();
        Box::pin(async move {
            ledger.check("release_stale_claims")?;
            let mut released = 0;
            for mut entry in ledger.inner.records.iter_mut() {
                if entry.status == FailedUpdateStatus::Processing && entry.updated_at < cutoff {
                    entry.status = FailedUpdateStatus::Pending;
                    entry.updated_at = SystemTime::now();
                    released += 1;
                }
            }
            Ok(released)
        })
    }

    fn purge_finished(&self, cutoff: SystemTime) -> BoxFuture<'static, StorageResult<u64>> {
        let ledger = self.clone();
        Box::pin(async move {
            ledger.check("purge_finished")?;
            let before = ledger.inner.records.len();
            ledger
                .inner
                .records
                .retain(|_, record| !(record.status.is_finished() && record.updated_at < cutoff));
            Ok((before - ledger.inner.records.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dao::models::{SessionSettings, UpdatePayload};

    fn player(code: &str, name: &str) -> PlayerEntity {
        PlayerEntity::new(Uuid::new_v4(), code, name, None, false)
    }

    #[tokio::test]
    async fn merge_progress_reports_stale_writes() {
        let store = MemoryFastStore::new();
        let ada = player("111111", "ada");
        store.upsert_player(ada.clone()).await.unwrap();

        let first = store
            .merge_progress("111111", ada.id, Progress::new(50, 5))
            .await
            .unwrap();
        let stale = store
            .merge_progress("111111", ada.id, Progress::new(40, 5))
            .await
            .unwrap();
        let missing = store
            .merge_progress("111111", Uuid::new_v4(), Progress::new(1, 1))
            .await
            .unwrap();

        assert_eq!(first, MergeOutcome::Applied);
        assert_eq!(stale, MergeOutcome::Unchanged);
        assert_eq!(missing, MergeOutcome::Missing);
        assert_eq!(store.progress_writes(), 3);
    }

    #[tokio::test]
    async fn watch_players_only_sees_its_session() {
        let store = MemoryFastStore::new();
        let mut stream = store.watch_players("111111").await.unwrap();

        store.upsert_player(player("222222", "other")).await.unwrap();
        let ada = player("111111", "ada");
        store.upsert_player(ada.clone()).await.unwrap();

        let change = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, PlayerChange::Upserted(ada));
    }

    #[tokio::test]
    async fn faults_fail_then_recover() {
        let store = MemoryFastStore::new();
        store.faults().fail_next(1);
        assert!(store.list_players("111111").await.is_err());
        assert!(store.list_players("111111").await.is_ok());

        store.faults().set_rate_limited(true);
        let err = store.list_players("111111").await.unwrap_err();
        assert!(err.is_rate_limited());
        store.faults().set_rate_limited(false);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn create_session_refuses_duplicate_codes() {
        let store = MemoryAuthoritativeStore::new();
        let host = PlayerEntity::new(Uuid::new_v4(), "333333", "host", None, true);
        let settings = SessionSettings {
            question_count: 5,
            time_limit_secs: 10,
            countdown_secs: None,
        };
        let session = SessionEntity::new("333333", &host, settings, "quiz");

        assert!(store.create_session(session.clone()).await.unwrap());
        assert!(!store.create_session(session).await.unwrap());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let ledger = MemoryRetryLedger::new();
        let record = FailedUpdateEntity::pending(
            "444444",
            Uuid::new_v4(),
            UpdatePayload::Score {
                score: 1,
                questions_answered: 1,
            },
            3,
        );
        ledger.insert(record.clone()).await.unwrap();

        assert!(ledger.claim(record.id).await.unwrap().is_some());
        assert!(ledger.claim(record.id).await.unwrap().is_none());
        assert!(ledger.list_pending(None).await.unwrap().is_empty());
    }
}
