#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::time::SystemTime;

use futures::{future::BoxFuture, stream::BoxStream};
use uuid::Uuid;

use crate::dao::models::{
    AnswerEntity, FailedUpdateEntity, MergeOutcome, PlayerEntity, Progress, RosterEntry,
    SessionEntity,
};
use crate::dao::storage::StorageResult;

/// Stream of change events scoped to one session.
pub type ChangeStream<T> = BoxStream<'static, T>;

/// Row-level change emitted by the fast record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerChange {
    /// A row was inserted or updated; carries the full row.
    Upserted(PlayerEntity),
    /// A row was deleted.
    Deleted(Uuid),
    /// The listener missed events and must re-read.
    Resync,
}

/// Document-level change emitted by the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    /// The session document changed; carries the full document.
    Updated(SessionEntity),
    /// The session document was deleted.
    Deleted,
    /// The listener missed events and must re-read.
    Resync,
}

/// Timestamp field set on every player of a session at a lifecycle edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerClock {
    /// `started_at`, set when play begins.
    Started,
    /// `ended_at`, set when the game finishes.
    Ended,
}

/// Per-player storage tuned for many concurrent partial writes.
pub trait FastRecordStore: Send + Sync {
    /// Insert or replace a player row keyed by (session, player id).
    fn upsert_player(&self, player: PlayerEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find_player(
        &self,
        code: &str,
        player_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>>;
    /// Read only the score/progress fields of a row.
    fn read_progress(
        &self,
        code: &str,
        player_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<Progress>>>;
    fn list_players(&self, code: &str) -> BoxFuture<'static, StorageResult<Vec<PlayerEntity>>>;
    fn delete_player(&self, code: &str, player_id: Uuid) -> BoxFuture<'static, StorageResult<bool>>;
    /// Delete every row of the session carrying `name`, returning the removed ids.
    fn delete_players_named(
        &self,
        code: &str,
        name: &str,
    ) -> BoxFuture<'static, StorageResult<Vec<Uuid>>>;
    /// Atomically max-merge score and progress into an existing row.
    fn merge_progress(
        &self,
        code: &str,
        player_id: Uuid,
        progress: Progress,
    ) -> BoxFuture<'static, StorageResult<MergeOutcome>>;
    /// Atomically append an answer unless its question was already answered.
    fn append_answer(
        &self,
        code: &str,
        player_id: Uuid,
        answer: AnswerEntity,
        question_limit: u32,
    ) -> BoxFuture<'static, StorageResult<MergeOutcome>>;
    /// Set a lifecycle timestamp on every row of the session that does not have it yet.
    fn stamp_players(
        &self,
        code: &str,
        clock: PlayerClock,
        at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<u64>>;
    fn delete_session_players(&self, code: &str) -> BoxFuture<'static, StorageResult<u64>>;
    /// Subscribe to row changes of one session.
    fn watch_players(
        &self,
        code: &str,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<PlayerChange>>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Whole-row session storage acting as the system of record.
pub trait AuthoritativeStore: Send + Sync {
    /// Insert a new session; returns `false` when the code is already taken.
    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<bool>>;
    fn find_session(&self, code: &str) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Replace the whole session row; returns `false` when it does not exist.
    fn update_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<bool>>;
    /// Drop roster entries sharing the id or name of `entry`, then append it.
    fn replace_roster_entry(
        &self,
        code: &str,
        entry: RosterEntry,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Max-merge progress into one roster entry, skipping the write when nothing changes.
    fn merge_roster_progress(
        &self,
        code: &str,
        player_id: Uuid,
        progress: Progress,
    ) -> BoxFuture<'static, StorageResult<MergeOutcome>>;
    fn delete_session(&self, code: &str) -> BoxFuture<'static, StorageResult<bool>>;
    /// Codes of sessions created before `cutoff`.
    fn sessions_created_before(
        &self,
        cutoff: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Vec<String>>>;
    /// Subscribe to changes of one session document.
    fn watch_session(
        &self,
        code: &str,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<SessionChange>>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Durable ledger of writes awaiting replay.
pub trait RetryLedger: Send + Sync {
    fn insert(&self, record: FailedUpdateEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<FailedUpdateEntity>>>;
    /// Atomically move a pending record to processing, returning the claimed record.
    fn claim(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<FailedUpdateEntity>>>;
    fn update(&self, record: FailedUpdateEntity) -> BoxFuture<'static, StorageResult<()>>;
    /// Pending records, oldest first, optionally restricted to one session and player.
    fn list_pending(
        &self,
        scope: Option<(String, Uuid)>,
    ) -> BoxFuture<'static, StorageResult<Vec<FailedUpdateEntity>>>;
    /// Return processing records last touched before `cutoff` to pending.
    fn release_stale_claims(&self, cutoff: SystemTime) -> BoxFuture<'static, StorageResult<u64>>;
    /// Delete completed and failed records last touched before `cutoff`.
    fn purge_finished(&self, cutoff: SystemTime) -> BoxFuture<'static, StorageResult<u64>>;
}
