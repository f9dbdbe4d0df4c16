//! The synchronization engine: one owner for the facade, the update queue, the retry store,
//! the change notifier and the recovery sweep.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use tokio::{sync::Mutex, task::JoinHandle, time::interval};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    dao::{
        models::{
            AnswerEntity, FailedUpdateEntity, MergeOutcome, PlayerEntity, SessionEntity,
            SessionSettings, SessionStatus, UpdateKind, UpdatePayload,
        },
        record_store::{
            AuthoritativeStore, FastRecordStore, RetryLedger,
            memory::{MemoryAuthoritativeStore, MemoryFastStore, MemoryRetryLedger},
        },
    },
    error::SyncError,
    services::{
        backoff::BackoffPolicy,
        change_notifier::{ChangeNotifier, RoomNotice, Subscription},
        retry_store::{ProcessReport, RetryHandler, RetryHandlers, RetryStore},
        sync_facade::{PlayerInfo, SyncFacade},
        update_queue::{FlushReport, UpdateQueue},
    },
    state::room::Room,
};

/// Store handles the engine is built from.
#[derive(Clone)]
pub struct EngineStores {
    /// Low-latency player rows.
    pub fast: Arc<dyn FastRecordStore>,
    /// Session documents and the roster.
    pub authoritative: Arc<dyn AuthoritativeStore>,
    /// Durable retry entries.
    pub ledger: Arc<dyn RetryLedger>,
}

impl EngineStores {
    /// In-process stores for tests and local runs.
    pub fn memory() -> Self {
        Self {
            fast: Arc::new(MemoryFastStore::new()),
            authoritative: Arc::new(MemoryAuthoritativeStore::new()),
            ledger: Arc::new(MemoryRetryLedger::new()),
        }
    }
}

/// Counts produced by one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale claims returned to pending.
    pub released: u64,
    /// Replay results over every due group.
    pub replayed: ProcessReport,
    /// Finished ledger records purged.
    pub purged: u64,
    /// Stale sessions torn down.
    pub removed_sessions: usize,
}

/// Caller-facing API over both stores.
pub struct SyncEngine {
    facade: Arc<SyncFacade>,
    queue: UpdateQueue,
    retry: Arc<RetryStore>,
    notifier: ChangeNotifier,
    config: EngineConfig,
    sweep: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl SyncEngine {
    /// Wire the facade, queue, retry store and notifier over `stores`.
    /// Background sweeping starts with [`Self::start_recovery_sweep`].
    pub fn new(stores: EngineStores, config: EngineConfig) -> Self {
        let config = config.sanitized();
        let backoff = BackoffPolicy::from(config.backoff.clone());
        let facade = Arc::new(SyncFacade::new(
            stores.fast,
            stores.authoritative,
            config.sessions.clone(),
        ));
        let retry = Arc::new(RetryStore::new(
            stores.ledger,
            backoff.clone(),
            config.retry.clone(),
        ));
        let queue = UpdateQueue::new(facade.clone(), retry.clone(), backoff, config.queue.clone());
        let notifier = ChangeNotifier::new(facade.clone(), config.notifier.clone());

        Self {
            facade,
            queue,
            retry,
            notifier,
            config,
            sweep: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Engine backed by fresh in-memory stores.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(EngineStores::memory(), config)
    }

    /// Effective configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Direct store access, bypassing the queue.
    pub fn facade(&self) -> &Arc<SyncFacade> {
        &self.facade
    }

    /// Create a waiting session with a fresh join code.
    pub async fn try_create_session(
        &self,
        host: PlayerInfo,
        settings: SessionSettings,
        quiz_ref: String,
    ) -> Result<SessionEntity, SyncError> {
        self.facade.try_create_session(host, settings, quiz_ref).await
    }

    /// Create a session; `None` when it could not be stored.
    pub async fn create_session(
        &self,
        host: PlayerInfo,
        settings: SessionSettings,
        quiz_ref: String,
    ) -> Option<SessionEntity> {
        self.facade.create_session(host, settings, quiz_ref).await
    }

    /// Session document, from cache when the authoritative store is down.
    pub async fn try_get_session(&self, code: &str) -> Result<SessionEntity, SyncError> {
        self.facade.try_get_session(code).await
    }

    /// `None` when the session is unknown or unreadable.
    pub async fn get_session(&self, code: &str) -> Option<SessionEntity> {
        self.facade.get_session(code).await
    }

    /// Session metadata with the merged player list.
    pub async fn try_get_room(&self, code: &str) -> Result<Room, SyncError> {
        self.facade.try_get_room(code).await
    }

    /// Session metadata with the merged player list.
    pub async fn get_room(&self, code: &str) -> Option<Room> {
        self.facade.get_room(code).await
    }

    /// Add a player to a waiting session; a repeated name replaces the older record.
    pub async fn try_join_session(
        &self,
        code: &str,
        info: PlayerInfo,
    ) -> Result<PlayerEntity, SyncError> {
        self.facade.try_join_session(code, info).await
    }

    /// `None` when the join was rejected or could not be stored.
    pub async fn join_session(&self, code: &str, info: PlayerInfo) -> Option<PlayerEntity> {
        self.facade.join_session(code, info).await
    }

    /// Write score and progress now; stale values are kept out by the per-field max.
    pub async fn try_update_score(
        &self,
        code: &str,
        player_id: Uuid,
        score: u32,
        questions_answered: u32,
    ) -> Result<MergeOutcome, SyncError> {
        self.facade
            .try_update_score(code, player_id, score, questions_answered)
            .await
    }

    /// Write score and progress now, bypassing the queue.
    pub async fn update_score(
        &self,
        code: &str,
        player_id: Uuid,
        score: u32,
        questions_answered: u32,
    ) -> bool {
        self.facade
            .update_score(code, player_id, score, questions_answered)
            .await
    }

    /// Append an answer unless that question was already answered.
    pub async fn try_record_answer(
        &self,
        code: &str,
        player_id: Uuid,
        answer: AnswerEntity,
    ) -> Result<MergeOutcome, SyncError> {
        self.facade.try_record_answer(code, player_id, answer).await
    }

    /// `true` when the answer was stored or already present.
    pub async fn record_answer(&self, code: &str, player_id: Uuid, answer: AnswerEntity) -> bool {
        self.facade.record_answer(code, player_id, answer).await
    }

    /// Move the session forward. Finishing flushes queued scores before reconciling.
    pub async fn try_transition_status(
        &self,
        code: &str,
        to: SessionStatus,
    ) -> Result<SessionEntity, SyncError> {
        if to == SessionStatus::Finished {
            let report = self.queue.flush_now().await;
            debug!(code = %code, written = report.written, "flushed queue before finishing");
        }
        self.facade.try_transition_status(code, to).await
    }

    /// Logs the failure and returns `false` instead of an error.
    pub async fn transition_status(&self, code: &str, to: SessionStatus) -> bool {
        match self.try_transition_status(code, to).await {
            Ok(_) => true,
            Err(err) => {
                warn!(code = %code, to = to.as_str(), error = %err, "status transition failed");
                false
            }
        }
    }

    /// Re-run reconciliation of a finished session.
    pub async fn reconcile(&self, code: &str) -> Result<SessionEntity, SyncError> {
        self.facade.try_reconcile(code).await
    }

    /// Follow a session; the callback fires once right away with the current state.
    pub async fn subscribe<F>(&self, code: &str, callback: F) -> Result<Subscription, SyncError>
    where
        F: Fn(RoomNotice) + Send + Sync + 'static,
    {
        self.notifier.subscribe(code, callback).await
    }

    /// Live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.notifier.active_subscriptions()
    }

    /// Queue a score update; repeated updates for one player collapse before the flush.
    pub async fn enqueue_score_update(
        &self,
        code: &str,
        player_id: Uuid,
        score: u32,
        questions_answered: u32,
    ) {
        self.queue
            .enqueue(code, player_id, score, questions_answered)
            .await;
    }

    /// Write every queued update now.
    pub async fn flush_now(&self) -> FlushReport {
        self.queue.flush_now().await
    }

    /// Queued entries awaiting a flush.
    pub async fn queued_updates(&self) -> usize {
        self.queue.len().await
    }

    /// Record a write for later replay.
    pub async fn store_failed_update(
        &self,
        code: &str,
        player_id: Uuid,
        payload: UpdatePayload,
    ) -> Result<FailedUpdateEntity, SyncError> {
        self.retry.store_failed_update(code, player_id, payload).await
    }

    /// Pending ledger records of one player.
    pub async fn pending_updates(
        &self,
        code: &str,
        player_id: Uuid,
    ) -> Result<Vec<FailedUpdateEntity>, SyncError> {
        self.retry.get_pending_updates(code, player_id).await
    }

    /// Replay a player's pending records with the default handlers.
    pub async fn process_pending_updates(
        &self,
        code: &str,
        player_id: Uuid,
    ) -> Result<ProcessReport, SyncError> {
        let handlers = self.default_handlers(code, player_id);
        self.retry
            .process_pending_updates(code, player_id, &handlers)
            .await
    }

    /// Replay a player's pending records with caller-supplied handlers.
    pub async fn process_pending_updates_with(
        &self,
        code: &str,
        player_id: Uuid,
        handlers: &RetryHandlers,
    ) -> Result<ProcessReport, SyncError> {
        self.retry
            .process_pending_updates(code, player_id, handlers)
            .await
    }

    /// Score replays go through `update_score`, answers through `record_answer`.
    fn default_handlers(&self, code: &str, player_id: Uuid) -> RetryHandlers {
        let score_facade = self.facade.clone();
        let score_code = code.to_owned();
        let score: RetryHandler = Arc::new(move |payload| {
            let facade = score_facade.clone();
            let code = score_code.clone();
            Box::pin(async move {
                match payload {
                    UpdatePayload::Score {
                        score,
                        questions_answered,
                    } => facade
                        .try_update_score(&code, player_id, score, questions_answered)
                        .await
                        .map(|_| ()),
                    other => Err(SyncError::InvalidInput(format!(
                        "score handler received {:?} payload",
                        other.kind()
                    ))),
                }
            })
        });

        let answer_facade = self.facade.clone();
        let answer_code = code.to_owned();
        let answer: RetryHandler = Arc::new(move |payload| {
            let facade = answer_facade.clone();
            let code = answer_code.clone();
            Box::pin(async move {
                match payload {
                    UpdatePayload::Answer { answer } => facade
                        .try_record_answer(&code, player_id, answer)
                        .await
                        .map(|_| ()),
                    other => Err(SyncError::InvalidInput(format!(
                        "answer handler received {:?} payload",
                        other.kind()
                    ))),
                }
            })
        });

        RetryHandlers::from([(UpdateKind::Score, score), (UpdateKind::Answer, answer)])
    }

    /// Drop queued updates of the session, then delete its rows and document.
    pub async fn try_teardown_session(&self, code: &str) -> Result<bool, SyncError> {
        let discarded = self.queue.discard_session(code).await;
        if discarded > 0 {
            debug!(code = %code, discarded, "dropped queued updates of removed session");
        }
        self.facade.try_teardown_session(code).await
    }

    /// Delete a session and release everything the engine holds for it.
    pub async fn teardown_session(&self, code: &str) -> bool {
        match self.try_teardown_session(code).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(code = %code, error = %err, "session teardown failed");
                false
            }
        }
    }

    /// Probe both stores.
    pub async fn health(&self) -> Result<(), SyncError> {
        self.facade.health().await
    }

    /// Reconnect both stores.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.facade.reconnect().await
    }

    /// One pass of the recovery sweep.
    ///
    /// Releases abandoned claims, replays due ledger groups, purges old ledger records and
    /// tears down sessions older than the configured age.
    pub async fn run_recovery_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.retry.release_stale_claims().await {
            Ok(released) => report.released = released,
            Err(err) => warn!(error = %err, "failed to release stale retry claims"),
        }

        match self.retry.due_groups(SystemTime::now()).await {
            Ok(groups) => {
                for (code, player_id) in groups {
                    match self.process_pending_updates(&code, player_id).await {
                        Ok(processed) => {
                            report.replayed.succeeded += processed.succeeded;
                            report.replayed.failed += processed.failed;
                        }
                        Err(err) => {
                            warn!(code = %code, player_id = %player_id, error = %err, "replay failed")
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to list due retry records"),
        }

        match self.retry.cleanup_old_records(self.retry.retention_days()).await {
            Ok(purged) => report.purged = purged,
            Err(err) => warn!(error = %err, "failed to purge retry records"),
        }

        let cutoff = SystemTime::now() - self.config.retry.stale_session_age;
        match self
            .facade
            .authoritative_store()
            .sessions_created_before(cutoff)
            .await
        {
            Ok(codes) => {
                for code in codes {
                    if self.teardown_session(&code).await {
                        info!(code = %code, "removed stale session");
                        report.removed_sessions += 1;
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to list stale sessions"),
        }

        report
    }

    /// Spawn the periodic recovery sweep unless it is disabled or already running.
    pub async fn start_recovery_sweep(self: &Arc<Self>) {
        if !self.config.retry.sweep_enabled || self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.sweep.lock().await;
        if slot.is_some() {
            return;
        }

        let engine: Weak<Self> = Arc::downgrade(self);
        let period = self.config.retry.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let report = engine.run_recovery_sweep().await;
                debug!(
                    released = report.released,
                    succeeded = report.replayed.succeeded,
                    failed = report.replayed.failed,
                    purged = report.purged,
                    removed_sessions = report.removed_sessions,
                    "recovery sweep finished"
                );
            }
        }));
        info!(interval_ms = period.as_millis(), "recovery sweep started");
    }

    /// Stop background work, flush queued updates and detach every subscription.
    pub async fn dispose(&self) -> FlushReport {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return FlushReport::default();
        }
        if let Some(sweep) = self.sweep.lock().await.take() {
            sweep.abort();
        }
        let report = self.queue.flush_now().await;
        self.notifier.close_all();
        info!(
            written = report.written,
            requeued = report.requeued,
            "sync engine disposed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn engine() -> SyncEngine {
        let mut config = EngineConfig::default();
        config.queue.flush_delay = Duration::from_secs(60);
        config.backoff.initial_delay = Duration::ZERO;
        config.backoff.max_delay = Duration::ZERO;
        config.backoff.max_attempts = 1;
        SyncEngine::in_memory(config)
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            question_count: 10,
            time_limit_secs: 20,
            countdown_secs: Some(3),
        }
    }

    #[tokio::test]
    async fn finishing_flushes_queued_scores_first() {
        let engine = engine();
        let session = engine
            .try_create_session(PlayerInfo::new("host", None), settings(), "quiz".into())
            .await
            .unwrap();
        let ada = engine
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();
        assert!(engine.transition_status(&session.code, SessionStatus::Active).await);

        engine.enqueue_score_update(&session.code, ada.id, 70, 4).await;
        let finished = engine
            .try_transition_status(&session.code, SessionStatus::Finished)
            .await
            .unwrap();

        assert_eq!(engine.queued_updates().await, 0);
        assert_eq!(finished.summaries.len(), 1);
        assert_eq!(finished.summaries[0].final_score, 70);
        assert_eq!(finished.summaries[0].answered, 4);
    }

    #[tokio::test]
    async fn default_handlers_replay_score_and_answer() {
        let engine = engine();
        let session = engine
            .try_create_session(PlayerInfo::new("host", None), settings(), "quiz".into())
            .await
            .unwrap();
        let ada = engine
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();

        engine
            .store_failed_update(
                &session.code,
                ada.id,
                UpdatePayload::Score {
                    score: 40,
                    questions_answered: 2,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        engine
            .store_failed_update(
                &session.code,
                ada.id,
                UpdatePayload::Answer {
                    answer: AnswerEntity {
                        question_ref: "q3".into(),
                        option_ref: "c".into(),
                        correct: true,
                        points: 100,
                        answered_at: SystemTime::now(),
                    },
                },
            )
            .await
            .unwrap();

        let report = engine
            .process_pending_updates(&session.code, ada.id)
            .await
            .unwrap();
        assert_eq!(report, ProcessReport { succeeded: 2, failed: 0 });

        let room = engine.get_room(&session.code).await.unwrap();
        let view = room.player(ada.id).unwrap();
        assert_eq!((view.score, view.questions_answered), (140, 3));
    }

    #[tokio::test]
    async fn sweep_replays_due_records_and_removes_stale_sessions() {
        let mut config = EngineConfig::default();
        config.retry.stale_session_age = Duration::ZERO;
        let engine = SyncEngine::in_memory(config);
        let session = engine
            .try_create_session(PlayerInfo::new("host", None), settings(), "quiz".into())
            .await
            .unwrap();
        let ada = engine
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();
        engine
            .store_failed_update(
                &session.code,
                ada.id,
                UpdatePayload::Score {
                    score: 5,
                    questions_answered: 1,
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = engine.run_recovery_sweep().await;
        assert_eq!(report.replayed.succeeded, 1);
        assert_eq!(report.removed_sessions, 1);
        assert!(engine.get_session(&session.code).await.is_none());
        assert!(engine.pending_updates(&session.code, ada.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispose_flushes_and_detaches() {
        let engine = engine();
        let session = engine
            .try_create_session(PlayerInfo::new("host", None), settings(), "quiz".into())
            .await
            .unwrap();
        let ada = engine
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();
        let subscription = engine.subscribe(&session.code, |_| {}).await.unwrap();
        engine.enqueue_score_update(&session.code, ada.id, 9, 1).await;

        let report = engine.dispose().await;
        assert_eq!(report.written, 1);
        assert_eq!(engine.active_subscriptions(), 0);
        drop(subscription);
        assert_eq!(engine.dispose().await, FlushReport::default());
    }
}
