//! Batching queue in front of score writes.
//!
//! Entries are keyed by (session, player) and max-merged, so N enqueues of the same key before a
//! flush produce a single write of the merged maximum. Only one flush runs at a time; enqueues
//! that arrive during a flush land in the live map and are picked up by the next one.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use futures::{StreamExt, stream};
use indexmap::IndexMap;
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::QueueConfig,
    dao::models::{MergeOutcome, Progress, UpdatePayload},
    error::SyncError,
    services::{backoff::BackoffPolicy, retry_store::RetryStore, sync_facade::SyncFacade},
};

type QueueKey = (String, Uuid);

/// Latest merged progress waiting to be written for one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedUpdate {
    /// Per-field maximum of every enqueued update.
    pub progress: Progress,
    /// When the newest update arrived.
    pub last_enqueued: SystemTime,
    /// Consecutive flush cycles in which the write failed.
    pub failures: u32,
}

impl QueuedUpdate {
    fn merge(&mut self, other: QueuedUpdate) {
        self.progress = self.progress.merge_max(other.progress);
        self.last_enqueued = self.last_enqueued.max(other.last_enqueued);
        self.failures = self.failures.max(other.failures);
    }
}

/// Outcome counts of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Writes that moved a field forward.
    pub written: usize,
    /// Writes that changed nothing.
    pub unchanged: usize,
    /// Failed writes merged back into the queue.
    pub requeued: usize,
    /// Entries handed to the retry store.
    pub deferred: usize,
    /// Entries refused for good (unknown player, finished session).
    pub dropped: usize,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.requeued += other.requeued;
        self.deferred += other.deferred;
        self.dropped += other.dropped;
    }
}

#[derive(Default)]
struct QueueState {
    entries: IndexMap<QueueKey, QueuedUpdate>,
    /// Token of the flush task currently sleeping, if any.
    scheduled: Option<u64>,
}

struct QueueShared {
    facade: Arc<SyncFacade>,
    retry: Arc<RetryStore>,
    backoff: BackoffPolicy,
    config: QueueConfig,
    state: Mutex<QueueState>,
    flush_gate: Mutex<()>,
    next_token: AtomicU64,
}

/// Handle to the queue; clones share the same entries.
#[derive(Clone)]
pub struct UpdateQueue {
    shared: Arc<QueueShared>,
}

impl UpdateQueue {
    /// Queue flushing through `facade`, handing exhausted writes to `retry`.
    pub fn new(
        facade: Arc<SyncFacade>,
        retry: Arc<RetryStore>,
        backoff: BackoffPolicy,
        config: QueueConfig,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                facade,
                retry,
                backoff,
                config,
                state: Mutex::new(QueueState::default()),
                flush_gate: Mutex::new(()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Merge an update into the queue and make sure a flush will pick it up.
    pub async fn enqueue(&self, code: &str, player_id: Uuid, score: u32, questions_answered: u32) {
        let update = QueuedUpdate {
            progress: Progress::new(score, questions_answered),
            last_enqueued: SystemTime::now(),
            failures: 0,
        };

        let mut state = self.shared.state.lock().await;
        match state.entries.get_mut(&(code.to_owned(), player_id)) {
            Some(existing) => existing.merge(update),
            None => {
                state.entries.insert((code.to_owned(), player_id), update);
            }
        }

        if state.entries.len() >= self.shared.config.flush_threshold {
            state.scheduled = None;
            drop(state);
            let queue = self.clone();
            tokio::spawn(async move {
                queue.flush().await;
            });
        } else if state.scheduled.is_none() {
            self.schedule(&mut state);
        }
    }

    fn schedule(&self, state: &mut QueueState) {
        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        state.scheduled = Some(token);
        let queue = self.clone();
        let delay = self.shared.config.flush_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let still_scheduled = {
                let mut state = queue.shared.state.lock().await;
                if state.scheduled == Some(token) {
                    state.scheduled = None;
                    true
                } else {
                    false
                }
            };
            if still_scheduled {
                queue.flush().await;
            }
        });
    }

    /// Number of queued entries.
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.entries.len()
    }

    /// Whether nothing is queued.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queued entry for one player, if any.
    pub async fn pending(&self, code: &str, player_id: Uuid) -> Option<QueuedUpdate> {
        let state = self.shared.state.lock().await;
        state.entries.get(&(code.to_owned(), player_id)).copied()
    }

    /// Drop queued entries of a session.
    pub async fn discard_session(&self, code: &str) -> usize {
        let mut state = self.shared.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|(session, _), _| session != code);
        before - state.entries.len()
    }

    /// Cancel any scheduled flush and flush right away.
    pub async fn flush_now(&self) -> FlushReport {
        self.shared.state.lock().await.scheduled = None;
        self.flush().await
    }

    /// Drain the queue and write every entry in bounded-parallel batches.
    pub async fn flush(&self) -> FlushReport {
        let _gate = self.shared.flush_gate.lock().await;
        let drained: Vec<(QueueKey, QueuedUpdate)> = {
            let mut state = self.shared.state.lock().await;
            std::mem::take(&mut state.entries).into_iter().collect()
        };
        if drained.is_empty() {
            return FlushReport::default();
        }

        let config = &self.shared.config;
        let total = drained.len();
        let batches: Vec<Vec<(QueueKey, QueuedUpdate)>> = drained
            .chunks(config.batch_size)
            .map(<[_]>::to_vec)
            .collect();
        let batch_count = batches.len();

        let mut report = FlushReport::default();
        for (index, batch) in batches.into_iter().enumerate() {
            let results: Vec<_> = stream::iter(batch)
                .map(|(key, entry)| async move {
                    let result = self.write_entry(&key, entry.progress).await;
                    (key, entry, result)
                })
                .buffer_unordered(config.parallelism)
                .collect()
                .await;

            for (key, entry, result) in results {
                report.absorb(self.settle_entry(key, entry, result).await);
            }

            if index + 1 < batch_count && !config.batch_pause.is_zero() {
                sleep(config.batch_pause).await;
            }
        }

        {
            let mut state = self.shared.state.lock().await;
            if !state.entries.is_empty() && state.scheduled.is_none() {
                self.schedule(&mut state);
            }
        }

        info!(
            total,
            written = report.written,
            unchanged = report.unchanged,
            requeued = report.requeued,
            deferred = report.deferred,
            dropped = report.dropped,
            "score queue flushed"
        );
        report
    }

    async fn write_entry(
        &self,
        (code, player_id): &QueueKey,
        progress: Progress,
    ) -> Result<MergeOutcome, SyncError> {
        let facade = &self.shared.facade;
        self.shared
            .backoff
            .retry("queue_flush", || {
                facade.try_update_score(code, *player_id, progress.score, progress.questions_answered)
            })
            .await
    }

    async fn settle_entry(
        &self,
        key: QueueKey,
        mut entry: QueuedUpdate,
        result: Result<MergeOutcome, SyncError>,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        match result {
            Ok(MergeOutcome::Applied) => report.written = 1,
            Ok(_) => report.unchanged = 1,
            Err(err) if !err.is_retryable() => {
                debug!(code = %key.0, player_id = %key.1, error = %err, "dropping queued update");
                report.dropped = 1;
            }
            Err(err) => {
                entry.failures += 1;
                if entry.failures >= self.shared.config.max_flush_failures {
                    let payload = UpdatePayload::Score {
                        score: entry.progress.score,
                        questions_answered: entry.progress.questions_answered,
                    };
                    match self.shared.retry.store_failed_update(&key.0, key.1, payload).await {
                        Ok(_) => {
                            report.deferred = 1;
                            return report;
                        }
                        Err(store_err) => {
                            warn!(
                                code = %key.0,
                                player_id = %key.1,
                                error = %store_err,
                                "retry store unavailable; keeping update queued"
                            );
                        }
                    }
                } else {
                    debug!(
                        code = %key.0,
                        player_id = %key.1,
                        failures = entry.failures,
                        error = %err,
                        "queued update failed; requeueing"
                    );
                }
                self.requeue(key, entry).await;
                report.requeued = 1;
            }
        }
        report
    }

    async fn requeue(&self, key: QueueKey, entry: QueuedUpdate) {
        let mut state = self.shared.state.lock().await;
        match state.entries.get_mut(&key) {
            Some(existing) => existing.merge(entry),
            None => {
                state.entries.insert(key, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::{RetryConfig, SessionsConfig},
        dao::{
            models::SessionSettings,
            record_store::{
                FastRecordStore, RetryLedger,
                memory::{MemoryAuthoritativeStore, MemoryFastStore, MemoryRetryLedger},
            },
        },
        services::sync_facade::PlayerInfo,
    };

    struct Fixture {
        fast: MemoryFastStore,
        authoritative: MemoryAuthoritativeStore,
        ledger: MemoryRetryLedger,
        facade: Arc<SyncFacade>,
        queue: UpdateQueue,
    }

    fn fixture(config: QueueConfig) -> Fixture {
        let fast = MemoryFastStore::new();
        let authoritative = MemoryAuthoritativeStore::new();
        let ledger = MemoryRetryLedger::new();
        let facade = Arc::new(SyncFacade::new(
            Arc::new(fast.clone()),
            Arc::new(authoritative.clone()),
            SessionsConfig::default(),
        ));
        let retry = Arc::new(RetryStore::new(
            Arc::new(ledger.clone()),
            BackoffPolicy::immediate(1),
            RetryConfig::default(),
        ));
        let queue = UpdateQueue::new(facade.clone(), retry, BackoffPolicy::immediate(1), config);
        Fixture {
            fast,
            authoritative,
            ledger,
            facade,
            queue,
        }
    }

    fn slow_config() -> QueueConfig {
        QueueConfig {
            flush_delay: Duration::from_secs(60),
            flush_threshold: 1_000,
            batch_size: 3,
            parallelism: 2,
            batch_pause: Duration::ZERO,
            max_flush_failures: 3,
        }
    }

    async fn session_with_players(fixture: &Fixture, count: usize) -> (String, Vec<Uuid>) {
        let session = fixture
            .facade
            .try_create_session(
                PlayerInfo::new("host", None),
                SessionSettings {
                    question_count: 10,
                    time_limit_secs: 20,
                    countdown_secs: None,
                },
                "quiz".into(),
            )
            .await
            .unwrap();
        let mut ids = Vec::new();
        for index in 0..count {
            let player = fixture
                .facade
                .try_join_session(&session.code, PlayerInfo::new(format!("p{index}"), None))
                .await
                .unwrap();
            ids.push(player.id);
        }
        (session.code, ids)
    }

    #[tokio::test]
    async fn repeated_enqueues_collapse_into_one_write() {
        let fixture = fixture(slow_config());
        let (code, ids) = session_with_players(&fixture, 1).await;

        for (score, answered) in [(10, 1), (30, 3), (20, 2), (30, 2)] {
            fixture.queue.enqueue(&code, ids[0], score, answered).await;
        }
        assert_eq!(fixture.queue.len().await, 1);

        let before = fixture.fast.progress_writes();
        let report = fixture.queue.flush_now().await;
        assert_eq!(fixture.fast.progress_writes() - before, 1);
        assert_eq!(report.written, 1);

        let player = fixture.fast.find_player(&code, ids[0]).await.unwrap().unwrap();
        assert_eq!(player.progress(), Progress::new(30, 3));
    }

    #[tokio::test]
    async fn failed_writes_are_requeued_then_written() {
        let fixture = fixture(slow_config());
        let (code, ids) = session_with_players(&fixture, 4).await;
        for (index, id) in ids.iter().enumerate() {
            fixture.queue.enqueue(&code, *id, 10 * index as u32, 1).await;
        }

        fixture.fast.faults().set_offline(true);
        fixture.authoritative.faults().set_offline(true);
        let report = fixture.queue.flush_now().await;
        assert_eq!(report.requeued, 4);
        assert_eq!(fixture.queue.len().await, 4);
        assert_eq!(fixture.queue.pending(&code, ids[0]).await.map(|e| e.failures), Some(1));

        fixture.fast.faults().set_offline(false);
        fixture.authoritative.faults().set_offline(false);
        fixture.queue.enqueue(&code, ids[3], 99, 2).await;
        let report = fixture.queue.flush_now().await;
        assert_eq!(report.written, 4);
        assert!(fixture.queue.is_empty().await);

        let player = fixture.fast.find_player(&code, ids[3]).await.unwrap().unwrap();
        assert_eq!(player.progress(), Progress::new(99, 2));
    }

    #[tokio::test]
    async fn persistent_failures_move_to_retry_store() {
        let mut config = slow_config();
        config.max_flush_failures = 2;
        let fixture = fixture(config);
        let (code, ids) = session_with_players(&fixture, 1).await;
        fixture.queue.enqueue(&code, ids[0], 50, 5).await;

        fixture.fast.faults().set_offline(true);
        fixture.authoritative.faults().set_offline(true);
        assert_eq!(fixture.queue.flush_now().await.requeued, 1);
        assert_eq!(fixture.queue.flush_now().await.deferred, 1);
        assert!(fixture.queue.is_empty().await);

        let pending = fixture.ledger.list_pending(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].payload,
            UpdatePayload::Score {
                score: 50,
                questions_answered: 5
            }
        );
    }

    #[tokio::test]
    async fn threshold_triggers_flush_without_waiting_for_the_timer() {
        let mut config = slow_config();
        config.flush_threshold = 2;
        let fixture = fixture(config);
        let (code, ids) = session_with_players(&fixture, 2).await;

        fixture.queue.enqueue(&code, ids[0], 5, 1).await;
        fixture.queue.enqueue(&code, ids[1], 7, 1).await;

        let mut flushed = false;
        for _ in 0..50 {
            if fixture.fast.progress_writes() == 2 {
                flushed = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed);
    }

    #[tokio::test]
    async fn scheduled_flush_fires_after_delay() {
        let mut config = slow_config();
        config.flush_delay = Duration::from_millis(20);
        let fixture = fixture(config);
        let (code, ids) = session_with_players(&fixture, 1).await;

        fixture.queue.enqueue(&code, ids[0], 5, 1).await;
        sleep(Duration::from_millis(200)).await;
        assert!(fixture.queue.is_empty().await);
        assert_eq!(fixture.fast.progress_writes(), 1);
    }
}
