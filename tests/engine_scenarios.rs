use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use quiz_sync_back::{
    config::EngineConfig,
    dao::{
        models::{
            FailedUpdateStatus, SessionEntity, SessionSettings, SessionStatus, UpdateKind,
            UpdatePayload,
        },
        record_store::{
            FastRecordStore, RetryLedger,
            memory::{MemoryAuthoritativeStore, MemoryFastStore, MemoryRetryLedger},
        },
        storage::StorageError,
    },
    error::SyncError,
    services::{
        change_notifier::RoomNotice,
        engine::{EngineStores, SyncEngine},
        retry_store::{RetryHandler, RetryHandlers},
        sync_facade::PlayerInfo,
    },
    state::lifecycle::TransitionError,
};

struct Harness {
    fast: MemoryFastStore,
    authoritative: MemoryAuthoritativeStore,
    ledger: MemoryRetryLedger,
    engine: SyncEngine,
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue.flush_delay = Duration::from_secs(60);
    config.queue.flush_threshold = 10_000;
    config.queue.batch_size = 4;
    config.queue.parallelism = 3;
    config.queue.batch_pause = Duration::ZERO;
    config.backoff.max_attempts = 1;
    config.backoff.initial_delay = Duration::ZERO;
    config.backoff.max_delay = Duration::ZERO;
    config.retry.max_attempts = 3;
    config
}

fn harness() -> Harness {
    harness_with(test_config())
}

fn harness_with(config: EngineConfig) -> Harness {
    let fast = MemoryFastStore::new();
    let authoritative = MemoryAuthoritativeStore::new();
    let ledger = MemoryRetryLedger::new();
    let engine = SyncEngine::new(
        EngineStores {
            fast: Arc::new(fast.clone()),
            authoritative: Arc::new(authoritative.clone()),
            ledger: Arc::new(ledger.clone()),
        },
        config,
    );
    Harness {
        fast,
        authoritative,
        ledger,
        engine,
    }
}

async fn hosted_session(engine: &SyncEngine, question_count: u32) -> SessionEntity {
    engine
        .create_session(
            PlayerInfo::new("quizmaster", None),
            SessionSettings {
                question_count,
                time_limit_secs: 20,
                countdown_secs: Some(3),
            },
            "capitals".into(),
        )
        .await
        .expect("session created")
}

async fn join(engine: &SyncEngine, code: &str, name: &str) -> Uuid {
    engine
        .join_session(code, PlayerInfo::new(name, None))
        .await
        .expect("player joined")
        .id
}

async fn progress_of(engine: &SyncEngine, code: &str, player: Uuid) -> (u32, u32) {
    let room = engine.get_room(code).await.expect("room readable");
    let view = room.player(player).expect("player listed");
    (view.score, view.questions_answered)
}

#[tokio::test]
async fn score_updates_converge_to_the_maximum() {
    let h = harness();
    let session = hosted_session(&h.engine, 10).await;
    let ada = join(&h.engine, &session.code, "ada").await;

    let mut submissions = vec![(0, 0), (100, 1), (200, 2), (200, 2), (300, 3), (100, 1)];
    submissions.shuffle(&mut rand::rng());
    for (score, answered) in submissions {
        assert!(h.engine.update_score(&session.code, ada, score, answered).await);
    }

    assert_eq!(progress_of(&h.engine, &session.code, ada).await, (300, 3));
}

#[tokio::test]
async fn repeated_enqueues_produce_one_write_per_flush() {
    let h = harness();
    let session = hosted_session(&h.engine, 10).await;
    let ada = join(&h.engine, &session.code, "ada").await;

    for step in 1..=8 {
        h.engine
            .enqueue_score_update(&session.code, ada, step * 10, step)
            .await;
    }
    let before = h.fast.progress_writes();
    let report = h.engine.flush_now().await;

    assert_eq!(h.fast.progress_writes() - before, 1);
    assert_eq!(report.written, 1);
    assert_eq!(progress_of(&h.engine, &session.code, ada).await, (80, 8));
}

#[tokio::test]
async fn flush_now_makes_every_queued_update_visible() {
    let h = harness();
    let session = hosted_session(&h.engine, 10).await;
    let mut players = Vec::new();
    for name in ["ada", "bob", "cyd", "dee", "eve", "fay"] {
        players.push(join(&h.engine, &session.code, name).await);
    }

    for (index, player) in players.iter().enumerate() {
        let index = index as u32;
        h.engine
            .enqueue_score_update(&session.code, *player, 10 * index, index)
            .await;
    }
    h.engine.flush_now().await;

    for (index, player) in players.iter().enumerate() {
        let index = index as u32;
        assert_eq!(
            progress_of(&h.engine, &session.code, *player).await,
            (10 * index, index)
        );
    }
}

#[tokio::test]
async fn concurrent_out_of_order_updates_converge_per_player() {
    let h = harness();
    let session = hosted_session(&h.engine, 10).await;
    let mut players = Vec::new();
    for index in 0..10 {
        players.push(join(&h.engine, &session.code, &format!("player-{index}")).await);
    }

    let mut updates: Vec<(Uuid, u32, u32)> = players
        .iter()
        .flat_map(|player| (1..=5).map(move |step| (*player, step * 25, step)))
        .collect();
    updates.shuffle(&mut rand::rng());

    for chunk in updates.chunks(7) {
        join_all(chunk.iter().map(|(player, score, answered)| {
            h.engine
                .enqueue_score_update(&session.code, *player, *score, *answered)
        }))
        .await;
        h.engine.flush_now().await;
    }

    for player in players {
        assert_eq!(progress_of(&h.engine, &session.code, player).await, (125, 5));
    }
}

#[tokio::test]
async fn progress_never_passes_the_question_count() {
    let h = harness();
    let session = hosted_session(&h.engine, 10).await;
    let ada = join(&h.engine, &session.code, "ada").await;

    assert!(h.engine.update_score(&session.code, ada, 1_000, 10).await);
    assert!(h.engine.update_score(&session.code, ada, 1_100, 11).await);

    assert_eq!(progress_of(&h.engine, &session.code, ada).await, (1_100, 10));
}

#[tokio::test]
async fn failed_update_is_retried_at_most_max_attempts() {
    let h = harness();
    let player = Uuid::new_v4();
    let record = h
        .engine
        .store_failed_update(
            "654321",
            player,
            UpdatePayload::Score {
                score: 10,
                questions_answered: 1,
            },
        )
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let failing: RetryHandler = Arc::new(move |_payload| {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(SyncError::from(StorageError::rate_limited("throttled"))) })
    });
    let handlers = RetryHandlers::from([(UpdateKind::Score, failing)]);

    for _ in 0..6 {
        h.engine
            .process_pending_updates_with("654321", player, &handlers)
            .await
            .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let stored = h.ledger.find(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, FailedUpdateStatus::Failed);
    assert!(h.engine.pending_updates("654321", player).await.unwrap().is_empty());
}

#[tokio::test]
async fn lifecycle_moves_forward_only() {
    let h = harness();

    let ended_early = hosted_session(&h.engine, 5).await;
    h.engine
        .try_transition_status(&ended_early.code, SessionStatus::Finished)
        .await
        .unwrap();
    let err = h
        .engine
        .try_transition_status(&ended_early.code, SessionStatus::Countdown)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::InvalidTransition(TransitionError::Terminal)
    ));

    let full = hosted_session(&h.engine, 5).await;
    for status in [
        SessionStatus::Countdown,
        SessionStatus::Active,
        SessionStatus::Finished,
    ] {
        assert!(h.engine.transition_status(&full.code, status).await);
    }
    let session = h.engine.get_session(&full.code).await.unwrap();
    assert_eq!(session.status, SessionStatus::Finished);
    assert!(session.countdown_started_at.is_some());
    assert_eq!(session.countdown_duration_ms, Some(3_000));
    assert!(session.started_at.is_some());
    assert!(session.ended_at.is_some());
}

#[tokio::test]
async fn same_name_joins_leave_one_record() {
    let h = harness();
    let session = hosted_session(&h.engine, 10).await;

    let (first, second) = tokio::join!(
        h.engine.join_session(&session.code, PlayerInfo::new("ada", None)),
        h.engine.join_session(&session.code, PlayerInfo::new("ada", None)),
    );
    assert!(first.is_some() && second.is_some());
    let third = join(&h.engine, &session.code, "ada").await;

    let rows = h.fast.list_players(&session.code).await.unwrap();
    let adas: Vec<_> = rows.iter().filter(|row| row.name == "ada").collect();
    assert_eq!(adas.len(), 1);
    assert_eq!(adas[0].id, third);

    let stored = h.engine.get_session(&session.code).await.unwrap();
    assert_eq!(stored.roster.iter().filter(|e| e.name == "ada").count(), 1);
}

#[tokio::test]
async fn subscribe_delivers_one_snapshot_immediately() {
    let h = harness();
    let session = hosted_session(&h.engine, 10).await;
    let ada = join(&h.engine, &session.code, "ada").await;

    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = notices.clone();
    let subscription = h
        .engine
        .subscribe(&session.code, move |notice| sink.lock().unwrap().push(notice))
        .await
        .unwrap();

    {
        let notices = notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        let RoomNotice::Snapshot(room) = &notices[0] else {
            panic!("expected a snapshot");
        };
        assert!(room.player(ada).is_some());
    }

    h.engine.update_score(&session.code, ada, 50, 1).await;
    timeout(Duration::from_secs(2), async {
        while notices.lock().unwrap().len() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    subscription.unsubscribe();
}

#[tokio::test]
async fn unsubscribe_cycles_do_not_leak() {
    let h = harness();
    let session = hosted_session(&h.engine, 10).await;

    for _ in 0..25 {
        let subscription = h.engine.subscribe(&session.code, |_| {}).await.unwrap();
        drop(subscription);
    }
    assert_eq!(h.engine.active_subscriptions(), 0);

    timeout(Duration::from_secs(2), async {
        while h.fast.watcher_count() > 0 || h.authoritative.watcher_count() > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let h = harness();
    let session = hosted_session(&h.engine, 3).await;
    let ada = join(&h.engine, &session.code, "ada").await;
    let bob = join(&h.engine, &session.code, "bob").await;
    assert!(h.engine.transition_status(&session.code, SessionStatus::Active).await);

    h.engine.update_score(&session.code, ada, 200, 2).await;
    h.engine.update_score(&session.code, bob, 100, 1).await;

    let first = h
        .engine
        .try_transition_status(&session.code, SessionStatus::Finished)
        .await
        .unwrap();
    let second = h.engine.reconcile(&session.code).await.unwrap();

    assert_eq!(first.roster, second.roster);
    assert_eq!(first.responses, second.responses);
    assert_eq!(first.summaries, second.summaries);
    assert_eq!(first.summaries.len(), 2);

    let room = h.engine.get_room(&session.code).await.unwrap();
    assert_eq!(room.player(ada).map(|p| p.score), Some(200));
}

#[tokio::test]
async fn flush_failures_are_requeued_and_written_later() {
    let h = harness();
    let session = hosted_session(&h.engine, 10).await;
    let ada = join(&h.engine, &session.code, "ada").await;
    let bob = join(&h.engine, &session.code, "bob").await;

    h.engine.enqueue_score_update(&session.code, ada, 40, 2).await;
    h.engine.enqueue_score_update(&session.code, bob, 30, 1).await;

    h.fast.faults().set_offline(true);
    h.authoritative.faults().set_offline(true);
    let report = h.engine.flush_now().await;
    assert_eq!(report.requeued, 2);
    assert_eq!(h.engine.queued_updates().await, 2);

    h.fast.faults().set_offline(false);
    h.authoritative.faults().set_offline(false);
    let report = h.engine.flush_now().await;
    assert_eq!(report.written, 2);

    assert_eq!(progress_of(&h.engine, &session.code, ada).await, (40, 2));
    assert_eq!(progress_of(&h.engine, &session.code, bob).await, (30, 1));
}

#[tokio::test]
async fn caller_api_reports_failures_without_raising() {
    let h = harness();
    assert!(h.engine.get_room("000000").await.is_none());
    assert!(!h.engine.update_score("000000", Uuid::new_v4(), 1, 1).await);
    assert!(!h.engine.transition_status("000000", SessionStatus::Active).await);
    assert!(!h.engine.teardown_session("000000").await);
}
