//! Per-session change subscriptions fed by both stores' change streams.
//!
//! Each subscription owns one task holding its [`RoomCache`]. Stream events patch the cache and
//! the callback only fires when the room fingerprint moves. Without streams the task polls full
//! reads and keeps trying to re-attach.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{
    StreamExt,
    future::ready,
    stream::{self, BoxStream},
};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, info};

use crate::{
    config::NotifierConfig,
    dao::{
        models::{PlayerEntity, SessionEntity},
        record_store::{PlayerChange, SessionChange},
    },
    error::SyncError,
    services::sync_facade::SyncFacade,
    state::room::{Room, RoomCache, RoomFingerprint},
};

/// What a subscriber is told about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomNotice {
    /// Current merged view.
    Snapshot(Room),
    /// The session was deleted or does not exist.
    Closed,
}

/// Callback invoked for every observable change.
pub type NoticeCallback = Arc<dyn Fn(RoomNotice) + Send + Sync>;

enum RoomEvent {
    Player(PlayerChange),
    Session(SessionChange),
    Ended,
}

type EventStream = BoxStream<'static, RoomEvent>;

struct SubscriptionEntry {
    code: String,
    task: Option<JoinHandle<()>>,
}

type Registry = DashMap<u64, SubscriptionEntry>;

/// Fan-out of room snapshots to in-process subscribers.
pub struct ChangeNotifier {
    facade: Arc<SyncFacade>,
    poll_interval: Duration,
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

/// Live subscription; dropping it detaches the listeners.
pub struct Subscription {
    id: u64,
    code: String,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Session code this subscription follows.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Detach the stream listeners and drop the cached snapshot.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some((_, entry)) = self.registry.remove(&self.id) {
            if let Some(task) = entry.task {
                task.abort();
            }
            debug!(code = %entry.code, subscription = self.id, "subscription detached");
        }
    }
}

impl ChangeNotifier {
    /// Notifier reading through `facade`.
    pub fn new(facade: Arc<SyncFacade>, config: NotifierConfig) -> Self {
        Self {
            facade,
            poll_interval: config.poll_interval,
            registry: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Follow one session. `callback` is invoked once with the current state before this returns.
    pub async fn subscribe<F>(&self, code: &str, callback: F) -> Result<Subscription, SyncError>
    where
        F: Fn(RoomNotice) + Send + Sync + 'static,
    {
        let callback: NoticeCallback = Arc::new(callback);
        // Attach first so nothing between the read and the attach is missed.
        let events = attach(&self.facade, code).await;

        let (session, players) = read_full(&self.facade, code).await?;
        let mut tracker = RoomTracker::default();
        tracker.cache.reset(session, players);
        let open = tracker.publish(&callback);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = open.then(|| {
            tokio::spawn(watch_room(
                self.facade.clone(),
                code.to_owned(),
                self.poll_interval,
                callback,
                tracker,
                events,
            ))
        });
        self.registry.insert(
            id,
            SubscriptionEntry {
                code: code.to_owned(),
                task,
            },
        );
        debug!(code = %code, subscription = id, "subscription attached");

        Ok(Subscription {
            id,
            code: code.to_owned(),
            registry: self.registry.clone(),
        })
    }

    /// Number of live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.registry.len()
    }

    /// Detach every subscription.
    pub fn close_all(&self) {
        let count = self.registry.len();
        self.registry.retain(|_, entry| {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            false
        });
        if count > 0 {
            info!(count, "closed room subscriptions");
        }
    }
}

/// Merge both change streams; `None` when either store cannot provide one.
async fn attach(facade: &SyncFacade, code: &str) -> Option<EventStream> {
    let (players, session) = tokio::join!(
        facade.fast_store().watch_players(code),
        facade.authoritative_store().watch_session(code)
    );
    match (players, session) {
        (Ok(players), Ok(session)) => {
            let players = players
                .map(RoomEvent::Player)
                .chain(stream::once(ready(RoomEvent::Ended)));
            let session = session
                .map(RoomEvent::Session)
                .chain(stream::once(ready(RoomEvent::Ended)));
            Some(stream::select(players, session).boxed())
        }
        (Err(err), _) | (_, Err(err)) => {
            debug!(code = %code, error = %err, "change stream unavailable; polling instead");
            None
        }
    }
}

/// Session document plus fast-store rows. A missing session reads as `None`.
async fn read_full(
    facade: &SyncFacade,
    code: &str,
) -> Result<(Option<SessionEntity>, Vec<PlayerEntity>), SyncError> {
    let session = match facade.try_get_session(code).await {
        Ok(session) => Some(session),
        Err(SyncError::NotFound(_)) => None,
        Err(err) => return Err(err),
    };
    let players = match facade.fast_store().list_players(code).await {
        Ok(players) => players,
        Err(err) => {
            debug!(code = %code, error = %err, "fast store unavailable; room falls back to roster");
            Vec::new()
        }
    };
    Ok((session, players))
}

#[derive(Default)]
struct RoomTracker {
    cache: RoomCache,
    last: Option<RoomFingerprint>,
}

impl RoomTracker {
    /// Notify when something observable moved; returns `false` once the session is closed.
    fn publish(&mut self, callback: &NoticeCallback) -> bool {
        match self.cache.room() {
            Some(room) => {
                let fingerprint = room.fingerprint();
                if self.last.as_ref() != Some(&fingerprint) {
                    self.last = Some(fingerprint);
                    callback(RoomNotice::Snapshot(room));
                }
                true
            }
            None if self.cache.is_closed() => {
                self.cache.clear();
                callback(RoomNotice::Closed);
                false
            }
            None => true,
        }
    }

    async fn refresh(&mut self, facade: &SyncFacade, code: &str) {
        match read_full(facade, code).await {
            Ok((session, players)) => self.cache.reset(session, players),
            Err(err) => debug!(code = %code, error = %err, "room refresh failed; keeping cached view"),
        }
    }
}

async fn watch_room(
    facade: Arc<SyncFacade>,
    code: String,
    poll_interval: Duration,
    callback: NoticeCallback,
    mut tracker: RoomTracker,
    mut events: Option<EventStream>,
) {
    loop {
        match events.as_mut() {
            Some(stream) => match stream.next().await {
                Some(RoomEvent::Player(change)) => {
                    if !tracker.cache.apply_player(change) {
                        tracker.refresh(&facade, &code).await;
                    }
                }
                Some(RoomEvent::Session(change)) => {
                    if !tracker.cache.apply_session(change) {
                        tracker.refresh(&facade, &code).await;
                    }
                }
                Some(RoomEvent::Ended) | None => {
                    debug!(code = %code, "change stream ended; falling back to polling");
                    events = None;
                    continue;
                }
            },
            None => {
                sleep(poll_interval).await;
                events = attach(&facade, &code).await;
                tracker.refresh(&facade, &code).await;
            }
        }

        if !tracker.publish(&callback) {
            debug!(code = %code, "session closed; ending subscription task");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::timeout;

    use super::*;
    use crate::{
        config::SessionsConfig,
        dao::{
            models::{SessionSettings, SessionStatus},
            record_store::memory::{MemoryAuthoritativeStore, MemoryFastStore},
        },
        services::sync_facade::PlayerInfo,
    };

    struct Fixture {
        fast: MemoryFastStore,
        authoritative: MemoryAuthoritativeStore,
        facade: Arc<SyncFacade>,
        notifier: ChangeNotifier,
    }

    fn fixture(poll_interval: Duration) -> Fixture {
        let fast = MemoryFastStore::new();
        let authoritative = MemoryAuthoritativeStore::new();
        let facade = Arc::new(SyncFacade::new(
            Arc::new(fast.clone()),
            Arc::new(authoritative.clone()),
            SessionsConfig::default(),
        ));
        let notifier = ChangeNotifier::new(facade.clone(), NotifierConfig { poll_interval });
        Fixture {
            fast,
            authoritative,
            facade,
            notifier,
        }
    }

    async fn create(fixture: &Fixture) -> SessionEntity {
        fixture
            .facade
            .try_create_session(
                PlayerInfo::new("host", None),
                SessionSettings {
                    question_count: 5,
                    time_limit_secs: 20,
                    countdown_secs: None,
                },
                "quiz".into(),
            )
            .await
            .unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<RoomNotice>>>, impl Fn(RoomNotice) + Send + Sync + 'static) {
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = notices.clone();
        (notices, move |notice| sink.lock().unwrap().push(notice))
    }

    async fn wait_for(notices: &Arc<Mutex<Vec<RoomNotice>>>, count: usize) {
        timeout(Duration::from_secs(2), async {
            while notices.lock().unwrap().len() < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn subscribe_delivers_current_state_immediately() {
        let fixture = fixture(Duration::from_secs(60));
        let session = create(&fixture).await;
        let (notices, callback) = recorder();

        let _subscription = fixture.notifier.subscribe(&session.code, callback).await.unwrap();

        let notices = notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        match &notices[0] {
            RoomNotice::Snapshot(room) => assert_eq!(room.status, SessionStatus::Waiting),
            other => panic!("unexpected notice {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshots_include_roster_only_players() {
        let fixture = fixture(Duration::from_secs(60));
        let session = create(&fixture).await;
        fixture.fast.faults().fail_next(1);
        let ada = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();

        let (notices, callback) = recorder();
        let _subscription = fixture.notifier.subscribe(&session.code, callback).await.unwrap();
        fixture.facade.try_update_score(&session.code, ada.id, 30, 1).await.unwrap();
        wait_for(&notices, 2).await;

        let notices = notices.lock().unwrap();
        let RoomNotice::Snapshot(first) = &notices[0] else {
            panic!("expected a snapshot");
        };
        assert_eq!(first.player(ada.id).map(|p| p.score), Some(0));
        let RoomNotice::Snapshot(latest) = &notices[1] else {
            panic!("expected a snapshot");
        };
        assert_eq!(latest.player(ada.id).map(|p| p.score), Some(30));
    }

    #[tokio::test]
    async fn only_observable_changes_notify() {
        let fixture = fixture(Duration::from_secs(60));
        let session = create(&fixture).await;
        let ada = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();
        let (notices, callback) = recorder();
        let _subscription = fixture.notifier.subscribe(&session.code, callback).await.unwrap();

        fixture.facade.try_update_score(&session.code, ada.id, 10, 1).await.unwrap();
        wait_for(&notices, 2).await;

        // Stale write: nothing reaches the stream, nothing is delivered.
        fixture.facade.try_update_score(&session.code, ada.id, 5, 1).await.unwrap();
        fixture.facade.try_update_score(&session.code, ada.id, 20, 2).await.unwrap();
        wait_for(&notices, 3).await;
        sleep(Duration::from_millis(50)).await;

        let notices = notices.lock().unwrap();
        assert_eq!(notices.len(), 3);
        match notices.last() {
            Some(RoomNotice::Snapshot(room)) => {
                assert_eq!(room.player(ada.id).map(|p| p.score), Some(20));
            }
            other => panic!("unexpected notice {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_sends_closed() {
        let fixture = fixture(Duration::from_secs(60));
        let session = create(&fixture).await;
        let (notices, callback) = recorder();
        let _subscription = fixture.notifier.subscribe(&session.code, callback).await.unwrap();

        fixture.facade.try_teardown_session(&session.code).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while !notices.lock().unwrap().contains(&RoomNotice::Closed) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_cycles_leave_nothing_behind() {
        let fixture = fixture(Duration::from_secs(60));
        let session = create(&fixture).await;

        for _ in 0..20 {
            let subscription = fixture
                .notifier
                .subscribe(&session.code, |_| {})
                .await
                .unwrap();
            subscription.unsubscribe();
        }
        assert_eq!(fixture.notifier.active_subscriptions(), 0);

        timeout(Duration::from_secs(2), async {
            while fixture.fast.watcher_count() > 0 || fixture.authoritative.watcher_count() > 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn polls_when_streams_are_unavailable() {
        let fixture = fixture(Duration::from_millis(20));
        let session = create(&fixture).await;
        let ada = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();

        fixture.fast.faults().fail_next(1);
        let (notices, callback) = recorder();
        let _subscription = fixture.notifier.subscribe(&session.code, callback).await.unwrap();

        fixture.facade.try_update_score(&session.code, ada.id, 30, 3).await.unwrap();
        wait_for(&notices, 2).await;
        match notices.lock().unwrap().last() {
            Some(RoomNotice::Snapshot(room)) => {
                assert_eq!(room.player(ada.id).map(|p| p.score), Some(30));
            }
            other => panic!("unexpected notice {other:?}"),
        }
    }
}
