//! Unified read/write API over the fast record store and the authoritative store.
//!
//! Every operation exists in two forms: `try_*` returns a [`SyncError`] so the HTTP layer can
//! pick a status code, and the plain form logs the error and reports a boolean or optional
//! result. Nothing raises past this layer.

use std::{sync::Arc, time::SystemTime};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::SessionsConfig,
    dao::{
        models::{
            AnswerEntity, MergeOutcome, PlayerEntity, Progress, RosterEntry, SessionEntity,
            SessionSettings, SessionStatus,
        },
        record_store::{AuthoritativeStore, FastRecordStore, PlayerClock},
    },
    error::SyncError,
    services::reconciliation::reconcile,
    state::{
        lifecycle::{TransitionEffect, plan_transition},
        room::Room,
    },
};

/// Identity a player (or host) presents when entering a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    /// Display name, unique within a session.
    pub name: String,
    /// Optional avatar reference; blank values are dropped.
    pub avatar: Option<String>,
}

impl PlayerInfo {
    /// Build player info from a display name and optional avatar.
    pub fn new(name: impl Into<String>, avatar: Option<String>) -> Self {
        Self {
            name: name.into(),
            avatar,
        }
    }

    fn normalized(self) -> Result<Self, SyncError> {
        let name = self.name.trim().to_owned();
        if name.is_empty() {
            return Err(SyncError::InvalidInput("display name must not be empty".into()));
        }
        Ok(Self {
            name,
            avatar: self.avatar.filter(|avatar| !avatar.trim().is_empty()),
        })
    }
}

/// Store-spanning facade owned by the engine.
pub struct SyncFacade {
    fast: Arc<dyn FastRecordStore>,
    authoritative: Arc<dyn AuthoritativeStore>,
    sessions: SessionsConfig,
    /// Last session document seen per code.
    known: DashMap<String, SessionEntity>,
    /// Serializes joins and transitions of one session.
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl SyncFacade {
    /// Facade over the two stores; nothing is cached until the first read.
    pub fn new(
        fast: Arc<dyn FastRecordStore>,
        authoritative: Arc<dyn AuthoritativeStore>,
        sessions: SessionsConfig,
    ) -> Self {
        Self {
            fast,
            authoritative,
            sessions,
            known: DashMap::new(),
            gates: DashMap::new(),
        }
    }

    /// Fast record store handle.
    pub fn fast_store(&self) -> &Arc<dyn FastRecordStore> {
        &self.fast
    }

    /// Authoritative store handle.
    pub fn authoritative_store(&self) -> &Arc<dyn AuthoritativeStore> {
        &self.authoritative
    }

    fn gate(&self, code: &str) -> Arc<Mutex<()>> {
        self.gates.entry(code.to_owned()).or_default().clone()
    }

    fn remember(&self, session: &SessionEntity) {
        self.known.insert(session.code.clone(), session.clone());
    }

    /// Drop the cached document, and the gate too unless another caller is queued on it.
    fn forget(&self, code: &str) {
        self.known.remove(code);
        self.gates
            .remove_if(code, |_, gate| Arc::strong_count(gate) <= 2);
    }

    /// Drop per-session engine state (cached document and gate).
    pub fn release_session(&self, code: &str) {
        self.forget(code);
        self.gates.remove(code);
    }

    /// Number of sessions with engine-local state.
    pub fn tracked_sessions(&self) -> usize {
        self.known.len().max(self.gates.len())
    }

    fn generate_code(&self) -> String {
        let mut rng = rand::rng();
        (0..self.sessions.code_length)
            .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
            .collect()
    }

    /// Read the session document, falling back to the cached copy when the store is down.
    async fn load_session(&self, code: &str) -> Result<SessionEntity, SyncError> {
        match self.authoritative.find_session(code).await {
            Ok(Some(session)) => {
                self.remember(&session);
                Ok(session)
            }
            Ok(None) => {
                self.forget(code);
                Err(SyncError::NotFound(format!("session `{code}`")))
            }
            Err(err) => match self.known.get(code) {
                Some(cached) => {
                    debug!(code = %code, error = %err, "authoritative store unavailable; using cached session");
                    Ok(cached.clone())
                }
                None => Err(err.into()),
            },
        }
    }

    /// Session metadata, from the local cache when present.
    async fn session_meta(&self, code: &str) -> Result<SessionEntity, SyncError> {
        if let Some(cached) = self.known.get(code) {
            return Ok(cached.clone());
        }
        self.load_session(code).await
    }

    fn check_scorable(session: &SessionEntity, player_id: Uuid) -> Result<(), SyncError> {
        if session.status == SessionStatus::Finished {
            return Err(SyncError::InvalidInput(format!(
                "session `{}` is finished",
                session.code
            )));
        }
        if player_id == session.host_id {
            return Err(SyncError::InvalidInput("the host does not score".into()));
        }
        Ok(())
    }

    /// Create a waiting session with a fresh join code and register its host.
    pub async fn try_create_session(
        &self,
        host: PlayerInfo,
        settings: SessionSettings,
        quiz_ref: String,
    ) -> Result<SessionEntity, SyncError> {
        let host = host.normalized()?;
        if settings.question_count == 0 {
            return Err(SyncError::InvalidInput("question count must be positive".into()));
        }

        for attempt in 1..=self.sessions.max_code_attempts {
            let code = self.generate_code();
            let host_record =
                PlayerEntity::new(Uuid::new_v4(), &code, &host.name, host.avatar.clone(), true);
            let session =
                SessionEntity::new(&code, &host_record, settings.clone(), quiz_ref.clone());

            if !self.authoritative.create_session(session.clone()).await? {
                debug!(code = %code, attempt, "join code already taken; regenerating");
                continue;
            }

            if let Err(err) = self.fast.upsert_player(host_record).await {
                warn!(code = %code, error = %err, "failed to register host in fast store; roster fallback only");
            }
            self.remember(&session);
            info!(code = %code, host_id = %session.host_id, "session created");
            return Ok(session);
        }

        Err(SyncError::InvalidInput(
            "could not allocate a free join code".into(),
        ))
    }

    /// Authoritative session document.
    pub async fn try_get_session(&self, code: &str) -> Result<SessionEntity, SyncError> {
        self.load_session(code).await
    }

    /// Session metadata with the merged player list.
    pub async fn try_get_room(&self, code: &str) -> Result<Room, SyncError> {
        let (session, players) = tokio::join!(
            self.authoritative.find_session(code),
            self.fast.list_players(code)
        );

        let session = match session {
            Ok(Some(session)) => {
                self.remember(&session);
                session
            }
            Ok(None) => {
                self.forget(code);
                return Err(SyncError::NotFound(format!("session `{code}`")));
            }
            Err(err) => match (self.known.get(code), &players) {
                (Some(cached), Ok(_)) => cached.clone(),
                _ => return Err(err.into()),
            },
        };

        let players = players.unwrap_or_else(|err| {
            debug!(code = %code, error = %err, "fast store unavailable; using embedded roster");
            Vec::new()
        });

        Ok(Room::assemble(&session, &players))
    }

    /// Add a player to a waiting session, superseding any record with the same name.
    pub async fn try_join_session(
        &self,
        code: &str,
        info: PlayerInfo,
    ) -> Result<PlayerEntity, SyncError> {
        let info = info.normalized()?;
        let gate = self.gate(code);
        let _guard = gate.lock().await;

        let session = self.load_session(code).await?;
        if session.status != SessionStatus::Waiting {
            return Err(SyncError::InvalidInput(format!(
                "session `{code}` is {} and no longer accepts players",
                session.status.as_str()
            )));
        }
        if session.host_name.eq_ignore_ascii_case(&info.name) {
            return Err(SyncError::InvalidInput(
                "display name is reserved by the host".into(),
            ));
        }

        let player = PlayerEntity::new(Uuid::new_v4(), code, &info.name, info.avatar, false);

        let fast_result = async {
            let superseded = self.fast.delete_players_named(code, &info.name).await?;
            for old_id in &superseded {
                warn!(
                    code = %code,
                    name = %info.name,
                    old_player_id = %old_id,
                    new_player_id = %player.id,
                    "rejoin supersedes existing player record"
                );
            }
            self.fast.upsert_player(player.clone()).await
        }
        .await;

        if fast_result.is_ok() {
            self.dedupe_name(code, &player).await;
        }

        let mirror = self
            .authoritative
            .replace_roster_entry(code, RosterEntry::from(&player))
            .await;

        match (fast_result, mirror) {
            (Ok(()), Ok(_)) => {}
            (Ok(()), Err(err)) => {
                warn!(code = %code, player_id = %player.id, error = %err, "roster mirror failed");
            }
            (Err(err), Ok(true)) => {
                warn!(code = %code, player_id = %player.id, error = %err, "fast store join failed; player recorded in roster only");
            }
            (Err(err), _) => return Err(err.into()),
        }

        info!(code = %code, player_id = %player.id, name = %player.name, "player joined");
        Ok(player)
    }

    /// Keep only the newest fast-store record carrying the player's name.
    async fn dedupe_name(&self, code: &str, player: &PlayerEntity) {
        let players = match self.fast.list_players(code).await {
            Ok(players) => players,
            Err(err) => {
                debug!(code = %code, error = %err, "skipping join dedupe");
                return;
            }
        };

        let mut same_name: Vec<&PlayerEntity> = players
            .iter()
            .filter(|candidate| candidate.name == player.name && !candidate.is_host)
            .collect();
        if same_name.len() < 2 {
            return;
        }

        same_name.sort_by_key(|candidate| (candidate.joined_at, candidate.id));
        let Some((newest, older)) = same_name.split_last() else {
            return;
        };
        for stale in older {
            warn!(
                code = %code,
                name = %player.name,
                old_player_id = %stale.id,
                new_player_id = %newest.id,
                "removing concurrently inserted duplicate"
            );
            if let Err(err) = self.fast.delete_player(code, stale.id).await {
                warn!(code = %code, player_id = %stale.id, error = %err, "duplicate removal failed");
            }
        }
    }

    /// Max-merge score and progress, falling back to the roster when the fast store fails.
    pub async fn try_update_score(
        &self,
        code: &str,
        player_id: Uuid,
        score: u32,
        questions_answered: u32,
    ) -> Result<MergeOutcome, SyncError> {
        let session = self.session_meta(code).await?;
        Self::check_scorable(&session, player_id)?;
        let progress =
            Progress::new(score, questions_answered).clamped(session.settings.question_count);

        let outcome = match self.fast.merge_progress(code, player_id, progress).await {
            Ok(MergeOutcome::Missing) => {
                self.authoritative
                    .merge_roster_progress(code, player_id, progress)
                    .await?
            }
            Ok(outcome) => outcome,
            Err(fast_err) => {
                match self
                    .authoritative
                    .merge_roster_progress(code, player_id, progress)
                    .await
                {
                    Ok(outcome) => {
                        warn!(
                            code = %code,
                            player_id = %player_id,
                            error = %fast_err,
                            "fast store write failed; merged into roster"
                        );
                        outcome
                    }
                    Err(_) => return Err(fast_err.into()),
                }
            }
        };

        if outcome == MergeOutcome::Missing {
            return Err(SyncError::NotFound(format!(
                "player `{player_id}` in session `{code}`"
            )));
        }
        Ok(outcome)
    }

    /// Append an answer to the player's history unless that question was already answered.
    pub async fn try_record_answer(
        &self,
        code: &str,
        player_id: Uuid,
        answer: AnswerEntity,
    ) -> Result<MergeOutcome, SyncError> {
        if answer.question_ref.trim().is_empty() {
            return Err(SyncError::InvalidInput("question reference must not be empty".into()));
        }
        let session = self.session_meta(code).await?;
        Self::check_scorable(&session, player_id)?;

        match self
            .fast
            .append_answer(code, player_id, answer, session.settings.question_count)
            .await?
        {
            MergeOutcome::Missing => Err(SyncError::NotFound(format!(
                "player `{player_id}` in session `{code}`"
            ))),
            outcome => Ok(outcome),
        }
    }

    /// Move the session forward; finishing reconciles the roster.
    pub async fn try_transition_status(
        &self,
        code: &str,
        to: SessionStatus,
    ) -> Result<SessionEntity, SyncError> {
        let gate = self.gate(code);
        let _guard = gate.lock().await;

        let mut session = match self.authoritative.find_session(code).await? {
            Some(session) => session,
            None => {
                self.forget(code);
                return Err(SyncError::NotFound(format!("session `{code}`")));
            }
        };
        let plan = plan_transition(&session, to)?;
        let now = SystemTime::now();

        match plan.effect {
            TransitionEffect::StartCountdown { .. } => {}
            TransitionEffect::StartPlay => {
                if let Err(err) = self.fast.stamp_players(code, PlayerClock::Started, now).await {
                    warn!(code = %code, error = %err, "failed to stamp player start times");
                }
            }
            TransitionEffect::Finish => {
                if let Err(err) = self.fast.stamp_players(code, PlayerClock::Ended, now).await {
                    warn!(code = %code, error = %err, "failed to stamp player end times");
                }
            }
        }

        plan.apply(&mut session, now);
        if plan.effect == TransitionEffect::Finish {
            let players = self.fast.list_players(code).await?;
            let ended_at = session.ended_at.unwrap_or(now);
            reconcile(&session, &players, ended_at).apply(&mut session, now);
        }

        if !self.authoritative.update_session(session.clone()).await? {
            self.forget(code);
            return Err(SyncError::NotFound(format!("session `{code}`")));
        }

        self.remember(&session);
        info!(
            code = %code,
            from = plan.from.as_str(),
            to = plan.to.as_str(),
            "session status changed"
        );
        Ok(session)
    }

    /// Re-run end-of-game reconciliation for a finished session.
    pub async fn try_reconcile(&self, code: &str) -> Result<SessionEntity, SyncError> {
        let gate = self.gate(code);
        let _guard = gate.lock().await;

        let mut session = match self.authoritative.find_session(code).await? {
            Some(session) => session,
            None => {
                self.forget(code);
                return Err(SyncError::NotFound(format!("session `{code}`")));
            }
        };
        if session.status != SessionStatus::Finished {
            return Err(SyncError::InvalidInput(format!(
                "session `{code}` is not finished"
            )));
        }

        let players = self.fast.list_players(code).await?;
        let now = SystemTime::now();
        let ended_at = session.ended_at.unwrap_or(now);
        reconcile(&session, &players, ended_at).apply(&mut session, now);

        if !self.authoritative.update_session(session.clone()).await? {
            self.forget(code);
            return Err(SyncError::NotFound(format!("session `{code}`")));
        }
        self.remember(&session);
        Ok(session)
    }

    /// Delete the session's player rows and document, then release local state.
    pub async fn try_teardown_session(&self, code: &str) -> Result<bool, SyncError> {
        let (players, session) = tokio::join!(
            self.fast.delete_session_players(code),
            self.authoritative.delete_session(code)
        );
        self.release_session(code);

        match (players, session) {
            (Err(fast_err), Err(_)) => Err(fast_err.into()),
            (Ok(rows), Ok(existed)) => {
                info!(code = %code, rows, existed, "session torn down");
                Ok(existed || rows > 0)
            }
            (Ok(rows), Err(err)) => {
                warn!(code = %code, error = %err, "session document not deleted");
                Ok(rows > 0)
            }
            (Err(err), Ok(existed)) => {
                warn!(code = %code, error = %err, "player rows not deleted");
                Ok(existed)
            }
        }
    }

    /// Probe both stores.
    pub async fn health(&self) -> Result<(), SyncError> {
        let (fast, authoritative) = tokio::join!(
            self.fast.health_check(),
            self.authoritative.health_check()
        );
        fast?;
        authoritative?;
        Ok(())
    }

    /// Reconnect both stores.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        let (fast, authoritative) = tokio::join!(
            self.fast.try_reconnect(),
            self.authoritative.try_reconnect()
        );
        fast?;
        authoritative?;
        Ok(())
    }

    /// [`Self::try_create_session`] with errors logged and dropped.
    pub async fn create_session(
        &self,
        host: PlayerInfo,
        settings: SessionSettings,
        quiz_ref: String,
    ) -> Option<SessionEntity> {
        settle("create_session", self.try_create_session(host, settings, quiz_ref).await)
    }

    /// [`Self::try_get_session`] with errors logged and dropped.
    pub async fn get_session(&self, code: &str) -> Option<SessionEntity> {
        settle("get_session", self.try_get_session(code).await)
    }

    /// `None` when the session is unknown or unreadable.
    pub async fn get_room(&self, code: &str) -> Option<Room> {
        settle("get_room", self.try_get_room(code).await)
    }

    /// [`Self::try_join_session`] with errors logged and dropped.
    pub async fn join_session(&self, code: &str, info: PlayerInfo) -> Option<PlayerEntity> {
        settle("join_session", self.try_join_session(code, info).await)
    }

    /// `true` when the write was accepted, including stale writes that changed nothing.
    pub async fn update_score(
        &self,
        code: &str,
        player_id: Uuid,
        score: u32,
        questions_answered: u32,
    ) -> bool {
        settle(
            "update_score",
            self.try_update_score(code, player_id, score, questions_answered)
                .await,
        )
        .is_some()
    }

    /// `true` when the answer was stored or already present.
    pub async fn record_answer(&self, code: &str, player_id: Uuid, answer: AnswerEntity) -> bool {
        settle(
            "record_answer",
            self.try_record_answer(code, player_id, answer).await,
        )
        .is_some()
    }

    /// `true` when the session moved to `to`.
    pub async fn transition_status(&self, code: &str, to: SessionStatus) -> bool {
        settle("transition_status", self.try_transition_status(code, to).await).is_some()
    }

    /// `true` when anything was deleted.
    pub async fn teardown_session(&self, code: &str) -> bool {
        settle("teardown_session", self.try_teardown_session(code).await).unwrap_or(false)
    }
}

fn settle<T>(operation: &'static str, result: Result<T, SyncError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(operation, error = %err, "sync operation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::record_store::memory::{MemoryAuthoritativeStore, MemoryFastStore};

    struct Fixture {
        fast: MemoryFastStore,
        authoritative: MemoryAuthoritativeStore,
        facade: SyncFacade,
    }

    fn fixture() -> Fixture {
        let fast = MemoryFastStore::new();
        let authoritative = MemoryAuthoritativeStore::new();
        let facade = SyncFacade::new(
            Arc::new(fast.clone()),
            Arc::new(authoritative.clone()),
            SessionsConfig::default(),
        );
        Fixture {
            fast,
            authoritative,
            facade,
        }
    }

    fn settings(question_count: u32) -> SessionSettings {
        SessionSettings {
            question_count,
            time_limit_secs: 20,
            countdown_secs: Some(3),
        }
    }

    async fn session(fixture: &Fixture) -> SessionEntity {
        fixture
            .facade
            .try_create_session(PlayerInfo::new("host", None), settings(10), "quiz".into())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_session_registers_host() {
        let fixture = fixture();
        let session = session(&fixture).await;

        assert_eq!(session.code.len(), 6);
        assert!(session.code.chars().all(|c| c.is_ascii_digit()));
        let host = fixture
            .fast
            .find_player(&session.code, session.host_id)
            .await
            .unwrap()
            .unwrap();
        assert!(host.is_host);
    }

    #[tokio::test]
    async fn rejoin_by_name_supersedes() {
        let fixture = fixture();
        let session = session(&fixture).await;
        let first = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();
        let second = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new(" ada ", None))
            .await
            .unwrap();

        let room = fixture.facade.try_get_room(&session.code).await.unwrap();
        let adas: Vec<_> = room.players.iter().filter(|p| p.name == "ada").collect();
        assert_eq!(adas.len(), 1);
        assert_eq!(adas[0].id, second.id);
        assert!(room.player(first.id).is_none());
    }

    #[tokio::test]
    async fn join_rejects_host_name_and_started_sessions() {
        let fixture = fixture();
        let session = session(&fixture).await;
        let err = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("HOST", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));

        fixture
            .facade
            .try_transition_status(&session.code, SessionStatus::Active)
            .await
            .unwrap();
        assert!(
            fixture
                .facade
                .join_session(&session.code, PlayerInfo::new("late", None))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn score_updates_clamp_and_never_regress() {
        let fixture = fixture();
        let session = session(&fixture).await;
        let ada = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();

        assert!(fixture.facade.update_score(&session.code, ada.id, 300, 11).await);
        assert!(fixture.facade.update_score(&session.code, ada.id, 100, 4).await);

        let room = fixture.facade.get_room(&session.code).await.unwrap();
        let view = room.player(ada.id).unwrap();
        assert_eq!((view.score, view.questions_answered), (300, 10));
    }

    #[tokio::test]
    async fn host_and_unknown_players_cannot_score() {
        let fixture = fixture();
        let session = session(&fixture).await;

        let err = fixture
            .facade
            .try_update_score(&session.code, session.host_id, 10, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));

        let err = fixture
            .facade
            .try_update_score(&session.code, Uuid::new_v4(), 10, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn fast_store_outage_falls_back_to_roster() {
        let fixture = fixture();
        let session = session(&fixture).await;
        let ada = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();

        fixture.fast.faults().set_offline(true);
        assert_eq!(
            fixture
                .facade
                .try_update_score(&session.code, ada.id, 50, 2)
                .await
                .unwrap(),
            MergeOutcome::Applied
        );
        assert_eq!(
            fixture
                .facade
                .try_update_score(&session.code, ada.id, 40, 2)
                .await
                .unwrap(),
            MergeOutcome::Unchanged
        );

        let room = fixture.facade.try_get_room(&session.code).await.unwrap();
        assert_eq!(room.player(ada.id).map(|p| p.score), Some(50));

        fixture.authoritative.faults().set_offline(true);
        let err = fixture
            .facade
            .try_update_score(&session.code, ada.id, 60, 3)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn failed_start_stamp_does_not_block_the_transition() {
        let fixture = fixture();
        let session = session(&fixture).await;
        let ada = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();

        fixture.fast.faults().fail_next(1);
        let active = fixture
            .facade
            .try_transition_status(&session.code, SessionStatus::Active)
            .await
            .unwrap();

        assert_eq!(active.status, SessionStatus::Active);
        assert!(active.started_at.is_some());
        let row = fixture
            .fast
            .find_player(&session.code, ada.id)
            .await
            .unwrap()
            .unwrap();
        assert!(row.started_at.is_none());
    }

    #[tokio::test]
    async fn unknown_codes_leave_no_local_state() {
        let fixture = fixture();

        for n in 0..1000 {
            let code = format!("{n:06}");
            let joined = fixture
                .facade
                .try_join_session(&code, PlayerInfo::new("ada", None))
                .await;
            assert!(matches!(joined, Err(SyncError::NotFound(_))));
            let moved = fixture
                .facade
                .try_transition_status(&code, SessionStatus::Active)
                .await;
            assert!(matches!(moved, Err(SyncError::NotFound(_))));
            let reconciled = fixture.facade.try_reconcile(&code).await;
            assert!(matches!(reconciled, Err(SyncError::NotFound(_))));
        }

        assert_eq!(fixture.facade.tracked_sessions(), 0);
    }

    #[tokio::test]
    async fn concurrent_misses_on_one_code_release_the_gate() {
        let fixture = fixture();

        let (first, second) = tokio::join!(
            fixture
                .facade
                .try_join_session("424242", PlayerInfo::new("ada", None)),
            fixture
                .facade
                .try_join_session("424242", PlayerInfo::new("bob", None))
        );

        assert!(first.is_err() && second.is_err());
        assert_eq!(fixture.facade.tracked_sessions(), 0);
    }

    #[tokio::test]
    async fn roster_only_join_is_listed_and_scored() {
        let fixture = fixture();
        let session = session(&fixture).await;

        fixture.fast.faults().fail_next(1);
        let ada = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();
        assert!(
            fixture
                .fast
                .find_player(&session.code, ada.id)
                .await
                .unwrap()
                .is_none()
        );

        assert_eq!(
            fixture
                .facade
                .try_update_score(&session.code, ada.id, 30, 1)
                .await
                .unwrap(),
            MergeOutcome::Applied
        );

        let room = fixture.facade.try_get_room(&session.code).await.unwrap();
        assert_eq!(room.players.len(), 2);
        let view = room.player(ada.id).unwrap();
        assert_eq!((view.score, view.questions_answered), (30, 1));
    }

    #[tokio::test]
    async fn roster_fallback_score_survives_fast_store_recovery() {
        let fixture = fixture();
        let session = session(&fixture).await;
        let ada = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();

        fixture.fast.faults().set_offline(true);
        fixture
            .facade
            .try_update_score(&session.code, ada.id, 50, 2)
            .await
            .unwrap();
        fixture.fast.faults().set_offline(false);

        let room = fixture.facade.try_get_room(&session.code).await.unwrap();
        let view = room.player(ada.id).unwrap();
        assert_eq!((view.score, view.questions_answered), (50, 2));
    }

    #[tokio::test]
    async fn finishing_reconciles_and_freezes_scores() {
        let fixture = fixture();
        let session = session(&fixture).await;
        let ada = fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();
        fixture
            .facade
            .try_transition_status(&session.code, SessionStatus::Active)
            .await
            .unwrap();
        fixture
            .facade
            .try_record_answer(
                &session.code,
                ada.id,
                AnswerEntity {
                    question_ref: "q1".into(),
                    option_ref: "b".into(),
                    correct: true,
                    points: 100,
                    answered_at: SystemTime::now(),
                },
            )
            .await
            .unwrap();

        let finished = fixture
            .facade
            .try_transition_status(&session.code, SessionStatus::Finished)
            .await
            .unwrap();
        assert_eq!(finished.responses.len(), 1);
        assert_eq!(finished.summaries.len(), 1);
        assert_eq!(finished.summaries[0].final_score, 100);

        let err = fixture
            .facade
            .try_update_score(&session.code, ada.id, 500, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));

        let again = fixture.facade.try_reconcile(&session.code).await.unwrap();
        assert_eq!(again.roster, finished.roster);
        assert_eq!(again.summaries, finished.summaries);
    }

    #[tokio::test]
    async fn teardown_removes_everything() {
        let fixture = fixture();
        let session = session(&fixture).await;
        fixture
            .facade
            .try_join_session(&session.code, PlayerInfo::new("ada", None))
            .await
            .unwrap();

        assert!(fixture.facade.teardown_session(&session.code).await);
        assert!(fixture.facade.get_room(&session.code).await.is_none());
        assert!(
            fixture
                .fast
                .list_players(&session.code)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(fixture.facade.tracked_sessions(), 0);
    }
}
