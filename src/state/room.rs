//! Merged room view and the cache the notifier keeps per subscription.

use std::{
    collections::{BTreeMap, HashSet},
    time::SystemTime,
};

use indexmap::IndexMap;
use uuid::Uuid;

use crate::dao::{
    models::{PlayerEntity, RosterEntry, SessionEntity, SessionStatus},
    record_store::{PlayerChange, SessionChange},
};

/// Which source supplies identity fields and ordering when both stores list a player.
///
/// Membership is always the union of both sources, and score/progress are read as the
/// per-field maximum of the two, so a value written to either store stays visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePreference {
    /// Live play: fast-store rows lead.
    PreferFast,
    /// Reconciled sessions: the roster leads.
    PreferAuthoritative,
}

impl SourcePreference {
    /// Preference matching a session status.
    pub fn for_status(status: SessionStatus) -> Self {
        if status == SessionStatus::Finished {
            SourcePreference::PreferAuthoritative
        } else {
            SourcePreference::PreferFast
        }
    }
}

/// One player as presented to hosts and participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerView {
    /// Player id, unique within the session.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Optional avatar reference.
    pub avatar: Option<String>,
    /// Highest score seen in either store.
    pub score: u32,
    /// Highest progress seen in either store.
    pub questions_answered: u32,
    /// Whether this is the session host.
    pub is_host: bool,
    /// When the player joined.
    pub joined_at: SystemTime,
}

impl From<&PlayerEntity> for PlayerView {
    fn from(player: &PlayerEntity) -> Self {
        Self {
            id: player.id,
            name: player.name.clone(),
            avatar: player.avatar.clone(),
            score: player.score,
            questions_answered: player.questions_answered,
            is_host: player.is_host,
            joined_at: player.joined_at,
        }
    }
}

impl From<&RosterEntry> for PlayerView {
    fn from(entry: &RosterEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name.clone(),
            avatar: entry.avatar.clone(),
            score: entry.score,
            questions_answered: entry.questions_answered,
            is_host: entry.is_host,
            joined_at: entry.joined_at,
        }
    }
}

/// Merge fast-store rows and the embedded roster into one player list.
///
/// Players are matched by id. A secondary entry whose name is already taken by a different
/// player in the leading source is a superseded record and is skipped.
pub fn merge_players(
    fast: &[PlayerEntity],
    roster: &[RosterEntry],
    preference: SourcePreference,
) -> Vec<PlayerView> {
    let fast_views = fast.iter().map(PlayerView::from);
    let roster_views = roster.iter().map(PlayerView::from);
    let (leading, trailing): (Vec<PlayerView>, Vec<PlayerView>) = match preference {
        SourcePreference::PreferFast => (fast_views.collect(), roster_views.collect()),
        SourcePreference::PreferAuthoritative => (roster_views.collect(), fast_views.collect()),
    };

    let mut merged: IndexMap<Uuid, PlayerView> =
        leading.into_iter().map(|view| (view.id, view)).collect();
    let taken: HashSet<String> = merged.values().map(|view| view.name.clone()).collect();

    for view in trailing {
        match merged.get_mut(&view.id) {
            Some(existing) => {
                existing.score = existing.score.max(view.score);
                existing.questions_answered =
                    existing.questions_answered.max(view.questions_answered);
            }
            None if taken.contains(&view.name) => {}
            None => {
                merged.insert(view.id, view);
            }
        }
    }

    merged.into_values().collect()
}

/// Session metadata plus its merged player list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Join code.
    pub code: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Host player id.
    pub host_id: Uuid,
    /// Quiz content reference.
    pub quiz_ref: String,
    /// Number of questions in the quiz.
    pub question_count: u32,
    /// Seconds allowed per question.
    pub time_limit_secs: u32,
    /// When the countdown started.
    pub countdown_started_at: Option<SystemTime>,
    /// Countdown length in milliseconds.
    pub countdown_duration_ms: Option<u64>,
    /// When play started.
    pub started_at: Option<SystemTime>,
    /// When the game finished.
    pub ended_at: Option<SystemTime>,
    /// Players from both stores, leading source first.
    pub players: Vec<PlayerView>,
}

impl Room {
    /// Build the room view of `session` using the fast-store `players`.
    pub fn assemble(session: &SessionEntity, players: &[PlayerEntity]) -> Self {
        let preference = SourcePreference::for_status(session.status);
        Self {
            code: session.code.clone(),
            status: session.status,
            host_id: session.host_id,
            quiz_ref: session.quiz_ref.clone(),
            question_count: session.settings.question_count,
            time_limit_secs: session.settings.time_limit_secs,
            countdown_started_at: session.countdown_started_at,
            countdown_duration_ms: session.countdown_duration_ms,
            started_at: session.started_at,
            ended_at: session.ended_at,
            players: merge_players(players, &session.roster, preference),
        }
    }

    /// Observable state compared between two snapshots.
    pub fn fingerprint(&self) -> RoomFingerprint {
        RoomFingerprint {
            status: self.status,
            players: self
                .players
                .iter()
                .map(|player| (player.id, (player.score, player.questions_answered)))
                .collect(),
        }
    }

    /// Player by id.
    pub fn player(&self, id: Uuid) -> Option<&PlayerView> {
        self.players.iter().find(|player| player.id == id)
    }
}

/// Status, the player id set and each player's (score, questions answered).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomFingerprint {
    status: SessionStatus,
    players: BTreeMap<Uuid, (u32, u32)>,
}

/// Incrementally patched copy of one session used by change subscriptions.
#[derive(Debug, Default)]
pub struct RoomCache {
    session: Option<SessionEntity>,
    players: IndexMap<Uuid, PlayerEntity>,
    closed: bool,
}

impl RoomCache {
    /// Replace the whole cache with a fresh read.
    pub fn reset(&mut self, session: Option<SessionEntity>, players: Vec<PlayerEntity>) {
        self.closed = session.is_none();
        self.session = session;
        self.players = players
            .into_iter()
            .map(|player| (player.id, player))
            .collect();
    }

    /// Apply a fast-store event; returns `false` when a full re-read is required.
    ///
    /// Progress is max-merged with the cached row so replayed events never move it back.
    pub fn apply_player(&mut self, change: PlayerChange) -> bool {
        match change {
            PlayerChange::Upserted(mut player) => {
                if let Some(cached) = self.players.get(&player.id) {
                    player.merge_progress(cached.progress());
                }
                self.players.insert(player.id, player);
                true
            }
            PlayerChange::Deleted(id) => {
                self.players.shift_remove(&id);
                true
            }
            PlayerChange::Resync => false,
        }
    }

    /// Apply an authoritative-store event; returns `false` when a full re-read is required.
    pub fn apply_session(&mut self, change: SessionChange) -> bool {
        match change {
            SessionChange::Updated(session) => {
                let regresses = self
                    .session
                    .as_ref()
                    .is_some_and(|cached| session.status.rank() < cached.status.rank());
                if !regresses {
                    self.session = Some(session);
                    self.closed = false;
                }
                true
            }
            SessionChange::Deleted => {
                self.session = None;
                self.closed = true;
                true
            }
            SessionChange::Resync => false,
        }
    }

    /// Whether the session is known to be gone.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current merged view, if the session exists.
    pub fn room(&self) -> Option<Room> {
        let session = self.session.as_ref()?;
        let players: Vec<PlayerEntity> = self.players.values().cloned().collect();
        Some(Room::assemble(session, &players))
    }

    /// Drop every cached row.
    pub fn clear(&mut self) {
        self.session = None;
        self.players.clear();
    }

    /// Number of cached player rows.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }
}
