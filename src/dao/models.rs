use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a hosted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Lobby is open and players may join.
    Waiting,
    /// Pre-game countdown is running.
    Countdown,
    /// Questions are being answered.
    Active,
    /// Game is over and results are reconciled.
    Finished,
}

impl SessionStatus {
    /// Position of the status along the forward-only lifecycle.
    pub fn rank(self) -> u8 {
        match self {
            SessionStatus::Waiting => 0,
            SessionStatus::Countdown => 1,
            SessionStatus::Active => 2,
            SessionStatus::Finished => 3,
        }
    }

    /// Stable lowercase label used in storage filters and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Countdown => "countdown",
            SessionStatus::Active => "active",
            SessionStatus::Finished => "finished",
        }
    }
}

/// Host-chosen settings fixed at session creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    /// Number of questions in the quiz; upper bound for `questions_answered`.
    pub question_count: u32,
    /// Time allowed per question, in seconds.
    pub time_limit_secs: u32,
    /// Length of the pre-game countdown, in seconds.
    #[serde(default)]
    pub countdown_secs: Option<u32>,
}

/// Score and progress pair merged field by field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Accumulated points.
    pub score: u32,
    /// Number of questions answered so far.
    pub questions_answered: u32,
}

impl Progress {
    /// Build a progress pair.
    pub fn new(score: u32, questions_answered: u32) -> Self {
        Self {
            score,
            questions_answered,
        }
    }

    /// Per-field maximum of both values; never regresses either field.
    pub fn merge_max(self, other: Progress) -> Progress {
        Progress {
            score: self.score.max(other.score),
            questions_answered: self.questions_answered.max(other.questions_answered),
        }
    }

    /// Cap `questions_answered` to the configured question count.
    pub fn clamped(self, question_count: u32) -> Progress {
        Progress {
            score: self.score,
            questions_answered: self.questions_answered.min(question_count),
        }
    }
}

/// Result of a monotonic write against either store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// At least one field moved forward.
    Applied,
    /// Every field was already at or above the submitted value (stale write).
    Unchanged,
    /// No record exists for the targeted player.
    Missing,
}

/// One answer submitted by a player.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerEntity {
    /// Question the answer refers to.
    pub question_ref: String,
    /// Option picked by the player.
    pub option_ref: String,
    /// Whether the picked option was correct.
    pub correct: bool,
    /// Points awarded for this answer.
    pub points: u32,
    /// When the answer was given.
    pub answered_at: SystemTime,
}

/// Per-player row held by the fast record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerEntity {
    /// Opaque identifier, unique within the session.
    pub id: Uuid,
    /// Join code of the owning session.
    pub session_code: String,
    /// Display name chosen at join.
    pub name: String,
    /// Avatar reference rendered by clients.
    pub avatar: Option<String>,
    /// Monotonic score.
    pub score: u32,
    /// Monotonic number of answered questions.
    pub questions_answered: u32,
    /// Whether this record is the session host.
    pub is_host: bool,
    /// When the player joined.
    pub joined_at: SystemTime,
    /// When the game started for the player.
    pub started_at: Option<SystemTime>,
    /// When the game ended for the player.
    pub ended_at: Option<SystemTime>,
    /// Append-only answer history.
    pub answers: Vec<AnswerEntity>,
    /// Last write time.
    pub updated_at: SystemTime,
}

impl PlayerEntity {
    /// Fresh record for a player joining `session_code`.
    pub fn new(
        id: Uuid,
        session_code: impl Into<String>,
        name: impl Into<String>,
        avatar: Option<String>,
        is_host: bool,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            session_code: session_code.into(),
            name: name.into(),
            avatar,
            score: 0,
            questions_answered: 0,
            is_host,
            joined_at: now,
            started_at: None,
            ended_at: None,
            answers: Vec::new(),
            updated_at: now,
        }
    }

    /// Current score/progress pair.
    pub fn progress(&self) -> Progress {
        Progress::new(self.score, self.questions_answered)
    }

    /// Max-merge `incoming` into the row, returning whether anything moved.
    pub fn merge_progress(&mut self, incoming: Progress) -> MergeOutcome {
        let merged = self.progress().merge_max(incoming);
        if merged == self.progress() {
            return MergeOutcome::Unchanged;
        }
        self.score = merged.score;
        self.questions_answered = merged.questions_answered;
        self.updated_at = SystemTime::now();
        MergeOutcome::Applied
    }

    /// Append an answer unless the question was already answered.
    ///
    /// Points are added to the score and progress is incremented, capped to `question_limit`.
    pub fn append_answer(&mut self, answer: AnswerEntity, question_limit: u32) -> MergeOutcome {
        if self
            .answers
            .iter()
            .any(|existing| existing.question_ref == answer.question_ref)
        {
            return MergeOutcome::Unchanged;
        }
        if self.questions_answered >= question_limit {
            return MergeOutcome::Unchanged;
        }
        self.score = self.score.saturating_add(answer.points);
        self.questions_answered += 1;
        self.answers.push(answer);
        self.updated_at = SystemTime::now();
        MergeOutcome::Applied
    }
}

/// Player entry embedded in the authoritative session document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    /// Player identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Avatar reference.
    pub avatar: Option<String>,
    /// Score at the time of the last mirror or reconciliation.
    pub score: u32,
    /// Progress at the time of the last mirror or reconciliation.
    pub questions_answered: u32,
    /// Whether the entry is the host.
    pub is_host: bool,
    /// When the player joined.
    pub joined_at: SystemTime,
    /// When the game started for the player.
    pub started_at: Option<SystemTime>,
    /// When the game ended for the player.
    pub ended_at: Option<SystemTime>,
}

impl RosterEntry {
    /// Current score/progress pair.
    pub fn progress(&self) -> Progress {
        Progress::new(self.score, self.questions_answered)
    }

    /// Max-merge `incoming` into the entry, returning whether anything moved.
    pub fn merge_progress(&mut self, incoming: Progress) -> MergeOutcome {
        let merged = self.progress().merge_max(incoming);
        if merged == self.progress() {
            return MergeOutcome::Unchanged;
        }
        self.score = merged.score;
        self.questions_answered = merged.questions_answered;
        MergeOutcome::Applied
    }
}

impl From<&PlayerEntity> for RosterEntry {
    fn from(player: &PlayerEntity) -> Self {
        Self {
            id: player.id,
            name: player.name.clone(),
            avatar: player.avatar.clone(),
            score: player.score,
            questions_answered: player.questions_answered,
            is_host: player.is_host,
            joined_at: player.joined_at,
            started_at: player.started_at,
            ended_at: player.ended_at,
        }
    }
}

/// Answer history entry stored in the authoritative session document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseEntity {
    /// Player who answered.
    pub player_id: Uuid,
    /// Question the answer refers to.
    pub question_ref: String,
    /// Option picked by the player.
    pub option_ref: String,
    /// Whether the picked option was correct.
    pub correct: bool,
    /// Points awarded.
    pub points: u32,
    /// When the answer was given.
    pub answered_at: SystemTime,
}

impl ResponseEntity {
    /// Attach a player id to an answer.
    pub fn from_answer(player_id: Uuid, answer: &AnswerEntity) -> Self {
        Self {
            player_id,
            question_ref: answer.question_ref.clone(),
            option_ref: answer.option_ref.clone(),
            correct: answer.correct,
            points: answer.points,
            answered_at: answer.answered_at,
        }
    }
}

/// End-of-game statistics computed during reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerSummaryEntity {
    /// Player identifier.
    pub player_id: Uuid,
    /// Display name at reconciliation time.
    pub name: String,
    /// Number of recorded answers.
    pub answered: u32,
    /// Number of correct answers.
    pub correct: u32,
    /// Rounded percentage of correct answers.
    pub accuracy_percent: u32,
    /// Time between start (or join) and end, in milliseconds.
    pub duration_ms: Option<u64>,
    /// Final score.
    pub final_score: u32,
}

/// Authoritative per-session document with the embedded roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEntity {
    /// Internal identifier.
    pub id: Uuid,
    /// Short numeric join code.
    pub code: String,
    /// Identifier of the hosting player record.
    pub host_id: Uuid,
    /// Display name of the host.
    pub host_name: String,
    /// Settings fixed at creation.
    pub settings: SessionSettings,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Reference to the quiz content.
    pub quiz_ref: String,
    /// Creation time.
    pub created_at: SystemTime,
    /// When the countdown started.
    pub countdown_started_at: Option<SystemTime>,
    /// Countdown length recorded when it started.
    pub countdown_duration_ms: Option<u64>,
    /// When play started.
    pub started_at: Option<SystemTime>,
    /// When the game finished.
    pub ended_at: Option<SystemTime>,
    /// Embedded roster snapshot.
    pub roster: Vec<RosterEntry>,
    /// Full answer history, written at reconciliation.
    pub responses: Vec<ResponseEntity>,
    /// Per-player summaries, written at reconciliation.
    pub summaries: Vec<PlayerSummaryEntity>,
    /// Last write time.
    pub updated_at: SystemTime,
}

impl SessionEntity {
    /// Fresh waiting session whose roster contains only the host.
    pub fn new(
        code: impl Into<String>,
        host: &PlayerEntity,
        settings: SessionSettings,
        quiz_ref: impl Into<String>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            host_id: host.id,
            host_name: host.name.clone(),
            settings,
            status: SessionStatus::Waiting,
            quiz_ref: quiz_ref.into(),
            created_at: now,
            countdown_started_at: None,
            countdown_duration_ms: None,
            started_at: None,
            ended_at: None,
            roster: vec![RosterEntry::from(host)],
            responses: Vec::new(),
            summaries: Vec::new(),
            updated_at: now,
        }
    }

    /// Countdown length configured for the session, if any.
    pub fn countdown_duration(&self) -> Option<Duration> {
        self.settings
            .countdown_secs
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(u64::from(secs)))
    }

    /// Replace any roster entry sharing the id or display name, then append `entry`.
    pub fn replace_roster_entry(&mut self, entry: RosterEntry) {
        self.roster
            .retain(|existing| existing.id != entry.id && existing.name != entry.name);
        self.roster.push(entry);
    }
}

/// Kind of write held in the retry ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Score/progress max-merge.
    Score,
    /// Answer append.
    Answer,
}

/// Payload replayed by the retry store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdatePayload {
    /// Score/progress max-merge.
    Score {
        /// Submitted score.
        score: u32,
        /// Submitted progress.
        questions_answered: u32,
    },
    /// Answer append.
    Answer {
        /// Answer to append.
        answer: AnswerEntity,
    },
}

impl UpdatePayload {
    /// Kind used to dispatch the payload to a retry handler.
    pub fn kind(&self) -> UpdateKind {
        match self {
            UpdatePayload::Score { .. } => UpdateKind::Score,
            UpdatePayload::Answer { .. } => UpdateKind::Answer,
        }
    }
}

/// Status of a retry ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedUpdateStatus {
    /// Waiting for a retry.
    Pending,
    /// Claimed by a retry in flight.
    Processing,
    /// Successfully replayed.
    Completed,
    /// Attempts exhausted; never retried again.
    Failed,
}

impl FailedUpdateStatus {
    /// Stable lowercase label used in storage filters.
    pub fn as_str(self) -> &'static str {
        match self {
            FailedUpdateStatus::Pending => "pending",
            FailedUpdateStatus::Processing => "processing",
            FailedUpdateStatus::Completed => "completed",
            FailedUpdateStatus::Failed => "failed",
        }
    }

    /// Whether the record reached a final state.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            FailedUpdateStatus::Completed | FailedUpdateStatus::Failed
        )
    }
}

/// Durable record of a write that exhausted its in-line retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedUpdateEntity {
    /// Record identifier.
    pub id: Uuid,
    /// Session the write targets.
    pub session_code: String,
    /// Player the write targets.
    pub player_id: Uuid,
    /// Dispatch kind.
    pub kind: UpdateKind,
    /// Write to replay.
    pub payload: UpdatePayload,
    /// Failed replay attempts so far.
    pub attempts: u32,
    /// Attempts allowed before the record is marked failed.
    pub max_attempts: u32,
    /// Current status.
    pub status: FailedUpdateStatus,
    /// Last failure message.
    pub last_error: Option<String>,
    /// When the record was stored.
    pub created_at: SystemTime,
    /// Last status change.
    pub updated_at: SystemTime,
    /// Earliest time the sweep may replay the record.
    pub next_attempt_at: SystemTime,
}

impl FailedUpdateEntity {
    /// New pending record with no attempts.
    pub fn pending(
        session_code: impl Into<String>,
        player_id: Uuid,
        payload: UpdatePayload,
        max_attempts: u32,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: Uuid::new_v4(),
            session_code: session_code.into(),
            player_id,
            kind: payload.kind(),
            payload,
            attempts: 0,
            max_attempts,
            status: FailedUpdateStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
            next_attempt_at: now,
        }
    }

    /// Whether the record may still be replayed.
    pub fn is_retryable(&self) -> bool {
        self.status == FailedUpdateStatus::Pending && self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(question: &str, points: u32) -> AnswerEntity {
        AnswerEntity {
            question_ref: question.into(),
            option_ref: "a".into(),
            correct: points > 0,
            points,
            answered_at: SystemTime::now(),
        }
    }

    #[test]
    fn merge_max_keeps_each_field_independently() {
        let merged = Progress::new(10, 2).merge_max(Progress::new(5, 4));
        assert_eq!(merged, Progress::new(10, 4));
    }

    #[test]
    fn stale_progress_is_unchanged() {
        let mut player = PlayerEntity::new(Uuid::new_v4(), "123456", "ada", None, false);
        assert_eq!(
            player.merge_progress(Progress::new(30, 3)),
            MergeOutcome::Applied
        );
        assert_eq!(
            player.merge_progress(Progress::new(20, 3)),
            MergeOutcome::Unchanged
        );
        assert_eq!(player.progress(), Progress::new(30, 3));
    }

    #[test]
    fn append_answer_skips_duplicates_and_respects_limit() {
        let mut player = PlayerEntity::new(Uuid::new_v4(), "123456", "ada", None, false);
        assert_eq!(player.append_answer(answer("q1", 100), 2), MergeOutcome::Applied);
        assert_eq!(
            player.append_answer(answer("q1", 100), 2),
            MergeOutcome::Unchanged
        );
        assert_eq!(player.append_answer(answer("q2", 0), 2), MergeOutcome::Applied);
        assert_eq!(
            player.append_answer(answer("q3", 100), 2),
            MergeOutcome::Unchanged
        );
        assert_eq!(player.progress(), Progress::new(100, 2));
        assert_eq!(player.answers.len(), 2);
    }

    #[test]
    fn replace_roster_entry_supersedes_same_name() {
        let host = PlayerEntity::new(Uuid::new_v4(), "123456", "host", None, true);
        let settings = SessionSettings {
            question_count: 10,
            time_limit_secs: 20,
            countdown_secs: Some(3),
        };
        let mut session = SessionEntity::new("123456", &host, settings, "quiz-1");
        let first = PlayerEntity::new(Uuid::new_v4(), "123456", "ada", None, false);
        let second = PlayerEntity::new(Uuid::new_v4(), "123456", "ada", None, false);
        session.replace_roster_entry(RosterEntry::from(&first));
        session.replace_roster_entry(RosterEntry::from(&second));

        let names: Vec<_> = session.roster.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["host", "ada"]);
        assert_eq!(session.roster[1].id, second.id);
    }

    #[test]
    fn payload_kind_matches_variant() {
        let payload = UpdatePayload::Score {
            score: 1,
            questions_answered: 1,
        };
        assert_eq!(payload.kind(), UpdateKind::Score);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "score");
    }
}
