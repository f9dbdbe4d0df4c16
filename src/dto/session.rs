//! Request and response bodies of the session routes.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::{
        AnswerEntity, PlayerEntity, PlayerSummaryEntity, SessionEntity, SessionSettings,
        SessionStatus,
    },
    dto::{format_system_time, validation::validate_display_name},
    services::{sync_facade::PlayerInfo, update_queue::FlushReport},
    state::room::{PlayerView, Room},
};

/// Payload creating a new session and its host.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 40), custom(function = "validate_display_name"))]
    pub host_name: String,
    #[validate(length(max = 256))]
    #[serde(default)]
    pub host_avatar: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub quiz_ref: String,
    #[validate(range(min = 1, max = 500))]
    pub question_count: u32,
    #[validate(range(min = 1, max = 3600))]
    pub time_limit_secs: u32,
    /// Countdown played before the first question; required to use the `countdown` status.
    #[validate(range(min = 1, max = 300))]
    #[serde(default)]
    pub countdown_secs: Option<u32>,
}

impl CreateSessionRequest {
    /// Split into the host identity, settings and quiz reference.
    pub fn into_parts(self) -> (PlayerInfo, SessionSettings, String) {
        (
            PlayerInfo::new(self.host_name, self.host_avatar),
            SessionSettings {
                question_count: self.question_count,
                time_limit_secs: self.time_limit_secs,
                countdown_secs: self.countdown_secs,
            },
            self.quiz_ref,
        )
    }
}

/// Payload adding a player to a waiting session.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct JoinSessionRequest {
    #[validate(length(min = 1, max = 40), custom(function = "validate_display_name"))]
    pub name: String,
    #[validate(length(max = 256))]
    #[serde(default)]
    pub avatar: Option<String>,
}

impl From<JoinSessionRequest> for PlayerInfo {
    fn from(request: JoinSessionRequest) -> Self {
        PlayerInfo::new(request.name, request.avatar)
    }
}

/// Score and progress reported by a player client.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ScoreUpdateRequest {
    pub score: u32,
    pub questions_answered: u32,
    /// Write through at once instead of batching.
    #[serde(default)]
    pub immediate: bool,
}

/// Outcome of a score submission.
#[derive(Debug, Serialize, ToSchema)]
pub struct ScoreUpdateResponse {
    /// `queued`, `applied` or `unchanged`.
    pub status: String,
}

impl ScoreUpdateResponse {
    pub fn queued() -> Self {
        Self {
            status: "queued".into(),
        }
    }

    pub fn written(applied: bool) -> Self {
        Self {
            status: if applied { "applied" } else { "unchanged" }.into(),
        }
    }
}

/// Answer submitted for one question.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct AnswerRequest {
    #[validate(length(min = 1, max = 128))]
    pub question_ref: String,
    #[validate(length(min = 1, max = 128))]
    pub option_ref: String,
    pub correct: bool,
    pub points: u32,
}

impl From<AnswerRequest> for AnswerEntity {
    fn from(request: AnswerRequest) -> Self {
        AnswerEntity {
            question_ref: request.question_ref,
            option_ref: request.option_ref,
            correct: request.correct,
            points: request.points,
            answered_at: std::time::SystemTime::now(),
        }
    }
}

/// Whether the answer changed the player's record.
#[derive(Debug, Serialize, ToSchema)]
pub struct AnswerResponse {
    pub recorded: bool,
}

/// Requested lifecycle status.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct TransitionRequest {
    pub status: SessionStatus,
}

/// Player row as returned after a join.
#[derive(Debug, Serialize, ToSchema)]
pub struct PlayerResponse {
    pub id: Uuid,
    pub session_code: String,
    pub name: String,
    pub avatar: Option<String>,
    pub joined_at: String,
}

impl From<PlayerEntity> for PlayerResponse {
    fn from(player: PlayerEntity) -> Self {
        Self {
            id: player.id,
            session_code: player.session_code,
            name: player.name,
            avatar: player.avatar,
            joined_at: format_system_time(player.joined_at),
        }
    }
}

/// One player inside a room view.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoomPlayer {
    pub id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
    pub score: u32,
    pub questions_answered: u32,
    pub is_host: bool,
    pub joined_at: String,
}

impl From<&PlayerView> for RoomPlayer {
    fn from(view: &PlayerView) -> Self {
        Self {
            id: view.id,
            name: view.name.clone(),
            avatar: view.avatar.clone(),
            score: view.score,
            questions_answered: view.questions_answered,
            is_host: view.is_host,
            joined_at: format_system_time(view.joined_at),
        }
    }
}

/// Session metadata plus the merged player list.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoomResponse {
    pub code: String,
    pub status: SessionStatus,
    pub host_id: Uuid,
    pub quiz_ref: String,
    pub question_count: u32,
    pub time_limit_secs: u32,
    pub countdown_started_at: Option<String>,
    pub countdown_duration_ms: Option<u64>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub players: Vec<RoomPlayer>,
}

impl From<Room> for RoomResponse {
    fn from(room: Room) -> Self {
        Self {
            players: room.players.iter().map(RoomPlayer::from).collect(),
            code: room.code,
            status: room.status,
            host_id: room.host_id,
            quiz_ref: room.quiz_ref,
            question_count: room.question_count,
            time_limit_secs: room.time_limit_secs,
            countdown_started_at: room.countdown_started_at.map(format_system_time),
            countdown_duration_ms: room.countdown_duration_ms,
            started_at: room.started_at.map(format_system_time),
            ended_at: room.ended_at.map(format_system_time),
        }
    }
}

/// End-of-game statistics of one player.
#[derive(Debug, Serialize, ToSchema)]
pub struct PlayerResultSummary {
    pub player_id: Uuid,
    pub name: String,
    pub answered: u32,
    pub correct: u32,
    pub accuracy_percent: u32,
    pub duration_ms: Option<u64>,
    pub final_score: u32,
}

impl From<PlayerSummaryEntity> for PlayerResultSummary {
    fn from(summary: PlayerSummaryEntity) -> Self {
        Self {
            player_id: summary.player_id,
            name: summary.name,
            answered: summary.answered,
            correct: summary.correct,
            accuracy_percent: summary.accuracy_percent,
            duration_ms: summary.duration_ms,
            final_score: summary.final_score,
        }
    }
}

/// Authoritative session document as exposed over HTTP.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionSummary {
    pub code: String,
    pub status: SessionStatus,
    pub host_id: Uuid,
    pub host_name: String,
    pub quiz_ref: String,
    pub question_count: u32,
    pub time_limit_secs: u32,
    pub countdown_secs: Option<u32>,
    pub created_at: String,
    pub countdown_started_at: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    /// Players recorded in the session document, host included.
    pub roster_size: usize,
    /// Number of recorded answers.
    pub responses: usize,
    /// Filled once the session is finished.
    pub summaries: Vec<PlayerResultSummary>,
}

impl From<SessionEntity> for SessionSummary {
    fn from(session: SessionEntity) -> Self {
        Self {
            roster_size: session.roster.len(),
            responses: session.responses.len(),
            summaries: session
                .summaries
                .into_iter()
                .map(PlayerResultSummary::from)
                .collect(),
            code: session.code,
            status: session.status,
            host_id: session.host_id,
            host_name: session.host_name,
            quiz_ref: session.quiz_ref,
            question_count: session.settings.question_count,
            time_limit_secs: session.settings.time_limit_secs,
            countdown_secs: session.settings.countdown_secs,
            created_at: format_system_time(session.created_at),
            countdown_started_at: session.countdown_started_at.map(format_system_time),
            started_at: session.started_at.map(format_system_time),
            ended_at: session.ended_at.map(format_system_time),
        }
    }
}

/// Counts of one queue flush.
#[derive(Debug, Serialize, ToSchema)]
pub struct FlushResponse {
    pub written: usize,
    pub unchanged: usize,
    pub requeued: usize,
    pub deferred: usize,
    pub dropped: usize,
}

impl From<FlushReport> for FlushResponse {
    fn from(report: FlushReport) -> Self {
        Self {
            written: report.written,
            unchanged: report.unchanged,
            requeued: report.requeued,
            deferred: report.deferred,
            dropped: report.dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_rejects_blank_host_and_zero_questions() {
        let request: CreateSessionRequest = serde_json::from_str(
            r#"{"host_name":"   ","quiz_ref":"quiz","question_count":0,"time_limit_secs":20}"#,
        )
        .unwrap();
        let errors = request.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("host_name"));
        assert!(fields.contains_key("question_count"));
    }

    #[test]
    fn join_request_accepts_plain_name() {
        let request: JoinSessionRequest = serde_json::from_str(r#"{"name":"ada"}"#).unwrap();
        assert!(request.validate().is_ok());
        let info = PlayerInfo::from(request);
        assert_eq!(info.avatar, None);
    }

    #[test]
    fn score_response_labels() {
        assert_eq!(ScoreUpdateResponse::queued().status, "queued");
        assert_eq!(ScoreUpdateResponse::written(true).status, "applied");
        assert_eq!(ScoreUpdateResponse::written(false).status, "unchanged");
    }
}
